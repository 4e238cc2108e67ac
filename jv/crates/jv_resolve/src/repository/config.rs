//! `~/.jv/resolve.toml` repository and download configuration.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Credentials, LocalRepository, RemoteRepository, Repository, RepositoryError};
use crate::checksum::HashAlgorithm;
use crate::remote::RetryConfig;

/// リポジトリ定義。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryConfig {
    /// リポジトリ識別子。
    pub name: String,
    /// ベースURL（file:// を含む完全URL）。
    pub url: String,
    /// 優先度（小さいほど高優先度）。
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub publish: bool,
    /// 検証に使わないチェックサム (例: 壊れた sha512 を公開するミラー)。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub untrusted_hashes: Vec<HashAlgorithm>,
}

fn default_priority() -> u32 {
    100
}

/// 認証設定。資格情報そのものではなく環境変数名を持つ。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Basic {
        #[serde(rename = "username-env")]
        username_env: String,
        #[serde(rename = "password-env")]
        password_env: String,
    },
    Token {
        #[serde(rename = "token-env")]
        token_env: String,
    },
}

impl AuthConfig {
    pub fn credentials(&self) -> Result<Credentials, RepositoryError> {
        match self {
            AuthConfig::Basic {
                username_env,
                password_env,
            } => Ok(Credentials::Basic {
                username: require_env(username_env)?,
                password: require_env(password_env)?,
            }),
            AuthConfig::Token { token_env } => Ok(Credentials::Token(require_env(token_env)?)),
        }
    }
}

fn require_env(name: &str) -> Result<String, RepositoryError> {
    std::env::var(name)
        .map_err(|_| RepositoryError::AuthConfigError(format!("環境変数 {name} が見つかりません")))
}

/// グループフィルタ。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FilterConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_groups: Vec<String>,
}

impl FilterConfig {
    pub fn allows(&self, group_id: &str) -> bool {
        if self
            .exclude_groups
            .iter()
            .any(|pattern| matches_pattern(group_id, pattern))
        {
            return false;
        }
        self.include_groups.is_empty()
            || self
                .include_groups
                .iter()
                .any(|pattern| matches_pattern(group_id, pattern))
    }
}

/// ミラー設定。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorConfig {
    /// 対象となるリポジトリ識別子（ワイルドカード対応）。
    pub mirror_of: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RetrySection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DownloadSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub sources: bool,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_max_concurrent() -> usize {
    8
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            sources: false,
            retry: RetrySection::default(),
        }
    }
}

/// 解決エンジンの設定ファイル全体。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ResolveConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// `~/.m2/repository` を参照するか。
    #[serde(default)]
    pub maven_local: bool,
    /// Gradle のファイルキャッシュを参照するか。
    #[serde(default)]
    pub gradle_local: bool,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
}

impl ResolveConfig {
    /// `~/.jv/resolve.toml` を読み込む。存在しなければ既定値。
    pub fn load_default() -> Result<Self, RepositoryError> {
        let home = dirs::home_dir().ok_or(RepositoryError::HomeDirectoryUnavailable)?;
        Self::load_or_default(&home.join(".jv").join("resolve.toml"))
    }

    pub fn load_or_default(path: &Path) -> Result<Self, RepositoryError> {
        if !path.exists() {
            debug!(path = %path.display(), "設定ファイルがないため既定値を使用");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self, RepositoryError> {
        let contents = fs::read_to_string(path).map_err(|source| RepositoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, RepositoryError> {
        Ok(toml::from_str(contents)?)
    }

    /// 優先度順に並べたリモートリポジトリ定義。空なら組み込みの既定値。
    pub fn prioritised_repositories(&self) -> Vec<RepositoryConfig> {
        let mut repos = if self.repositories.is_empty() {
            builtin_repositories()
        } else {
            self.repositories.clone()
        };
        repos.sort_by(|left, right| {
            left.priority
                .cmp(&right.priority)
                .then_with(|| left.name.cmp(&right.name))
        });
        let mut seen = HashSet::new();
        repos.retain(|repo| seen.insert(repo.name.clone()));
        repos
    }

    /// ミラー適用後のURL。
    pub fn effective_url<'a>(&'a self, repo: &'a RepositoryConfig) -> &'a str {
        self.mirrors
            .iter()
            .find(|mirror| matches_pattern(&repo.name, &mirror.mirror_of))
            .map(|mirror| mirror.url.as_str())
            .unwrap_or(repo.url.as_str())
    }

    /// 指定グループの探索に使うリポジトリ列。ローカルが先頭に並ぶ。
    pub fn repositories_for(&self, group_id: Option<&str>) -> Result<Vec<Repository>, RepositoryError> {
        let mut repositories = Vec::new();
        if self.maven_local {
            repositories.push(Repository::Local(LocalRepository::maven_local()?));
        }
        if self.gradle_local {
            repositories.push(Repository::Local(LocalRepository::gradle_local()?));
        }
        for config in self.prioritised_repositories() {
            let allowed = match (group_id, config.filter.as_ref()) {
                (Some(group), Some(filter)) => filter.allows(group),
                _ => true,
            };
            if !allowed {
                continue;
            }
            let mut remote = RemoteRepository::new(&config.name, self.effective_url(&config))?
                .with_publish(config.publish)
                .with_untrusted_hashes(config.untrusted_hashes.clone());
            if let Some(auth) = &config.auth {
                remote = remote.with_credentials(auth.credentials()?);
            }
            if let Some(filter) = &config.filter {
                remote = remote.with_group_filter(filter.clone());
            }
            repositories.push(Repository::Remote(remote));
        }
        Ok(repositories)
    }

    pub fn repositories(&self) -> Result<Vec<Repository>, RepositoryError> {
        self.repositories_for(None)
    }
}

pub fn builtin_repositories() -> Vec<RepositoryConfig> {
    [
        ("maven-central", super::MAVEN_CENTRAL_URL, 10),
        ("google", super::GOOGLE_MAVEN_URL, 20),
    ]
    .into_iter()
    .map(|(name, url, priority)| RepositoryConfig {
        name: name.to_string(),
        url: url.to_string(),
        priority,
        auth: None,
        filter: None,
        publish: false,
        untrusted_hashes: Vec::new(),
    })
    .collect()
}

fn matches_pattern(text: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        None => text == pattern,
        Some((prefix, rest)) => {
            let Some(mut remaining) = text.strip_prefix(prefix) else {
                return false;
            };
            let mut parts = rest.split('*').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    return remaining.ends_with(part);
                }
                if part.is_empty() {
                    continue;
                }
                match remaining.find(part) {
                    Some(index) => remaining = &remaining[index + part.len()..],
                    None => return false,
                }
            }
            true
        }
    }
}

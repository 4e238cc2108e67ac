//! Remote and local artifact repositories.

pub mod config;
pub mod local;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::checksum::HashAlgorithm;
use crate::coordinates::Coordinates;
use config::FilterConfig;

pub use local::LocalRootDiscovery;

pub const MAVEN_CENTRAL_URL: &str = "https://repo1.maven.org/maven2/";
pub const GOOGLE_MAVEN_URL: &str = "https://maven.google.com/";

/// リポジトリ管理エラー。
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("ホームディレクトリを特定できませんでした")]
    HomeDirectoryUnavailable,
    #[error("リポジトリURL '{url}' が不正です: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("設定ファイル {path:?} の読み込みに失敗しました: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("設定ファイルの解析に失敗しました: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("settings.xml の解析に失敗しました ({path:?}): {message}")]
    Settings { path: PathBuf, message: String },
    #[error("認証設定が不完全です: {0}")]
    AuthConfigError(String),
}

/// 認証情報。
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credentials::Token(_) => f.debug_tuple("Token").field(&"***").finish(),
        }
    }
}

/// HTTP(S) または file:// で公開されたMavenリポジトリ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub name: String,
    pub url: Url,
    pub credentials: Option<Credentials>,
    /// `install` の公開先として利用できるか。
    pub publish: bool,
    /// 公開しているチェックサムが信用できないアルゴリズム。
    pub untrusted_hashes: Vec<HashAlgorithm>,
    /// 問い合わせるグループの制限。`None` なら全グループ。
    pub group_filter: Option<FilterConfig>,
}

impl RemoteRepository {
    pub fn new(name: impl Into<String>, url: impl AsRef<str>) -> Result<Self, RepositoryError> {
        let raw = url.as_ref();
        let mut url = Url::parse(raw).map_err(|source| RepositoryError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        ensure_trailing_slash(&mut url);
        Ok(Self {
            name: name.into(),
            url,
            credentials: None,
            publish: false,
            untrusted_hashes: Vec::new(),
            group_filter: None,
        })
    }

    pub fn maven_central() -> Result<Self, RepositoryError> {
        Self::new("maven-central", MAVEN_CENTRAL_URL)
    }

    pub fn google() -> Result<Self, RepositoryError> {
        Self::new("google", GOOGLE_MAVEN_URL)
    }

    /// ローカルディレクトリを file:// リポジトリとして扱う。
    pub fn from_directory(name: impl Into<String>, path: &Path) -> Result<Self, RepositoryError> {
        let url = Url::from_directory_path(path).map_err(|_| RepositoryError::InvalidUrl {
            url: path.display().to_string(),
            source: url::ParseError::RelativeUrlWithoutBase,
        })?;
        Ok(Self {
            name: name.into(),
            url,
            credentials: None,
            publish: false,
            untrusted_hashes: Vec::new(),
            group_filter: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_untrusted_hashes(mut self, algorithms: Vec<HashAlgorithm>) -> Self {
        self.untrusted_hashes = algorithms;
        self
    }

    pub fn with_group_filter(mut self, filter: FilterConfig) -> Self {
        self.group_filter = Some(filter);
        self
    }

    /// 指定グループをこのリポジトリへ問い合わせるか。
    pub fn serves(&self, group_id: &str) -> bool {
        self.group_filter
            .as_ref()
            .is_none_or(|filter| filter.allows(group_id))
    }

    /// このリポジトリで検証に使うアルゴリズム (優先順)。
    pub fn hash_algorithms(&self) -> Vec<HashAlgorithm> {
        HashAlgorithm::ALL
            .into_iter()
            .filter(|algorithm| !self.untrusted_hashes.contains(algorithm))
            .collect()
    }

    pub fn join(&self, relative: &str) -> Result<Url, url::ParseError> {
        self.url.join(relative)
    }
}

/// ローカルリポジトリのディレクトリ構成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalLayout {
    /// `group/path/artifact/version/artifact-version.ext`
    MavenFlat,
    /// `group.id/artifact/version/<sha1>/artifact-version.ext`
    GradleHashed,
}

/// ディスク上のアーティファクトキャッシュ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRepository {
    pub name: String,
    pub root: PathBuf,
    pub layout: LocalLayout,
    /// このエンジン自身が書き込んだインストール先で、チェックサム取得を省略できる。
    pub trusted: bool,
}

impl LocalRepository {
    pub fn maven_flat(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            layout: LocalLayout::MavenFlat,
            trusted: false,
        }
    }

    pub fn gradle_hashed(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            layout: LocalLayout::GradleHashed,
            trusted: false,
        }
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }

    /// `~/.m2/repository` (設定による上書きを考慮)。
    pub fn maven_local() -> Result<Self, RepositoryError> {
        let root = LocalRootDiscovery::from_env()?.maven_root()?;
        Ok(Self::maven_flat("maven-local", root))
    }

    /// Gradle の `modules-2/files-2.1` キャッシュ。
    pub fn gradle_local() -> Result<Self, RepositoryError> {
        let root = LocalRootDiscovery::from_env()?.gradle_root()?;
        Ok(Self::gradle_hashed("gradle-local", root))
    }

    pub fn version_dir(&self, coords: &Coordinates) -> Option<PathBuf> {
        let version = coords.version()?;
        let mut dir = self.root.clone();
        match self.layout {
            LocalLayout::MavenFlat => {
                for segment in coords.group_id.split('.') {
                    dir.push(segment);
                }
            }
            LocalLayout::GradleHashed => dir.push(&coords.group_id),
        }
        dir.push(&coords.artifact_id);
        dir.push(version);
        Some(dir)
    }

    /// 既存ファイルの位置を推定する。ハッシュ付き構成ではディレクトリを走査する。
    pub fn guess_path(&self, coords: &Coordinates, file_name: &str) -> Option<PathBuf> {
        let version_dir = self.version_dir(coords)?;
        match self.layout {
            LocalLayout::MavenFlat => {
                let candidate = version_dir.join(file_name);
                candidate.is_file().then_some(candidate)
            }
            LocalLayout::GradleHashed => {
                let mut hash_dirs: Vec<PathBuf> = fs::read_dir(&version_dir)
                    .ok()?
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir())
                    .collect();
                hash_dirs.sort();
                hash_dirs
                    .into_iter()
                    .map(|dir| dir.join(file_name))
                    .find(|candidate| candidate.is_file())
            }
        }
    }

    /// 書き込み先のパス。ハッシュ付き構成では SHA-1 が必要。
    pub fn target_path(
        &self,
        coords: &Coordinates,
        file_name: &str,
        sha1: Option<&str>,
    ) -> Option<PathBuf> {
        let version_dir = self.version_dir(coords)?;
        match self.layout {
            LocalLayout::MavenFlat => Some(version_dir.join(file_name)),
            LocalLayout::GradleHashed => Some(version_dir.join(sha1?).join(file_name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repository {
    Remote(RemoteRepository),
    Local(LocalRepository),
}

impl Repository {
    pub fn name(&self) -> &str {
        match self {
            Repository::Remote(remote) => &remote.name,
            Repository::Local(local) => &local.name,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Repository::Local(_))
    }

    pub fn as_remote(&self) -> Option<&RemoteRepository> {
        match self {
            Repository::Remote(remote) => Some(remote),
            Repository::Local(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&LocalRepository> {
        match self {
            Repository::Local(local) => Some(local),
            Repository::Remote(_) => None,
        }
    }

    /// キャッシュキーに使う安定した識別文字列。
    pub fn fingerprint(&self) -> String {
        match self {
            Repository::Remote(remote) => match &remote.group_filter {
                Some(filter) => format!(
                    "remote:{}:+{}:-{}",
                    remote.url,
                    filter.include_groups.join(","),
                    filter.exclude_groups.join(",")
                ),
                None => format!("remote:{}", remote.url),
            },
            Repository::Local(local) => format!(
                "local:{:?}:{}:{}",
                local.layout,
                local.trusted,
                local.root.display()
            ),
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repository::Remote(remote) => write!(f, "{} ({})", remote.name, remote.url),
            Repository::Local(local) => {
                write!(f, "{} ({})", local.name, local.root.display())
            }
        }
    }
}

impl From<RemoteRepository> for Repository {
    fn from(value: RemoteRepository) -> Self {
        Repository::Remote(value)
    }
}

impl From<LocalRepository> for Repository {
    fn from(value: LocalRepository) -> Self {
        Repository::Local(value)
    }
}

/// ローカルを先頭に、与えられた順序を保ったまま並べ替える。
pub fn local_first(repositories: Vec<Repository>) -> Vec<Repository> {
    let (mut local, remote): (Vec<_>, Vec<_>) =
        repositories.into_iter().partition(Repository::is_local);
    local.extend(remote);
    local
}

pub(crate) fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}

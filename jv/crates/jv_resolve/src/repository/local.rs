use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use roxmltree::Document;
use tracing::{debug, warn};

use super::RepositoryError;

/// ローカルリポジトリのルートを決定するための入力。
///
/// Maven のルートは次の順で決まる:
/// `maven.repo.local` の明示指定 → `$M2_HOME/conf/settings.xml` →
/// `~/.m2/settings.xml` → `~/.m2/repository`。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalRootDiscovery {
    pub home: Option<PathBuf>,
    pub maven_repo_local: Option<String>,
    pub m2_home: Option<PathBuf>,
    pub gradle_user_home: Option<PathBuf>,
}

impl LocalRootDiscovery {
    /// プロセス環境から入力を集める。
    pub fn from_env() -> Result<Self, RepositoryError> {
        let home = dirs::home_dir().ok_or(RepositoryError::HomeDirectoryUnavailable)?;
        let maven_repo_local = env::var("JV_MAVEN_REPO_LOCAL")
            .ok()
            .or_else(|| {
                env::var("MAVEN_OPTS")
                    .ok()
                    .and_then(|opts| maven_repo_local_from_opts(&opts))
            });
        Ok(Self {
            home: Some(home),
            maven_repo_local,
            m2_home: non_empty_env("M2_HOME").map(PathBuf::from),
            gradle_user_home: non_empty_env("GRADLE_USER_HOME").map(PathBuf::from),
        })
    }

    fn home(&self) -> Result<&Path, RepositoryError> {
        self.home
            .as_deref()
            .ok_or(RepositoryError::HomeDirectoryUnavailable)
    }

    pub fn maven_root(&self) -> Result<PathBuf, RepositoryError> {
        if let Some(explicit) = self
            .maven_repo_local
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            debug!(root = explicit, "maven.repo.local の指定を使用");
            return Ok(PathBuf::from(explicit));
        }

        let home = self.home()?;
        let mut settings_files = Vec::new();
        if let Some(m2_home) = &self.m2_home {
            settings_files.push(m2_home.join("conf").join("settings.xml"));
        }
        settings_files.push(home.join(".m2").join("settings.xml"));

        for settings in settings_files {
            if !settings.is_file() {
                continue;
            }
            match local_repository_from_settings(&settings, home) {
                Ok(Some(root)) => {
                    debug!(settings = %settings.display(), root = %root.display(), "settings.xml の localRepository を使用");
                    return Ok(root);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(settings = %settings.display(), %error, "settings.xml を読み飛ばします");
                }
            }
        }

        Ok(home.join(".m2").join("repository"))
    }

    pub fn gradle_root(&self) -> Result<PathBuf, RepositoryError> {
        let base = match &self.gradle_user_home {
            Some(gradle_home) => gradle_home.clone(),
            None => self.home()?.join(".gradle"),
        };
        Ok(base.join("caches").join("modules-2").join("files-2.1"))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// `MAVEN_OPTS` 中の `-Dmaven.repo.local=...` を取り出す。
pub fn maven_repo_local_from_opts(opts: &str) -> Option<String> {
    opts.split_whitespace()
        .filter_map(|token| token.strip_prefix("-Dmaven.repo.local="))
        .map(|value| value.trim_matches('"').to_string())
        .rfind(|value| !value.is_empty())
}

/// settings.xml の `<localRepository>` を読む。`${user.home}` は展開する。
pub fn local_repository_from_settings(
    settings: &Path,
    home: &Path,
) -> Result<Option<PathBuf>, RepositoryError> {
    let text = fs::read_to_string(settings).map_err(|source| RepositoryError::Io {
        path: settings.to_path_buf(),
        source,
    })?;
    let document = Document::parse(&text).map_err(|error| RepositoryError::Settings {
        path: settings.to_path_buf(),
        message: error.to_string(),
    })?;
    let value = document
        .descendants()
        .find(|node| node.has_tag_name("localRepository"))
        .and_then(|node| node.text())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    Ok(value.map(|raw| {
        let home = home.to_string_lossy();
        PathBuf::from(
            raw.replace("${user.home}", &home)
                .replace("${env.HOME}", &home),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery(home: &Path) -> LocalRootDiscovery {
        LocalRootDiscovery {
            home: Some(home.to_path_buf()),
            ..LocalRootDiscovery::default()
        }
    }

    #[test]
    fn defaults_to_dot_m2_repository() {
        let home = tempfile::tempdir().expect("tempdir");
        let root = discovery(home.path()).maven_root().expect("root");
        assert_eq!(root, home.path().join(".m2/repository"));
    }

    #[test]
    fn explicit_override_wins_over_settings() {
        let home = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(home.path().join(".m2")).expect("mkdir");
        fs::write(
            home.path().join(".m2/settings.xml"),
            "<settings><localRepository>/from/settings</localRepository></settings>",
        )
        .expect("write");

        let mut input = discovery(home.path());
        assert_eq!(
            input.maven_root().expect("root"),
            PathBuf::from("/from/settings")
        );

        input.maven_repo_local = Some("/explicit".to_string());
        assert_eq!(input.maven_root().expect("root"), PathBuf::from("/explicit"));

        input.maven_repo_local = Some("  ".to_string());
        assert_eq!(
            input.maven_root().expect("root"),
            PathBuf::from("/from/settings")
        );
    }

    #[test]
    fn m2_home_settings_precede_user_settings() {
        let home = tempfile::tempdir().expect("tempdir");
        let m2_home = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(m2_home.path().join("conf")).expect("mkdir");
        fs::write(
            m2_home.path().join("conf/settings.xml"),
            r#"<settings xmlns="http://maven.apache.org/SETTINGS/1.0.0">
                 <localRepository>${user.home}/custom-repo</localRepository>
               </settings>"#,
        )
        .expect("write");
        fs::create_dir_all(home.path().join(".m2")).expect("mkdir");
        fs::write(
            home.path().join(".m2/settings.xml"),
            "<settings><localRepository>/user</localRepository></settings>",
        )
        .expect("write");

        let mut input = discovery(home.path());
        input.m2_home = Some(m2_home.path().to_path_buf());
        assert_eq!(
            input.maven_root().expect("root"),
            home.path().join("custom-repo")
        );
    }

    #[test]
    fn empty_local_repository_element_is_ignored() {
        let home = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(home.path().join(".m2")).expect("mkdir");
        fs::write(
            home.path().join(".m2/settings.xml"),
            "<settings><localRepository>  </localRepository></settings>",
        )
        .expect("write");
        assert_eq!(
            discovery(home.path()).maven_root().expect("root"),
            home.path().join(".m2/repository")
        );
    }

    #[test]
    fn maven_opts_property_is_extracted() {
        assert_eq!(
            maven_repo_local_from_opts("-Xmx1g -Dmaven.repo.local=/opt/m2 -Dfoo=bar"),
            Some("/opt/m2".to_string())
        );
        assert_eq!(maven_repo_local_from_opts("-Xmx1g"), None);
    }

    #[test]
    fn gradle_root_honours_user_home_override() {
        let home = tempfile::tempdir().expect("tempdir");
        let mut input = discovery(home.path());
        assert_eq!(
            input.gradle_root().expect("root"),
            home.path().join(".gradle/caches/modules-2/files-2.1")
        );
        input.gradle_user_home = Some(PathBuf::from("/gradle-home"));
        assert_eq!(
            input.gradle_root().expect("root"),
            PathBuf::from("/gradle-home/caches/modules-2/files-2.1")
        );
    }
}

//! Immutable resolution settings shared by every node of one graph.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::files::InFlightDownloads;
use crate::install::LocalInstallSink;
use crate::remote::{HttpTransport, RemoteError, RetryConfig, Transport};
use crate::repository::config::ResolveConfig;
use crate::repository::{LocalRepository, RemoteRepository, Repository, RepositoryError, local_first};

/// 解決スコープ。どの宣言済み依存を辿るかを決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Compile,
    Runtime,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Compile => "compile",
            Scope::Runtime => "runtime",
        }
    }

    /// POM の `<scope>` 値をこのスコープで辿るか。
    pub fn includes_pom_scope(&self, pom_scope: Option<&str>) -> bool {
        match pom_scope.map(str::trim).filter(|value| !value.is_empty()) {
            None | Some("compile") => true,
            Some("runtime") => *self == Scope::Runtime,
            _ => false,
        }
    }

    /// `org.gradle.usage` 属性の受け入れ値。
    pub fn usages(&self) -> &'static [&'static str] {
        match self {
            Scope::Compile => &["java-api", "kotlin-api"],
            Scope::Runtime => &["java-runtime", "kotlin-runtime"],
        }
    }

    pub fn fallback(&self) -> Scope {
        match self {
            Scope::Compile => Scope::Runtime,
            Scope::Runtime => Scope::Compile,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ContextError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compile" => Ok(Scope::Compile),
            "runtime" => Ok(Scope::Runtime),
            other => Err(ContextError::UnknownScope(other.to_string())),
        }
    }
}

/// `org.jetbrains.kotlin.platform.type` 属性の値。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformType {
    Common,
    Jvm,
    AndroidJvm,
    Js,
    Wasm,
    Native,
}

impl PlatformType {
    pub fn value(&self) -> &'static str {
        match self {
            PlatformType::Common => "common",
            PlatformType::Jvm => "jvm",
            PlatformType::AndroidJvm => "androidJvm",
            PlatformType::Js => "js",
            PlatformType::Wasm => "wasm",
            PlatformType::Native => "native",
        }
    }

    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            "common" => Some(PlatformType::Common),
            "jvm" => Some(PlatformType::Jvm),
            "androidJvm" => Some(PlatformType::AndroidJvm),
            "js" => Some(PlatformType::Js),
            "wasm" => Some(PlatformType::Wasm),
            "native" => Some(PlatformType::Native),
            _ => None,
        }
    }

    /// 専用バリアントが無い場合に受け入れる代替。Android は JVM 向け成果物を使える。
    pub fn fallback(&self) -> Option<PlatformType> {
        match self {
            PlatformType::AndroidJvm => Some(PlatformType::Jvm),
            _ => None,
        }
    }
}

/// 解決対象のプラットフォーム。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Jvm,
    Android,
    Js,
    Wasm,
    IosArm64,
    IosX64,
    IosSimulatorArm64,
    MacosX64,
    MacosArm64,
    LinuxX64,
    LinuxArm64,
    MingwX64,
}

impl Platform {
    pub const ALL: [Platform; 12] = [
        Platform::Jvm,
        Platform::Android,
        Platform::Js,
        Platform::Wasm,
        Platform::IosArm64,
        Platform::IosX64,
        Platform::IosSimulatorArm64,
        Platform::MacosX64,
        Platform::MacosArm64,
        Platform::LinuxX64,
        Platform::LinuxArm64,
        Platform::MingwX64,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Jvm => "jvm",
            Platform::Android => "android",
            Platform::Js => "js",
            Platform::Wasm => "wasm",
            Platform::IosArm64 => "ios-arm64",
            Platform::IosX64 => "ios-x64",
            Platform::IosSimulatorArm64 => "ios-simulator-arm64",
            Platform::MacosX64 => "macos-x64",
            Platform::MacosArm64 => "macos-arm64",
            Platform::LinuxX64 => "linux-x64",
            Platform::LinuxArm64 => "linux-arm64",
            Platform::MingwX64 => "mingw-x64",
        }
    }

    pub fn platform_type(&self) -> PlatformType {
        match self {
            Platform::Jvm => PlatformType::Jvm,
            Platform::Android => PlatformType::AndroidJvm,
            Platform::Js => PlatformType::Js,
            Platform::Wasm => PlatformType::Wasm,
            _ => PlatformType::Native,
        }
    }

    /// `org.jetbrains.kotlin.native.target` 属性の値。ネイティブ以外は `None`。
    pub fn native_target(&self) -> Option<&'static str> {
        match self {
            Platform::IosArm64 => Some("ios_arm64"),
            Platform::IosX64 => Some("ios_x64"),
            Platform::IosSimulatorArm64 => Some("ios_simulator_arm64"),
            Platform::MacosX64 => Some("macos_x64"),
            Platform::MacosArm64 => Some("macos_arm64"),
            Platform::LinuxX64 => Some("linux_x64"),
            Platform::LinuxArm64 => Some("linux_arm64"),
            Platform::MingwX64 => Some("mingw_x64"),
            Platform::Jvm | Platform::Android | Platform::Js | Platform::Wasm => None,
        }
    }

    /// Apple ホストでのみビルドできる (共通メタデータに含まれないことがある) ターゲットか。
    pub fn is_apple(&self) -> bool {
        matches!(
            self,
            Platform::IosArm64
                | Platform::IosX64
                | Platform::IosSimulatorArm64
                | Platform::MacosX64
                | Platform::MacosArm64
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = ContextError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = value.trim().to_ascii_lowercase().replace('_', "-");
        Platform::ALL
            .into_iter()
            .find(|platform| platform.name() == normalised)
            .ok_or_else(|| ContextError::UnknownPlatform(value.trim().to_string()))
    }
}

/// PARTIAL はメタデータのみ、NETWORK は成果物ファイルまで取得する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionLevel {
    Partial,
    Network,
}

/// ダウンロードキャッシュと解決済みグラフの保存先。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub root: PathBuf,
    /// 解決済みグラフを保存・再利用するか。
    pub incremental: bool,
}

impl CacheSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            incremental: true,
        }
    }

    pub fn default_root() -> Result<PathBuf, RepositoryError> {
        let home = dirs::home_dir().ok_or(RepositoryError::HomeDirectoryUnavailable)?;
        Ok(home.join(".jv").join("resolve"))
    }

    /// 内容アドレスで管理される一次キャッシュ。
    pub fn files_repository(&self) -> LocalRepository {
        LocalRepository::gradle_hashed("resolve-cache", self.root.join("files"))
    }

    pub fn graphs_dir(&self) -> PathBuf {
        self.root.join("graphs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("files").join(".tmp")
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("解決対象のプラットフォームが指定されていません")]
    NoPlatforms,
    #[error("未対応のプラットフォーム: {0}")]
    UnknownPlatform(String),
    #[error("未対応のスコープ: {0} (compile または runtime)")]
    UnknownScope(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transport(#[from] RemoteError),
}

/// ノードの同一性に含まれる、コンテキストのうち解決結果を左右する部分。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub scope: Scope,
    pub platforms: BTreeSet<Platform>,
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let platforms: Vec<&str> = self.platforms.iter().map(Platform::name).collect();
        write!(f, "{}[{}]", self.scope, platforms.join(","))
    }
}

struct ContextInner {
    scope: Scope,
    platforms: BTreeSet<Platform>,
    repositories: Vec<Repository>,
    cache: CacheSettings,
    transport: Arc<dyn Transport>,
    max_concurrent: usize,
    download_sources: bool,
    cancellation: CancellationToken,
    install_sink: Option<LocalInstallSink>,
    in_flight: InFlightDownloads,
}

/// 解決時の不変設定。複製は安価で、同じHTTPクライアントとキャンセル信号を共有する。
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("scope", &self.inner.scope)
            .field("platforms", &self.inner.platforms)
            .field("repositories", &self.inner.repositories)
            .field("cache", &self.inner.cache)
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    pub fn platforms(&self) -> &BTreeSet<Platform> {
        &self.inner.platforms
    }

    pub fn is_multiplatform(&self) -> bool {
        self.inner.platforms.len() > 1
    }

    pub fn key(&self) -> ContextKey {
        ContextKey {
            scope: self.inner.scope,
            platforms: self.inner.platforms.clone(),
        }
    }

    /// 探索順に並んだリポジトリ (インストール先・ローカル・リモートの順)。
    pub fn repositories(&self) -> &[Repository] {
        &self.inner.repositories
    }

    pub fn remote_repositories(&self) -> impl Iterator<Item = &RemoteRepository> {
        self.inner
            .repositories
            .iter()
            .filter_map(Repository::as_remote)
    }

    /// グループフィルタを満たすリモートリポジトリ。
    pub fn remote_repositories_for<'a>(
        &'a self,
        group_id: &'a str,
    ) -> impl Iterator<Item = &'a RemoteRepository> {
        self.remote_repositories()
            .filter(move |remote| remote.serves(group_id))
    }

    pub fn local_repositories(&self) -> impl Iterator<Item = &LocalRepository> {
        self.inner
            .repositories
            .iter()
            .filter_map(Repository::as_local)
    }

    pub fn cache(&self) -> &CacheSettings {
        &self.inner.cache
    }

    pub fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn download_sources(&self) -> bool {
        self.inner.download_sources
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub fn install_sink(&self) -> Option<&LocalInstallSink> {
        self.inner.install_sink.as_ref()
    }

    pub(crate) fn in_flight(&self) -> &InFlightDownloads {
        &self.inner.in_flight
    }
}

/// [`Context`] のビルダー。未指定の項目は既定値 (COMPILE / JVM / Maven Central) で補う。
#[derive(Default)]
pub struct ContextBuilder {
    scope: Option<Scope>,
    platforms: BTreeSet<Platform>,
    repositories: Vec<Repository>,
    cache: Option<CacheSettings>,
    transport: Option<Arc<dyn Transport>>,
    retry: Option<RetryConfig>,
    max_concurrent: Option<usize>,
    download_sources: bool,
    cancellation: Option<CancellationToken>,
    install_sink: Option<LocalInstallSink>,
    platforms_cleared: bool,
}

impl ContextBuilder {
    /// 設定ファイルのリポジトリ・ダウンロード設定を取り込む。
    pub fn from_config(config: &ResolveConfig) -> Result<Self, ContextError> {
        let mut builder = Self::default()
            .repositories(config.repositories()?)
            .max_concurrent(config.download.max_concurrent)
            .retry(config.download.retry.to_retry_config())
            .download_sources(config.download.sources);
        if let Some(cache_dir) = &config.cache_dir {
            builder = builder.cache(CacheSettings::new(cache_dir));
        }
        Ok(builder)
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platforms.insert(platform);
        self
    }

    pub fn platforms(mut self, platforms: impl IntoIterator<Item = Platform>) -> Self {
        self.platforms = platforms.into_iter().collect();
        self.platforms_cleared = self.platforms.is_empty();
        self
    }

    pub fn repository(mut self, repository: impl Into<Repository>) -> Self {
        self.repositories.push(repository.into());
        self
    }

    pub fn repositories(mut self, repositories: Vec<Repository>) -> Self {
        self.repositories = repositories;
        self
    }

    pub fn cache(mut self, cache: CacheSettings) -> Self {
        self.cache = Some(cache);
        self
    }

    /// HTTPクライアント等を共有するため、既存のトランスポートを注入する。
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn download_sources(mut self, enabled: bool) -> Self {
        self.download_sources = enabled;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn install_sink(mut self, sink: LocalInstallSink) -> Self {
        self.install_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        let platforms = if self.platforms.is_empty() {
            if self.platforms_cleared {
                return Err(ContextError::NoPlatforms);
            }
            BTreeSet::from([Platform::Jvm])
        } else {
            self.platforms
        };

        let repositories = if self.repositories.is_empty() {
            vec![Repository::Remote(RemoteRepository::maven_central()?)]
        } else {
            self.repositories
        };
        let mut repositories = local_first(repositories);
        if let Some(sink) = &self.install_sink {
            let trusted = Repository::Local(sink.repository().clone());
            repositories.retain(|repository| repository != &trusted);
            repositories.insert(0, trusted);
        }

        let cache = match self.cache {
            Some(cache) => cache,
            None => CacheSettings::new(CacheSettings::default_root()?),
        };

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(self.retry.unwrap_or_default())?),
        };

        Ok(Context {
            inner: Arc::new(ContextInner {
                scope: self.scope.unwrap_or(Scope::Compile),
                platforms,
                repositories,
                cache,
                transport,
                max_concurrent: self.max_concurrent.unwrap_or(8).max(1),
                download_sources: self.download_sources,
                cancellation: self.cancellation.unwrap_or_default(),
                install_sink: self.install_sink,
                in_flight: InFlightDownloads::default(),
            }),
        })
    }
}

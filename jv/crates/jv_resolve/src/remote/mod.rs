//! HTTP (and `file://`) access to remote Maven repositories.

mod metadata;

use std::error::Error as StdError;
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::checksum::{Checksum, HashAlgorithm, extract_checksum};
use crate::coordinates::{Coordinates, ModuleKey};
use crate::repository::{Credentials, RemoteRepository};

pub use metadata::{
    MavenMetadata, MetadataParseError, Snapshot, SnapshotVersion, Versioning, parse_metadata,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// リトライ挙動を制御する設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5), 5)
    }
}

/// リモート取得のエラー種別。
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("URLの構築に失敗しました (base: {base}, path: {path}): {source}")]
    UrlJoin {
        base: String,
        path: String,
        source: url::ParseError,
    },
    #[error("HTTPクライアントの初期化に失敗しました: {source}")]
    ClientBuild { source: reqwest::Error },
    #[error("{url} が見つかりません")]
    NotFound { url: String },
    #[error("HTTP {status} が返されました: {url}")]
    HttpStatus { url: String, status: StatusCode },
    #[error("{url} への通信に失敗しました: {source}")]
    Network { url: String, source: reqwest::Error },
    #[error("{url} を取得できません: {reason}")]
    Unavailable { url: String, reason: String },
    #[error("{path} の読み込みに失敗しました: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{url} の内容が不正です: {message}")]
    InvalidResponse { url: String, message: String },
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }

    /// 時間をおいて再実行すれば成功し得る失敗か。
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network { .. } | RemoteError::Unavailable { .. } => true,
            RemoteError::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// リポジトリ内の相対パスを取得する手段。テストではファイルやメモリ上の実装に差し替える。
pub trait Transport: Send + Sync {
    fn get<'a>(
        &'a self,
        repository: &'a RemoteRepository,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, RemoteError>>;
}

/// reqwest ベースの既定実装。`file://` リポジトリは直接ファイルシステムから読む。
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    retry: RetryConfig,
}

impl HttpTransport {
    pub fn new(retry: RetryConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            // Avoid HTTP/2 oddities against Maven Central; prefer HTTP/1.1.
            .http1_only()
            .user_agent(format!("jv-resolve/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| RemoteError::ClientBuild { source })?;
        Ok(Self::with_client(client, retry))
    }

    /// 既存のHTTPクライアントを共有する。
    pub fn with_client(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    async fn fetch(&self, repository: &RemoteRepository, path: &str) -> Result<Bytes, RemoteError> {
        let url = repository
            .join(path)
            .map_err(|source| RemoteError::UrlJoin {
                base: repository.url.to_string(),
                path: path.to_string(),
                source,
            })?;
        if url.scheme() == "file" {
            return read_file_url(&url).await;
        }
        self.request_bytes(url, repository.credentials.as_ref())
            .await
    }

    async fn request_bytes(
        &self,
        url: Url,
        credentials: Option<&Credentials>,
    ) -> Result<Bytes, RemoteError> {
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let mut request = self.client.get(url.clone());
            request = match credentials {
                Some(Credentials::Basic { username, password }) => {
                    request.basic_auth(username, Some(password))
                }
                Some(Credentials::Token(token)) => request.bearer_auth(token),
                None => request,
            };
            debug!(attempt, max_attempts, url = %url, "リポジトリリクエストを送信");

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.bytes().await.map_err(|source| RemoteError::Network {
                            url: url.to_string(),
                            source,
                        });
                    }

                    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                        debug!(status = %status, url = %url, "リソースが存在しません");
                        return Err(RemoteError::NotFound {
                            url: url.to_string(),
                        });
                    }

                    let retryable =
                        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    if !retryable {
                        warn!(
                            status = %status,
                            url = %url,
                            "HTTP {} を受信。再試行しません (policy: 4xx no-retry)",
                            status
                        );
                        return Err(RemoteError::HttpStatus {
                            url: url.to_string(),
                            status,
                        });
                    }

                    warn!(
                        attempt,
                        max_attempts,
                        status = %status,
                        url = %url,
                        "HTTP {} を受信。再試行",
                        status
                    );
                    if attempt == max_attempts {
                        return Err(RemoteError::HttpStatus {
                            url: url.to_string(),
                            status,
                        });
                    }
                    sleep(self.retry.delay_for_attempt(attempt)).await;
                }
                Err(error) => {
                    let mut chain = format!("{error}");
                    let mut curr = error.source();
                    while let Some(src) = curr {
                        chain.push_str(&format!(" | caused by: {src}"));
                        curr = src.source();
                    }
                    let retryable = error.is_timeout() || error.is_connect();
                    warn!(
                        attempt,
                        max_attempts,
                        url = %url,
                        retryable,
                        error = %chain,
                        "HTTPリクエスト失敗"
                    );
                    if retryable && attempt < max_attempts {
                        sleep(self.retry.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(RemoteError::Network {
                        url: url.to_string(),
                        source: error,
                    });
                }
            }
        }

        Err(RemoteError::Unavailable {
            url: url.to_string(),
            reason: "再試行回数を超えました".to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn get<'a>(
        &'a self,
        repository: &'a RemoteRepository,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, RemoteError>> {
        Box::pin(self.fetch(repository, path))
    }
}

async fn read_file_url(url: &Url) -> Result<Bytes, RemoteError> {
    let path = url.to_file_path().map_err(|_| RemoteError::InvalidResponse {
        url: url.to_string(),
        message: "ファイルパスへ変換できません".to_string(),
    })?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(error) if error.kind() == ErrorKind::NotFound => Err(RemoteError::NotFound {
            url: url.to_string(),
        }),
        Err(source) => Err(RemoteError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// サイドカーのチェックサムファイルを取得する。存在しなければ `None`。
pub async fn fetch_checksum(
    transport: &dyn Transport,
    repository: &RemoteRepository,
    file_path: &str,
    algorithm: HashAlgorithm,
) -> Result<Option<Checksum>, RemoteError> {
    let checksum_path = format!("{file_path}.{}", algorithm.extension());
    let bytes = match transport.get(repository, &checksum_path).await {
        Ok(bytes) => bytes,
        Err(error) if error.is_not_found() => return Ok(None),
        Err(error) => return Err(error),
    };
    let text = String::from_utf8_lossy(bytes.as_ref());
    match extract_checksum(&text) {
        Some(value)
            if value.len() == algorithm.hex_len()
                && value.chars().all(|ch| ch.is_ascii_hexdigit()) =>
        {
            Ok(Some(Checksum::new(algorithm, value)))
        }
        _ => {
            warn!(
                repository = %repository.name,
                path = %checksum_path,
                "{} チェックサムファイルの内容が不正なため無視します",
                algorithm
            );
            Ok(None)
        }
    }
}

/// `group/artifact/maven-metadata.xml` を取得する。
pub async fn fetch_artifact_metadata(
    transport: &dyn Transport,
    repository: &RemoteRepository,
    key: &ModuleKey,
) -> Result<MavenMetadata, RemoteError> {
    let path = format!("{}/maven-metadata.xml", key.path());
    fetch_metadata_at(transport, repository, &path).await
}

/// スナップショットのバージョンディレクトリにある `maven-metadata.xml` を取得する。
pub async fn fetch_snapshot_metadata(
    transport: &dyn Transport,
    repository: &RemoteRepository,
    coords: &Coordinates,
) -> Result<MavenMetadata, RemoteError> {
    let dir = coords.version_dir().ok_or_else(|| RemoteError::InvalidResponse {
        url: coords.to_string(),
        message: "バージョンが指定されていません".to_string(),
    })?;
    fetch_metadata_at(transport, repository, &format!("{dir}/maven-metadata.xml")).await
}

async fn fetch_metadata_at(
    transport: &dyn Transport,
    repository: &RemoteRepository,
    path: &str,
) -> Result<MavenMetadata, RemoteError> {
    let bytes = transport.get(repository, path).await?;
    parse_metadata(bytes.as_ref()).map_err(|error| RemoteError::InvalidResponse {
        url: format!("{}{}", repository.url, path),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let retry = RetryConfig::new(Duration::from_millis(100), Duration::from_millis(350), 0);
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn transient_classification() {
        let unavailable = RemoteError::Unavailable {
            url: "u".into(),
            reason: "timeout".into(),
        };
        assert!(unavailable.is_transient());
        let server = RemoteError::HttpStatus {
            url: "u".into(),
            status: StatusCode::BAD_GATEWAY,
        };
        assert!(server.is_transient());
        let forbidden = RemoteError::HttpStatus {
            url: "u".into(),
            status: StatusCode::FORBIDDEN,
        };
        assert!(!forbidden.is_transient());
        assert!(!RemoteError::NotFound { url: "u".into() }.is_transient());
    }

    #[tokio::test]
    async fn file_repositories_are_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("org/example/demo/1.0/demo-1.0.jar");
        fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        fs::write(&file, b"payload").expect("write");
        fs::write(
            dir.path().join("org/example/demo/1.0/demo-1.0.jar.sha1"),
            format!("{}  demo-1.0.jar\n", HashAlgorithm::Sha1.compute(b"payload")),
        )
        .expect("write");
        fs::write(
            dir.path().join("org/example/demo/1.0/demo-1.0.jar.md5"),
            "not-a-hash",
        )
        .expect("write");

        let repo = RemoteRepository::from_directory("fixture", dir.path()).expect("repo");
        let transport = HttpTransport::new(RetryConfig::default()).expect("transport");

        let bytes = transport
            .get(&repo, "org/example/demo/1.0/demo-1.0.jar")
            .await
            .expect("read");
        assert_eq!(bytes.as_ref(), b"payload");

        let missing = transport
            .get(&repo, "org/example/demo/1.0/demo-1.0.pom")
            .await
            .expect_err("missing");
        assert!(missing.is_not_found());

        let sha1 = fetch_checksum(
            &transport,
            &repo,
            "org/example/demo/1.0/demo-1.0.jar",
            HashAlgorithm::Sha1,
        )
        .await
        .expect("checksum");
        assert_eq!(
            sha1.map(|checksum| checksum.value),
            Some(HashAlgorithm::Sha1.compute(b"payload"))
        );

        let md5 = fetch_checksum(
            &transport,
            &repo,
            "org/example/demo/1.0/demo-1.0.jar",
            HashAlgorithm::Md5,
        )
        .await
        .expect("checksum");
        assert_eq!(md5, None);
    }
}

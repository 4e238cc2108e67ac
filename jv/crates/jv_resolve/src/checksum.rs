use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 8192;
const LOCKED_READ_ATTEMPTS: u32 = 8;

/// チェックサムアルゴリズム。`ALL` は信頼度の高い順に並ぶ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha512,
    Sha256,
    Sha1,
    Md5,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha512,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha1,
        HashAlgorithm::Md5,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Md5 => "md5",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "SHA-512",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Md5 => "MD5",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.extension().eq_ignore_ascii_case(extension))
    }

    /// 十六進表現の長さ。チェックサムファイルの妥当性確認に使う。
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha512 => 128,
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Md5 => 32,
        }
    }

    pub fn compute(&self, bytes: &[u8]) -> String {
        let mut hasher = StreamingHasher::new(*self);
        hasher.update(bytes);
        hasher.finalize().value
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// 計算済み、またはリポジトリから取得したハッシュ値。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().to_ascii_lowercase(),
        }
    }

    pub fn matches(&self, actual: &str) -> bool {
        self.value.eq_ignore_ascii_case(actual.trim())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.extension(), self.value)
    }
}

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("{path:?} の読み込みに失敗しました: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path:?} はロックされたままです ({attempts} 回再試行)")]
    StillLocked { path: PathBuf, attempts: u32 },
    #[error("{path:?} の {algorithm} チェックサムが一致しません (expected={expected}, actual={actual})")]
    Mismatch {
        path: PathBuf,
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },
    #[error("ハッシュ計算タスクが異常終了しました: {0}")]
    Join(#[from] tokio::task::JoinError),
}

enum HasherState {
    Sha512(Sha512),
    Sha256(Sha256),
    Sha1(Sha1),
    Md5(md5::Context),
}

/// 単一アルゴリズムのストリーミングハッシュ。
pub struct StreamingHasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

impl StreamingHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Md5 => HasherState::Md5(md5::Context::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            HasherState::Sha512(hasher) => hasher.update(bytes),
            HasherState::Sha256(hasher) => hasher.update(bytes),
            HasherState::Sha1(hasher) => hasher.update(bytes),
            HasherState::Md5(context) => context.consume(bytes),
        }
    }

    pub fn finalize(self) -> Checksum {
        let value = match self.state {
            HasherState::Sha512(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Sha1(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Md5(context) => format!("{:x}", context.compute()),
        };
        Checksum::new(self.algorithm, value)
    }
}

/// ファイルを一度だけ読み、指定された全アルゴリズムのハッシュを計算する。
pub fn compute_file(
    path: &Path,
    algorithms: &[HashAlgorithm],
) -> Result<Vec<Checksum>, ChecksumError> {
    let io_error = |source| ChecksumError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_error)?;
    let mut hashers: Vec<StreamingHasher> =
        algorithms.iter().copied().map(StreamingHasher::new).collect();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(io_error)?;
        if read == 0 {
            break;
        }
        for hasher in &mut hashers {
            hasher.update(&buffer[..read]);
        }
    }
    Ok(hashers.into_iter().map(StreamingHasher::finalize).collect())
}

/// 他プロセスが書き込み中のファイルを読む場合に備え、短い待機を挟んで再試行する。
///
/// 待機時間は 10ms から倍々で 1s まで伸びる。`NotFound` は即座に返す。
pub async fn compute_file_with_retry(
    path: &Path,
    algorithms: &[HashAlgorithm],
) -> Result<Vec<Checksum>, ChecksumError> {
    let mut delay = Duration::from_millis(10);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let owned_path = path.to_path_buf();
        let owned_algorithms = algorithms.to_vec();
        let result =
            tokio::task::spawn_blocking(move || compute_file(&owned_path, &owned_algorithms))
                .await?;
        match result {
            Ok(hashes) => return Ok(hashes),
            Err(ChecksumError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Err(ChecksumError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
            Err(ChecksumError::Io { source, .. }) if attempt < LOCKED_READ_ATTEMPTS => {
                debug!(
                    path = %path.display(),
                    attempt,
                    error = %source,
                    "ファイルが読み込めないため待機して再試行"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(1));
            }
            Err(ChecksumError::Io { .. }) => {
                return Err(ChecksumError::StillLocked {
                    path: path.to_path_buf(),
                    attempts: attempt,
                });
            }
            Err(other) => return Err(other),
        }
    }
}

/// 期待値と実ファイルを照合する。
pub async fn verify_file(path: &Path, expected: &Checksum) -> Result<(), ChecksumError> {
    let computed = compute_file_with_retry(path, &[expected.algorithm]).await?;
    let actual = computed
        .into_iter()
        .next()
        .map(|hash| hash.value)
        .unwrap_or_default();
    if expected.matches(&actual) {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch {
            path: path.to_path_buf(),
            algorithm: expected.algorithm,
            expected: expected.value.clone(),
            actual,
        })
    }
}

/// チェックサムファイルの本文から最初のトークンを小文字で取り出す。
pub fn extract_checksum(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn known_digests() {
        assert_eq!(
            HashAlgorithm::Sha1.compute(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            HashAlgorithm::Sha256.compute(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            HashAlgorithm::Md5.compute(b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(HashAlgorithm::Sha512.compute(b"abc").len(), 128);
    }

    #[test]
    fn compute_file_streams_all_algorithms_at_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.bin");
        let payload = vec![7u8; READ_BUFFER_SIZE * 3 + 17];
        fs::write(&path, &payload).expect("write");

        let hashes = compute_file(&path, &HashAlgorithm::ALL).expect("hash");
        assert_eq!(hashes.len(), 4);
        for hash in hashes {
            assert_eq!(hash.value, hash.algorithm.compute(&payload));
            assert_eq!(hash.value.len(), hash.algorithm.hex_len());
        }
    }

    #[tokio::test]
    async fn verify_file_reports_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.jar");
        fs::write(&path, b"jar").expect("write");

        let good = Checksum::new(HashAlgorithm::Sha1, HashAlgorithm::Sha1.compute(b"jar"));
        verify_file(&path, &good).await.expect("matches");

        let bad = Checksum::new(HashAlgorithm::Sha1, "0000");
        let error = verify_file(&path, &bad).await.expect_err("mismatch");
        assert!(matches!(error, ChecksumError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_not_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = compute_file_with_retry(&dir.path().join("absent"), &[HashAlgorithm::Md5])
            .await
            .expect_err("missing");
        assert!(matches!(error, ChecksumError::Io { .. }));
    }

    #[test]
    fn extract_checksum_returns_lowercase_first_token() {
        let text = " \n 5F366B some-file.jar\n";
        assert_eq!(extract_checksum(text), Some("5f366b".to_string()));
        assert_eq!(extract_checksum("\n  \n"), None);
    }
}

//! Locating, downloading and verifying the files of resolved nodes.
//!
//! Lookup order for every file: the content-addressed cache under
//! `<cache_root>/files`, then the configured local repositories, then the
//! remote repositories. Nothing is handed out before a checksum from a trusted
//! source has been compared against the bytes.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::checksum::{Checksum, HashAlgorithm, compute_file_with_retry};
use crate::context::Context;
use crate::coordinates::Coordinates;
use crate::diagnostics::{DiagnosticKind, Message};
use crate::metadata::kmp;
use crate::metadata::module::VariantFile;
use crate::remote::{RemoteError, fetch_checksum, fetch_snapshot_metadata};
use crate::repository::{LocalRepository, RemoteRepository};

/// 成果物ファイルの取得方法。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FileOrigin {
    /// リポジトリからそのまま取得する。
    Download,
    /// 取得済みアーカイブからソースセットを取り出す。
    Extracted {
        archive: Box<DependencyFile>,
        source_set: String,
    },
}

/// 解決済みノードに属する1ファイル。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFile {
    /// ファイルが置かれるバージョンディレクトリの座標。
    pub coordinates: Coordinates,
    pub file_name: String,
    pub extension: String,
    /// メタデータに記載された期待値。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected: Vec<Checksum>,
    /// 見つからなくてもエラーにしない (ソースjarなど)。
    #[serde(default)]
    pub optional: bool,
    pub origin: FileOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl DependencyFile {
    /// 座標から `artifact-version[-classifier].ext` を組み立てる。バージョン未指定なら `None`。
    pub fn artifact(coordinates: &Coordinates, extension: &str) -> Option<Self> {
        let file_name = coordinates.file_name(extension)?;
        Some(Self {
            coordinates: coordinates.clone(),
            file_name,
            extension: extension.to_string(),
            expected: Vec::new(),
            optional: false,
            origin: FileOrigin::Download,
            path: None,
        })
    }

    /// モジュールメタデータのファイル記述から作る。`url` は `.module` からの相対パス。
    pub fn from_variant_file(module: &Coordinates, file: &VariantFile) -> Self {
        let segments: Vec<&str> = file.url.split('/').collect();
        let coordinates = match segments.as_slice() {
            ["..", version, _name] => module.with_version(*version),
            _ => module.clone(),
        };
        let file_name = segments
            .last()
            .map(|name| name.to_string())
            .unwrap_or_else(|| file.name.clone());
        Self {
            coordinates,
            extension: file.extension().to_string(),
            file_name,
            expected: file.checksums(),
            optional: false,
            origin: FileOrigin::Download,
            path: None,
        }
    }

    /// アーカイブ内のソースセットを klib として取り出すファイル。
    pub fn extracted(owner: &Coordinates, archive: DependencyFile, source_set: &str) -> Self {
        let version = owner.version().unwrap_or("unspecified");
        Self {
            coordinates: owner.clone(),
            file_name: format!("{}-{}-{}.klib", owner.artifact_id, version, source_set),
            extension: "klib".to_string(),
            expected: Vec::new(),
            optional: false,
            origin: FileOrigin::Extracted {
                archive: Box::new(archive),
                source_set: source_set.to_string(),
            },
            path: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// リポジトリルートからの相対パス。
    pub fn relative_path(&self) -> Option<String> {
        Some(format!("{}/{}", self.coordinates.version_dir()?, self.file_name))
    }

    fn key(&self) -> String {
        format!(
            "{}/{}",
            self.coordinates.version_dir().unwrap_or_default(),
            self.file_name
        )
    }
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("解決がキャンセルされました")]
    Cancelled,
    #[error("{file} はどのリポジトリにも見つかりません")]
    NotFound { file: String, attempts: Vec<Message> },
    #[error("{file} のチェックサムを取得できません")]
    ChecksumsUnavailable { file: String, attempts: Vec<Message> },
    #[error("{file} を取得できません")]
    Unavailable { file: String, attempts: Vec<Message> },
    #[error("{file} にソースセット {source_set} が含まれていません")]
    SourceSetMissing { file: String, source_set: String },
    #[error("{path:?} の処理に失敗しました: {message}")]
    Storage { path: PathBuf, message: String },
}

impl FileError {
    pub fn attempts(&self) -> &[Message] {
        match self {
            FileError::NotFound { attempts, .. }
            | FileError::ChecksumsUnavailable { attempts, .. }
            | FileError::Unavailable { attempts, .. } => attempts,
            _ => &[],
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FileError::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        self.attempts().iter().any(Message::is_transient)
    }

    /// ノードへ付与する診断に変換する。
    pub fn to_message(&self) -> Message {
        let kind = match self {
            FileError::ChecksumsUnavailable { .. } => DiagnosticKind::UnableToDownloadChecksums,
            FileError::SourceSetMissing { .. } => DiagnosticKind::SourceSetUnavailable,
            _ => DiagnosticKind::UnableToResolveDependency,
        };
        Message::error(kind, self.to_string()).with_children(self.attempts().to_vec())
    }
}

/// 同一プロセス内で同じファイルの取得を直列化する。
#[derive(Default)]
pub struct InFlightDownloads {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InFlightDownloads {
    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn acquire(&self, key: &str) -> InFlightGuard<'_> {
        let lock = self
            .locks()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        InFlightGuard {
            downloads: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks().len()
    }
}

/// 解放時に待機者がいなければ表からエントリを取り除く。
struct InFlightGuard<'a> {
    downloads: &'a InFlightDownloads,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.downloads.locks();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

struct Attempt {
    message: Message,
    not_found: bool,
    checksum_missing: bool,
}

impl Attempt {
    fn not_found(text: String) -> Self {
        Self {
            message: Message::info(DiagnosticKind::UnableToDownloadFile, text),
            not_found: true,
            checksum_missing: false,
        }
    }

    fn failed(message: Message) -> Self {
        Self {
            message,
            not_found: false,
            checksum_missing: false,
        }
    }

    fn checksum_missing(message: Message) -> Self {
        Self {
            message,
            not_found: false,
            checksum_missing: true,
        }
    }

    fn from_remote(repository: &RemoteRepository, error: RemoteError) -> Self {
        if error.is_not_found() {
            return Self::not_found(format!("{}: {}", repository.name, error));
        }
        let transient = error.is_transient();
        Self::failed(
            Message::warning(
                DiagnosticKind::UnableToDownloadFile,
                format!("{}: {}", repository.name, error),
            )
            .with_transient(transient),
        )
    }
}

enum LocalCheck {
    Valid,
    Rejected(Attempt),
}

/// ファイル解決器。[`Context`] のリポジトリ列とキャッシュ設定に従う。
#[derive(Clone)]
pub struct FileResolver {
    context: Context,
}

impl FileResolver {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    fn check_cancelled(&self) -> Result<(), FileError> {
        if self.context.is_cancelled() {
            Err(FileError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// ノードのファイルをすべてローカルに用意する。失敗は診断として返す。
    pub async fn materialize(&self, files: &mut [DependencyFile]) -> Result<Vec<Message>, FileError> {
        let mut messages = Vec::new();
        for file in files.iter_mut() {
            if file.path.as_deref().is_some_and(Path::is_file) {
                continue;
            }
            match self.fetch(file).await {
                Ok(path) => file.path = Some(path),
                Err(FileError::Cancelled) => return Err(FileError::Cancelled),
                Err(error) if file.optional => {
                    info!(file = %file.file_name, "任意ファイルが見つかりません");
                    messages.push(
                        Message::info(
                            DiagnosticKind::SourcesUnavailable,
                            format!("{} は利用できません", file.file_name),
                        )
                        .with_transient(error.is_transient()),
                    );
                }
                Err(error) => {
                    warn!(file = %file.file_name, %error, "ファイルを解決できません");
                    messages.push(error.to_message());
                }
            }
        }
        Ok(messages)
    }

    pub async fn fetch(&self, file: &DependencyFile) -> Result<PathBuf, FileError> {
        match &file.origin {
            FileOrigin::Download => self.download(file).await,
            FileOrigin::Extracted {
                archive,
                source_set,
            } => self.extract(file, archive, source_set).await,
        }
    }

    async fn download(&self, file: &DependencyFile) -> Result<PathBuf, FileError> {
        self.check_cancelled()?;
        let _guard = self.context.in_flight().acquire(&file.key()).await;
        let cache = self.context.cache().files_repository();

        if let Some(path) = cache.guess_path(&file.coordinates, &file.file_name) {
            if self.verify_cached(&path, file).await {
                debug!(path = %path.display(), "キャッシュヒット");
                return Ok(path);
            }
            warn!(path = %path.display(), "キャッシュ内のファイルが破損しているため再取得します");
        }

        let mut attempts = Vec::new();
        for local in self.context.local_repositories() {
            let Some(path) = local.guess_path(&file.coordinates, &file.file_name) else {
                continue;
            };
            match self.verify_local(local, &path, file).await? {
                LocalCheck::Valid => {
                    debug!(repository = %local.name, path = %path.display(), "ローカルリポジトリのファイルを使用");
                    return Ok(path);
                }
                LocalCheck::Rejected(attempt) => attempts.push(attempt),
            }
        }

        for remote in self.context.remote_repositories_for(&file.coordinates.group_id) {
            self.check_cancelled()?;
            match self.download_from(remote, &cache, file).await {
                Ok(Ok(path)) => return Ok(path),
                Ok(Err(attempt)) => attempts.push(attempt),
                Err(FileError::Cancelled) => return Err(FileError::Cancelled),
                Err(error) => {
                    warn!(repository = %remote.name, file = %file.file_name, %error, "取得したファイルを保存できません");
                    attempts.push(Attempt::failed(Message::warning(
                        DiagnosticKind::UnableToDownloadFile,
                        format!("{}: {error}", remote.name),
                    )));
                }
            }
        }

        Err(classify(file, attempts))
    }

    /// 一次キャッシュはハッシュディレクトリ名が内容の SHA-1 と一致するものだけを信用する。
    async fn verify_cached(&self, path: &Path, file: &DependencyFile) -> bool {
        let Some(dir_hash) = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
        else {
            return false;
        };
        let mut algorithms = vec![HashAlgorithm::Sha1];
        algorithms.extend(
            file.expected
                .iter()
                .map(|checksum| checksum.algorithm)
                .filter(|algorithm| *algorithm != HashAlgorithm::Sha1),
        );
        let Ok(computed) = compute_file_with_retry(path, &algorithms).await else {
            return false;
        };
        let content_matches = computed
            .iter()
            .any(|hash| hash.algorithm == HashAlgorithm::Sha1 && hash.matches(dir_hash));
        content_matches && expected_match(&file.expected, &computed).unwrap_or(true)
    }

    async fn verify_local(
        &self,
        local: &LocalRepository,
        path: &Path,
        file: &DependencyFile,
    ) -> Result<LocalCheck, FileError> {
        let mut trusted: Vec<Checksum> = file.expected.clone();
        let mut sidecar_failures = Vec::new();
        if !local.trusted {
            if let Some(relative) = file.relative_path() {
                for remote in self.context.remote_repositories_for(&file.coordinates.group_id) {
                    self.check_cancelled()?;
                    match self.fetch_sidecar(remote, &relative).await {
                        Ok(Some(checksum)) => {
                            trusted.push(checksum);
                            break;
                        }
                        Ok(None) => {}
                        Err(message) => sidecar_failures.push(message),
                    }
                }
            }
        }

        if trusted.is_empty() {
            if local.trusted {
                return Ok(LocalCheck::Valid);
            }
            return Ok(LocalCheck::Rejected(Attempt::checksum_missing(
                Message::warning(
                    DiagnosticKind::UnableToDownloadChecksums,
                    format!(
                        "{}: {} を検証するチェックサムがありません",
                        local.name, file.file_name
                    ),
                )
                .with_children(sidecar_failures.clone())
                .with_transient(sidecar_failures.iter().any(Message::is_transient)),
            )));
        }

        let algorithms = distinct_algorithms(&trusted);
        let computed = match compute_file_with_retry(path, &algorithms).await {
            Ok(computed) => computed,
            Err(error) => {
                warn!(
                    repository = %local.name,
                    path = %path.display(),
                    %error,
                    "ローカルリポジトリのファイルを読み込めないため無視します"
                );
                return Ok(LocalCheck::Rejected(Attempt::failed(Message::warning(
                    DiagnosticKind::UnableToDownloadFile,
                    format!("{}: {} を読み込めません: {error}", local.name, path.display()),
                ))));
            }
        };
        match expected_match(&trusted, &computed) {
            Some(true) => Ok(LocalCheck::Valid),
            _ => {
                warn!(
                    repository = %local.name,
                    path = %path.display(),
                    "ローカルリポジトリのファイルがチェックサムと一致しないため無視します"
                );
                Ok(LocalCheck::Rejected(Attempt::failed(Message::warning(
                    DiagnosticKind::ChecksumMismatch,
                    format!(
                        "{}: {} のチェックサムが一致しません",
                        local.name,
                        path.display()
                    ),
                ))))
            }
        }
    }

    /// 強い順に試し、最初に得られたサイドカーを返す。
    async fn fetch_sidecar(
        &self,
        remote: &RemoteRepository,
        relative: &str,
    ) -> Result<Option<Checksum>, Message> {
        for algorithm in remote.hash_algorithms() {
            match fetch_checksum(self.context.transport(), remote, relative, algorithm).await {
                Ok(Some(checksum)) => return Ok(Some(checksum)),
                Ok(None) => continue,
                Err(error) => {
                    let transient = error.is_transient();
                    return Err(Message::warning(
                        DiagnosticKind::UnableToDownloadChecksums,
                        format!("{}: {}", remote.name, error),
                    )
                    .with_transient(transient));
                }
            }
        }
        Ok(None)
    }

    async fn remote_path(
        &self,
        remote: &RemoteRepository,
        file: &DependencyFile,
    ) -> Result<String, Attempt> {
        let Some(version_dir) = file.coordinates.version_dir() else {
            return Err(Attempt::failed(Message::error(
                DiagnosticKind::UnspecifiedDependencyVersion,
                format!("{} のバージョンが指定されていません", file.coordinates),
            )));
        };
        if !file.coordinates.is_snapshot() {
            return Ok(format!("{version_dir}/{}", file.file_name));
        }

        let base_version = file.coordinates.version().unwrap_or_default();
        match fetch_snapshot_metadata(self.context.transport(), remote, &file.coordinates).await {
            Ok(metadata) => {
                let classifier = file.coordinates.classifier();
                let name = metadata
                    .snapshot_value(base_version, &file.extension, classifier)
                    .map(|value| file.file_name.replacen(base_version, &value, 1))
                    .unwrap_or_else(|| file.file_name.clone());
                debug!(repository = %remote.name, file = %name, "スナップショットのファイル名を解決");
                Ok(format!("{version_dir}/{name}"))
            }
            Err(error) if error.is_not_found() => Ok(format!("{version_dir}/{}", file.file_name)),
            Err(error) => Err(Attempt::from_remote(remote, error)),
        }
    }

    async fn get_cancellable(
        &self,
        remote: &RemoteRepository,
        path: &str,
    ) -> Result<Result<Bytes, RemoteError>, FileError> {
        tokio::select! {
            _ = self.context.cancellation().cancelled() => Err(FileError::Cancelled),
            result = self.context.transport().get(remote, path) => Ok(result),
        }
    }

    async fn download_from(
        &self,
        remote: &RemoteRepository,
        cache: &LocalRepository,
        file: &DependencyFile,
    ) -> Result<Result<PathBuf, Attempt>, FileError> {
        let path = match self.remote_path(remote, file).await {
            Ok(path) => path,
            Err(attempt) => return Ok(Err(attempt)),
        };
        debug!(repository = %remote.name, path = %path, "リモートから取得");
        let bytes = match self.get_cancellable(remote, &path).await? {
            Ok(bytes) => bytes,
            Err(error) => return Ok(Err(Attempt::from_remote(remote, error))),
        };

        let mut trusted = file.expected.clone();
        let mut sidecar_failure = None;
        match self.fetch_sidecar(remote, &path).await {
            Ok(Some(checksum)) => trusted.push(checksum),
            Ok(None) => {}
            Err(message) => sidecar_failure = Some(message),
        }
        if trusted.is_empty() {
            let transient = sidecar_failure.as_ref().is_some_and(Message::is_transient);
            return Ok(Err(Attempt::checksum_missing(
                Message::warning(
                    DiagnosticKind::UnableToDownloadChecksums,
                    format!("{}: {} のチェックサムファイルがありません", remote.name, path),
                )
                .with_children(sidecar_failure.into_iter().collect())
                .with_transient(transient),
            )));
        }

        for checksum in &trusted {
            let actual = checksum.algorithm.compute(&bytes);
            if !checksum.matches(&actual) {
                warn!(
                    repository = %remote.name,
                    path = %path,
                    algorithm = %checksum.algorithm,
                    expected = %checksum.value,
                    actual = %actual,
                    "チェックサム不一致"
                );
                return Ok(Err(Attempt::failed(Message::warning(
                    DiagnosticKind::ChecksumMismatch,
                    format!(
                        "{}: {} の {} が一致しません (expected={}, actual={})",
                        remote.name, path, checksum.algorithm, checksum.value, actual
                    ),
                ))));
            }
        }

        self.check_cancelled()?;
        let sha1 = HashAlgorithm::Sha1.compute(&bytes);
        let target = cache
            .target_path(&file.coordinates, &file.file_name, Some(&sha1))
            .ok_or_else(|| FileError::Storage {
                path: cache.root.clone(),
                message: format!("{} の保存先を決定できません", file.coordinates),
            })?;
        let temp_dir = self.context.cache().temp_dir();
        let stored = target.clone();
        tokio::task::spawn_blocking(move || store_atomically(&temp_dir, &stored, &bytes))
            .await
            .map_err(|error| FileError::Storage {
                path: target.clone(),
                message: error.to_string(),
            })??;
        info!(repository = %remote.name, path = %target.display(), "ダウンロード完了");
        Ok(Ok(target))
    }

    async fn extract(
        &self,
        file: &DependencyFile,
        archive: &DependencyFile,
        source_set: &str,
    ) -> Result<PathBuf, FileError> {
        let archive_path = self.download(archive).await?;
        self.check_cancelled()?;
        let _guard = self.context.in_flight().acquire(&file.key()).await;

        let archive_hash = compute_file_with_retry(&archive_path, &[HashAlgorithm::Sha1])
            .await
            .map_err(|error| FileError::Storage {
                path: archive_path.clone(),
                message: error.to_string(),
            })?
            .into_iter()
            .next()
            .map(|checksum| checksum.value)
            .unwrap_or_default();
        let cache = self.context.cache().files_repository();
        let target = cache
            .target_path(&file.coordinates, &file.file_name, Some(&archive_hash))
            .ok_or_else(|| FileError::Storage {
                path: cache.root.clone(),
                message: format!("{} の保存先を決定できません", file.coordinates),
            })?;
        if target.is_file() {
            return Ok(target);
        }

        let owned_archive = archive_path.clone();
        let owned_target = target.clone();
        let owned_set = source_set.to_string();
        let extracted = tokio::task::spawn_blocking(move || {
            with_file_lock(&owned_target, || {
                if owned_target.is_file() {
                    return Ok(true);
                }
                kmp::extract_source_set(&owned_archive, &owned_set, &owned_target)
                    .map_err(|error| error.to_string())
            })
        })
        .await
        .map_err(|error| FileError::Storage {
            path: target.clone(),
            message: error.to_string(),
        })?
        .map_err(|message| FileError::Storage {
            path: target.clone(),
            message,
        })?;

        if extracted {
            debug!(source_set, path = %target.display(), "ソースセットを展開");
            Ok(target)
        } else {
            Err(FileError::SourceSetMissing {
                file: archive.file_name.clone(),
                source_set: source_set.to_string(),
            })
        }
    }
}

fn distinct_algorithms(checksums: &[Checksum]) -> Vec<HashAlgorithm> {
    let mut algorithms: Vec<HashAlgorithm> = checksums
        .iter()
        .map(|checksum| checksum.algorithm)
        .collect();
    algorithms.sort();
    algorithms.dedup();
    algorithms
}

/// 期待値のうち計算済みのものをすべて照合する。照合できたものが無ければ `None`。
fn expected_match(expected: &[Checksum], computed: &[Checksum]) -> Option<bool> {
    let mut compared = false;
    for checksum in expected {
        if let Some(actual) = computed
            .iter()
            .find(|hash| hash.algorithm == checksum.algorithm)
        {
            compared = true;
            if !checksum.matches(&actual.value) {
                return Some(false);
            }
        }
    }
    compared.then_some(true)
}

fn classify(file: &DependencyFile, attempts: Vec<Attempt>) -> FileError {
    let name = file
        .relative_path()
        .unwrap_or_else(|| file.file_name.clone());
    let all_not_found = attempts.iter().all(|attempt| attempt.not_found);
    let checksum_only = attempts
        .iter()
        .any(|attempt| attempt.checksum_missing)
        && attempts
            .iter()
            .all(|attempt| attempt.checksum_missing || attempt.not_found);
    let messages: Vec<Message> = attempts.into_iter().map(|attempt| attempt.message).collect();
    if all_not_found {
        FileError::NotFound {
            file: name,
            attempts: messages,
        }
    } else if checksum_only {
        FileError::ChecksumsUnavailable {
            file: name,
            attempts: messages,
        }
    } else {
        FileError::Unavailable {
            file: name,
            attempts: messages,
        }
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// `<target>.lock` の排他ロックを保持したまま `action` を実行する。
fn with_file_lock<T>(
    target: &Path,
    action: impl FnOnce() -> Result<T, String>,
) -> Result<T, String> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|error| error.to_string())?;
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(target))
        .map_err(|error| error.to_string())?;
    FileExt::lock_exclusive(&lock_file).map_err(|error| error.to_string())?;
    let result = action();
    if let Err(error) = FileExt::unlock(&lock_file) {
        debug!(%error, "ロック解除に失敗しました");
    }
    result
}

/// 一時ファイルへ書き込んでから、ロックを取得して所定の位置へ移動する。
fn store_atomically(temp_dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), FileError> {
    let storage = |message: String| FileError::Storage {
        path: target.to_path_buf(),
        message,
    };
    fs::create_dir_all(temp_dir).map_err(|error| storage(error.to_string()))?;
    let mut temp = NamedTempFile::new_in(temp_dir).map_err(|error| storage(error.to_string()))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|error| storage(error.to_string()))?;

    with_file_lock(target, || {
        if target.is_file() {
            return Ok(());
        }
        temp.persist(target)
            .map(|_| ())
            .map_err(|error| error.error.to_string())
    })
    .map_err(storage)
}

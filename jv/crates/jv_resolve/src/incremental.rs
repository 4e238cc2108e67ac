//! Incremental resolution cache.
//!
//! Fully materialized graphs are stored as JSON under `<cache>/graphs`, keyed by
//! a SHA-256 over the root dependencies, the context key and the repository
//! chain. A restored [`CachedGraph`] carries only what downstream consumers need
//! (live nodes with their files, plus the diagnostics report in graph order), so
//! it is a separate type from [`DependencyGraph`]; [`ResolvedGraph`] hides the
//! difference.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::{Context, ContextKey, Scope};
use crate::coordinates::Coordinates;
use crate::diagnostics::{DiagnosticsReport, Message};
use crate::files::{DependencyFile, FileError, FileResolver};
use crate::graph::{DependencyGraph, RootDependency};
use crate::metadata::DeclarationKind;
use crate::repository::Repository;

/// 保存形式を変えたら上げる。異なる版のファイルは破棄して再解決する。
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IOエラー: {0}")]
    Io(#[from] io::Error),
    #[error("JSONシリアライズ/デシリアライズに失敗しました: {0}")]
    Json(#[from] serde_json::Error),
    #[error("キャッシュファイル {path:?} を書き込めません: {message}")]
    Persist { path: PathBuf, message: String },
}

/// ルート依存・コンテキスト・リポジトリ構成から導く安定したキー。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(context: &Context, roots: &[RootDependency]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("format={CACHE_FORMAT_VERSION}\n"));
        hasher.update(format!("context={}\n", context.key()));
        for root in roots {
            let kind = match root.kind {
                DeclarationKind::Regular => "regular",
                DeclarationKind::BomImport => "bom",
            };
            hasher.update(format!("root={kind}:{}\n", root.coordinates));
        }
        for repository in context.repositories() {
            let location = match repository {
                Repository::Remote(remote) => remote.url.to_string(),
                Repository::Local(local) => local.root.display().to_string(),
            };
            hasher.update(format!("repository={}={location}\n", repository.name()));
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// キャッシュ済みグラフの生存ノード1つ分。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub coordinates: Coordinates,
    #[serde(default)]
    pub files: Vec<DependencyFile>,
}

/// 診断レポートの1行。置き換えられたノードの診断も含む。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDiagnostic {
    pub subject: String,
    pub message: Message,
}

/// ディスクから復元したグラフ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedGraph {
    pub format_version: u32,
    pub key: CacheKey,
    pub context: ContextKey,
    pub roots: Vec<RootDependency>,
    /// 幅優先順の生存ノード。
    pub entries: Vec<CachedEntry>,
    /// [`DependencyGraph::report`] と同じ順の診断。
    #[serde(default)]
    pub diagnostics: Vec<CachedDiagnostic>,
}

impl CachedGraph {
    pub fn from_graph(key: CacheKey, graph: &DependencyGraph) -> Self {
        let (context, roots) = graph
            .root_node()
            .map(|root| (root.context.clone(), root.requested.clone()))
            .unwrap_or_else(|| {
                (
                    ContextKey {
                        scope: Scope::Compile,
                        platforms: BTreeSet::new(),
                    },
                    Vec::new(),
                )
            });
        let entries = graph
            .live_nodes()
            .into_iter()
            .filter_map(|id| {
                let maven = graph.maven(id)?;
                Some(CachedEntry {
                    coordinates: maven.coordinates.clone(),
                    files: maven.files.clone(),
                })
            })
            .collect();
        let diagnostics = graph
            .report()
            .entries()
            .iter()
            .map(|entry| CachedDiagnostic {
                subject: entry.subject.clone(),
                message: entry.message.clone(),
            })
            .collect();
        Self {
            format_version: CACHE_FORMAT_VERSION,
            key,
            context,
            roots,
            entries,
            diagnostics,
        }
    }

    pub fn files(&self) -> Vec<&DependencyFile> {
        self.entries.iter().flat_map(|entry| entry.files.iter()).collect()
    }

    pub fn classpath(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.files()
            .into_iter()
            .filter(|file| !file.optional)
            .filter_map(|file| file.path.clone())
            .filter(|path| seen.insert(path.clone()))
            .collect()
    }

    pub fn report(&self) -> DiagnosticsReport {
        let mut report = DiagnosticsReport::new();
        for diagnostic in &self.diagnostics {
            report.push(diagnostic.subject.clone(), diagnostic.message.clone());
        }
        report
    }

    /// 消えたファイルを取り直す。必須ファイルを揃えられなければ `false`。
    pub async fn refresh(&mut self, resolver: &FileResolver) -> Result<bool, FileError> {
        for entry in &mut self.entries {
            for file in &mut entry.files {
                if file.path.as_deref().is_some_and(Path::is_file) {
                    continue;
                }
                match resolver.fetch(file).await {
                    Ok(path) => {
                        debug!(file = %file.file_name, "キャッシュ済みグラフのファイルを再取得しました");
                        file.path = Some(path);
                    }
                    Err(FileError::Cancelled) => return Err(FileError::Cancelled),
                    Err(_) if file.optional => file.path = None,
                    Err(error) => {
                        warn!(file = %file.file_name, %error, "キャッシュ済みグラフのファイルを取得できません");
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
}

/// 新規に解決したグラフか、キャッシュから復元したグラフ。利用側からは同じに振る舞う。
#[derive(Debug, Clone)]
pub enum ResolvedGraph {
    Fresh(DependencyGraph),
    Cached(CachedGraph),
}

impl ResolvedGraph {
    pub fn is_cached(&self) -> bool {
        matches!(self, ResolvedGraph::Cached(_))
    }

    pub fn classpath(&self) -> Vec<PathBuf> {
        match self {
            ResolvedGraph::Fresh(graph) => graph.classpath(),
            ResolvedGraph::Cached(cached) => cached.classpath(),
        }
    }

    pub fn files(&self) -> Vec<&DependencyFile> {
        match self {
            ResolvedGraph::Fresh(graph) => graph.files(),
            ResolvedGraph::Cached(cached) => cached.files(),
        }
    }

    pub fn report(&self) -> DiagnosticsReport {
        match self {
            ResolvedGraph::Fresh(graph) => graph.report(),
            ResolvedGraph::Cached(cached) => cached.report(),
        }
    }

    pub fn graph(&self) -> Option<&DependencyGraph> {
        match self {
            ResolvedGraph::Fresh(graph) => Some(graph),
            ResolvedGraph::Cached(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// `<cache>/graphs/<key>.json` に保存されたグラフ。
#[derive(Debug)]
pub struct IncrementalCache {
    dir: PathBuf,
    stats: CacheStats,
}

impl IncrementalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stats: CacheStats::default(),
        }
    }

    pub fn for_context(context: &Context) -> Self {
        Self::new(context.cache().graphs_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
        }
    }

    /// 保存済みグラフを読む。壊れたファイルや形式の異なるファイルは削除して `None`。
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CachedGraph>, CacheError> {
        let path = self.path(key);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "グラフキャッシュミス");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        match serde_json::from_slice::<CachedGraph>(&contents) {
            Ok(cached) if cached.format_version == CACHE_FORMAT_VERSION && &cached.key == key => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, entries = cached.entries.len(), "グラフキャッシュヒット");
                Ok(Some(cached))
            }
            Ok(cached) => {
                warn!(key = %key, format_version = cached.format_version, "形式の異なるグラフキャッシュを破棄します");
                self.invalidate(key)?;
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(error) => {
                warn!(key = %key, %error, "読めないグラフキャッシュを破棄します");
                self.invalidate(key)?;
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// 一時ファイルに書いてから置き換える。一時的な障害を含むグラフは保存しない。
    pub fn store(&self, graph: &CachedGraph) -> Result<bool, CacheError> {
        let transient = graph
            .diagnostics
            .iter()
            .any(|diagnostic| diagnostic.message.is_transient());
        if transient {
            debug!(key = %graph.key, "一時的な障害を含むため保存しません");
            return Ok(false);
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.path(&graph.key);
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(temp.as_file_mut(), graph)?;
        temp.as_file_mut().flush()?;
        temp.persist(&path).map_err(|error| CacheError::Persist {
            path: path.clone(),
            message: error.error.to_string(),
        })?;
        info!(key = %graph.key, entries = graph.entries.len(), "解決済みグラフを保存しました");
        Ok(true)
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => {
                self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
                info!(key = %key, "グラフキャッシュを無効化しました");
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

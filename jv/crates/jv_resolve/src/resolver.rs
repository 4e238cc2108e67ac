//! Level-by-level graph expansion.
//!
//! Every level fans the pending nodes out over a bounded [`JoinSet`], waits for
//! the whole level to finish, applies the results in node order and only then
//! runs conflict resolution. Expansion stops at a fixpoint or after
//! [`Resolver::MAX_LEVELS`] levels.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::conflict::{ConflictStrategy, HighestVersionStrategy, resolve_conflicts};
use crate::context::{Context, ContextError, ResolutionLevel};
use crate::coordinates::Coordinates;
use crate::diagnostics::{DiagnosticKind, Message};
use crate::files::{DependencyFile, FileError, FileResolver};
use crate::graph::{DependencyGraph, NodeId, RootDependency};
use crate::incremental::{CacheError, CacheKey, CachedGraph, IncrementalCache, ResolvedGraph};
use crate::metadata::{DeclarationKind, MetadataError, MetadataResolver, Publication, ResolvedMetadata};

/// 解決そのものを中断する設定上の誤り。依存単位の問題はノードの診断になる。
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("解決対象の依存が指定されていません")]
    EmptyRoots,
    #[error("リポジトリが1つも設定されていません")]
    NoRepositories,
    #[error("キャッシュディレクトリ {path} を使用できません: {source}")]
    CacheDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("解決がキャンセルされました")]
    Cancelled,
}

enum Expansion {
    Metadata(Result<ResolvedMetadata, MetadataError>),
    Range(Result<Option<String>, MetadataError>),
}

type Materialized = (Vec<DependencyFile>, Vec<Message>);

/// 依存グラフの構築器。
pub struct Resolver {
    context: Context,
    metadata: Arc<MetadataResolver>,
    strategy: Arc<dyn ConflictStrategy>,
}

impl Resolver {
    /// 展開レベル数の上限。
    pub const MAX_LEVELS: usize = 64;

    /// 連続してこの回数だけ変化が無ければ収束とみなす。
    const QUIET_LEVELS: usize = 2;

    pub fn new(context: Context) -> Self {
        let metadata = Arc::new(MetadataResolver::new(context.clone()));
        Self {
            context,
            metadata,
            strategy: Arc::new(HighestVersionStrategy),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ConflictStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn check_cancelled(&self) -> Result<(), ResolveError> {
        if self.context.is_cancelled() {
            Err(ResolveError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn prepare(&self, roots: &[RootDependency]) -> Result<(), ResolveError> {
        if roots.is_empty() {
            return Err(ResolveError::EmptyRoots);
        }
        if self.context.repositories().is_empty() {
            return Err(ResolveError::NoRepositories);
        }
        let root = &self.context.cache().root;
        std::fs::create_dir_all(root).map_err(|source| ResolveError::CacheDirectory {
            path: root.clone(),
            source,
        })
    }

    /// ルート依存からグラフを構築する。`Network` ではファイルの取得まで行う。
    pub async fn resolve(
        &self,
        roots: Vec<RootDependency>,
        level: ResolutionLevel,
    ) -> Result<DependencyGraph, ResolveError> {
        self.prepare(&roots)?;
        let mut graph = DependencyGraph::new(self.context.key(), roots.clone());
        let root = graph.root();
        for dependency in &roots {
            graph.add_dependency(root, &dependency.declaration());
        }

        let mut quiet = 0;
        let mut converged = false;
        for depth in 0..Self::MAX_LEVELS {
            self.check_cancelled()?;
            let pending = graph.pending();
            let nodes_before = graph.len();
            debug!(depth, pending = pending.len(), "レベルを展開");
            let expanded = !pending.is_empty();
            self.expand_level(&mut graph, pending).await?;

            let outcome = resolve_conflicts(&mut graph, self.strategy.as_ref());
            let created = graph.len() > nodes_before;
            if expanded || outcome.changed || created {
                quiet = 0;
            } else {
                quiet += 1;
            }
            if quiet >= Self::QUIET_LEVELS {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(levels = Self::MAX_LEVELS, "依存グラフが収束しませんでした");
            graph.node_mut(root).messages.push(Message::error(
                DiagnosticKind::ResolutionDidNotConverge,
                format!("{} レベル以内に依存グラフが収束しませんでした", Self::MAX_LEVELS),
            ));
        }
        report_unspecified_versions(&mut graph);

        if level == ResolutionLevel::Network {
            self.materialize(&mut graph).await?;
        }
        info!(
            nodes = graph.len(),
            live = graph.live_nodes().len(),
            errors = graph.report().errors().count(),
            "依存グラフを解決しました"
        );
        Ok(graph)
    }

    /// 増分キャッシュを使って解決する。再利用できるのは `Network` で解決したグラフのみ。
    pub async fn resolve_cached(
        &self,
        roots: Vec<RootDependency>,
        level: ResolutionLevel,
    ) -> Result<ResolvedGraph, ResolveError> {
        let cacheable = level == ResolutionLevel::Network && self.context.cache().incremental;
        if !cacheable {
            return Ok(ResolvedGraph::Fresh(self.resolve(roots, level).await?));
        }
        self.prepare(&roots)?;

        let cache = IncrementalCache::for_context(&self.context);
        let key = CacheKey::compute(&self.context, &roots);
        if let Some(mut cached) = cache.lookup(&key)? {
            match cached.refresh(self.metadata.files()).await {
                Ok(true) => return Ok(ResolvedGraph::Cached(cached)),
                Ok(false) => {
                    info!(key = %key, "キャッシュ済みグラフのファイルを揃えられないため再解決します");
                    cache.invalidate(&key)?;
                }
                Err(FileError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(error) => {
                    warn!(key = %key, %error, "キャッシュ済みグラフを破棄します");
                    cache.invalidate(&key)?;
                }
            }
        }

        let graph = self.resolve(roots, level).await?;
        if graph.has_transient_errors() {
            info!(key = %key, "一時的な障害を含むためグラフをキャッシュしません");
        } else {
            cache.store(&CachedGraph::from_graph(key, &graph))?;
        }
        Ok(ResolvedGraph::Fresh(graph))
    }

    async fn expand_level(&self, graph: &mut DependencyGraph, pending: Vec<NodeId>) -> Result<(), ResolveError> {
        let mut join_set: JoinSet<(NodeId, Expansion)> = JoinSet::new();
        let mut results = BTreeMap::new();
        let mut queue: VecDeque<(NodeId, Coordinates)> = VecDeque::new();

        for id in pending {
            let Some(node) = graph.maven_mut(id) else {
                continue;
            };
            if node.coordinates.version().is_none() {
                node.expanded = true;
                continue;
            }
            queue.push_back((id, node.coordinates.clone()));
        }
        let spawned: Vec<(NodeId, Coordinates)> = queue.iter().cloned().collect();

        let limit = self.context.max_concurrent();
        while let Some((id, coordinates)) = queue.pop_front() {
            let metadata = Arc::clone(&self.metadata);
            join_set.spawn(async move {
                let expansion = if coordinates.is_range() {
                    Expansion::Range(metadata.resolve_range(&coordinates).await)
                } else {
                    Expansion::Metadata(metadata.resolve(&coordinates).await)
                };
                (id, expansion)
            });

            if join_set.len() >= limit {
                consume_next(&mut join_set, &mut results).await?;
            }
        }
        while !join_set.is_empty() {
            consume_next(&mut join_set, &mut results).await?;
        }

        for (id, coordinates) in spawned {
            results.entry(id).or_insert_with(|| {
                Expansion::Metadata(Err(MetadataError::Unavailable {
                    coordinates: coordinates.to_string(),
                    messages: Vec::new(),
                }))
            });
        }
        for (id, expansion) in results {
            apply_expansion(graph, id, expansion);
        }
        Ok(())
    }

    /// 生存ノードのファイルを取得する。`Partial` で作ったグラフもそのまま `Network` に引き上げられる。
    pub async fn materialize(&self, graph: &mut DependencyGraph) -> Result<(), ResolveError> {
        let mut join_set: JoinSet<(NodeId, Result<Materialized, FileError>)> = JoinSet::new();
        let mut queue: VecDeque<(NodeId, Vec<DependencyFile>)> = VecDeque::new();
        let mut live = graph.live_nodes();
        live.sort();
        for id in live {
            let Some(node) = graph.maven(id) else {
                continue;
            };
            if node.files.is_empty() || (node.materialized && files_present(&node.files)) {
                continue;
            }
            queue.push_back((id, node.files.clone()));
        }

        let limit = self.context.max_concurrent();
        let mut results = BTreeMap::new();
        while let Some((id, files)) = queue.pop_front() {
            self.check_cancelled()?;
            let resolver = self.metadata.files().clone();
            join_set.spawn(async move { (id, materialize_node(resolver, files).await) });
            if join_set.len() >= limit {
                collect_materialized(&mut join_set, &mut results).await?;
            }
        }
        while !join_set.is_empty() {
            collect_materialized(&mut join_set, &mut results).await?;
        }

        for (id, (files, messages)) in results {
            let node = graph.node_mut(id);
            for message in messages {
                if !node.messages.contains(&message) {
                    node.messages.push(message);
                }
            }
            if let Some(maven) = node.as_maven_mut() {
                maven.files = files;
                maven.materialized = true;
            }
        }
        Ok(())
    }
}

impl Expansion {
    fn is_cancelled(&self) -> bool {
        match self {
            Expansion::Metadata(Err(error)) | Expansion::Range(Err(error)) => error.is_cancelled(),
            _ => false,
        }
    }
}

async fn consume_next(
    join_set: &mut JoinSet<(NodeId, Expansion)>,
    results: &mut BTreeMap<NodeId, Expansion>,
) -> Result<(), ResolveError> {
    match join_set.join_next().await {
        Some(Ok((id, expansion))) => {
            if expansion.is_cancelled() {
                join_set.shutdown().await;
                return Err(ResolveError::Cancelled);
            }
            results.insert(id, expansion);
        }
        Some(Err(join_error)) => {
            warn!(error = %join_error, "メタデータ取得タスクが異常終了しました");
        }
        None => {}
    }
    Ok(())
}

async fn materialize_node(resolver: FileResolver, mut files: Vec<DependencyFile>) -> Result<Materialized, FileError> {
    let messages = resolver.materialize(&mut files).await?;
    Ok((files, messages))
}

async fn collect_materialized(
    join_set: &mut JoinSet<(NodeId, Result<Materialized, FileError>)>,
    results: &mut BTreeMap<NodeId, Materialized>,
) -> Result<(), ResolveError> {
    match join_set.join_next().await {
        Some(Ok((id, Ok(materialized)))) => {
            results.insert(id, materialized);
        }
        Some(Ok((_, Err(_)))) => {
            join_set.shutdown().await;
            return Err(ResolveError::Cancelled);
        }
        Some(Err(join_error)) => {
            warn!(error = %join_error, "ファイル取得タスクが異常終了しました");
        }
        None => {}
    }
    Ok(())
}

fn files_present(files: &[DependencyFile]) -> bool {
    files
        .iter()
        .filter(|file| !file.optional)
        .all(|file| file.path.as_deref().is_some_and(Path::is_file))
}

fn bom_misuse(publication: Publication, declared_as_bom: bool, coordinates: &Coordinates) -> Option<Message> {
    match publication {
        Publication::Platform if !declared_as_bom => Some(Message::error(
            DiagnosticKind::BomDeclaredAsRegularDependency,
            format!("{coordinates} は BOM です。BOM インポートとして宣言してください"),
        )),
        Publication::Library if declared_as_bom => Some(Message::error(
            DiagnosticKind::RegularDependencyDeclaredAsBom,
            format!("{coordinates} は BOM ではありません。通常の依存として宣言してください"),
        )),
        _ => None,
    }
}

fn apply_expansion(graph: &mut DependencyGraph, id: NodeId, expansion: Expansion) {
    graph.clear_children(id);
    let Some(node) = graph.maven(id) else {
        return;
    };
    let coordinates = node.coordinates.clone();
    let declared_as_bom = node.declared_as.contains(&DeclarationKind::BomImport);

    match expansion {
        Expansion::Range(result) => {
            let (selection, messages) = match result {
                Ok(Some(version)) => (Some(version), Vec::new()),
                Ok(None) => (
                    None,
                    vec![Message::error(
                        DiagnosticKind::UnresolvedVersionRange,
                        format!("{coordinates} の範囲を満たすバージョンが見つかりません"),
                    )],
                ),
                Err(error) => (
                    None,
                    vec![
                        Message::error(
                            DiagnosticKind::UnresolvedVersionRange,
                            format!("{coordinates} のバージョン一覧を取得できません"),
                        )
                        .with_children(vec![error.to_message()])
                        .with_transient(error.is_transient()),
                    ],
                ),
            };
            let node = graph.node_mut(id);
            node.messages = messages;
            if let Some(maven) = node.as_maven_mut() {
                maven.range_selection = selection;
                maven.expanded = true;
            }
        }
        Expansion::Metadata(Err(error)) => {
            let node = graph.node_mut(id);
            node.messages = vec![error.to_message()];
            if let Some(maven) = node.as_maven_mut() {
                maven.files.clear();
                maven.expanded = true;
            }
        }
        Expansion::Metadata(Ok(resolved)) => {
            let ResolvedMetadata {
                publication,
                dependencies,
                constraints,
                files,
                mut messages,
                ..
            } = resolved;
            let misuse = bom_misuse(publication, declared_as_bom, &coordinates);
            let rejected = misuse
                .as_ref()
                .is_some_and(|message| message.kind == DiagnosticKind::BomDeclaredAsRegularDependency);
            messages.extend(misuse);

            let node = graph.node_mut(id);
            node.messages = messages;
            if let Some(maven) = node.as_maven_mut() {
                maven.publication = Some(publication);
                maven.files = if rejected { Vec::new() } else { files };
                maven.materialized = false;
                maven.expanded = true;
            }
            if rejected {
                return;
            }

            for declaration in &dependencies {
                graph.add_dependency(id, declaration);
            }
            let contributes_constraints = match publication {
                Publication::Platform => declared_as_bom,
                Publication::LegacyBom => true,
                Publication::Library | Publication::Aggregator => false,
            };
            if contributes_constraints {
                for constraint in &constraints {
                    graph.add_constraint(id, constraint);
                }
            }
        }
    }
}

/// バージョン未指定の生存ノードに ERROR を1つだけ付ける。
fn report_unspecified_versions(graph: &mut DependencyGraph) {
    let live: Vec<NodeId> = graph.live_nodes();
    let ids: Vec<NodeId> = graph.nodes().map(|node| node.id).collect();
    for id in ids {
        let unspecified = live.contains(&id)
            && graph
                .maven(id)
                .is_some_and(|node| node.coordinates.version().is_none());
        let subject = graph.node(id).subject();
        let messages = &mut graph.node_mut(id).messages;
        messages.retain(|message| message.kind != DiagnosticKind::UnspecifiedDependencyVersion);
        if unspecified {
            messages.push(Message::error(
                DiagnosticKind::UnspecifiedDependencyVersion,
                format!("{subject} のバージョンが指定されていません"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Platform, Scope};
    use crate::graph::NodeState;
    use crate::tests::FixtureRepository;

    fn root(coords: &str) -> RootDependency {
        RootDependency::regular(Coordinates::parse(coords).expect("coordinates"))
    }

    fn find(graph: &DependencyGraph, coords: &str) -> NodeId {
        graph
            .find(&Coordinates::parse(coords).expect("coordinates"))
            .unwrap_or_else(|| panic!("{coords} がグラフにありません"))
    }

    fn kinds(graph: &DependencyGraph, id: NodeId) -> Vec<DiagnosticKind> {
        graph.node(id).messages.iter().map(|message| message.kind).collect()
    }

    #[tokio::test]
    async fn empty_roots_are_rejected() {
        let repo = FixtureRepository::new();
        let resolver = Resolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let error = resolver
            .resolve(Vec::new(), ResolutionLevel::Partial)
            .await
            .expect_err("empty roots");
        assert!(matches!(error, ResolveError::EmptyRoots));
    }

    #[tokio::test]
    async fn transitive_pom_dependencies_are_expanded_and_deduplicated() {
        let repo = FixtureRepository::new();
        repo.pom(
            "org.example:app:1.0",
            "<dependencies>
               <dependency><groupId>org.example</groupId><artifactId>a</artifactId><version>1.0</version></dependency>
               <dependency><groupId>org.example</groupId><artifactId>b</artifactId><version>1.0</version></dependency>
             </dependencies>",
        );
        repo.pom(
            "org.example:a:1.0",
            "<dependencies><dependency><groupId>org.example</groupId><artifactId>shared</artifactId><version>1.0</version></dependency></dependencies>",
        );
        repo.pom(
            "org.example:b:1.0",
            "<dependencies><dependency><groupId>org.example</groupId><artifactId>shared</artifactId><version>1.0</version></dependency></dependencies>",
        );
        repo.pom("org.example:shared:1.0", "");
        for coords in ["org.example:app:1.0", "org.example:a:1.0", "org.example:b:1.0", "org.example:shared:1.0"] {
            repo.jar(coords);
        }

        let resolver = Resolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let graph = resolver
            .resolve(vec![root("org.example:app:1.0")], ResolutionLevel::Network)
            .await
            .expect("resolve");

        let shared = find(&graph, "org.example:shared:1.0");
        assert_eq!(
            graph.node(shared).parents,
            vec![find(&graph, "org.example:a:1.0"), find(&graph, "org.example:b:1.0")]
        );
        assert!(!graph.report().has_errors(), "{}", graph.report().render(crate::diagnostics::Severity::Info));
        assert_eq!(graph.classpath().len(), 4);
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let repo = FixtureRepository::new();
        repo.pom(
            "org.example:a:1.0",
            "<dependencies><dependency><groupId>org.example</groupId><artifactId>b</artifactId><version>1.0</version></dependency></dependencies>",
        );
        repo.pom(
            "org.example:b:1.0",
            "<dependencies><dependency><groupId>org.example</groupId><artifactId>a</artifactId><version>1.0</version></dependency></dependencies>",
        );
        let resolver = Resolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let graph = resolver
            .resolve(vec![root("org.example:a:1.0")], ResolutionLevel::Partial)
            .await
            .expect("resolve");
        assert_eq!(graph.len(), 3);
        assert!(!kinds(&graph, graph.root()).contains(&DiagnosticKind::ResolutionDidNotConverge));
    }

    #[tokio::test]
    async fn partial_graphs_can_be_materialized_later() {
        let repo = FixtureRepository::new();
        repo.pom("org.example:lib:1.0", "");
        repo.jar("org.example:lib:1.0");
        let resolver = Resolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let mut graph = resolver
            .resolve(vec![root("org.example:lib:1.0")], ResolutionLevel::Partial)
            .await
            .expect("resolve");
        assert!(graph.classpath().is_empty());

        resolver.materialize(&mut graph).await.expect("materialize");
        assert_eq!(graph.classpath().len(), 1);
        let lib = find(&graph, "org.example:lib:1.0");
        assert!(graph.maven(lib).expect("maven").materialized);
    }

    #[tokio::test]
    async fn range_roots_resolve_to_a_concrete_node() {
        let repo = FixtureRepository::new();
        repo.publish(
            "org/example/lib/maven-metadata.xml",
            b"<metadata><groupId>org.example</groupId><artifactId>lib</artifactId><versioning><versions><version>1.0</version><version>1.4</version><version>2.0</version></versions></versioning></metadata>",
        );
        repo.pom("org.example:lib:1.4", "");
        let resolver = Resolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let graph = resolver
            .resolve(vec![root("org.example:lib:[1.0,2.0)")], ResolutionLevel::Partial)
            .await
            .expect("resolve");
        let range = find(&graph, "org.example:lib:[1.0,2.0)");
        assert_eq!(graph.node(range).state(), NodeState::Superseded);
        let winner = graph.winner(range);
        assert_eq!(graph.maven(winner).expect("maven").coordinates.version(), Some("1.4"));
        assert_eq!(graph.node(winner).state(), NodeState::Resolved);
    }

    #[tokio::test]
    async fn bom_imports_of_regular_libraries_are_flagged() {
        let repo = FixtureRepository::new();
        repo.pom("org.example:lib:1.0", "");
        let resolver = Resolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let graph = resolver
            .resolve(
                vec![RootDependency::bom(Coordinates::new("org.example", "lib", "1.0"))],
                ResolutionLevel::Partial,
            )
            .await
            .expect("resolve");
        let lib = find(&graph, "org.example:lib:1.0");
        assert_eq!(kinds(&graph, lib), vec![DiagnosticKind::RegularDependencyDeclaredAsBom]);
    }

    #[tokio::test]
    async fn legacy_boms_constrain_either_way() {
        let repo = FixtureRepository::new();
        repo.pom_with_packaging(
            "org.example:bom:1.0",
            "pom",
            "<dependencyManagement><dependencies>
               <dependency><groupId>org.example</groupId><artifactId>lib</artifactId><version>1.5</version></dependency>
             </dependencies></dependencyManagement>",
        );
        repo.pom("org.example:lib:1.5", "");
        let resolver = Resolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let graph = resolver
            .resolve(
                vec![
                    root("org.example:bom:1.0"),
                    RootDependency::regular(Coordinates::unversioned("org.example", "lib")),
                ],
                ResolutionLevel::Partial,
            )
            .await
            .expect("resolve");
        let bom = find(&graph, "org.example:bom:1.0");
        assert!(kinds(&graph, bom).is_empty());
        let unversioned = graph
            .find(&Coordinates::unversioned("org.example", "lib"))
            .expect("unversioned node");
        let winner = graph.winner(unversioned);
        assert_eq!(graph.maven(winner).expect("maven").coordinates.version(), Some("1.5"));
        assert!(!graph.report().has_errors());
    }

    #[tokio::test]
    async fn cancelled_runs_return_cancelled() {
        let repo = FixtureRepository::new();
        repo.pom("org.example:lib:1.0", "");
        let context = repo.context(Scope::Compile, &[Platform::Jvm]);
        context.cancellation().cancel();
        let error = Resolver::new(context)
            .resolve(vec![root("org.example:lib:1.0")], ResolutionLevel::Network)
            .await
            .expect_err("cancelled");
        assert!(matches!(error, ResolveError::Cancelled));
    }
}

//! Arena-backed dependency graph.
//!
//! Nodes live in a single `Vec` and refer to each other through [`NodeId`]s, so
//! cycles and shared subtrees need no owning pointers. A node superseded by
//! conflict resolution stays in the arena for display and points at its winner.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::context::ContextKey;
use crate::coordinates::{Coordinates, ModuleKey};
use crate::diagnostics::{DiagnosticsReport, Message};
use crate::files::DependencyFile;
use crate::metadata::pom::Exclusion;
use crate::metadata::{ConstraintDeclaration, Declaration, DeclarationKind, Publication};

/// 置き換えチェーンを辿る上限。
const MAX_REDIRECTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 解決を要求されたルート依存。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDependency {
    pub coordinates: Coordinates,
    pub kind: DeclarationKind,
}

impl RootDependency {
    pub fn regular(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            kind: DeclarationKind::Regular,
        }
    }

    pub fn bom(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            kind: DeclarationKind::BomImport,
        }
    }

    pub(crate) fn declaration(&self) -> Declaration {
        match self.kind {
            DeclarationKind::Regular => Declaration::regular(self.coordinates.clone()),
            DeclarationKind::BomImport => Declaration::bom(self.coordinates.clone()),
        }
    }
}

impl From<Coordinates> for RootDependency {
    fn from(coordinates: Coordinates) -> Self {
        Self::regular(coordinates)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootNode {
    pub context: ContextKey,
    pub requested: Vec<RootDependency>,
}

/// ライブラリ1バージョン分のノード。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MavenNode {
    pub coordinates: Coordinates,
    /// このノードへ到達した宣言の種類。
    pub declared_as: BTreeSet<DeclarationKind>,
    #[serde(default)]
    pub strict: bool,
    /// 子孫に適用される除外。経路ごとの集合の共通部分。未到達なら `None`。
    #[serde(default)]
    pub exclusions: Option<BTreeSet<Exclusion>>,
    /// バージョン範囲から選ばれたバージョン。
    #[serde(default)]
    pub range_selection: Option<String>,
    #[serde(default)]
    pub expanded: bool,
    #[serde(default)]
    pub materialized: bool,
    #[serde(default)]
    pub publication: Option<Publication>,
    #[serde(default)]
    pub overridden_by: Option<NodeId>,
    #[serde(default)]
    pub files: Vec<DependencyFile>,
}

impl MavenNode {
    fn new(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            declared_as: BTreeSet::new(),
            strict: false,
            exclusions: None,
            range_selection: None,
            expanded: false,
            materialized: false,
            publication: None,
            overridden_by: None,
            files: Vec::new(),
        }
    }

    /// 競合解決で比較に使うバージョン。範囲指定は選択結果を使う。
    pub fn candidate_version(&self) -> Option<&str> {
        if self.coordinates.is_range() {
            self.range_selection.as_deref()
        } else {
            self.coordinates.version()
        }
    }

    pub fn is_excluded(&self, key: &ModuleKey) -> bool {
        self.exclusions
            .as_ref()
            .is_some_and(|exclusions| exclusions.iter().any(|exclusion| exclusion.matches(key)))
    }
}

/// BOM が与えるバージョン制約。成果物を持たない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintNode {
    pub key: ModuleKey,
    pub version: String,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeKind {
    Root(RootNode),
    Maven(MavenNode),
    Constraint(ConstraintNode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Unresolved,
    Resolved,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub target: NodeId,
    pub kind: DeclarationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub parents: Vec<NodeId>,
    #[serde(default)]
    pub children: Vec<Edge>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl DependencyNode {
    pub fn state(&self) -> NodeState {
        match &self.kind {
            NodeKind::Maven(node) if node.overridden_by.is_some() => NodeState::Superseded,
            NodeKind::Maven(node) if !node.expanded => NodeState::Unresolved,
            _ => NodeState::Resolved,
        }
    }

    pub fn as_maven(&self) -> Option<&MavenNode> {
        match &self.kind {
            NodeKind::Maven(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_maven_mut(&mut self) -> Option<&mut MavenNode> {
        match &mut self.kind {
            NodeKind::Maven(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_constraint(&self) -> Option<&ConstraintNode> {
        match &self.kind {
            NodeKind::Constraint(node) => Some(node),
            _ => None,
        }
    }

    pub fn module_key(&self) -> Option<ModuleKey> {
        match &self.kind {
            NodeKind::Root(_) => None,
            NodeKind::Maven(node) => Some(node.coordinates.key()),
            NodeKind::Constraint(node) => Some(node.key.clone()),
        }
    }

    /// 診断レポートの見出しに使う名前。
    pub fn subject(&self) -> String {
        match &self.kind {
            NodeKind::Root(root) => format!("root {}", root.context),
            NodeKind::Maven(node) => node.coordinates.to_string(),
            NodeKind::Constraint(node) => format!("{}:{}", node.key, node.version),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SerializedGraph {
    nodes: Vec<DependencyNode>,
}

/// 依存グラフ。`nodes[0]` が常にルート。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SerializedGraph")]
pub struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    #[serde(skip_serializing)]
    maven_index: HashMap<Coordinates, NodeId>,
    #[serde(skip_serializing)]
    constraint_index: HashMap<(ModuleKey, String, bool), NodeId>,
}

impl From<SerializedGraph> for DependencyGraph {
    fn from(serialized: SerializedGraph) -> Self {
        let mut graph = Self {
            nodes: serialized.nodes,
            maven_index: HashMap::new(),
            constraint_index: HashMap::new(),
        };
        graph.rebuild_index();
        graph
    }
}

impl PartialEq for DependencyGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl DependencyGraph {
    pub fn new(context: ContextKey, requested: Vec<RootDependency>) -> Self {
        Self {
            nodes: vec![DependencyNode {
                id: NodeId(0),
                kind: NodeKind::Root(RootNode { context, requested }),
                parents: Vec::new(),
                children: Vec::new(),
                messages: Vec::new(),
            }],
            maven_index: HashMap::new(),
            constraint_index: HashMap::new(),
        }
    }

    fn rebuild_index(&mut self) {
        self.maven_index.clear();
        self.constraint_index.clear();
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Maven(maven) => {
                    self.maven_index.insert(maven.coordinates.clone(), node.id);
                }
                NodeKind::Constraint(constraint) => {
                    self.constraint_index.insert(
                        (
                            constraint.key.clone(),
                            constraint.version.clone(),
                            constraint.strict,
                        ),
                        node.id,
                    );
                }
                NodeKind::Root(_) => {}
            }
        }
    }

    /// 復元したグラフの参照整合性を確認する。
    pub fn is_consistent(&self) -> bool {
        let in_range = |id: NodeId| id.0 < self.nodes.len();
        matches!(
            self.nodes.first().map(|node| &node.kind),
            Some(NodeKind::Root(_))
        ) && self.nodes.iter().enumerate().all(|(index, node)| {
            node.id.0 == index
                && node.parents.iter().copied().all(in_range)
                && node.children.iter().all(|edge| in_range(edge.target))
                && node
                    .as_maven()
                    .and_then(|maven| maven.overridden_by)
                    .is_none_or(in_range)
        })
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn root_node(&self) -> Option<&RootNode> {
        match &self.nodes.first()?.kind {
            NodeKind::Root(root) => Some(root),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut DependencyNode {
        &mut self.nodes[id.0]
    }

    pub fn maven(&self, id: NodeId) -> Option<&MavenNode> {
        self.node(id).as_maven()
    }

    pub(crate) fn maven_mut(&mut self, id: NodeId) -> Option<&mut MavenNode> {
        self.node_mut(id).as_maven_mut()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.iter()
    }

    pub fn find(&self, coordinates: &Coordinates) -> Option<NodeId> {
        self.maven_index.get(coordinates).copied()
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(DependencyNode {
            id,
            kind,
            parents: Vec::new(),
            children: Vec::new(),
            messages: Vec::new(),
        });
        id
    }

    fn link(&mut self, parent: NodeId, child: NodeId, kind: DeclarationKind) {
        let node = &mut self.nodes[parent.0];
        if !node
            .children
            .iter()
            .any(|edge| edge.target == child && edge.kind == kind)
        {
            node.children.push(Edge {
                target: child,
                kind,
            });
        }
        let child_node = &mut self.nodes[child.0];
        if !child_node.parents.contains(&parent) {
            child_node.parents.push(parent);
        }
    }

    /// 再展開の前に子への辺を外す。外れた子は他の親が無ければ到達不能になる。
    pub(crate) fn clear_children(&mut self, parent: NodeId) {
        let children = std::mem::take(&mut self.nodes[parent.0].children);
        for edge in children {
            self.nodes[edge.target.0]
                .parents
                .retain(|existing| *existing != parent);
        }
    }

    fn inherited_exclusions(&self, parent: NodeId) -> BTreeSet<Exclusion> {
        self.maven(parent)
            .and_then(|maven| maven.exclusions.clone())
            .unwrap_or_default()
    }

    /// 子依存を追加する。親の除外に該当する場合は追加せず `None` を返す。
    ///
    /// 到達経路が増えて除外・宣言種別・strict が変わった展開済みノードは再展開の対象に戻す。
    pub(crate) fn add_dependency(&mut self, parent: NodeId, declaration: &Declaration) -> Option<NodeId> {
        let key = declaration.coordinates.key();
        if self.maven(parent).is_some_and(|maven| maven.is_excluded(&key)) {
            return None;
        }

        let mut path_exclusions = self.inherited_exclusions(parent);
        path_exclusions.extend(declaration.exclusions.iter().cloned());

        let id = match self.find(&declaration.coordinates) {
            Some(id) => id,
            None => {
                let id = self.push(NodeKind::Maven(MavenNode::new(declaration.coordinates.clone())));
                self.maven_index.insert(declaration.coordinates.clone(), id);
                id
            }
        };
        self.link(parent, id, declaration.kind);

        if let Some(maven) = self.maven_mut(id) {
            let mut changed = maven.declared_as.insert(declaration.kind);
            if declaration.strict && !maven.strict {
                maven.strict = true;
                changed = true;
            }
            let merged = match &maven.exclusions {
                Some(existing) => existing.intersection(&path_exclusions).cloned().collect(),
                None => path_exclusions,
            };
            if maven.exclusions.as_ref() != Some(&merged) {
                changed |= maven.exclusions.is_some();
                maven.exclusions = Some(merged);
            }
            if changed && maven.expanded {
                maven.expanded = false;
            }
        }
        Some(id)
    }

    pub(crate) fn add_constraint(&mut self, parent: NodeId, constraint: &ConstraintDeclaration) -> NodeId {
        let index_key = (
            constraint.key.clone(),
            constraint.version.clone(),
            constraint.strict,
        );
        let id = match self.constraint_index.get(&index_key) {
            Some(id) => *id,
            None => {
                let id = self.push(NodeKind::Constraint(ConstraintNode {
                    key: constraint.key.clone(),
                    version: constraint.version.clone(),
                    strict: constraint.strict,
                }));
                self.constraint_index.insert(index_key, id);
                id
            }
        };
        self.link(parent, id, DeclarationKind::Regular);
        id
    }

    /// 勝者のバージョンを持つノードを用意する。既存が無ければ `template` の到達情報を引き継いで作る。
    pub(crate) fn ensure_version(&mut self, template: NodeId, version: &str) -> (NodeId, bool) {
        let Some(template_node) = self.maven(template) else {
            return (template, false);
        };
        let coordinates = template_node.coordinates.with_version(version);
        if let Some(existing) = self.find(&coordinates) {
            return (existing, false);
        }
        let mut node = MavenNode::new(coordinates.clone());
        node.declared_as = template_node.declared_as.clone();
        node.exclusions = template_node.exclusions.clone();
        let id = self.push(NodeKind::Maven(node));
        self.maven_index.insert(coordinates, id);
        (id, true)
    }

    /// 置き換えを辿った先のノード。
    pub fn winner(&self, id: NodeId) -> NodeId {
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            match self.maven(current).and_then(|maven| maven.overridden_by) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current
    }

    /// ルートから幅優先で到達できるノード。置き換えられたノードは子の代わりに勝者へ進む。
    pub fn reachable(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([self.root()]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            order.push(id);
            queue.extend(self.successors(id));
        }
        order
    }

    /// 走査で次に進むノード。置き換えられたノードは勝者だけを指す。
    pub(crate) fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let node = self.node(id);
        match node.as_maven().and_then(|maven| maven.overridden_by) {
            Some(winner) => vec![winner],
            None => node.children.iter().map(|edge| edge.target).collect(),
        }
    }

    /// `module` に至る経路だけを残したグラフ。詳細は [`crate::insights`]。
    pub fn filter(&self, module: &ModuleKey, resolved_only: bool) -> DependencyGraph {
        crate::insights::filter_graph(self, module, resolved_only)
    }

    /// `keep` に含まれるノードと、その間の辺だけから成るグラフを作る。ルートは常に残る。
    pub(crate) fn retain(&self, keep: &BTreeSet<NodeId>) -> DependencyGraph {
        let mut kept: Vec<NodeId> = keep.iter().copied().filter(|id| id.0 < self.nodes.len()).collect();
        if kept.first() != Some(&self.root()) {
            kept.insert(0, self.root());
        }
        let remap: HashMap<NodeId, NodeId> = kept
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, NodeId(index)))
            .collect();

        let nodes = kept
            .iter()
            .map(|id| {
                let original = self.node(*id);
                let mut kind = original.kind.clone();
                let superseded = if let NodeKind::Maven(maven) = &mut kind {
                    maven.overridden_by = maven.overridden_by.and_then(|winner| remap.get(&winner).copied());
                    maven.overridden_by.is_some()
                } else {
                    false
                };
                let children = if superseded {
                    Vec::new()
                } else {
                    original
                        .children
                        .iter()
                        .filter_map(|edge| {
                            remap.get(&edge.target).map(|target| Edge {
                                target: *target,
                                kind: edge.kind,
                            })
                        })
                        .collect()
                };
                DependencyNode {
                    id: remap[id],
                    kind,
                    parents: Vec::new(),
                    children,
                    messages: original.messages.clone(),
                }
            })
            .collect();

        let mut graph = DependencyGraph {
            nodes,
            maven_index: HashMap::new(),
            constraint_index: HashMap::new(),
        };
        let edges: Vec<(NodeId, NodeId)> = graph
            .nodes
            .iter()
            .flat_map(|node| node.children.iter().map(move |edge| (node.id, edge.target)))
            .collect();
        for (parent, child) in edges {
            let parents = &mut graph.nodes[child.0].parents;
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        graph.rebuild_index();
        graph
    }

    /// 到達可能で置き換えられていないノード。
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.reachable()
            .into_iter()
            .filter(|id| self.node(*id).state() != NodeState::Superseded)
            .collect()
    }

    /// 展開待ちの生存ノード (ID順)。
    pub fn pending(&self) -> Vec<NodeId> {
        let mut pending: Vec<NodeId> = self
            .live_nodes()
            .into_iter()
            .filter(|id| self.maven(*id).is_some_and(|maven| !maven.expanded))
            .collect();
        pending.sort();
        pending
    }

    /// 生存ノードのファイル (取得済みでないものも含む)。
    pub fn files(&self) -> Vec<&DependencyFile> {
        self.live_nodes()
            .into_iter()
            .filter_map(|id| self.maven(id))
            .flat_map(|maven| maven.files.iter())
            .collect()
    }

    /// タスクグラフへ渡すクラスパス。幅優先順で重複なし、任意ファイルは含めない。
    pub fn classpath(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.files()
            .into_iter()
            .filter(|file| !file.optional)
            .filter_map(|file| file.path.clone())
            .filter(|path| seen.insert(path.clone()))
            .collect()
    }

    /// 到達可能なノードの診断をまとめる。
    pub fn report(&self) -> DiagnosticsReport {
        let mut report = DiagnosticsReport::new();
        for id in self.reachable() {
            let node = self.node(id);
            for message in &node.messages {
                report.push(node.subject(), message.clone());
            }
        }
        report
    }

    /// 再試行で解消し得る診断を含むか。
    pub fn has_transient_errors(&self) -> bool {
        self.nodes
            .iter()
            .flat_map(|node| node.messages.iter())
            .any(Message::is_transient)
    }

    fn label(&self, id: NodeId) -> String {
        let node = self.node(id);
        match &node.kind {
            NodeKind::Root(root) => format!("root {}", root.context),
            NodeKind::Constraint(constraint) => {
                format!("{}:{} (c)", constraint.key, constraint.version)
            }
            NodeKind::Maven(maven) => match maven.overridden_by {
                Some(_) => {
                    let winner = self.winner(id);
                    let version = self
                        .maven(winner)
                        .and_then(|node| node.coordinates.version())
                        .unwrap_or("?");
                    format!("{} -> {version}", maven.coordinates)
                }
                None => maven.coordinates.to_string(),
            },
        }
    }

    /// Gradle の `dependencies` 形式のツリー。
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.label(self.root()));
        out.push('\n');
        let mut printed = HashSet::new();
        self.render_children(self.root(), "", &mut printed, &mut out);
        out
    }

    fn render_children(&self, id: NodeId, prefix: &str, printed: &mut HashSet<NodeId>, out: &mut String) {
        let children = &self.node(id).children;
        for (index, edge) in children.iter().enumerate() {
            let last = index + 1 == children.len();
            let branch = if last { "\\--- " } else { "+--- " };
            let target = self.winner(edge.target);
            let mut line = self.label(edge.target);
            let expandable = !self.node(target).children.is_empty();
            let repeated = expandable && printed.contains(&target);
            if repeated {
                line.push_str(" (*)");
            }
            out.push_str(&format!("{prefix}{branch}{line}\n"));
            if expandable && !repeated {
                printed.insert(target);
                let nested = format!("{prefix}{}", if last { "     " } else { "|    " });
                self.render_children(target, &nested, printed, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Platform, Scope};

    fn graph() -> DependencyGraph {
        DependencyGraph::new(
            ContextKey {
                scope: Scope::Compile,
                platforms: BTreeSet::from([Platform::Jvm]),
            },
            Vec::new(),
        )
    }

    fn regular(coords: &str) -> Declaration {
        Declaration::regular(Coordinates::parse(coords).expect("coordinates"))
    }

    #[test]
    fn identical_coordinates_share_one_node() {
        let mut graph = graph();
        let root = graph.root();
        let a = graph.add_dependency(root, &regular("org.example:a:1.0")).expect("a");
        let b = graph.add_dependency(root, &regular("org.example:b:1.0")).expect("b");
        let shared_from_a = graph.add_dependency(a, &regular("org.example:c:1.0")).expect("c");
        let shared_from_b = graph.add_dependency(b, &regular("org.example:c:1.0")).expect("c");
        assert_eq!(shared_from_a, shared_from_b);
        assert_eq!(graph.node(shared_from_a).parents, vec![a, b]);
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn cycles_close_without_new_nodes() {
        let mut graph = graph();
        let root = graph.root();
        let a = graph.add_dependency(root, &regular("org.example:a:1.0")).expect("a");
        let b = graph.add_dependency(a, &regular("org.example:b:1.0")).expect("b");
        let back = graph.add_dependency(b, &regular("org.example:a:1.0")).expect("a again");
        assert_eq!(back, a);
        assert_eq!(graph.reachable(), vec![root, a, b]);
        assert!(graph.render_tree().contains("(*)"));
    }

    #[test]
    fn exclusions_apply_to_descendants_only() {
        let mut graph = graph();
        let root = graph.root();
        let mut declaration = regular("org.example:a:1.0");
        declaration.exclusions = vec![Exclusion::new("org.unwanted", "*")];
        let a = graph.add_dependency(root, &declaration).expect("a");
        assert!(graph.add_dependency(a, &regular("org.unwanted:x:1.0")).is_none());
        assert!(graph.add_dependency(a, &regular("org.wanted:y:1.0")).is_some());
    }

    #[test]
    fn a_second_path_without_exclusions_reopens_expansion() {
        let mut graph = graph();
        let root = graph.root();
        let mut excluded = regular("org.example:a:1.0");
        excluded.exclusions = vec![Exclusion::new("org.unwanted", "x")];
        let a = graph.add_dependency(root, &excluded).expect("a");
        graph.maven_mut(a).expect("maven").expanded = true;

        let b = graph.add_dependency(root, &regular("org.example:b:1.0")).expect("b");
        graph.add_dependency(b, &regular("org.example:a:1.0")).expect("a");
        let node = graph.maven(a).expect("maven");
        assert!(!node.expanded);
        assert_eq!(node.exclusions, Some(BTreeSet::new()));
    }

    #[test]
    fn superseded_nodes_redirect_to_winner() {
        let mut graph = graph();
        let root = graph.root();
        let old = graph.add_dependency(root, &regular("org.example:a:1.0")).expect("old");
        let (new, created) = graph.ensure_version(old, "1.2");
        assert!(created);
        graph.maven_mut(old).expect("maven").overridden_by = Some(new);
        assert_eq!(graph.node(old).state(), NodeState::Superseded);
        assert_eq!(graph.winner(old), new);
        assert_eq!(graph.live_nodes(), vec![root, new]);
        assert!(graph.render_tree().contains("org.example:a:1.0 -> 1.2"));
    }

    #[test]
    fn serialized_graph_restores_indexes() {
        let mut graph = graph();
        let root = graph.root();
        let a = graph.add_dependency(root, &regular("org.example:a:1.0")).expect("a");
        graph.add_constraint(
            a,
            &ConstraintDeclaration {
                key: ModuleKey::new("org.example", "b"),
                version: "2.0".into(),
                strict: false,
            },
        );
        let json = serde_json::to_string(&graph).expect("serialize");
        let restored: DependencyGraph = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, graph);
        assert!(restored.is_consistent());
        assert_eq!(
            restored.find(&Coordinates::new("org.example", "a", "1.0")),
            Some(a)
        );
    }
}

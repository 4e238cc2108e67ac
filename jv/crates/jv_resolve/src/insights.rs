//! Dependency insights: why a module is in the graph and which version won.
//!
//! The filtered graph keeps every path from the root to the nodes of one
//! module. With `resolved_only` set, only the resolved version is explained;
//! when that version was forced onto the graph (by a BOM constraint or a range
//! selection), the overridden declarations and the matching constraints are
//! kept together with their paths.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::debug;

use crate::coordinates::ModuleKey;
use crate::graph::{DependencyGraph, NodeId};

type Predecessors = HashMap<NodeId, Vec<NodeId>>;

/// `module` に至る経路だけを残したグラフを返す。該当ノードが無ければルートだけになる。
pub fn filter_graph(graph: &DependencyGraph, module: &ModuleKey, resolved_only: bool) -> DependencyGraph {
    let reachable = graph.reachable();
    let mut predecessors: Predecessors = HashMap::new();
    for id in &reachable {
        for next in graph.successors(*id) {
            predecessors.entry(next).or_default().push(*id);
        }
    }

    let members: Vec<NodeId> = reachable
        .iter()
        .copied()
        .filter(|id| graph.node(*id).module_key().as_ref() == Some(module))
        .collect();
    let targets = if resolved_only {
        resolved_targets(graph, &members, &predecessors)
    } else {
        members
    };
    if targets.is_empty() {
        debug!(module = %module, "グラフに該当するモジュールがありません");
        return graph.retain(&BTreeSet::new());
    }

    let mut keep = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = targets.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if !keep.insert(id) {
            continue;
        }
        if let Some(parents) = predecessors.get(&id) {
            queue.extend(parents.iter().copied());
        }
    }
    let winners: Vec<NodeId> = keep
        .iter()
        .filter_map(|id| graph.maven(*id).and_then(|maven| maven.overridden_by))
        .collect();
    keep.extend(winners);
    debug!(module = %module, resolved_only, nodes = keep.len(), "依存関係の経路を抽出");
    graph.retain(&keep)
}

/// 解決済みバージョンのノードと、それを決めたノード。
///
/// 解決済みノードが自身のバージョンで宣言されていれば、それだけを返す。
/// 置き換えを通してしか到達しないなら、置き換えられた宣言と同じバージョンの制約も加える。
fn resolved_targets(graph: &DependencyGraph, members: &[NodeId], predecessors: &Predecessors) -> Vec<NodeId> {
    let resolved: Vec<NodeId> = members
        .iter()
        .copied()
        .filter(|id| graph.maven(*id).is_some_and(|maven| maven.overridden_by.is_none()))
        .collect();
    let superseded: Vec<NodeId> = members
        .iter()
        .copied()
        .filter(|id| {
            graph
                .maven(*id)
                .and_then(|maven| maven.overridden_by)
                .is_some_and(|_| resolved.contains(&graph.winner(*id)))
        })
        .collect();

    let declared_directly = resolved.iter().any(|id| {
        predecessors
            .get(id)
            .is_some_and(|parents| parents.iter().any(|parent| !superseded.contains(parent)))
    });
    if declared_directly {
        return resolved;
    }

    let versions: BTreeSet<&str> = resolved
        .iter()
        .filter_map(|id| graph.maven(*id).and_then(|maven| maven.coordinates.version()))
        .collect();
    let constraints = members.iter().copied().filter(|id| {
        graph
            .node(*id)
            .as_constraint()
            .is_some_and(|constraint| versions.contains(constraint.version.as_str()))
    });
    resolved
        .iter()
        .copied()
        .chain(superseded.iter().copied())
        .chain(constraints)
        .collect()
}

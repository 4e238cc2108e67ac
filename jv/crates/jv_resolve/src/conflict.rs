//! Version conflict resolution over a level-complete graph.
//!
//! Nodes that differ only in version are grouped; a [`ConflictStrategy`] picks
//! the winning version and every other member of the group is redirected to
//! the winner. The pass runs only between levels so the outcome never depends
//! on the order in which concurrent metadata fetches completed.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::coordinates::{Coordinates, ModuleKey, Version};
use crate::diagnostics::{DiagnosticKind, Message, Payload};
use crate::graph::{DependencyGraph, NodeId, NodeKind};

/// 1回の呼び出しで繰り返す選択ラウンドの上限。
const MAX_ROUNDS: usize = 32;

/// 候補バージョンの出どころ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Declared,
    /// `strictly` で宣言された依存。
    Strict,
    /// BOM が与える制約。
    Constraint,
    StrictConstraint,
}

impl CandidateSource {
    pub fn is_strict(&self) -> bool {
        matches!(self, CandidateSource::Strict | CandidateSource::StrictConstraint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub node: NodeId,
    pub version: Option<&'a str>,
    pub source: CandidateSource,
}

/// 競合グループから勝者のバージョンを選ぶ戦略。
pub trait ConflictStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 勝者のバージョン。候補のいずれもバージョンを持たなければ `None`。
    fn select(&self, candidates: &[Candidate<'_>]) -> Option<String>;
}

/// strict 指定 > BOM 制約 > 宣言の順に層を選び、その中で最も高いバージョンを採る。
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestVersionStrategy;

impl HighestVersionStrategy {
    fn highest<'a>(candidates: impl Iterator<Item = &'a Candidate<'a>>) -> Option<&'a str> {
        candidates
            .filter_map(|candidate| candidate.version)
            .max_by(|left, right| Version::parse(left).cmp(&Version::parse(right)))
    }
}

impl ConflictStrategy for HighestVersionStrategy {
    fn name(&self) -> &'static str {
        "highest-version"
    }

    fn select(&self, candidates: &[Candidate<'_>]) -> Option<String> {
        let tiers: [fn(&CandidateSource) -> bool; 3] = [
            CandidateSource::is_strict,
            |source| *source == CandidateSource::Constraint,
            |source| *source == CandidateSource::Declared,
        ];
        tiers.iter().find_map(|in_tier| {
            Self::highest(candidates.iter().filter(|candidate| in_tier(&candidate.source)))
                .map(str::to_string)
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictOutcome {
    /// 置き換え先が1つでも変わったか。
    pub changed: bool,
    /// 勝者として新たに作ったノード数。
    pub created: usize,
}

fn group_key(coordinates: &Coordinates) -> Coordinates {
    Coordinates {
        version: None,
        ..coordinates.clone()
    }
}

struct Groups {
    members: BTreeMap<Coordinates, Vec<NodeId>>,
    constraints: BTreeMap<ModuleKey, Vec<NodeId>>,
}

fn collect_groups(graph: &DependencyGraph) -> Groups {
    let mut members: BTreeMap<Coordinates, Vec<NodeId>> = BTreeMap::new();
    let mut constraints: BTreeMap<ModuleKey, Vec<NodeId>> = BTreeMap::new();
    let mut reachable = graph.reachable();
    reachable.sort();
    for id in reachable {
        match &graph.node(id).kind {
            NodeKind::Maven(node) => members
                .entry(group_key(&node.coordinates))
                .or_default()
                .push(id),
            NodeKind::Constraint(node) => constraints.entry(node.key.clone()).or_default().push(id),
            NodeKind::Root(_) => {}
        }
    }
    Groups {
        members,
        constraints,
    }
}

fn candidates<'g>(graph: &'g DependencyGraph, members: &[NodeId], constraints: &[NodeId]) -> Vec<Candidate<'g>> {
    let declared = members.iter().filter_map(|id| {
        let node = graph.maven(*id)?;
        Some(Candidate {
            node: *id,
            version: node.candidate_version(),
            source: if node.strict {
                CandidateSource::Strict
            } else {
                CandidateSource::Declared
            },
        })
    });
    let constrained = constraints.iter().filter_map(|id| {
        let node = graph.node(*id).as_constraint()?;
        Some(Candidate {
            node: *id,
            version: Some(node.version.as_str()),
            source: if node.strict {
                CandidateSource::StrictConstraint
            } else {
                CandidateSource::Constraint
            },
        })
    });
    declared.chain(constrained).collect()
}

/// 敗者の到達情報を勝者へ引き継ぐ。展開済みの勝者で条件が変われば再展開させる。
fn absorb_losers(graph: &mut DependencyGraph, winner: NodeId, members: &[NodeId]) {
    let mut declared_as = BTreeSet::new();
    let mut exclusions: Option<BTreeSet<_>> = None;
    for member in members.iter().chain(std::iter::once(&winner)) {
        let Some(node) = graph.maven(*member) else {
            continue;
        };
        declared_as.extend(node.declared_as.iter().copied());
        if let Some(set) = &node.exclusions {
            exclusions = Some(match exclusions {
                Some(current) => current.intersection(set).cloned().collect(),
                None => set.clone(),
            });
        }
    }
    if let Some(node) = graph.maven_mut(winner) {
        let mut changed = false;
        if !declared_as.is_subset(&node.declared_as) {
            node.declared_as.extend(declared_as);
            changed = true;
        }
        if exclusions.is_some() && node.exclusions != exclusions {
            changed |= node.exclusions.is_some();
            node.exclusions = exclusions;
        }
        if changed && node.expanded {
            node.expanded = false;
        }
    }
}

/// 1グループ分の選択。置き換え先が変わったら `true`。
fn resolve_group(
    graph: &mut DependencyGraph,
    strategy: &dyn ConflictStrategy,
    members: &[NodeId],
    constraints: &[NodeId],
    outcome: &mut ConflictOutcome,
) -> bool {
    let Some(version) = strategy.select(&candidates(graph, members, constraints)) else {
        return false;
    };

    let concrete = members.iter().copied().find(|id| {
        graph.maven(*id).is_some_and(|node| {
            !node.coordinates.is_range() && node.coordinates.version() == Some(version.as_str())
        })
    });
    let winner = match concrete {
        Some(id) => id,
        None => {
            let (id, created) = graph.ensure_version(members[0], &version);
            if created {
                outcome.created += 1;
            }
            id
        }
    };

    absorb_losers(graph, winner, members);

    let mut changed = false;
    for member in members.iter().copied().chain(std::iter::once(winner)) {
        let desired = (member != winner).then_some(winner);
        if let Some(node) = graph.maven_mut(member)
            && node.overridden_by != desired
        {
            node.overridden_by = desired;
            changed = true;
        }
    }
    if changed && let Some(node) = graph.maven(winner) {
        debug!(artifact = %node.coordinates, candidates = members.len(), "競合を解決");
    }
    changed
}

/// 置き換えられたノードに `old -> new` の INFO を付け直す。
fn record_overrides(graph: &mut DependencyGraph) {
    let ids: Vec<NodeId> = graph.nodes().map(|node| node.id).collect();
    for id in ids {
        let Some(node) = graph.maven(id) else {
            continue;
        };
        let from = node.coordinates.version().map(str::to_string);
        let to = node.overridden_by.and_then(|_| {
            let winner = graph.winner(id);
            graph
                .maven(winner)
                .and_then(|node| node.coordinates.version())
                .map(str::to_string)
        });
        let subject = node.coordinates.to_string();

        let messages = &mut graph.node_mut(id).messages;
        messages.retain(|message| message.kind != DiagnosticKind::VersionOverridden);
        if let (Some(from), Some(to)) = (from, to)
            && from != to
        {
            info!(artifact = %subject, %from, %to, "バージョンを置き換えました");
            messages.push(
                Message::info(DiagnosticKind::VersionOverridden, format!("{from} -> {to}"))
                    .with_payload(Payload::VersionOverride { from, to }),
            );
        }
    }
}

/// 到達可能なノード全体で競合を解決する。置き換えが安定するまでラウンドを繰り返す。
pub fn resolve_conflicts(graph: &mut DependencyGraph, strategy: &dyn ConflictStrategy) -> ConflictOutcome {
    let mut outcome = ConflictOutcome::default();
    for _ in 0..MAX_ROUNDS {
        let groups = collect_groups(graph);
        let mut round_changed = false;
        for (key, members) in &groups.members {
            let module = key.key();
            let constraints = groups
                .constraints
                .get(&module)
                .map(Vec::as_slice)
                .unwrap_or_default();
            round_changed |= resolve_group(graph, strategy, members, constraints, &mut outcome);
        }
        if !round_changed {
            break;
        }
        outcome.changed = true;
    }
    record_overrides(graph);
    outcome
}

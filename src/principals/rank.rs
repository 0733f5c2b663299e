// restoretool/src/principals/rank.rs
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::{Principal, PrincipalId, PrincipalKind, PrincipalSnapshot, RoleHierarchyEdge};

pub const USER_BASE_RANK: i32 = 3000;
pub const ROLE_BASE_RANK: i32 = 2000;
pub const APPLICATION_ROLE_BASE_RANK: i32 = 1000;

/// Deepest nesting that still ranks a role above every application role.
const MAX_RANKED_DEPTH: u32 = (ROLE_BASE_RANK - APPLICATION_ROLE_BASE_RANK - 1) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRank {
    pub role_id: PrincipalId,
    pub depth: u32,
}

/// Nesting depth of every captured role.
///
/// Roots are roles with no captured parent; a role whose only parents are
/// fixed or excluded roles is a root. Depth is the longest path from a root,
/// so a parent is always shallower than each of its children. Roles that sit
/// on or below a cycle are never released by the layering and are placed one
/// level below the deepest ranked role.
pub fn role_depths(principals: &[Principal], hierarchy: &[RoleHierarchyEdge]) -> Vec<RoleRank> {
    let roles: BTreeSet<PrincipalId> = principals
        .iter()
        .filter(|p| p.kind == PrincipalKind::Role)
        .map(|p| p.id)
        .collect();

    let mut children: BTreeMap<PrincipalId, Vec<PrincipalId>> = BTreeMap::new();
    let mut parents_left: BTreeMap<PrincipalId, usize> = roles.iter().map(|id| (*id, 0)).collect();
    let edges: BTreeSet<&RoleHierarchyEdge> = hierarchy
        .iter()
        .filter(|e| e.child_id != e.parent_id)
        .filter(|e| roles.contains(&e.child_id) && roles.contains(&e.parent_id))
        .collect();
    for edge in edges {
        children.entry(edge.parent_id).or_default().push(edge.child_id);
        *parents_left.entry(edge.child_id).or_default() += 1;
    }

    let mut depth: BTreeMap<PrincipalId, u32> = BTreeMap::new();
    let mut queue: VecDeque<PrincipalId> = parents_left
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    for root in &queue {
        depth.insert(*root, 0);
    }

    while let Some(current) = queue.pop_front() {
        let current_depth = depth.get(&current).copied().unwrap_or(0);
        for child in children.get(&current).map(Vec::as_slice).unwrap_or_default() {
            let entry = depth.entry(*child).or_insert(0);
            *entry = (*entry).max(current_depth + 1);
            if let Some(left) = parents_left.get_mut(child) {
                *left -= 1;
                if *left == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    let unreleased: Vec<PrincipalId> = parents_left
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(id, _)| *id)
        .collect();
    if !unreleased.is_empty() {
        tracing::warn!(roles = ?unreleased, "role hierarchy contains a cycle; ranking those roles last");
        let floor = depth
            .iter()
            .filter(|(id, _)| !unreleased.contains(*id))
            .map(|(_, d)| *d)
            .max()
            .map_or(0, |d| d + 1);
        for id in &unreleased {
            depth.insert(*id, floor);
        }
    }

    roles
        .into_iter()
        .map(|role_id| RoleRank {
            role_id,
            depth: depth.get(&role_id).copied().unwrap_or(0),
        })
        .collect()
}

pub fn replay_rank(kind: PrincipalKind, depth: u32) -> i32 {
    match kind {
        PrincipalKind::Role => ROLE_BASE_RANK - depth.min(MAX_RANKED_DEPTH) as i32,
        PrincipalKind::ApplicationRole => APPLICATION_ROLE_BASE_RANK,
        _ => USER_BASE_RANK,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedPrincipal {
    pub id: PrincipalId,
    pub name: String,
    pub kind: PrincipalKind,
    pub rank: i32,
}

/// Total processing order: rank descending, then id ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOrder {
    entries: Vec<RankedPrincipal>,
}

impl ReplayOrder {
    pub fn resolve(snapshot: &PrincipalSnapshot) -> Self {
        let depths: BTreeMap<PrincipalId, u32> = role_depths(&snapshot.principals, &snapshot.hierarchy)
            .into_iter()
            .map(|r| (r.role_id, r.depth))
            .collect();

        let mut entries: Vec<RankedPrincipal> = snapshot
            .principals
            .iter()
            .map(|p| RankedPrincipal {
                id: p.id,
                name: p.name.clone(),
                kind: p.kind,
                rank: replay_rank(p.kind, depths.get(&p.id).copied().unwrap_or(0)),
            })
            .collect();
        entries.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.id.cmp(&b.id)));
        ReplayOrder { entries }
    }

    pub fn entries(&self) -> &[RankedPrincipal] {
        &self.entries
    }

    /// Index of a principal in processing order, `None` when it was not captured.
    pub fn position(&self, id: PrincipalId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

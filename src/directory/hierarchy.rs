//! Organization tree helpers: depth assignment, level order and cycle detection.

use std::collections::{BTreeMap, HashSet};

use super::Organization;
use crate::sync::error::SyncError;

/// Depth of every live organization. Parents that do not resolve to a live
/// organization are treated as roots (depth 0).
pub fn depths(orgs: &BTreeMap<String, Organization>) -> Result<BTreeMap<String, usize>, SyncError> {
    let live: BTreeMap<&str, Option<&str>> = orgs
        .values()
        .filter(|o| !o.deleted)
        .map(|o| (o.id.as_str(), o.parent_id.as_deref()))
        .collect();

    let mut depth: BTreeMap<&str, usize> = BTreeMap::new();

    for &start in live.keys() {
        if depth.contains_key(start) {
            continue;
        }

        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        let mut cursor = start;

        let anchor = loop {
            if let Some(known) = depth.get(cursor) {
                break Some(*known);
            }
            if !on_path.insert(cursor) {
                let cycle_start = path.iter().position(|id| *id == cursor).unwrap_or(0);
                let mut cycle: Vec<&str> = path[cycle_start..].to_vec();
                cycle.push(cursor);
                return Err(SyncError::cyclic_hierarchy(format!(
                    "organization parent cycle: {}",
                    cycle.join(" -> ")
                ))
                .with_entity("organization", cursor));
            }
            path.push(cursor);
            match live.get(cursor).copied().flatten() {
                Some(parent) if live.contains_key(parent) => cursor = parent,
                _ => break None,
            }
        };

        let mut next = anchor.map(|d| d + 1).unwrap_or(0);
        for id in path.iter().rev() {
            depth.insert(*id, next);
            next += 1;
        }
    }

    Ok(depth
        .into_iter()
        .map(|(id, d)| (id.to_string(), d))
        .collect())
}

/// Live organization ids in level order: every parent precedes its children.
pub fn level_order(depths: &BTreeMap<String, usize>) -> Vec<String> {
    let mut ids: Vec<(&usize, &String)> = depths.iter().map(|(id, d)| (d, id)).collect();
    ids.sort();
    ids.into_iter().map(|(_, id)| id.clone()).collect()
}

/// Largest depth in the map; zero when empty.
pub fn max_depth(depths: &BTreeMap<String, usize>) -> usize {
    depths.values().copied().max().unwrap_or(0)
}

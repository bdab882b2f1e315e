//! Turns a classified diff into a dependency-ordered operation list.
//!
//! Tiers: org upserts by local depth, users at 0, membership upserts after
//! the deepest org, then membership deletes, user deletes, and finally org
//! deletes deepest-first.

use std::collections::BTreeMap;

use serde_json::Value;

use super::ClassifiedDiff;
use crate::directory::hierarchy::{depths, level_order, max_depth};
use crate::directory::{DirectorySnapshot, EntityType};
use crate::sync::error::SyncError;
use crate::sync::operation::{OperationType, PlannedOperation};

fn record_value(snapshot: &DirectorySnapshot, entity_type: EntityType, id: &str) -> Value {
    snapshot
        .get(entity_type, id)
        .map(|r| r.to_value())
        .unwrap_or(Value::Null)
}

pub fn plan(
    local: &DirectorySnapshot,
    remote: &DirectorySnapshot,
    classified: &ClassifiedDiff,
) -> Result<Vec<PlannedOperation>, SyncError> {
    let local_depths = depths(&local.organizations)?;
    let remote_depths = depths(&remote.organizations)?;
    let d = max_depth(&local_depths) as i32;
    let r = max_depth(&remote_depths) as i32;

    let local_rank: BTreeMap<String, usize> = level_order(&local_depths)
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();
    let remote_rank: BTreeMap<String, usize> = level_order(&remote_depths)
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();

    // (tier, entity type, bfs rank, op type, id)
    let mut keyed: Vec<((i32, EntityType, usize, OperationType, String), PlannedOperation)> =
        Vec::new();
    let mut push = |priority: i32, entity_type: EntityType, rank: usize, op: OperationType, id: &str| {
        let data = if op == OperationType::Delete {
            record_value(remote, entity_type, id)
        } else {
            record_value(local, entity_type, id)
        };
        keyed.push((
            (priority, entity_type, rank, op, id.to_string()),
            PlannedOperation {
                entity_type,
                entity_id: id.to_string(),
                operation_type: op,
                priority,
                data,
            },
        ));
    };

    if let Some(orgs) = classified.get(EntityType::Organization) {
        let upserts = [
            (OperationType::Create, &orgs.creates),
            (OperationType::Move, &orgs.moves),
            (OperationType::Rename, &orgs.renames),
            (OperationType::Update, &orgs.updates),
        ];
        for (op, ids) in upserts {
            for id in ids {
                let depth = local_depths.get(id).copied().unwrap_or(0) as i32;
                let rank = local_rank.get(id).copied().unwrap_or(usize::MAX);
                push(depth, EntityType::Organization, rank, op, id);
            }
        }
        for id in &orgs.deletes {
            let depth = remote_depths.get(id).copied().unwrap_or(0) as i32;
            let rank = remote_rank.get(id).copied().unwrap_or(usize::MAX);
            push(d + 4 + (r - depth), EntityType::Organization, rank, OperationType::Delete, id);
        }
    }

    if let Some(users) = classified.get(EntityType::User) {
        for id in &users.creates {
            push(0, EntityType::User, 0, OperationType::Create, id);
        }
        for id in &users.updates {
            push(0, EntityType::User, 0, OperationType::Update, id);
        }
        for id in &users.deletes {
            push(d + 3, EntityType::User, 0, OperationType::Delete, id);
        }
    }

    if let Some(memberships) = classified.get(EntityType::Membership) {
        for id in &memberships.creates {
            push(d + 1, EntityType::Membership, 0, OperationType::Create, id);
        }
        for id in &memberships.updates {
            push(d + 1, EntityType::Membership, 0, OperationType::Update, id);
        }
        for id in &memberships.deletes {
            push(d + 2, EntityType::Membership, 0, OperationType::Delete, id);
        }
    }

    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, op)| op).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Membership, Organization, User};
    use crate::sync::diff::classify;
    use crate::sync::error::SyncErrorKind;

    fn planned(local: &DirectorySnapshot, remote: &DirectorySnapshot) -> Vec<PlannedOperation> {
        let classified = classify(local, remote, &EntityType::ALL);
        plan(local, remote, &classified).unwrap()
    }

    #[test]
    fn parents_are_created_before_children_and_memberships_last() {
        let local = DirectorySnapshot::from_parts(
            vec![
                Organization::new("C", Some("B"), "C"),
                Organization::new("B", Some("A"), "B"),
                Organization::new("A", None, "A"),
            ],
            vec![User::new("u1", "alice")],
            vec![Membership::new("m1", "C", "u1", true)],
        );
        let ops = planned(&local, &DirectorySnapshot::default());

        let order: Vec<&str> = ops.iter().map(|o| o.entity_id.as_str()).collect();
        assert_eq!(order, vec!["A", "u1", "B", "C", "m1"]);
        assert_eq!(ops.last().unwrap().priority, 3);
        assert!(ops.iter().all(|o| o.operation_type == OperationType::Create));
    }

    #[test]
    fn deletes_run_leaf_first_after_membership_and_user_deletes() {
        let remote = DirectorySnapshot::from_parts(
            vec![Organization::new("A", None, "A"), Organization::new("B", Some("A"), "B")],
            vec![User::new("u1", "alice")],
            vec![Membership::new("m1", "B", "u1", true)],
        );
        let ops = planned(&DirectorySnapshot::default(), &remote);

        let order: Vec<(&str, i32)> = ops.iter().map(|o| (o.entity_id.as_str(), o.priority)).collect();
        assert_eq!(order, vec![("m1", 2), ("u1", 3), ("B", 4), ("A", 5)]);
        assert_eq!(ops[0].data["orgId"], "B");
    }

    #[test]
    fn remote_cycle_is_rejected() {
        let remote = DirectorySnapshot::from_parts(
            vec![Organization::new("A", Some("B"), "A"), Organization::new("B", Some("A"), "B")],
            vec![],
            vec![],
        );
        let classified = classify(&DirectorySnapshot::default(), &remote, &EntityType::ALL);
        let err = plan(&DirectorySnapshot::default(), &remote, &classified).unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::CyclicHierarchy);
    }

    #[test]
    fn moved_org_waits_for_its_new_parent() {
        let local = DirectorySnapshot::from_parts(
            vec![Organization::new("P", None, "P"), Organization::new("X", Some("P"), "X")],
            vec![],
            vec![],
        );
        let remote = DirectorySnapshot::from_parts(vec![Organization::new("X", None, "X")], vec![], vec![]);
        let ops = planned(&local, &remote);

        assert_eq!(ops[0].entity_id, "P");
        assert_eq!(ops[0].operation_type, OperationType::Create);
        assert_eq!(ops[1].entity_id, "X");
        assert_eq!(ops[1].operation_type, OperationType::Move);
        assert!(ops[1].priority > ops[0].priority);
    }
}

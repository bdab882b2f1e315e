//! Property checks over randomly generated directories.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::collections::BTreeMap;

use anyhow::Result;
use dirsync::directory::{DirectorySnapshot, EntityType};
use dirsync::sync::diff::{DiffEngine, DiffStrategy, classify, plan};
use dirsync::sync::operation::{OperationType, PlannedOperation};
use rand::SeedableRng;
use rand::rngs::StdRng;
use test_utils::{random_snapshot, setup_test_db};

const SEEDS: u64 = 24;

fn pair(seed: u64) -> (DirectorySnapshot, DirectorySnapshot) {
    let mut rng = StdRng::seed_from_u64(seed);
    let local = random_snapshot(&mut rng, 12, 10);
    let remote = random_snapshot(&mut rng, 9, 12);
    (local, remote)
}

fn priorities(ops: &[PlannedOperation]) -> BTreeMap<(EntityType, String, OperationType), i32> {
    ops.iter()
        .map(|op| ((op.entity_type, op.entity_id.clone(), op.operation_type), op.priority))
        .collect()
}

#[test]
fn identical_directories_have_no_differences() {
    for seed in 0..SEEDS {
        let (local, _) = pair(seed);
        let diff = classify(&local, &local, &EntityType::ALL);
        assert!(diff.is_empty(), "seed {seed} produced {diff:?}");
    }
}

#[test]
fn swapping_inputs_swaps_creates_and_deletes() {
    for seed in 0..SEEDS {
        let (local, remote) = pair(seed);
        let forward = classify(&local, &remote, &EntityType::ALL);
        let backward = classify(&remote, &local, &EntityType::ALL);
        assert_eq!(forward, backward.reversed(), "seed {seed}");
    }
}

#[test]
fn operations_are_sorted_by_priority() {
    for seed in 0..SEEDS {
        let (local, remote) = pair(seed);
        let classified = classify(&local, &remote, &EntityType::ALL);
        let ops = plan(&local, &remote, &classified).unwrap();

        assert_eq!(ops.len(), classified.len(), "seed {seed}");
        assert!(
            ops.windows(2).all(|w| w[0].priority <= w[1].priority),
            "seed {seed} is out of order"
        );
    }
}

#[test]
fn parents_are_written_before_children_and_deleted_after_them() {
    for seed in 0..SEEDS {
        let (local, remote) = pair(seed);
        let classified = classify(&local, &remote, &EntityType::ALL);
        let ops = plan(&local, &remote, &classified).unwrap();
        let by_key = priorities(&ops);

        for op in ops.iter().filter(|op| op.entity_type == EntityType::Organization) {
            if op.operation_type == OperationType::Delete {
                for child in remote
                    .organizations
                    .values()
                    .filter(|o| o.parent_id.as_deref() == Some(op.entity_id.as_str()))
                {
                    let key = (EntityType::Organization, child.id.clone(), OperationType::Delete);
                    if let Some(child_priority) = by_key.get(&key) {
                        assert!(*child_priority < op.priority, "seed {seed}: child delete after parent");
                    }
                }
            } else if let Some(parent) = local.organizations[&op.entity_id].parent_id.clone() {
                let key = (EntityType::Organization, parent, OperationType::Create);
                if let Some(parent_priority) = by_key.get(&key) {
                    assert!(*parent_priority < op.priority, "seed {seed}: child before parent");
                }
            }
        }

        let org_upserts = ops
            .iter()
            .filter(|op| {
                op.entity_type == EntityType::Organization && op.operation_type != OperationType::Delete
            })
            .map(|op| op.priority)
            .max();
        for op in ops.iter().filter(|op| op.entity_type == EntityType::Membership) {
            if let Some(max_org) = org_upserts {
                assert!(op.priority > max_org, "seed {seed}: membership before its org");
            }
        }
    }
}

#[tokio::test]
async fn relational_join_matches_in_memory_classification() -> Result<()> {
    let db = setup_test_db().await?;
    let joined = DiffEngine::new(db, 0);
    let in_memory = DiffEngine::in_memory();

    for seed in 0..8 {
        let (local, remote) = pair(seed);
        let via_join = joined.diff(&local, &remote, &EntityType::ALL).await?;
        let via_memory = in_memory.diff(&local, &remote, &EntityType::ALL).await?;

        assert_eq!(via_join.strategy, DiffStrategy::RelationalJoin);
        assert_eq!(via_memory.strategy, DiffStrategy::InMemory);
        assert_eq!(via_join.classified, via_memory.classified, "seed {seed}");
        assert_eq!(via_join.operations, via_memory.operations, "seed {seed}");
    }
    Ok(())
}

#[tokio::test]
async fn relational_join_respects_requested_types() -> Result<()> {
    let db = setup_test_db().await?;
    let (local, remote) = pair(3);

    let diff = DiffEngine::new(db, 0)
        .diff(&local, &remote, &[EntityType::User])
        .await?;

    assert!(diff.classified.get(EntityType::Organization).is_none());
    assert!(diff.operations.iter().all(|op| op.entity_type == EntityType::User));
    Ok(())
}

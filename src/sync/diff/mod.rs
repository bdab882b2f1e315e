//! Diff engine.
//!
//! Compares a local entity set against a remote one and classifies every
//! difference per entity type. Two comparison strategies produce the same
//! [`ClassifiedDiff`]: an in-memory map walk and a relational join over the
//! `diff_staging` table for large inputs. The shared [`plan`] step turns the
//! classification into an ordered, hierarchy-respecting operation list.

pub mod join;
pub mod plan;

use std::collections::{BTreeMap, BTreeSet};

use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::directory::{DirectoryEntity, DirectorySnapshot, EntityType};
use crate::sync::error::SyncError;
use crate::sync::operation::PlannedOperation;

pub use plan::plan;

/// Classified differences for one entity type, as sorted id sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDiff {
    pub creates: BTreeSet<String>,
    pub deletes: BTreeSet<String>,
    /// Organizations only: parent changed
    pub moves: BTreeSet<String>,
    /// Organizations only: name changed
    pub renames: BTreeSet<String>,
    pub updates: BTreeSet<String>,
}

impl TypeDiff {
    pub fn len(&self) -> usize {
        self.creates.len() + self.deletes.len() + self.moves.len() + self.renames.len() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifiedDiff {
    pub types: BTreeMap<EntityType, TypeDiff>,
}

impl ClassifiedDiff {
    pub fn get(&self, entity_type: EntityType) -> Option<&TypeDiff> {
        self.types.get(&entity_type)
    }

    pub fn len(&self) -> usize {
        self.types.values().map(TypeDiff::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The diff of the swapped inputs: creates and deletes trade places.
    pub fn reversed(&self) -> Self {
        let types = self
            .types
            .iter()
            .map(|(t, d)| {
                (
                    *t,
                    TypeDiff {
                        creates: d.deletes.clone(),
                        deletes: d.creates.clone(),
                        moves: d.moves.clone(),
                        renames: d.renames.clone(),
                        updates: d.updates.clone(),
                    },
                )
            })
            .collect();
        Self { types }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStrategy {
    InMemory,
    RelationalJoin,
}

#[derive(Debug, Clone)]
pub struct DiffPlan {
    pub strategy: DiffStrategy,
    pub classified: ClassifiedDiff,
    pub operations: Vec<PlannedOperation>,
}

fn live<E: DirectoryEntity>(map: &BTreeMap<String, E>) -> BTreeMap<&str, &E> {
    map.iter()
        .filter(|(_, e)| !e.is_deleted())
        .map(|(id, e)| (id.as_str(), e))
        .collect()
}

fn compare_type<E: DirectoryEntity>(
    local: &BTreeMap<String, E>,
    remote: &BTreeMap<String, E>,
    shape: impl Fn(&E, &E, &mut TypeDiff, &str),
) -> TypeDiff {
    let local = live(local);
    let remote = live(remote);
    let mut diff = TypeDiff::default();

    for (id, l) in &local {
        match remote.get(id) {
            None => {
                diff.creates.insert((*id).to_string());
            }
            Some(r) => shape(l, r, &mut diff, id),
        }
    }
    for id in remote.keys() {
        if !local.contains_key(id) {
            diff.deletes.insert((*id).to_string());
        }
    }
    diff
}

/// In-memory classification. Soft-deleted entities on either side count as absent.
pub fn classify(
    local: &DirectorySnapshot,
    remote: &DirectorySnapshot,
    entity_types: &[EntityType],
) -> ClassifiedDiff {
    let mut classified = ClassifiedDiff::default();
    for &entity_type in entity_types {
        let diff = match entity_type {
            EntityType::Organization => {
                compare_type(&local.organizations, &remote.organizations, |l, r, diff, id| {
                    if l.parent_id != r.parent_id {
                        diff.moves.insert(id.to_string());
                    }
                    if l.name != r.name {
                        diff.renames.insert(id.to_string());
                    }
                    if l.content_hash() != r.content_hash() {
                        diff.updates.insert(id.to_string());
                    }
                })
            }
            EntityType::User => compare_type(&local.users, &remote.users, |l, r, diff, id| {
                if l.content_hash() != r.content_hash() {
                    diff.updates.insert(id.to_string());
                }
            }),
            EntityType::Membership => {
                compare_type(&local.memberships, &remote.memberships, |l, r, diff, id| {
                    if l.content_hash() != r.content_hash() {
                        diff.updates.insert(id.to_string());
                    }
                })
            }
        };
        classified.types.insert(entity_type, diff);
    }
    classified
}

/// Chooses the comparison strategy and plans the resulting operations.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    db: Option<DatabaseConnection>,
    join_threshold: usize,
}

impl DiffEngine {
    pub fn in_memory() -> Self {
        Self {
            db: None,
            join_threshold: usize::MAX,
        }
    }

    pub fn new(db: DatabaseConnection, join_threshold: usize) -> Self {
        Self {
            db: Some(db),
            join_threshold,
        }
    }

    pub fn strategy_for(&self, local: &DirectorySnapshot, remote: &DirectorySnapshot) -> DiffStrategy {
        if self.db.is_some() && local.len() + remote.len() >= self.join_threshold {
            DiffStrategy::RelationalJoin
        } else {
            DiffStrategy::InMemory
        }
    }

    #[instrument(skip_all, fields(local = local.len(), remote = remote.len()))]
    pub async fn diff(
        &self,
        local: &DirectorySnapshot,
        remote: &DirectorySnapshot,
        entity_types: &[EntityType],
    ) -> Result<DiffPlan, SyncError> {
        let strategy = self.strategy_for(local, remote);
        let classified = match (&self.db, strategy) {
            (Some(db), DiffStrategy::RelationalJoin) => {
                join::classify_with_join(db, local, remote, entity_types).await?
            }
            _ => classify(local, remote, entity_types),
        };
        Self::planned(strategy, classified, local, remote)
    }

    /// Like [`DiffEngine::diff`], staging join rows through `conn` so the
    /// comparison can run inside an open transaction.
    #[instrument(skip_all, fields(local = local.len(), remote = remote.len()))]
    pub async fn diff_within<C: ConnectionTrait>(
        &self,
        conn: &C,
        local: &DirectorySnapshot,
        remote: &DirectorySnapshot,
        entity_types: &[EntityType],
    ) -> Result<DiffPlan, SyncError> {
        let strategy = self.strategy_for(local, remote);
        let classified = match strategy {
            DiffStrategy::RelationalJoin => {
                join::classify_with_join(conn, local, remote, entity_types).await?
            }
            DiffStrategy::InMemory => classify(local, remote, entity_types),
        };
        Self::planned(strategy, classified, local, remote)
    }

    fn planned(
        strategy: DiffStrategy,
        classified: ClassifiedDiff,
        local: &DirectorySnapshot,
        remote: &DirectorySnapshot,
    ) -> Result<DiffPlan, SyncError> {
        let operations = plan(local, remote, &classified)?;
        debug!(
            strategy = ?strategy,
            operations = operations.len(),
            "diff computed"
        );
        Ok(DiffPlan {
            strategy,
            classified,
            operations,
        })
    }
}

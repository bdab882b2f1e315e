//! Scope locks held by a running task.
//!
//! One lease per requested entity type, keyed
//! `sync:{entityType}:{tenant}:{project}`. Keys are taken in sorted order and
//! all-or-nothing; partially acquired keys are released before retrying.
//! A lease the refresher finds taken over cancels the holder's token.

use std::time::Duration;

use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::directory::{EntityType, Scope};
use crate::repositories::LockRepository;
use crate::sync::error::SyncError;

pub fn lock_key(entity_type: EntityType, scope: &Scope) -> String {
    format!("sync:{}:{}:{}", entity_type.as_str(), scope.tenant_id, scope.project_id)
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub ttl: Duration,
    pub refresh_every: Duration,
    pub acquire_attempts: u32,
    pub retry_base: Duration,
}

impl From<&LockConfig> for LockSettings {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_seconds),
            refresh_every: Duration::from_secs(config.refresh_seconds),
            acquire_attempts: config.acquire_attempts.max(1),
            retry_base: Duration::from_millis(200),
        }
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// Held leases plus the background refresher keeping them alive.
pub struct ScopeLock {
    db: DatabaseConnection,
    keys: Vec<String>,
    holder: String,
    stop: CancellationToken,
    lost: CancellationToken,
    refresher: Option<JoinHandle<()>>,
}

impl ScopeLock {
    pub async fn acquire(
        db: &DatabaseConnection,
        scope: &Scope,
        entity_types: &[EntityType],
        holder: &str,
        settings: &LockSettings,
    ) -> Result<Self, SyncError> {
        Self::acquire_for(db, scope, entity_types, holder, settings, CancellationToken::new()).await
    }

    /// Like [`ScopeLock::acquire`]; `on_lost` is cancelled once any lease is
    /// found held by someone else.
    pub async fn acquire_for(
        db: &DatabaseConnection,
        scope: &Scope,
        entity_types: &[EntityType],
        holder: &str,
        settings: &LockSettings,
        on_lost: CancellationToken,
    ) -> Result<Self, SyncError> {
        let mut types = entity_types.to_vec();
        types.sort();
        types.dedup();
        let keys: Vec<String> = types.iter().map(|t| lock_key(*t, scope)).collect();

        let repo = LockRepository::new();
        let ttl = chrono_ttl(settings.ttl);
        let mut delay = settings.retry_base;

        for attempt in 1..=settings.acquire_attempts {
            match try_acquire_all(db, &repo, &keys, holder, ttl).await? {
                None => {
                    debug!(holder, ?keys, attempt, "scope locks acquired");
                    let stop = CancellationToken::new();
                    let lost = CancellationToken::new();
                    let refresher = Refresher {
                        db: db.clone(),
                        keys: keys.clone(),
                        holder: holder.to_string(),
                        ttl,
                        every: settings.refresh_every,
                        stop: stop.clone(),
                        lost: lost.clone(),
                        on_lost,
                    }
                    .spawn();
                    return Ok(Self {
                        db: db.clone(),
                        keys,
                        holder: holder.to_string(),
                        stop,
                        lost,
                        refresher: Some(refresher),
                    });
                }
                Some(contended) => {
                    metrics::counter!("dirsync_lock_contention_total").increment(1);
                    warn!(holder, key = %contended, attempt, "scope lock contended");
                    if attempt < settings.acquire_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        Err(SyncError::lock_contention(format!(
            "scope locks {} are held by another task",
            keys.join(", ")
        ))
        .with_attempts(settings.acquire_attempts))
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Whether the refresher found a lease taken over.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stops the refresher and deletes every lease this holder owns.
    pub async fn release(mut self) -> Result<(), SyncError> {
        self.stop.cancel();
        if let Some(handle) = self.refresher.take() {
            if let Err(err) = handle.await {
                warn!(holder = %self.holder, error = %err, "scope lock refresher ended abnormally");
            }
        }
        let repo = LockRepository::new();
        let mut first_error = None;
        for key in self.keys.iter().rev() {
            if let Err(err) = repo.release(&self.db, key, &self.holder).await {
                warn!(key = %key, error = %err, "failed to release scope lock");
                first_error.get_or_insert(err);
            }
        }
        info!(holder = %self.holder, "scope locks released");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        // Leases that were never released expire on their own.
        self.stop.cancel();
    }
}

/// `None` when every key was taken, otherwise the first contended key.
async fn try_acquire_all(
    db: &DatabaseConnection,
    repo: &LockRepository,
    keys: &[String],
    holder: &str,
    ttl: chrono::Duration,
) -> Result<Option<String>, SyncError> {
    let mut taken: Vec<&String> = Vec::new();
    for key in keys {
        if repo.try_acquire(db, key, holder, ttl).await? {
            taken.push(key);
            continue;
        }
        for held in taken.iter().rev() {
            repo.release(db, held, holder).await?;
        }
        return Ok(Some(key.clone()));
    }
    Ok(None)
}

struct Refresher {
    db: DatabaseConnection,
    keys: Vec<String>,
    holder: String,
    ttl: chrono::Duration,
    every: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
    on_lost: CancellationToken,
}

impl Refresher {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let repo = LockRepository::new();
            let mut interval = tokio::time::interval(self.every.max(Duration::from_millis(50)));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = interval.tick() => {
                        if !self.refresh_all(&repo).await {
                            self.lost.cancel();
                            self.on_lost.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }

    /// `false` once a lease is held by someone else.
    async fn refresh_all(&self, repo: &LockRepository) -> bool {
        for key in &self.keys {
            match repo.refresh(&self.db, key, &self.holder, self.ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    metrics::counter!("dirsync_lock_lost_total").increment(1);
                    warn!(key = %key, holder = %self.holder, "scope lock lease lost");
                    return false;
                }
                Err(err) => warn!(key = %key, error = %err, "scope lock refresh failed"),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn keys_are_scoped_by_tenant_and_project() {
        let scope = Scope::new(Uuid::from_u128(1), Uuid::from_u128(2));
        let key = lock_key(EntityType::User, &scope);
        assert!(key.starts_with("sync:user:"));
        assert!(key.ends_with(&Uuid::from_u128(2).to_string()));
    }
}

//! One-shot migration of legacy storage keys into the unified store.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::KeyValueStore;
use crate::error::{storage_error, Error, ErrorKind, StorageErrorKind};

/// What a migration run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Entries copied into the unified store.
    pub migrated: usize,
    /// Legacy entries dropped because the unified store already had a value.
    pub kept_existing: usize,
}

#[async_trait]
pub trait Migration: Send + Sync {
    async fn run(&self) -> Result<MigrationReport, Error>;
}

type SharedRun = Shared<BoxFuture<'static, Result<MigrationReport, Arc<Error>>>>;

#[derive(Default)]
struct GuardState {
    completed: Option<MigrationReport>,
    in_flight: Option<(u64, SharedRun)>,
    generation: u64,
}

/// Runs a [`Migration`] at most once at a time and at most once successfully.
///
/// The first caller spawns the run and publishes a shared handle to it; callers
/// arriving while it is in flight await the same handle. A failed run clears the
/// in-flight marker so the next caller starts a fresh attempt.
pub struct MigrationGuard {
    migration: Arc<dyn Migration>,
    state: Mutex<GuardState>,
}

impl MigrationGuard {
    pub fn new(migration: Arc<dyn Migration>) -> Self {
        Self {
            migration,
            state: Mutex::new(GuardState::default()),
        }
    }

    /// A guard with nothing to migrate.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoMigration))
    }

    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.completed.is_some()
    }

    pub async fn ensure_migration(&self) -> Result<MigrationReport, Error> {
        let (generation, run) = {
            let mut state = self.state.lock().await;
            if let Some(report) = &state.completed {
                return Ok(report.clone());
            }
            match &state.in_flight {
                Some((generation, run)) => (*generation, run.clone()),
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let run = self.spawn_run();
                    state.in_flight = Some((generation, run.clone()));
                    (generation, run)
                }
            }
        };

        let result = run.await;

        let mut state = self.state.lock().await;
        if matches!(&state.in_flight, Some((current, _)) if *current == generation) {
            state.in_flight = None;
            match &result {
                Ok(report) => {
                    info!(
                        "Storage migration complete: {} migrated, {} already present",
                        report.migrated, report.kept_existing
                    );
                    state.completed = Some(report.clone());
                }
                Err(e) => warn!("Storage migration failed, will retry on next access: {}", e),
            }
        }

        result.map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Storage(StorageErrorKind::MigrationFailed),
        })
    }

    fn spawn_run(&self) -> SharedRun {
        let migration = self.migration.clone();
        let handle = tokio::spawn(async move { migration.run().await });
        async move {
            match handle.await {
                Ok(result) => result.map_err(Arc::new),
                Err(join) => Err(Arc::new(Error {
                    source: Some(Box::new(join)),
                    error_kind: ErrorKind::Storage(StorageErrorKind::MigrationFailed),
                })),
            }
        }
        .boxed()
        .shared()
    }
}

struct NoMigration;

#[async_trait]
impl Migration for NoMigration {
    async fn run(&self) -> Result<MigrationReport, Error> {
        Ok(MigrationReport::default())
    }
}

/// Which legacy keys to move and where to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyKey {
    Exact { from: String, to: String },
    /// Every key starting with `from`; the prefix is replaced by `to`.
    Prefix { from: String, to: String },
}

impl LegacyKey {
    fn target(&self, key: &str) -> Option<String> {
        match self {
            LegacyKey::Exact { from, to } if from == key => Some(to.clone()),
            LegacyKey::Prefix { from, to } => {
                key.strip_prefix(from.as_str()).map(|rest| format!("{to}{rest}"))
            }
            _ => None,
        }
    }
}

/// Moves legacy entries into the unified store.
///
/// Each entry is written, read back to confirm, and only then deleted from the
/// legacy store. An entry already present in the unified store wins.
pub struct LegacyKeyMigration {
    legacy: Arc<dyn KeyValueStore>,
    unified: Arc<dyn KeyValueStore>,
    keys: Vec<LegacyKey>,
}

impl LegacyKeyMigration {
    pub fn new(
        legacy: Arc<dyn KeyValueStore>,
        unified: Arc<dyn KeyValueStore>,
        keys: Vec<LegacyKey>,
    ) -> Self {
        Self {
            legacy,
            unified,
            keys,
        }
    }

    fn target(&self, key: &str) -> Option<String> {
        self.keys.iter().find_map(|k| k.target(key))
    }
}

#[async_trait]
impl Migration for LegacyKeyMigration {
    async fn run(&self) -> Result<MigrationReport, Error> {
        let mut report = MigrationReport::default();

        for key in self.legacy.keys().await? {
            let Some(target) = self.target(&key) else {
                continue;
            };
            let Some(value) = self.legacy.get(&key).await? else {
                continue;
            };

            if self.unified.get(&target).await?.is_some() {
                debug!("Keeping existing unified entry {}", target);
                report.kept_existing += 1;
            } else {
                self.unified.set(&target, &value).await?;
                if self.unified.get(&target).await?.as_deref() != Some(value.as_str()) {
                    return Err(storage_error(
                        StorageErrorKind::WriteNotConfirmed,
                        "migrated value could not be read back",
                    ));
                }
                debug!("Migrated {} to {}", key, target);
                report.migrated += 1;
            }
            self.legacy.remove(&key).await?;
        }

        Ok(report)
    }
}

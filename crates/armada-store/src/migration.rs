//! Storage format migration.
//!
//! On leader start, the stored format version is compared against the
//! process's current version. Registered steps whose target version is
//! greater run in ascending order; each step is idempotent and bumps the
//! stored version on success, so a crash mid-migration resumes where it
//! stopped. A store without a version node is freshly initialized: the
//! current version is written and no steps run. A stored version newer than
//! the process is fatal.

use std::pin::Pin;
use std::sync::Arc;

use crate::kv::{CoordinationStore, StoreError};
use crate::repository::{Repository, StorageVersion};

/// The format version this build reads and writes.
pub const CURRENT_STORAGE_VERSION: u32 = 2;

type StepFn = Box<
    dyn Fn(Arc<dyn CoordinationStore>) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>
        + Send
        + Sync,
>;

/// One upgrade step. Running it brings the store to `target`.
pub struct MigrationStep {
    pub target: u32,
    pub name: &'static str,
    run: StepFn,
}

impl MigrationStep {
    pub fn new<F, Fut>(target: u32, name: &'static str, run: F) -> Self
    where
        F: Fn(Arc<dyn CoordinationStore>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        Self {
            target,
            name,
            run: Box::new(move |store| Box::pin(run(store))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The store was written by a newer build. Refusing to touch it is the
    /// only safe move.
    #[error("storage version {stored} is newer than this build's {current}")]
    FromTheFuture { stored: u32, current: u32 },

    #[error("migration step '{step}' (target {target}) failed: {source}")]
    StepFailed {
        step: &'static str,
        target: u32,
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ordered registry of migration steps for one storage root.
pub struct Migrator {
    store: Arc<dyn CoordinationStore>,
    version_repo: Repository<StorageVersion>,
    current: u32,
    steps: Vec<MigrationStep>,
}

impl Migrator {
    pub fn new(store: Arc<dyn CoordinationStore>, root: &str) -> Self {
        Self {
            version_repo: Repository::new(Arc::clone(&store), root),
            store,
            current: CURRENT_STORAGE_VERSION,
            steps: Vec::new(),
        }
    }

    /// Override the build version; test hook.
    pub fn with_current_version(mut self, current: u32) -> Self {
        self.current = current;
        self
    }

    pub fn register(mut self, step: MigrationStep) -> Self {
        self.steps.push(step);
        self.steps.sort_by_key(|s| s.target);
        self
    }

    /// Run all applicable steps. Returns the resulting storage version.
    pub async fn migrate(&self) -> Result<u32, MigrationError> {
        let stored = match self.version_repo.get("version").await? {
            Some(v) => v.current,
            None => {
                // Freshly initialized store: stamp and proceed.
                tracing::info!(version = self.current, "initializing storage version");
                self.write_version(self.current).await?;
                return Ok(self.current);
            }
        };

        if stored > self.current {
            return Err(MigrationError::FromTheFuture {
                stored,
                current: self.current,
            });
        }
        if stored == self.current {
            return Ok(stored);
        }

        let mut at = stored;
        for step in &self.steps {
            if step.target <= at || step.target > self.current {
                continue;
            }
            tracing::info!(step = step.name, target = step.target, "running storage migration");
            (step.run)(Arc::clone(&self.store))
                .await
                .map_err(|source| MigrationError::StepFailed {
                    step: step.name,
                    target: step.target,
                    source,
                })?;
            self.write_version(step.target).await?;
            at = step.target;
        }

        // Steps may not cover every number up to current; stamp the rest.
        if at < self.current {
            self.write_version(self.current).await?;
            at = self.current;
        }
        Ok(at)
    }

    async fn write_version(&self, version: u32) -> Result<(), StoreError> {
        self.version_repo.store(&StorageVersion { current: version }).await
    }
}

//! Leader-local lazy caching over a repository.
//!
//! Keeps two maps per category: the id list and individual values, both
//! populated on first miss. Writes go to the durable store first and update
//! the cache after, so a reader on the same process never observes the cache
//! ahead of the store. Operations on the same id (and the id-list operations
//! on the category) are sequenced through a named-lock manager. The cache is
//! only valid while this process is leader; discard it on leadership loss.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::kv::StoreError;
use crate::repository::{Record, Repository};

/// One async mutex per name, created on demand.
///
/// Equivalent to a lock stripe per record id plus one per category. Locks are
/// never removed; the name space is bounded by the set of record ids.
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

#[derive(Default)]
struct CacheState<T> {
    ids: Option<BTreeSet<String>>,
    values: HashMap<String, Option<T>>,
}

/// A [`Repository`] wrapper that caches reads for the leader's lifetime.
pub struct LazyCachingRepository<T> {
    inner: Repository<T>,
    locks: LockManager,
    state: Mutex<CacheState<T>>,
}

impl<T: Record> LazyCachingRepository<T> {
    pub fn new(inner: Repository<T>) -> Self {
        Self {
            inner,
            locks: LockManager::new(),
            state: Mutex::new(CacheState {
                ids: None,
                values: HashMap::new(),
            }),
        }
    }

    fn category_lock_name() -> String {
        format!("category:{}", T::CATEGORY)
    }

    /// Read through the cache, populating on miss. Negative results are
    /// cached too, so repeated lookups of absent records stay cheap.
    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        let _guard = self.locks.lock(id).await;
        {
            let state = self.state.lock().await;
            if let Some(cached) = state.values.get(id) {
                return Ok(cached.clone());
            }
        }
        let value = self.inner.get(id).await?;
        let mut state = self.state.lock().await;
        state.values.insert(id.to_string(), value.clone());
        Ok(value)
    }

    /// Durable write first, then cache update.
    pub async fn store(&self, value: &T) -> Result<(), StoreError> {
        let id = value.record_id();
        let _guard = self.locks.lock(&id).await;
        self.inner.store(value).await?;
        let mut state = self.state.lock().await;
        state.values.insert(id.clone(), Some(value.clone()));
        if let Some(ids) = state.ids.as_mut() {
            ids.insert(id);
        }
        Ok(())
    }

    /// Durable delete first, then cache update.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.locks.lock(id).await;
        self.inner.delete(id).await?;
        let mut state = self.state.lock().await;
        state.values.insert(id.to_string(), None);
        if let Some(ids) = state.ids.as_mut() {
            ids.remove(id);
        }
        Ok(())
    }

    /// The id list, read once from the store and maintained by writes.
    pub async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.locks.lock(&Self::category_lock_name()).await;
        {
            let state = self.state.lock().await;
            if let Some(ids) = &state.ids {
                return Ok(ids.iter().cloned().collect());
            }
        }
        let ids = self.inner.ids().await?;
        let mut state = self.state.lock().await;
        state.ids = Some(ids.iter().cloned().collect());
        Ok(ids)
    }

    /// All current records, via the cached id list.
    pub async fn all(&self) -> Result<Vec<T>, StoreError> {
        let ids = self.ids().await?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(value) = self.get(&id).await? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Versions pass straight through; history is not cached.
    pub async fn versions(&self, id: &str) -> Result<Vec<chrono::DateTime<chrono::Utc>>, StoreError> {
        self.inner.versions(id).await
    }

    pub async fn get_version(
        &self,
        id: &str,
        version: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<T>, StoreError> {
        self.inner.get_version(id, version).await
    }

    /// Drop everything cached. Call on leadership loss.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.ids = None;
        state.values.clear();
    }
}

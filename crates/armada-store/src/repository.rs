//! Typed repositories over the coordination store.
//!
//! Each record category (apps, pods, groups, instances, deployments,
//! task-failures, framework-id, event-subscribers, storage-version) gets its
//! own key space under a common root. Records are serialized as JSON.
//! Categories that keep historical versions write an extra node per version
//! under a parallel `<category>.versions` subtree; old versions survive
//! until explicitly removed.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::kv::{CoordinationStore, NodeVersion, StoreError};

/// A persistable record.
///
/// `record_version` returns `Some` for categories with retained history
/// (run-specs and groups); the repository then writes a version node next to
/// the current one on every store.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const CATEGORY: &'static str;

    fn record_id(&self) -> String;

    fn record_version(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Replace the path separator in record ids so they form a single node name.
///
/// Validated run-spec path segments never contain `:`, so the mapping is
/// reversible.
pub fn escape_id(id: &str) -> String {
    id.trim_matches('/').replace('/', ":")
}

pub fn unescape_id(escaped: &str) -> String {
    format!("/{}", escaped.replace(':', "/"))
}

fn version_key(version: DateTime<Utc>) -> String {
    // Zero-padded micros sort lexicographically in timestamp order.
    format!("{:020}", version.timestamp_micros())
}

fn parse_version_key(key: &str) -> Option<DateTime<Utc>> {
    let micros: i64 = key.parse().ok()?;
    DateTime::from_timestamp_micros(micros)
}

/// Typed access to one record category.
pub struct Repository<T> {
    store: Arc<dyn CoordinationStore>,
    root: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            root: self.root.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> Repository<T> {
    pub fn new(store: Arc<dyn CoordinationStore>, root: &str) -> Self {
        Self {
            store,
            root: root.trim_end_matches('/').to_string(),
            _marker: PhantomData,
        }
    }

    fn category_path(&self) -> String {
        format!("{}/{}", self.root, T::CATEGORY)
    }

    fn node_path(&self, id: &str) -> String {
        format!("{}/{}", self.category_path(), escape_id(id))
    }

    fn version_dir(&self, id: &str) -> String {
        format!("{}/{}.versions/{}", self.root, T::CATEGORY, escape_id(id))
    }

    fn version_path(&self, id: &str, version: DateTime<Utc>) -> String {
        format!("{}/{}", self.version_dir(id), version_key(version))
    }

    fn decode(&self, data: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(data).map_err(StoreError::from)
    }

    /// Read the current record for `id`.
    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(&self.node_path(id)).await? {
            Some(node) => Ok(Some(self.decode(&node.data)?)),
            None => Ok(None),
        }
    }

    /// Read the current record together with its store version, for
    /// compare-and-set writes.
    pub async fn get_versioned(&self, id: &str) -> Result<Option<(T, NodeVersion)>, StoreError> {
        match self.store.get(&self.node_path(id)).await? {
            Some(node) => Ok(Some((self.decode(&node.data)?, node.version))),
            None => Ok(None),
        }
    }

    /// Read a specific retained version of `id`.
    pub async fn get_version(
        &self,
        id: &str,
        version: DateTime<Utc>,
    ) -> Result<Option<T>, StoreError> {
        match self.store.get(&self.version_path(id, version)).await? {
            Some(node) => Ok(Some(self.decode(&node.data)?)),
            None => Ok(None),
        }
    }

    /// Write `value` as the current record, unconditionally. Versioned
    /// categories also retain the record under its version key.
    pub async fn store(&self, value: &T) -> Result<(), StoreError> {
        let id = value.record_id();
        let data = serde_json::to_vec(value)?;
        if let Some(version) = value.record_version() {
            self.store
                .set(&self.version_path(&id, version), data.clone(), None)
                .await?;
        }
        self.store.set(&self.node_path(&id), data, None).await?;
        Ok(())
    }

    /// Compare-and-set write: succeeds only if the stored node version still
    /// equals `expected` (`None` = must not exist yet).
    pub async fn store_cas(
        &self,
        value: &T,
        expected: Option<NodeVersion>,
    ) -> Result<NodeVersion, StoreError> {
        let id = value.record_id();
        let data = serde_json::to_vec(value)?;
        if let Some(version) = value.record_version() {
            self.store
                .set(&self.version_path(&id, version), data.clone(), None)
                .await?;
        }
        match expected {
            Some(v) => self.store.set(&self.node_path(&id), data, Some(v)).await,
            None => self.store.create(&self.node_path(&id), data).await,
        }
    }

    /// Delete the current record. Retained versions stay until
    /// [`Repository::delete_version`] removes them.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        match self.store.delete(&self.node_path(id), None).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_version(
        &self,
        id: &str,
        version: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.store.delete(&self.version_path(id, version), None).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All ids with a current record, unescaped back to path form.
    pub async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let names = match self.store.children(&self.category_path()).await {
            Ok(names) => names,
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(names.iter().map(|n| unescape_id(n)).collect())
    }

    /// All current records.
    pub async fn all(&self) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for id in self.ids().await? {
            if let Some(value) = self.get(&id).await? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Retained versions of `id`, ascending.
    pub async fn versions(&self, id: &str) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let names = match self.store.children(&self.version_dir(id)).await {
            Ok(names) => names,
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut versions: Vec<DateTime<Utc>> =
            names.iter().filter_map(|n| parse_version_key(n)).collect();
        versions.sort();
        Ok(versions)
    }
}

// ---------------------------------------------------------------------------
// Storage version
// ---------------------------------------------------------------------------

/// The on-disk format version, a single counter bumped by migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct StorageVersion {
    pub current: u32,
}

impl Record for StorageVersion {
    const CATEGORY: &'static str = "storage-version";

    fn record_id(&self) -> String {
        "version".to_string()
    }
}

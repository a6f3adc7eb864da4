//! In-memory coordination store.
//!
//! Backs every test and the embedded single-node deployment mode. Implements
//! the full [`CoordinationStore`] contract including ephemeral sequential
//! nodes and session expiry, plus fault hooks (`set_unavailable`,
//! `expire_session`) so failure paths can be exercised deterministically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::kv::{
    CoordinationStore, NodeVersion, SessionState, StoreError, StoreEvent, StoreEventKind,
    VersionedNode,
};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: NodeVersion,
    ephemeral: bool,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    sequence: u64,
    unavailable: bool,
}

/// An in-process [`CoordinationStore`].
///
/// Cloning shares the underlying tree, so one instance can serve several
/// components the way a shared client connection would.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    events_tx: broadcast::Sender<StoreEvent>,
    session_tx: Arc<watch::Sender<SessionState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        let (session_tx, _) = watch::channel(SessionState::Connected);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events_tx,
            session_tx: Arc::new(session_tx),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    /// until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Expire the session: drop every ephemeral node and flip the session
    /// signal to [`SessionState::Expired`].
    pub fn expire_session(&self) {
        let removed: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let paths: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.ephemeral)
                .map(|(p, _)| p.clone())
                .collect();
            for p in &paths {
                state.nodes.remove(p);
            }
            paths
        };
        for path in removed {
            let _ = self.events_tx.send(StoreEvent {
                path,
                kind: StoreEventKind::Deleted,
            });
        }
        let _ = self.session_tx.send(SessionState::Expired);
    }

    /// Flip the session signal without dropping ephemerals (a transport
    /// blip, not an expiry).
    pub fn disconnect(&self) {
        let _ = self.session_tx.send(SessionState::Disconnected);
    }

    pub fn reconnect(&self) {
        let _ = self.session_tx.send(SessionState::Connected);
    }

    fn check_available(state: &State) -> Result<(), StoreError> {
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store set unavailable".into()));
        }
        Ok(())
    }

    fn emit(&self, path: &str, kind: StoreEventKind) {
        let _ = self.events_tx.send(StoreEvent {
            path: path.to_string(),
            kind,
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<VersionedNode>, StoreError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state.nodes.get(path).map(|n| VersionedNode {
            data: n.data.clone(),
            version: n.version,
        }))
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<NodeVersion, StoreError> {
        {
            let mut state = self.state.lock().unwrap();
            Self::check_available(&state)?;
            if state.nodes.contains_key(path) {
                return Err(StoreError::AlreadyExists(path.to_string()));
            }
            state.nodes.insert(
                path.to_string(),
                Node {
                    data,
                    version: 0,
                    ephemeral: false,
                },
            );
        }
        self.emit(path, StoreEventKind::Created);
        Ok(0)
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<NodeVersion>,
    ) -> Result<NodeVersion, StoreError> {
        let (version, kind) = {
            let mut state = self.state.lock().unwrap();
            Self::check_available(&state)?;
            match state.nodes.get_mut(path) {
                Some(node) => {
                    if let Some(expected) = expected {
                        if node.version != expected {
                            return Err(StoreError::Conflict {
                                path: path.to_string(),
                                expected,
                                actual: node.version,
                            });
                        }
                    }
                    node.data = data;
                    node.version += 1;
                    (node.version, StoreEventKind::Updated)
                }
                None => {
                    if let Some(expected) = expected {
                        return Err(StoreError::Conflict {
                            path: path.to_string(),
                            expected,
                            actual: 0,
                        });
                    }
                    state.nodes.insert(
                        path.to_string(),
                        Node {
                            data,
                            version: 0,
                            ephemeral: false,
                        },
                    );
                    (0, StoreEventKind::Created)
                }
            }
        };
        self.emit(path, kind);
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Option<NodeVersion>) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().unwrap();
            Self::check_available(&state)?;
            match state.nodes.get(path) {
                None => return Err(StoreError::NotFound(path.to_string())),
                Some(node) => {
                    if let Some(expected) = expected {
                        if node.version != expected {
                            return Err(StoreError::Conflict {
                                path: path.to_string(),
                                expected,
                                actual: node.version,
                            });
                        }
                    }
                }
            }
            state.nodes.remove(path);
        }
        self.emit(path, StoreEventKind::Deleted);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names: Vec<String> = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                // Direct children only.
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: Vec<u8>,
    ) -> Result<String, StoreError> {
        let path = {
            let mut state = self.state.lock().unwrap();
            Self::check_available(&state)?;
            let seq = state.sequence;
            state.sequence += 1;
            let path = format!("{prefix}{seq:010}");
            state.nodes.insert(
                path.clone(),
                Node {
                    data,
                    version: 0,
                    ephemeral: true,
                },
            );
            path
        };
        self.emit(&path, StoreEventKind::Created);
        Ok(path)
    }

    fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let store = MemoryStore::new();
        let v = store.create("/a/b", b"one".to_vec()).await.unwrap();
        assert_eq!(v, 0);
        let node = store.get("/a/b").await.unwrap().unwrap();
        assert_eq!(node.data, b"one");
        assert_eq!(node.version, 0);
    }

    #[tokio::test]
    async fn create_refuses_existing_node() {
        let store = MemoryStore::new();
        store.create("/a", b"x".to_vec()).await.unwrap();
        let err = store.create("/a", b"y".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn cas_set_conflicts_on_moved_version() {
        let store = MemoryStore::new();
        store.create("/k", b"v0".to_vec()).await.unwrap();
        let v1 = store.set("/k", b"v1".to_vec(), Some(0)).await.unwrap();
        assert_eq!(v1, 1);

        let err = store.set("/k", b"v2".to_vec(), Some(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: 1, .. }));
    }

    #[tokio::test]
    async fn cas_set_on_missing_node_conflicts() {
        let store = MemoryStore::new();
        let err = store.set("/nope", b"v".to_vec(), Some(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete("/nope", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn children_lists_direct_level_only() {
        let store = MemoryStore::new();
        store.create("/apps/web", b"".to_vec()).await.unwrap();
        store.create("/apps/db", b"".to_vec()).await.unwrap();
        store.create("/apps/web/v1", b"".to_vec()).await.unwrap();
        store.create("/other", b"".to_vec()).await.unwrap();

        let names = store.children("/apps").await.unwrap();
        assert_eq!(names, vec!["db".to_string(), "web".to_string()]);
    }

    #[tokio::test]
    async fn ephemeral_sequential_orders_and_expires() {
        let store = MemoryStore::new();
        let a = store
            .create_ephemeral_sequential("/election/member_", b"a".to_vec())
            .await
            .unwrap();
        let b = store
            .create_ephemeral_sequential("/election/member_", b"b".to_vec())
            .await
            .unwrap();
        assert!(a < b, "sequence numbers must order: {a} vs {b}");

        let names = store.children("/election").await.unwrap();
        assert_eq!(names.len(), 2);

        store.expire_session();
        let names = store.children("/election").await.unwrap();
        assert!(names.is_empty(), "ephemerals must vanish on expiry");
        assert_eq!(*store.session().borrow(), SessionState::Expired);
    }

    #[tokio::test]
    async fn unavailable_mode_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("/x").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn change_feed_reports_writes_and_deletes() {
        let store = MemoryStore::new();
        let mut events = store.events();

        store.create("/a", b"1".to_vec()).await.unwrap();
        store.set("/a", b"2".to_vec(), None).await.unwrap();
        store.delete("/a", None).await.unwrap();

        let e1 = events.recv().await.unwrap();
        assert_eq!((e1.path.as_str(), e1.kind), ("/a", StoreEventKind::Created));
        let e2 = events.recv().await.unwrap();
        assert_eq!(e2.kind, StoreEventKind::Updated);
        let e3 = events.recv().await.unwrap();
        assert_eq!(e3.kind, StoreEventKind::Deleted);
    }
}

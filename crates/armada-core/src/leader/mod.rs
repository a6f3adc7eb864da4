//! Leader election over the coordination store.
//!
//! Candidates register ephemeral sequential nodes under a well-known path;
//! the lowest sequence number leads. Everyone watches the change feed and
//! re-evaluates when an election node disappears. Losing the session means
//! our node is gone and someone else may already lead: the only safe move
//! is to stand down and terminate rather than keep writing on a stale
//! belief.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use armada_store::{CoordinationStore, SessionState, StoreError};

use crate::events::{Event, EventBus};

/// Election states, in the order a candidate passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    /// Registered, waiting for the election outcome.
    Offered,
    Leading,
    NotLeading,
}

/// Why the process is shutting down; the binary adapter maps this to an
/// exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Clean,
    /// The coordination session was lost; leadership belief is stale.
    CoordinationLost,
    /// Graceful shutdown overran its allowance.
    GracefulTimeout,
}

impl ShutdownReason {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::CoordinationLost => 9,
            Self::GracefulTimeout => 137,
        }
    }
}

/// Handles returned by [`spawn_election`].
pub struct ElectionHandle {
    pub leadership: watch::Receiver<Leadership>,
    /// Fires once with the reason when the candidate must die.
    pub shutdown: watch::Receiver<Option<ShutdownReason>>,
    pub cancel: CancellationToken,
}

const ELECTION_DIR: &str = "election";
const MEMBER_PREFIX: &str = "member_";

fn election_dir(root: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), ELECTION_DIR)
}

/// Register as a candidate and watch the election until cancelled.
///
/// `node_info` identifies this process (host:port) so non-leaders can
/// surface the current leader's address for proxying.
pub fn spawn_election(
    store: Arc<dyn CoordinationStore>,
    root: &str,
    node_info: String,
    bus: EventBus,
) -> ElectionHandle {
    let (leadership_tx, leadership_rx) = watch::channel(Leadership::Offered);
    let (shutdown_tx, shutdown_rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let dir = election_dir(root);

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_election(
            store,
            dir,
            node_info,
            bus,
            leadership_tx,
            &shutdown_tx,
            task_cancel,
        )
        .await
        {
            tracing::error!(error = %e, "election loop failed; standing down");
            let _ = shutdown_tx.send(Some(ShutdownReason::CoordinationLost));
        }
    });

    ElectionHandle {
        leadership: leadership_rx,
        shutdown: shutdown_rx,
        cancel,
    }
}

async fn run_election(
    store: Arc<dyn CoordinationStore>,
    dir: String,
    node_info: String,
    bus: EventBus,
    leadership_tx: watch::Sender<Leadership>,
    shutdown_tx: &watch::Sender<Option<ShutdownReason>>,
    cancel: CancellationToken,
) -> Result<(), StoreError> {
    let mut events = store.events();
    let mut session = store.session();

    let my_path = store
        .create_ephemeral_sequential(&format!("{dir}/{MEMBER_PREFIX}"), node_info.into_bytes())
        .await?;
    let my_name = my_path
        .rsplit('/')
        .next()
        .unwrap_or(my_path.as_str())
        .to_string();
    tracing::info!(candidate = %my_name, "registered for election");

    let mut current = Leadership::Offered;
    loop {
        let members = store.children(&dir).await?;
        let leading = members.first().map(String::as_str) == Some(my_name.as_str());
        let next = if leading {
            Leadership::Leading
        } else {
            Leadership::NotLeading
        };
        if next != current {
            match next {
                Leadership::Leading => tracing::info!("elected leader"),
                _ => tracing::info!(
                    leader = members.first().map(String::as_str).unwrap_or("<none>"),
                    "standing by as non-leader"
                ),
            }
            bus.publish(Event::LeadershipChanged {
                leader: next == Leadership::Leading,
            });
            current = next;
            let _ = leadership_tx.send(current);
        }

        // Wait for something that can change the outcome.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = leadership_tx.send(Leadership::NotLeading);
                    return Ok(());
                }
                changed = session.changed() => {
                    if changed.is_err() {
                        return Err(StoreError::SessionExpired);
                    }
                    match *session.borrow() {
                        SessionState::Expired => {
                            tracing::error!("coordination session expired; terminating");
                            if current == Leadership::Leading {
                                bus.publish(Event::LeadershipChanged { leader: false });
                            }
                            let _ = leadership_tx.send(Leadership::NotLeading);
                            let _ = shutdown_tx.send(Some(ShutdownReason::CoordinationLost));
                            return Ok(());
                        }
                        SessionState::Disconnected => {
                            tracing::warn!("coordination session disconnected; holding state");
                            continue;
                        }
                        SessionState::Connected => continue,
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) if event.path.starts_with(&dir) => break,
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            return Err(StoreError::SessionExpired);
                        }
                    }
                }
            }
        }
    }
}

/// Read the current leader's registered node info, for write proxying.
pub async fn current_leader_info(
    store: &Arc<dyn CoordinationStore>,
    root: &str,
) -> Result<Option<String>, StoreError> {
    let dir = election_dir(root);
    let members = match store.children(&dir).await {
        Ok(m) => m,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let Some(first) = members.first() else {
        return Ok(None);
    };
    match store.get(&format!("{dir}/{first}")).await? {
        Some(node) => Ok(Some(String::from_utf8_lossy(&node.data).into_owned())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_store::MemoryStore;
    use std::time::Duration;

    const ROOT: &str = "/armada";

    async fn wait_for(rx: &mut watch::Receiver<Leadership>, want: Leadership) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if *rx.borrow() == want {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
    }

    #[tokio::test]
    async fn first_candidate_becomes_leader() {
        let store = MemoryStore::new();
        let bus = EventBus::new();
        let sub = bus.subscribe("test", 16);
        let mut handle = spawn_election(Arc::new(store), ROOT, "node-a:8080".into(), bus);

        wait_for(&mut handle.leadership, Leadership::Leading).await;
        assert_eq!(
            sub.recv().await,
            Some(Event::LeadershipChanged { leader: true })
        );
        handle.cancel.cancel();
    }

    #[tokio::test]
    async fn second_candidate_stands_by_and_takes_over() {
        let store = MemoryStore::new();
        let arc: Arc<dyn CoordinationStore> = Arc::new(store.clone());
        let bus = EventBus::new();

        let mut first = spawn_election(Arc::clone(&arc), ROOT, "node-a:8080".into(), bus.clone());
        wait_for(&mut first.leadership, Leadership::Leading).await;

        let mut second = spawn_election(Arc::clone(&arc), ROOT, "node-b:8080".into(), bus.clone());
        wait_for(&mut second.leadership, Leadership::NotLeading).await;

        // Non-leaders can resolve the leader's address.
        let info = current_leader_info(&arc, ROOT).await.unwrap();
        assert_eq!(info.as_deref(), Some("node-a:8080"));

        // The leader's node disappears (process died); the second takes over.
        let members = arc.children(&format!("{ROOT}/election")).await.unwrap();
        arc.delete(&format!("{ROOT}/election/{}", members[0]), None)
            .await
            .unwrap();
        wait_for(&mut second.leadership, Leadership::Leading).await;

        first.cancel.cancel();
        second.cancel.cancel();
    }

    #[tokio::test]
    async fn session_expiry_triggers_shutdown() {
        let store = MemoryStore::new();
        let bus = EventBus::new();
        let mut handle =
            spawn_election(Arc::new(store.clone()), ROOT, "node-a:8080".into(), bus);
        wait_for(&mut handle.leadership, Leadership::Leading).await;

        store.expire_session();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if handle.shutdown.borrow().is_some() {
                    return;
                }
                handle.shutdown.changed().await.unwrap();
            }
        })
        .await
        .expect("shutdown signal");
        assert_eq!(
            *handle.shutdown.borrow(),
            Some(ShutdownReason::CoordinationLost)
        );
        assert_eq!(*handle.leadership.borrow(), Leadership::NotLeading);
        assert_eq!(ShutdownReason::CoordinationLost.exit_code(), 9);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ShutdownReason::Clean.exit_code(), 0);
        assert_eq!(ShutdownReason::CoordinationLost.exit_code(), 9);
        assert_eq!(ShutdownReason::GracefulTimeout.exit_code(), 137);
    }
}

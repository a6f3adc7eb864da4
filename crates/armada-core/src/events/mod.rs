//! Internal event types and the in-process event bus.
//!
//! Every observable change (instance conditions, health flips, deployment
//! progress, leadership) is published here and fanned out to subscribers,
//! each with its own bounded queue. Overflow drops the oldest entry with a
//! warning; a closed subscriber is dropped from the fan-out. Delivery is
//! FIFO per subscriber with no cross-subscriber ordering.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::instance::{Condition, Goal, InstanceId, TaskId};
use crate::spec::path::PathId;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    LeadershipChanged {
        leader: bool,
    },
    /// The instance's condition (or goal, or placement) changed.
    InstanceChanged {
        id: InstanceId,
        run_spec_id: PathId,
        run_spec_version: DateTime<Utc>,
        condition: Condition,
        goal: Goal,
    },
    /// The aggregate health flag flipped.
    InstanceHealthChanged {
        id: InstanceId,
        run_spec_id: PathId,
        healthy: Option<bool>,
    },
    /// A terminal status arrived for a task no instance owns.
    UnknownTaskTerminated {
        task_id: TaskId,
    },
    DeploymentStarted {
        plan_id: Uuid,
    },
    DeploymentStepSuccess {
        plan_id: Uuid,
        step: usize,
    },
    DeploymentStepFailure {
        plan_id: Uuid,
        step: usize,
        run_spec_id: PathId,
        reason: String,
    },
    DeploymentFinished {
        plan_id: Uuid,
    },
    DeploymentCanceled {
        plan_id: Uuid,
        rolled_back: bool,
    },
    GroupChanged {
        group_id: PathId,
        version: DateTime<Utc>,
    },
    EventSubscriberAdded {
        callback_url: String,
    },
    EventSubscriberRemoved {
        callback_url: String,
    },
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct SubscriberQueue {
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: Mutex<bool>,
}

/// Receiving half of a subscription.
pub struct EventSubscription {
    inner: Arc<SubscriberQueue>,
}

impl EventSubscription {
    /// Next event, in publication order. `None` after [`EventSubscription::close`].
    pub async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if *self.inner.closed.lock().unwrap() {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking variant.
    pub fn try_recv(&self) -> Option<Event> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    pub fn close(&self) {
        *self.inner.closed.lock().unwrap() = true;
        self.inner.notify.notify_waiters();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// The process-wide fan-out. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubscriberQueue>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with its own bounded queue.
    pub fn subscribe(&self, name: &str, capacity: usize) -> EventSubscription {
        let inner = Arc::new(SubscriberQueue {
            name: name.to_string(),
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: Mutex::new(false),
        });
        self.subscribers.lock().unwrap().push(Arc::clone(&inner));
        EventSubscription { inner }
    }

    /// Publish to every live subscriber. On a full queue the oldest entry is
    /// dropped so slow consumers lag instead of blocking the publisher.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| {
            if *sub.closed.lock().unwrap() {
                tracing::debug!(subscriber = %sub.name, "removing closed event subscriber");
                return false;
            }
            let mut queue = sub.queue.lock().unwrap();
            if queue.len() >= sub.capacity {
                queue.pop_front();
                tracing::warn!(
                    subscriber = %sub.name,
                    capacity = sub.capacity,
                    "event queue full, dropping oldest event"
                );
            }
            queue.push_back(event.clone());
            sub.notify.notify_one();
            true
        });
    }

    pub fn publish_all<I: IntoIterator<Item = Event>>(&self, events: I) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

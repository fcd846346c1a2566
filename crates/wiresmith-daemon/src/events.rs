// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Change notification fan-out.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a
//! subscriber whose queue is full is dropped from the bus and its
//! [`Subscription`] reports [`RecvError::Evicted`] once drained. Sequence
//! numbers are assigned under the same lock that enqueues, so every
//! subscriber observes events in publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;
use wiresmith_types::{ChangeAction, ChangeEvent, Entity, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("subscriber fell behind and was disconnected")]
    Evicted,

    #[error("event bus closed")]
    Closed,
}

/// Which events a subscriber wants. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kind: Option<EntityKind>,
    pub entity_id: Option<Uuid>,
}

impl EventFilter {
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            entity_id: None,
        }
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        self.kind.is_none_or(|k| k == event.kind())
            && self.entity_id.is_none_or(|id| id == event.entity_id())
    }
}

struct Subscriber {
    tx: mpsc::Sender<ChangeEvent>,
    filter: EventFilter,
    evicted: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    sequence: u64,
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

pub struct EventBus {
    inner: Mutex<Inner>,
    capacity: usize,
}

pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ChangeEvent>,
    evicted: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event. Events queued before an eviction are still delivered.
    pub async fn recv(&mut self) -> Result<ChangeEvent, RecvError> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None if self.evicted.load(Ordering::Acquire) => Err(RecvError::Evicted),
            None => Err(RecvError::Closed),
        }
    }

    /// Non-blocking variant of [`Subscription::recv`]; `Ok(None)` when the
    /// queue is momentarily empty.
    pub fn try_recv(&mut self) -> Result<Option<ChangeEvent>, RecvError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                if self.evicted.load(Ordering::Acquire) {
                    Err(RecvError::Evicted)
                } else {
                    Err(RecvError::Closed)
                }
            }
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Publishing only touches plain data, a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let evicted = Arc::new(AtomicBool::new(false));
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                filter,
                evicted: evicted.clone(),
            },
        );
        debug!(subscriber = id, "subscriber attached");
        Subscription { id, rx, evicted }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "subscriber detached");
        }
    }

    /// Publish a change and return its sequence number.
    pub fn publish(&self, action: ChangeAction, entity: Entity, actor: Option<Uuid>) -> u64 {
        let mut inner = self.lock();
        inner.sequence += 1;
        let event = ChangeEvent {
            sequence: inner.sequence,
            action,
            entity,
            actor,
            at: Utc::now(),
        };

        let mut dropped = Vec::new();
        for (id, sub) in &inner.subscribers {
            if !sub.filter.matches(&event) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "subscriber queue full, disconnecting");
                    sub.evicted.store(true, Ordering::Release);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            inner.subscribers.remove(&id);
        }

        debug!(
            sequence = event.sequence,
            action = ?event.action,
            kind = ?event.kind(),
            id = %event.entity_id(),
            "published event"
        );
        event.sequence
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Whether any live subscriber would receive events of `kind`.
    pub fn has_subscribers(&self, kind: EntityKind) -> bool {
        self.lock()
            .subscribers
            .values()
            .any(|s| !s.tx.is_closed() && s.filter.kind.is_none_or(|k| k == kind))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wiresmith_types::User;

    use super::*;

    fn user(email: &str) -> Entity {
        let now = Utc::now();
        Entity::User(User {
            id: Uuid::new_v4(),
            email: email.into(),
            password_hash: String::new(),
            created_at: now,
            updated_at: now,
        })
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(EventFilter::default());
        for i in 0..5 {
            bus.publish(ChangeAction::Created, user(&format!("u{i}@example.com")), None);
        }
        let mut last = 0;
        for _ in 0..5 {
            let event = sub.recv().await.unwrap();
            assert!(event.sequence > last);
            last = event.sequence;
        }
    }

    #[tokio::test]
    async fn events_before_subscribing_are_not_replayed() {
        let bus = EventBus::new(4);
        bus.publish(ChangeAction::Created, user("early@example.com"), None);
        let mut sub = bus.subscribe(EventFilter::default());
        assert!(sub.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn full_queue_evicts_only_that_subscriber() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe(EventFilter::default());
        let mut fast = bus.subscribe(EventFilter::default());

        for i in 0..3 {
            bus.publish(ChangeAction::Updated, user(&format!("{i}@example.com")), None);
            fast.recv().await.unwrap();
        }
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(ChangeAction::Updated, user("after@example.com"), None);
        assert!(fast.recv().await.is_ok());

        assert!(slow.recv().await.is_ok());
        assert!(slow.recv().await.is_ok());
        assert_eq!(slow.recv().await, Err(RecvError::Evicted));
    }

    #[tokio::test]
    async fn filters_by_kind_and_id() {
        let bus = EventBus::new(8);
        let target = user("target@example.com");
        let target_id = target.id();
        let mut by_id = bus.subscribe(EventFilter {
            kind: None,
            entity_id: Some(target_id),
        });
        let mut servers = bus.subscribe(EventFilter::kind(EntityKind::Server));

        bus.publish(ChangeAction::Created, user("other@example.com"), None);
        bus.publish(ChangeAction::Created, target, None);

        assert_eq!(by_id.recv().await.unwrap().entity_id(), target_id);
        assert!(by_id.try_recv().unwrap().is_none());
        assert!(servers.try_recv().unwrap().is_none());
        assert!(bus.has_subscribers(EntityKind::Server));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe(EventFilter::default());
        drop(sub);
        assert!(!bus.has_subscribers(EntityKind::User));
        bus.publish(ChangeAction::Deleted, user("gone@example.com"), None);
        assert_eq!(bus.subscriber_count(), 0);
    }
}

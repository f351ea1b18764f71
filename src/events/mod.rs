use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::models::{AliasId, DomainId, EmailId, UserId};

pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Closed set of event types carried over the stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Connected,
    Heartbeat,
    NewEmail {
        email_id: EmailId,
        alias_id: AliasId,
        alias_address: String,
        sender_addr: String,
        subject: Option<String>,
        preview: Option<String>,
        has_attachments: bool,
    },
    EmailDeleted {
        email_id: EmailId,
    },
    AliasCreated {
        alias_id: AliasId,
        full_address: String,
    },
    AliasDeleted {
        alias_id: AliasId,
    },
    DomainVerified {
        domain_id: DomainId,
        name: String,
    },
    DomainDeleted {
        domain_id: DomainId,
        name: String,
    },
    ConnectionLimit,
    Error {
        message: String,
    },
}

impl EventPayload {
    /// The wire name used in the `event:` field of the stream.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Connected => "connected",
            EventPayload::Heartbeat => "heartbeat",
            EventPayload::NewEmail { .. } => "new_email",
            EventPayload::EmailDeleted { .. } => "email_deleted",
            EventPayload::AliasCreated { .. } => "alias_created",
            EventPayload::AliasDeleted { .. } => "alias_deleted",
            EventPayload::DomainVerified { .. } => "domain_verified",
            EventPayload::DomainDeleted { .. } => "domain_deleted",
            EventPayload::ConnectionLimit => "connection_limit",
            EventPayload::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub tenant: String,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn new(tenant: String, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Tenant key for a user. Events are keyed by the owning user.
pub fn tenant_for(user: UserId) -> String {
    user.to_string()
}

/// Bounded ring of recent events with two secondary indices: event id to
/// ring sequence, and tenant to the ordered sequences of its events.
/// Realizes the replay contract: `get_since` with an unknown id means the
/// caller fell off the ring and must resync from scratch.
struct Ring {
    capacity: usize,
    next_seq: u64,
    events: VecDeque<(u64, Arc<Event>)>,
    by_id: HashMap<String, u64>,
    by_tenant: HashMap<String, VecDeque<u64>>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            events: VecDeque::new(),
            by_id: HashMap::new(),
            by_tenant: HashMap::new(),
        }
    }

    fn push(&mut self, event: Arc<Event>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_id.insert(event.id.clone(), seq);
        self.by_tenant
            .entry(event.tenant.clone())
            .or_default()
            .push_back(seq);
        self.events.push_back((seq, event));

        while self.events.len() > self.capacity {
            let Some((_, evicted)) = self.events.pop_front() else {
                break;
            };
            self.by_id.remove(&evicted.id);
            if let Some(seqs) = self.by_tenant.get_mut(&evicted.tenant) {
                seqs.pop_front();
                if seqs.is_empty() {
                    self.by_tenant.remove(&evicted.tenant);
                }
            }
        }
    }

    fn get_since(&self, tenant: &str, since_id: &str, limit: usize) -> Vec<Arc<Event>> {
        let Some(seqs) = self.by_tenant.get(tenant) else {
            return Vec::new();
        };

        // An empty id asks for the whole retained window; an unknown id
        // was evicted (or never existed) and yields nothing, which the
        // caller must treat as "resync from scratch".
        let floor = if since_id.is_empty() {
            None
        } else {
            match self.by_id.get(since_id) {
                Some(&seq) => Some(seq),
                None => return Vec::new(),
            }
        };

        let start = self.events.front().map(|(seq, _)| *seq).unwrap_or(0);

        seqs.iter()
            .filter(|&&seq| floor.is_none_or(|f| seq > f))
            .take(limit)
            .filter_map(|&seq| {
                self.events
                    .get((seq - start) as usize)
                    .map(|(_, event)| event.clone())
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

type Subscriber = mpsc::UnboundedSender<Arc<Event>>;

type SubscriberMap = Arc<RwLock<HashMap<String, HashMap<u64, Subscriber>>>>;

/// In-process pub/sub with bounded per-tenant replay.
///
/// Publish snapshots the subscriber set under the read lock and delivers
/// outside it; the ring has its own mutex so readers of the subscriber
/// map never contend with replay.
pub struct EventBus {
    ring: Mutex<Ring>,
    subscribers: SubscriberMap,
    next_subscription: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("events must be published to a tenant")]
    EmptyTenant,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::new(capacity)),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscription: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, tenant: &str, payload: EventPayload) -> Result<Arc<Event>, PublishError> {
        if tenant.is_empty() {
            return Err(PublishError::EmptyTenant);
        }

        let event = Arc::new(Event::new(tenant.to_string(), payload));

        self.ring
            .lock()
            .expect("event ring poisoned")
            .push(event.clone());

        let snapshot: Vec<Subscriber> = {
            let subscribers = self.subscribers.read().expect("subscriber map poisoned");
            subscribers
                .get(tenant)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default()
        };

        trace!(
            tenant,
            event = event.payload.kind(),
            subscribers = snapshot.len(),
            "publishing event"
        );

        for subscriber in snapshot {
            if subscriber.send(event.clone()).is_err() {
                // Receiver went away between snapshot and send; its
                // subscription guard will clean the map entry up.
                warn!(tenant, "dropping event for closed subscriber");
            }
        }

        Ok(event)
    }

    /// Replays retained events for a tenant after `since_id`, oldest
    /// first. An empty `since_id` returns the whole retained window.
    pub fn get_since(&self, tenant: &str, since_id: &str, limit: usize) -> Vec<Arc<Event>> {
        self.ring
            .lock()
            .expect("event ring poisoned")
            .get_since(tenant, since_id, limit)
    }

    pub fn ring_len(&self) -> usize {
        self.ring.lock().expect("event ring poisoned").len()
    }

    pub fn subscribe(&self, tenant: &str) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::unbounded_channel();

        self.subscribers
            .write()
            .expect("subscriber map poisoned")
            .entry(tenant.to_string())
            .or_default()
            .insert(id, tx);

        Subscription {
            subscribers: self.subscribers.clone(),
            tenant: tenant.to_string(),
            id,
            receiver: rx,
            active: true,
        }
    }
}

fn remove_subscriber(subscribers: &SubscriberMap, tenant: &str, id: u64) {
    let mut subscribers = subscribers.write().expect("subscriber map poisoned");
    if let Some(subs) = subscribers.get_mut(tenant) {
        subs.remove(&id);
        if subs.is_empty() {
            subscribers.remove(tenant);
        }
    }
}

/// A live subscription. Unsubscribing is idempotent and also happens on
/// drop, so cancelled streams release their slot synchronously.
pub struct Subscription {
    subscribers: SubscriberMap,
    tenant: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Arc<Event>>,
    active: bool,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(&mut self) {
        if self.active {
            self.active = false;
            remove_subscriber(&self.subscribers, &self.tenant, self.id);
            self.receiver.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bus(capacity: usize) -> Arc<EventBus> {
        Arc::new(EventBus::new(capacity))
    }

    fn error_event(n: usize) -> EventPayload {
        EventPayload::Error {
            message: format!("event {n}"),
        }
    }

    #[test]
    fn rejects_empty_tenant() {
        let bus = bus(10);
        assert!(matches!(
            bus.publish("", EventPayload::Heartbeat),
            Err(PublishError::EmptyTenant)
        ));
    }

    #[test]
    fn replays_in_order_after_since_id() {
        let bus = bus(100);

        let events: Vec<_> = (0..5)
            .map(|n| bus.publish("t1", error_event(n)).unwrap())
            .collect();

        let replay = bus.get_since("t1", &events[2].id, usize::MAX);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].id, events[3].id);
        assert_eq!(replay[1].id, events[4].id);
    }

    #[test]
    fn empty_since_id_returns_whole_window() {
        let bus = bus(100);
        for n in 0..5 {
            bus.publish("t1", error_event(n)).unwrap();
        }

        let replay = bus.get_since("t1", "", usize::MAX);
        assert_eq!(replay.len(), 5);
    }

    #[test]
    fn unknown_since_id_means_resync() {
        let bus = bus(100);
        bus.publish("t1", error_event(0)).unwrap();

        assert!(bus.get_since("t1", "no-such-id", usize::MAX).is_empty());
    }

    #[test]
    fn ring_never_exceeds_capacity_and_keeps_latest() {
        let bus = bus(10);

        let mut ids = Vec::new();
        for n in 0..25 {
            ids.push(bus.publish("t1", error_event(n)).unwrap().id.clone());
        }

        assert_eq!(bus.ring_len(), 10);

        let replay = bus.get_since("t1", "", 10);
        assert_eq!(replay.len(), 10);
        assert_eq!(replay.last().unwrap().id, ids[24]);
        assert_eq!(replay.first().unwrap().id, ids[15]);

        // evicted ids are unknown now
        assert!(bus.get_since("t1", &ids[3], usize::MAX).is_empty());
    }

    #[test]
    fn tenants_are_isolated() {
        let bus = bus(100);
        bus.publish("t1", error_event(1)).unwrap();
        bus.publish("t2", error_event(2)).unwrap();

        let t1 = bus.get_since("t1", "", usize::MAX);
        assert_eq!(t1.len(), 1);
        assert!(t1.iter().all(|e| e.tenant == "t1"));
    }

    #[tokio::test]
    async fn subscriber_receives_only_its_tenant() {
        let bus = bus(100);
        let mut sub = bus.subscribe("t1");

        bus.publish("t2", error_event(1)).unwrap();
        let published = bus.publish("t1", error_event(2)).unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, published.id);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = bus(100);
        let mut sub = bus.subscribe("t1");

        sub.unsubscribe();
        sub.unsubscribe();

        bus.publish("t1", error_event(1)).unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = bus(100);
        let mut a = bus.subscribe("t1");
        let mut b = bus.subscribe("t1");

        let published = bus.publish("t1", error_event(1)).unwrap();

        assert_eq!(a.recv().await.unwrap().id, published.id);
        assert_eq!(b.recv().await.unwrap().id, published.id);
    }
}

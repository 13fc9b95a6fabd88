//! Fan-out of server events to every subscribed connection.
//!
//! Each subscriber owns a bounded mpsc queue. `publish` copies the current
//! subscriber list, releases the lock, then `try_send`s to each queue, so a
//! stalled connection can never hold up the others. A subscriber whose queue
//! is full gets evicted: its sender is dropped, the receiver drains whatever
//! was already queued and then reports end-of-stream. Evicted ids are handed
//! back to the publisher and signalled on the subscription's `Eviction`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use crate::error::ChatError;
use crate::messages::ServerEvent;
use crate::presence::ConnectionId;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<Arc<ServerEvent>>,
    evicted: Arc<Notify>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    /// Connections removed because their queue was full or closed.
    pub evicted: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub published: u64,
    pub dropped: u64,
    pub active: usize,
}

struct HubInner {
    subscribers: RwLock<HashMap<ConnectionId, Outbound>>,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl HubInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Outbound>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Outbound>> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        BroadcastHub {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a connection for delivery. The returned handle unsubscribes on drop.
    pub fn subscribe(&self, connection_id: ConnectionId) -> Result<Subscription, ChatError> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let evicted = Arc::new(Notify::new());
        let mut subscribers = self.inner.write();
        if subscribers.contains_key(&connection_id) {
            return Err(ChatError::DuplicateConnection(connection_id));
        }
        subscribers.insert(
            connection_id,
            Outbound {
                tx,
                evicted: Arc::clone(&evicted),
            },
        );

        Ok(Subscription {
            connection_id,
            receiver: rx,
            evicted,
            hub: Arc::downgrade(&self.inner),
        })
    }

    pub fn unsubscribe(&self, connection_id: &ConnectionId) -> bool {
        self.inner.write().remove(connection_id).is_some()
    }

    /// Queues `event` for every connection subscribed right now. Connections
    /// that could not take it are evicted and listed in the result.
    pub fn publish(&self, event: ServerEvent) -> Delivery {
        let event = Arc::new(event);
        let targets: Vec<(ConnectionId, Outbound)> = self
            .inner
            .read()
            .iter()
            .map(|(id, outbound)| (*id, outbound.clone()))
            .collect();

        let mut delivery = Delivery::default();
        for (id, outbound) in targets {
            if self.offer(&id, &outbound, Arc::clone(&event)) {
                delivery.delivered += 1;
            } else {
                delivery.dropped += 1;
                delivery.evicted.push(id);
            }
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.evict(&delivery.evicted);
        delivery
    }

    /// Queues `event` for a single connection. Returns false if it is gone or evicted.
    pub fn send_to(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        let Some(outbound) = self.inner.read().get(connection_id).cloned() else {
            return false;
        };

        if self.offer(connection_id, &outbound, Arc::new(event)) {
            true
        } else {
            self.evict(&[*connection_id]);
            false
        }
    }

    fn offer(&self, id: &ConnectionId, outbound: &Outbound, event: Arc<ServerEvent>) -> bool {
        match outbound.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full for {}, disconnecting slow consumer", id);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Connection {} went away mid-delivery", id);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn evict(&self, ids: &[ConnectionId]) {
        if ids.is_empty() {
            return;
        }
        let mut subscribers = self.inner.write();
        for id in ids {
            if let Some(outbound) = subscribers.remove(id) {
                outbound.evicted.notify_one();
            }
        }
    }

    pub fn is_subscribed(&self, connection_id: &ConnectionId) -> bool {
        self.inner.read().contains_key(connection_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            active: self.active_count(),
        }
    }
}

/// Receiving end of one connection's outbound queue.
pub struct Subscription {
    connection_id: ConnectionId,
    receiver: mpsc::Receiver<Arc<ServerEvent>>,
    evicted: Arc<Notify>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Next queued event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<ServerEvent>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ServerEvent>> {
        self.receiver.try_recv().ok()
    }

    /// Handle that fires if the hub evicts this connection. It outlives the
    /// subscription, so the reading side can hold it while a writer task
    /// owns the queue.
    pub fn eviction(&self) -> Eviction {
        Eviction(Arc::clone(&self.evicted))
    }
}

/// Signalled once when a connection is evicted. Plain unsubscribes never fire it.
#[derive(Clone)]
pub struct Eviction(Arc<Notify>);

impl Eviction {
    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.write().remove(&self.connection_id);
        }
    }
}

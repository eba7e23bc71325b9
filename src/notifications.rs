//! Typed publish/subscribe hub.
//!
//! Managers never hold pointers at each other; state changes flow through
//! this hub as typed events. Delivery is synchronous on the publisher's
//! task, so subscribers must be quick and may only post further work
//! onward. Subscriptions are RAII: dropping the handle unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::primitives::{Hash256, U256};

/// Everything the consensus and network layers announce.
#[derive(Debug, Clone)]
pub enum Event {
    NewTip {
        hash: Hash256,
        height: u64,
        work: U256,
    },
    Reorg {
        old_tip: Hash256,
        new_tip: Hash256,
        fork_height: u64,
    },
    BlockConnected {
        hash: Hash256,
        height: u64,
    },
    BlockDisconnected {
        hash: Hash256,
        height: u64,
    },
    PeerDisconnected {
        peer_id: u64,
    },
    InvalidHeader {
        peer_id: Option<u64>,
        hash: Hash256,
        reason: String,
    },
    LowWorkHeaders {
        peer_id: u64,
    },
    OversizedMessage {
        peer_id: u64,
    },
    SuspiciousReorg {
        depth: u64,
        allowed_max: u64,
    },
}

type Callback = Box<dyn Fn(&Event) + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    subscribers: Vec<(u64, Callback)>,
}

/// Process-wide notification hub.
pub struct NotificationHub {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Arc<Self> {
        Arc::new(NotificationHub {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a callback for every event. The returned handle keeps the
    /// registration alive; dropping it unsubscribes.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .write()
            .subscribers
            .push((id, Box::new(callback)));
        Subscription {
            hub: Arc::downgrade(self),
            id,
        }
    }

    pub fn publish(&self, event: Event) {
        let registry = self.registry.read();
        for (_, callback) in &registry.subscribers {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.read().subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.registry.write().subscribers.retain(|(sid, _)| *sid != id);
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        NotificationHub {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }
}

/// RAII subscription handle.
pub struct Subscription {
    hub: Weak<NotificationHub>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

//! Event fan-out to application listeners.
//!
//! Two delivery styles share one hub:
//! - handler callbacks registered with [`EventHub::subscribe`], removed by
//!   [`Subscription::unsubscribe`]
//! - unbounded channels handed out by [`EventHub::channel`]
//!
//! Handlers run on the client driver task, one at a time. A panicking
//! handler is caught and logged; the remaining handlers still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

// Handler isolation needs panics to unwind back into `emit`.
#[cfg(not(panic = "unwind"))]
compile_error!("logos-mesh isolates listener panics with catch_unwind and requires panic = \"unwind\"");

use tokio::sync::mpsc;

use crate::client::ConnectionStatus;
use crate::config::Topology;
use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::sync_core::Delta;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// Authoritative snapshot applied. Queued writes replay on entering
    /// ACTIVE.
    Synced,
    /// Remote writes changed these keys.
    RemoteChange {
        origin: Option<String>,
        deltas: Vec<Delta>,
    },
    PeerJoined(String),
    PeerLeft(String),
    /// Direct link usable.
    PeerConnected(String),
    PeerDisconnected {
        peer_id: String,
        reason: String,
    },
    TopologyChanged {
        from: Topology,
        to: Topology,
        reason: String,
    },
    Metrics(MeshMetrics),
    QueueSizeChanged(usize),
    QueueOverflow {
        dropped_key: String,
    },
    Ephemeral {
        from: Option<String>,
        payload: Vec<u8>,
    },
    SignalingState {
        connected: bool,
    },
    Error(MeshError),
}

type Handler = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
    channels: Vec<mpsc::UnboundedSender<MeshEvent>>,
}

/// Registered listeners. Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        let id = match self.inner.lock() {
            Ok(mut inner) => {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.handlers.push((id, Arc::new(handler)));
                id
            }
            Err(_) => 0,
        };
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn channel(&self) -> mpsc::UnboundedReceiver<MeshEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.channels.push(tx);
        }
        rx
    }

    /// Deliver to every listener. Closed channels are pruned.
    pub fn emit(&self, event: MeshEvent) {
        let handlers: Vec<Handler> = match self.inner.lock() {
            Ok(mut inner) => {
                inner.channels.retain(|tx| tx.send(event.clone()).is_ok());
                inner.handlers.iter().map(|(_, h)| h.clone()).collect()
            }
            Err(_) => return,
        };
        // Called without the lock so a handler may (un)subscribe.
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                log::error!("Event listener panicked while handling {event:?}");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .map(|i| i.handlers.len() + i.channels.len())
            .unwrap_or(0)
    }

    /// Drop every listener. Open channels see end-of-stream.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.handlers.clear();
            inner.channels.clear();
        }
    }
}

/// Handle returned by [`EventHub::subscribe`]. Dropping it keeps the
/// handler registered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    hub: std::sync::Weak<Mutex<HubInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.hub.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = hub.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hub.emit(MeshEvent::Synced);
        sub.unsubscribe();
        hub.emit(MeshEvent::Synced);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        hub.subscribe(|_| panic!("listener bug"));
        let c = count.clone();
        hub.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hub.emit(MeshEvent::Synced);
        hub.emit(MeshEvent::QueueSizeChanged(1));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_release_profile_keeps_unwinding() {
        assert!(cfg!(panic = "unwind"));
        let manifest = include_str!("../../Cargo.toml");
        let release = manifest
            .split("[profile.release]")
            .nth(1)
            .unwrap_or_default();
        assert!(!release.contains("panic = \"abort\""));
    }

    #[tokio::test]
    async fn test_channel_delivery_and_clear() {
        let hub = EventHub::new();
        let mut rx = hub.channel();
        hub.emit(MeshEvent::PeerJoined("p1".into()));
        assert_eq!(rx.recv().await, Some(MeshEvent::PeerJoined("p1".into())));
        hub.clear();
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_handler_may_subscribe_reentrantly() {
        let hub = EventHub::new();
        let inner_hub = hub.clone();
        hub.subscribe(move |_| {
            inner_hub.subscribe(|_| {});
        });
        hub.emit(MeshEvent::Synced);
        assert_eq!(hub.listener_count(), 2);
    }
}

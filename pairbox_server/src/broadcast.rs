//! Online / pairing count broadcasts.
//!
//! Publishing is a non-blocking offer into a single-slot buffer; bursts
//! coalesce because an offer made while the slot is full is dropped. The
//! fan-out task drains the slot and pushes an `update` to every endpoint.

use std::sync::Arc;

use pairbox_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pairing::PairingEngine;
use crate::state::Registry;

/// Aggregate counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Registered endpoints.
    pub online_count: usize,
    /// Endpoints currently matched.
    pub pairing_count: i64,
}

impl Snapshot {
    /// The `update` event carrying these counts.
    pub fn to_event(self) -> ServerEvent {
        ServerEvent::Update {
            online_num: self.online_count,
            pairing_num: self.pairing_count,
        }
    }
}

/// Receiving end of the pending-broadcast slot.
pub type BroadcastReceiver = mpsc::Receiver<Snapshot>;

/// Takes count snapshots and offers them for broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastCoordinator {
    registry: Arc<Registry>,
    pairing: Arc<PairingEngine>,
    pending: mpsc::Sender<Snapshot>,
}

impl BroadcastCoordinator {
    /// Create a coordinator and the receiver for its single-slot buffer.
    pub fn new(registry: Arc<Registry>, pairing: Arc<PairingEngine>) -> (Self, BroadcastReceiver) {
        let (pending, receiver) = mpsc::channel(1);
        let coordinator = Self {
            registry,
            pairing,
            pending,
        };
        (coordinator, receiver)
    }

    /// Current counts.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            online_count: self.registry.size(),
            pairing_count: self.pairing.pairing_count(),
        }
    }

    /// Offer the current counts for broadcast.
    ///
    /// Returns `false` when an earlier snapshot is still pending and this
    /// one was coalesced into it.
    pub fn publish(&self) -> bool {
        self.pending.try_send(self.snapshot()).is_ok()
    }

    /// Push `snapshot` as an `update` to every registered endpoint.
    ///
    /// Endpoints with a full queue skip this update. Returns how many
    /// endpoints it was queued for.
    pub fn deliver(&self, snapshot: Snapshot) -> usize {
        let json: Arc<str> = match serde_json::to_string(&snapshot.to_event()) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(error = %e, "failed to serialize update");
                return 0;
            }
        };
        let endpoints = self.registry.endpoints();
        let delivered = endpoints
            .iter()
            .filter(|ep| ep.push_update(Arc::clone(&json)))
            .count();
        if delivered < endpoints.len() {
            debug!(
                skipped = endpoints.len() - delivered,
                "update dropped for endpoints with full queues"
            );
        }
        delivered
    }

    /// Drain the slot for the life of the relay.
    ///
    /// When the counts moved on while a snapshot sat in the slot, the
    /// newer counts follow right after it.
    pub async fn fan_out(self, mut receiver: BroadcastReceiver) {
        while let Some(snapshot) = receiver.recv().await {
            let _ = self.deliver(snapshot);
            let latest = self.snapshot();
            if latest != snapshot {
                let _ = self.deliver(latest);
            }
        }
        debug!("broadcast fan-out stopped");
    }

    /// Run [`BroadcastCoordinator::fan_out`] on its own task.
    pub fn spawn_fan_out(&self, receiver: BroadcastReceiver) -> JoinHandle<()> {
        tokio::spawn(self.clone().fan_out(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Endpoint;
    use std::time::Duration;

    fn setup() -> (Arc<Registry>, Arc<PairingEngine>, BroadcastCoordinator, BroadcastReceiver) {
        let registry = Arc::new(Registry::new());
        let pairing = Arc::new(PairingEngine::new(Arc::clone(&registry), 3));
        let (coordinator, receiver) =
            BroadcastCoordinator::new(Arc::clone(&registry), Arc::clone(&pairing));
        (registry, pairing, coordinator, receiver)
    }

    #[test]
    fn snapshot_reflects_counts() {
        let (registry, pairing, coordinator, _rx) = setup();
        let (a, _rx_a) = Endpoint::channel(4, Duration::from_millis(10));
        let (b, _rx_b) = Endpoint::channel(4, Duration::from_millis(10));
        let a_id = a.id;
        assert!(registry.register(a));
        assert!(registry.register(b));
        let _ = pairing.attempt_pair(a_id).unwrap();

        assert_eq!(
            coordinator.snapshot(),
            Snapshot {
                online_count: 2,
                pairing_count: 2
            }
        );
    }

    #[test]
    fn publish_coalesces_while_pending() {
        let (registry, _pairing, coordinator, mut rx) = setup();
        assert!(coordinator.publish());

        let (ep, _ep_rx) = Endpoint::channel(4, Duration::from_millis(10));
        assert!(registry.register(ep));
        assert!(!coordinator.publish());

        let pending = rx.try_recv().unwrap();
        assert_eq!(pending.online_count, 0);
        assert!(rx.try_recv().is_err());
        assert!(coordinator.publish());
    }

    #[test]
    fn deliver_reaches_every_endpoint() {
        let (registry, _pairing, coordinator, _rx) = setup();
        let (a, mut rx_a) = Endpoint::channel(4, Duration::from_millis(10));
        let (b, mut rx_b) = Endpoint::channel(1, Duration::from_millis(10));
        assert!(b.push_update("filler".into()));
        assert!(registry.register(a));
        assert!(registry.register(Arc::clone(&b)));

        let snapshot = coordinator.snapshot();
        assert_eq!(coordinator.deliver(snapshot), 1);
        assert_eq!(
            &*rx_a.try_recv().unwrap(),
            r#"{"msg":"update","online_num":2,"pairing_num":0}"#
        );
        assert_eq!(&*rx_b.try_recv().unwrap(), "filler");
        assert_eq!(b.dropped_updates(), 1);
    }

    #[tokio::test]
    async fn fan_out_catches_up_with_newer_counts() {
        let (registry, _pairing, coordinator, rx) = setup();
        let (a, mut rx_a) = Endpoint::channel(8, Duration::from_millis(10));
        assert!(registry.register(a));
        assert!(coordinator.publish());
        let (b, _rx_b) = Endpoint::channel(8, Duration::from_millis(10));
        assert!(registry.register(b));

        let task = coordinator.spawn_fan_out(rx);
        let first = rx_a.recv().await.unwrap();
        let second = rx_a.recv().await.unwrap();
        assert_eq!(&*first, r#"{"msg":"update","online_num":1,"pairing_num":0}"#);
        assert_eq!(&*second, r#"{"msg":"update","online_num":2,"pairing_num":0}"#);

        task.abort();
    }
}

//! Endpoint and registry state for the signaling relay
//!
//! This module tracks connected endpoints, their pairing status, and who they
//! are paired with. Status and partner links live in a single table behind one
//! lock, so observing that a peer is `Ready` and claiming it happen together.

use crate::broadcast::{BroadcastCoordinator, BroadcastReceiver};
use crate::config::Config;
use crate::error::SignalingError;
use crate::pairing::PairingEngine;
use pairbox_protocol::ServerEvent;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// Identity of a connected endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Uuid);

impl From<Uuid> for PeerId {
    fn from(id: Uuid) -> Self {
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Pairing status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Waiting, available as a pairing candidate
    Ready,
    /// Claimed by a pairing, role not yet assigned
    Pairing,
    /// Paired, sends the offer
    Offer,
    /// Paired, sends the answer
    Answer,
    /// Gone
    Closed,
}

impl Status {
    /// Whether the endpoint is bound to a partner
    pub fn is_matched(self) -> bool {
        matches!(self, Status::Pairing | Status::Offer | Status::Answer)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ready => "ready",
            Status::Pairing => "pairing",
            Status::Offer => "offer",
            Status::Answer => "answer",
            Status::Closed => "closed",
        })
    }
}

/// Outbound side of one connection.
///
/// Messages are queued on a bounded channel drained by the connection's
/// writer task, which keeps writes to the socket ordered.
#[derive(Debug)]
pub struct Endpoint {
    /// Unique endpoint ID
    pub id: PeerId,
    tx: mpsc::Sender<Arc<str>>,
    push_timeout: Duration,
    evicted: CancellationToken,
    dropped_updates: AtomicU64,
}

impl Endpoint {
    /// Create an endpoint with a fresh ID around an existing queue
    pub fn new(tx: mpsc::Sender<Arc<str>>, push_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4().into(),
            tx,
            push_timeout,
            evicted: CancellationToken::new(),
            dropped_updates: AtomicU64::new(0),
        }
    }

    /// Create an endpoint together with the receiving half of its queue
    pub fn channel(capacity: usize, push_timeout: Duration) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(tx, push_timeout)), rx)
    }

    /// Queue a coalescable broadcast message.
    ///
    /// Never waits: returns `false` and counts a drop if the queue is full.
    pub fn push_update(&self, message: Arc<str>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_updates.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a message that must not be lost, waiting at most the push timeout
    pub async fn push(&self, message: Arc<str>) -> Result<(), SignalingError> {
        if self.is_evicted() {
            return Err(SignalingError::Delivery("endpoint evicted"));
        }
        match tokio::time::timeout(self.push_timeout, self.tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SignalingError::Delivery("outbound queue closed")),
            Err(_) => Err(SignalingError::Delivery("outbound queue full")),
        }
    }

    /// Serialize and queue a relay event
    pub async fn push_event(&self, event: &ServerEvent) -> Result<(), SignalingError> {
        let json = serde_json::to_string(event)?;
        self.push(json.into()).await
    }

    /// Ask the connection to shut down as if its transport had closed
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    /// Whether [`Endpoint::evict`] has been called
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Resolves once the endpoint is evicted
    pub fn evicted(&self) -> WaitForCancellationFuture<'_> {
        self.evicted.cancelled()
    }

    /// Broadcast messages dropped because the queue was full
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }
}

/// Registry entry for one endpoint
#[derive(Debug)]
struct Slot {
    endpoint: Arc<Endpoint>,
    status: Status,
    partner: Option<PeerId>,
    /// Position in `Table::ready` while `status == Ready`
    ready_index: Option<usize>,
}

#[derive(Debug, Default)]
struct Table {
    slots: HashMap<PeerId, Slot>,
    /// IDs of all `Ready` endpoints, for uniform sampling
    ready: Vec<PeerId>,
}

impl Table {
    fn is_ready(&self, id: PeerId) -> bool {
        self.slots.get(&id).is_some_and(|s| s.status == Status::Ready)
    }

    fn set_status(&mut self, id: PeerId, status: Status) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let was_ready = slot.status == Status::Ready;
        slot.status = status;
        match (was_ready, status == Status::Ready) {
            (false, true) => {
                slot.ready_index = Some(self.ready.len());
                self.ready.push(id);
            }
            (true, false) => self.remove_ready(id),
            _ => {}
        }
    }

    fn remove_ready(&mut self, id: PeerId) {
        let Some(index) = self.slots.get_mut(&id).and_then(|s| s.ready_index.take()) else {
            return;
        };
        let _ = self.ready.swap_remove(index);
        if let Some(moved) = self.ready.get(index).copied() {
            if let Some(slot) = self.slots.get_mut(&moved) {
                slot.ready_index = Some(index);
            }
        }
    }

    fn set_partner(&mut self, id: PeerId, partner: Option<PeerId>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.partner = partner;
        }
    }

    fn release(&mut self, id: PeerId) -> Release {
        let partner = match self.slots.get(&id) {
            Some(slot) if slot.status.is_matched() => slot.partner,
            _ => return Release::NotMatched,
        };
        self.set_status(id, Status::Ready);
        self.set_partner(id, None);

        match partner {
            Some(p) if self.slots.get(&p).is_some_and(|s| s.partner == Some(id)) => {
                self.set_status(p, Status::Ready);
                self.set_partner(p, None);
                Release::Both(p)
            }
            _ => Release::Alone,
        }
    }
}

/// Outcome of [`Registry::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The endpoint was not matched; nothing changed
    NotMatched,
    /// Both sides were reset to `Ready`
    Both(PeerId),
    /// Only the local side was reset; the partner link was already gone
    Alone,
}

/// Status and partner of one endpoint, read under a single lock
#[derive(Debug, Clone)]
pub struct EndpointView {
    /// Current status (`Closed` if not registered)
    pub status: Status,
    /// Partner endpoint, if linked and still registered
    pub partner: Option<Arc<Endpoint>>,
}

/// The set of live endpoints
#[derive(Debug, Default)]
pub struct Registry {
    table: Mutex<Table>,
    online: AtomicUsize,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint as `Ready`. Returns `false` if it was already present.
    pub fn register(&self, endpoint: Arc<Endpoint>) -> bool {
        let mut table = self.table.lock();
        let id = endpoint.id;
        if table.slots.contains_key(&id) {
            return false;
        }
        let ready_index = Some(table.ready.len());
        table.ready.push(id);
        let _ = table.slots.insert(
            id,
            Slot {
                endpoint,
                status: Status::Ready,
                partner: None,
                ready_index,
            },
        );
        let _ = self.online.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove an endpoint; its status is `Closed` from here on.
    ///
    /// A matched endpoint is released in the same critical section, so no
    /// concurrent `claim` can pick it up between leaving its pairing and
    /// leaving the registry.
    pub fn unregister(&self, id: PeerId) -> Option<(Arc<Endpoint>, Release)> {
        let mut table = self.table.lock();
        let release = table.release(id);
        table.remove_ready(id);
        let slot = table.slots.remove(&id)?;
        let _ = self.online.fetch_sub(1, Ordering::Relaxed);
        Some((slot.endpoint, release))
    }

    /// Drop a slot without touching partner links, leaving any partner
    /// pointing at a vanished endpoint.
    #[cfg(test)]
    pub(crate) fn vanish(&self, id: PeerId) {
        let mut table = self.table.lock();
        table.remove_ready(id);
        if table.slots.remove(&id).is_some() {
            let _ = self.online.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Number of registered endpoints
    pub fn size(&self) -> usize {
        self.online.load(Ordering::Relaxed)
    }

    /// Current status of an endpoint, `Closed` if not registered
    pub fn status(&self, id: PeerId) -> Status {
        self.table
            .lock()
            .slots
            .get(&id)
            .map_or(Status::Closed, |s| s.status)
    }

    /// Status and partner of an endpoint in one step
    pub fn view(&self, id: PeerId) -> EndpointView {
        let table = self.table.lock();
        match table.slots.get(&id) {
            Some(slot) => EndpointView {
                status: slot.status,
                partner: slot
                    .partner
                    .and_then(|p| table.slots.get(&p))
                    .map(|p| Arc::clone(&p.endpoint)),
            },
            None => EndpointView {
                status: Status::Closed,
                partner: None,
            },
        }
    }

    /// Look up a registered endpoint
    pub fn endpoint(&self, id: PeerId) -> Option<Arc<Endpoint>> {
        self.table
            .lock()
            .slots
            .get(&id)
            .map(|s| Arc::clone(&s.endpoint))
    }

    /// All registered endpoints
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.table
            .lock()
            .slots
            .values()
            .map(|s| Arc::clone(&s.endpoint))
            .collect()
    }

    /// Pick a `Ready` endpoint other than `excluding`, uniformly at random
    pub fn sample_ready(&self, excluding: PeerId) -> Option<PeerId> {
        let table = self.table.lock();
        let own = table.slots.get(&excluding).and_then(|s| s.ready_index);
        let pool = table.ready.len() - usize::from(own.is_some());
        if pool == 0 {
            return None;
        }
        let mut pick = rand::rng().random_range(0..pool);
        if own.is_some_and(|own| pick >= own) {
            pick += 1;
        }
        table.ready.get(pick).copied()
    }

    /// Claim two `Ready` endpoints for each other.
    ///
    /// Both move to `Pairing` with symmetric partner links. Fails without
    /// changes if either is no longer `Ready`.
    pub fn claim(&self, a: PeerId, b: PeerId) -> bool {
        if a == b {
            return false;
        }
        let mut table = self.table.lock();
        if !(table.is_ready(a) && table.is_ready(b)) {
            return false;
        }
        table.set_status(a, Status::Pairing);
        table.set_status(b, Status::Pairing);
        table.set_partner(a, Some(b));
        table.set_partner(b, Some(a));
        true
    }

    /// Give a claimed pair its roles. Fails if the pair came apart after the claim.
    pub fn assign_roles(&self, offer: PeerId, answer: PeerId) -> bool {
        let mut table = self.table.lock();
        let linked = |from: PeerId, to: PeerId| {
            table
                .slots
                .get(&from)
                .is_some_and(|s| s.status == Status::Pairing && s.partner == Some(to))
        };
        if !(linked(offer, answer) && linked(answer, offer)) {
            return false;
        }
        table.set_status(offer, Status::Offer);
        table.set_status(answer, Status::Answer);
        true
    }

    /// Return a matched endpoint, and its partner if still linked, to `Ready`
    pub fn release(&self, id: PeerId) -> Release {
        self.table.lock().release(id)
    }
}

/// Process-wide relay context handed to every connection
#[derive(Clone)]
pub struct RelayState {
    /// Runtime settings
    pub config: Arc<Config>,
    /// Live endpoints
    pub registry: Arc<Registry>,
    /// Pairing engine and counters
    pub pairing: Arc<PairingEngine>,
    /// Count broadcaster
    pub broadcast: BroadcastCoordinator,
}

impl RelayState {
    /// Create an empty relay context and the receiver its broadcasts land in
    pub fn new(config: Config) -> (Self, BroadcastReceiver) {
        let registry = Arc::new(Registry::new());
        let pairing = Arc::new(PairingEngine::new(
            Arc::clone(&registry),
            config.pair_attempts,
        ));
        let (broadcast, receiver) =
            BroadcastCoordinator::new(Arc::clone(&registry), Arc::clone(&pairing));
        let state = Self {
            config: Arc::new(config),
            registry,
            pairing,
            broadcast,
        };
        (state, receiver)
    }

    /// Create an endpoint sized by the configured queue settings
    pub fn new_endpoint(&self) -> (Arc<Endpoint>, mpsc::Receiver<Arc<str>>) {
        Endpoint::channel(self.config.outbound_capacity, self.config.push_timeout)
    }
}

//! Random one-to-one pairing of waiting endpoints

use crate::state::{Endpoint, PeerId, Registry, Release, Status};
use pairbox_protocol::Role;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the pairing engine
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingError {
    /// The requester was not `Ready`
    #[error("cannot pair while {0}")]
    InvalidState(Status),
}

/// Two freshly paired endpoints and their roles
#[derive(Debug, Clone)]
pub struct Pairing {
    /// Endpoint playing [`Role::Offer`] (the requester)
    pub offer: Arc<Endpoint>,
    /// Endpoint playing [`Role::Answer`] (the sampled candidate)
    pub answer: Arc<Endpoint>,
}

impl Pairing {
    /// Each side with the role it was given
    pub fn sides(&self) -> [(&Arc<Endpoint>, Role); 2] {
        [(&self.offer, Role::Offer), (&self.answer, Role::Answer)]
    }
}

/// Result of [`PairingEngine::attempt_pair`]
#[derive(Debug, Clone)]
pub enum PairOutcome {
    /// A partner was found
    Paired(Pairing),
    /// Nobody suitable is waiting; the requester stays `Ready`
    NoPartner,
}

/// Matches `Ready` endpoints and keeps the count of matched endpoints
#[derive(Debug)]
pub struct PairingEngine {
    registry: Arc<Registry>,
    pairing_count: AtomicI64,
    attempts: usize,
}

impl PairingEngine {
    /// Create an engine over a registry, trying at most `attempts` candidates per request
    pub fn new(registry: Arc<Registry>, attempts: usize) -> Self {
        Self {
            registry,
            pairing_count: AtomicI64::new(0),
            attempts: attempts.max(1),
        }
    }

    /// Number of endpoints currently matched with a partner
    pub fn pairing_count(&self) -> i64 {
        self.pairing_count.load(Ordering::SeqCst)
    }

    /// Try to match `requester` with a random `Ready` endpoint.
    ///
    /// The requester becomes the offering side. Losing a candidate to a
    /// concurrent request triggers a resample, up to the attempt limit.
    pub fn attempt_pair(&self, requester: PeerId) -> Result<PairOutcome, PairingError> {
        let status = self.registry.status(requester);
        if status != Status::Ready {
            return Err(PairingError::InvalidState(status));
        }

        for attempt in 1..=self.attempts {
            let Some(candidate) = self.registry.sample_ready(requester) else {
                return Ok(PairOutcome::NoPartner);
            };
            if !self.registry.claim(requester, candidate) {
                if self.registry.status(requester) != Status::Ready {
                    // Claimed by someone else's request; they deliver the notices.
                    return Ok(PairOutcome::NoPartner);
                }
                debug!(peer = %requester, %candidate, attempt, "candidate taken, resampling");
                continue;
            }
            let _ = self.pairing_count.fetch_add(2, Ordering::SeqCst);

            // A release between claim and here has already adjusted the count.
            if !self.registry.assign_roles(requester, candidate) {
                return Ok(PairOutcome::NoPartner);
            }
            let (Some(offer), Some(answer)) = (
                self.registry.endpoint(requester),
                self.registry.endpoint(candidate),
            ) else {
                return Ok(PairOutcome::NoPartner);
            };
            info!(offer = %requester, answer = %candidate, "paired");
            return Ok(PairOutcome::Paired(Pairing { offer, answer }));
        }

        debug!(peer = %requester, attempts = self.attempts, "no candidate could be claimed");
        Ok(PairOutcome::NoPartner)
    }

    /// Leave the current pairing. No-op unless `id` is matched.
    pub fn unpair(&self, id: PeerId) -> Release {
        let release = self.registry.release(id);
        self.settle(id, release);
        release
    }

    /// Leave the current pairing and the registry in one step.
    ///
    /// Returns `None` if `id` was not registered.
    pub fn disconnect(&self, id: PeerId) -> Option<Release> {
        let (_, release) = self.registry.unregister(id)?;
        self.settle(id, release);
        Some(release)
    }

    fn settle(&self, id: PeerId, release: Release) {
        match release {
            Release::Both(partner) => {
                let _ = self.pairing_count.fetch_sub(2, Ordering::SeqCst);
                info!(peer = %id, %partner, "unpaired");
            }
            Release::Alone => {
                let _ = self.pairing_count.fetch_sub(1, Ordering::SeqCst);
                info!(peer = %id, "unpaired from a vanished partner");
            }
            Release::NotMatched => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<Registry>, PairingEngine) {
        let registry = Arc::new(Registry::new());
        let engine = PairingEngine::new(Arc::clone(&registry), 3);
        (registry, engine)
    }

    fn join(registry: &Registry) -> PeerId {
        let (ep, _rx) = Endpoint::channel(8, Duration::from_millis(50));
        let id = ep.id;
        assert!(registry.register(ep));
        id
    }

    fn assert_symmetric(registry: &Registry, ids: &[PeerId]) {
        for &id in ids {
            if let Some(partner) = registry.view(id).partner {
                assert_eq!(
                    registry.view(partner.id).partner.map(|p| p.id),
                    Some(id),
                    "partner link of {id} is one-sided"
                );
            }
        }
    }

    #[test]
    fn lone_requester_stays_ready() {
        let (registry, engine) = setup();
        let a = join(&registry);

        assert!(matches!(engine.attempt_pair(a), Ok(PairOutcome::NoPartner)));
        assert_eq!(registry.status(a), Status::Ready);
        assert_eq!(engine.pairing_count(), 0);
    }

    #[test]
    fn requester_offers_and_candidate_answers() {
        let (registry, engine) = setup();
        let a = join(&registry);
        let b = join(&registry);

        let PairOutcome::Paired(pairing) = engine.attempt_pair(b).unwrap() else {
            panic!("expected a pairing");
        };
        assert_eq!(pairing.offer.id, b);
        assert_eq!(pairing.answer.id, a);
        assert_eq!(registry.status(b), Status::Offer);
        assert_eq!(registry.status(a), Status::Answer);
        assert_eq!(engine.pairing_count(), 2);
        assert_symmetric(&registry, &[a, b]);

        let roles: Vec<_> = pairing.sides().iter().map(|(ep, role)| (ep.id, *role)).collect();
        assert_eq!(roles, vec![(b, Role::Offer), (a, Role::Answer)]);
    }

    #[test]
    fn pairing_while_matched_is_rejected() {
        let (registry, engine) = setup();
        let a = join(&registry);
        let b = join(&registry);
        assert!(matches!(engine.attempt_pair(a), Ok(PairOutcome::Paired(_))));

        assert_eq!(
            engine.attempt_pair(a).unwrap_err(),
            PairingError::InvalidState(Status::Offer)
        );
        assert_eq!(
            engine.attempt_pair(b).unwrap_err(),
            PairingError::InvalidState(Status::Answer)
        );
        assert_eq!(engine.pairing_count(), 2);
    }

    #[test]
    fn unknown_requester_is_rejected() {
        let (_registry, engine) = setup();
        let ghost = PeerId(uuid::Uuid::new_v4());
        assert_eq!(
            engine.attempt_pair(ghost).unwrap_err(),
            PairingError::InvalidState(Status::Closed)
        );
    }

    #[test]
    fn unpair_resets_both_and_counts_down() {
        let (registry, engine) = setup();
        let a = join(&registry);
        let b = join(&registry);
        assert!(matches!(engine.attempt_pair(a), Ok(PairOutcome::Paired(_))));

        assert_eq!(engine.unpair(b), Release::Both(a));
        assert_eq!(registry.status(a), Status::Ready);
        assert_eq!(registry.status(b), Status::Ready);
        assert_eq!(engine.pairing_count(), 0);
        assert_symmetric(&registry, &[a, b]);

        assert_eq!(engine.unpair(a), Release::NotMatched);
        assert_eq!(engine.pairing_count(), 0);

        assert!(matches!(engine.attempt_pair(b), Ok(PairOutcome::Paired(_))));
        assert_eq!(engine.pairing_count(), 2);
    }

    #[test]
    fn unpair_with_vanished_partner_counts_one() {
        let (registry, engine) = setup();
        let a = join(&registry);
        let b = join(&registry);
        assert!(matches!(engine.attempt_pair(a), Ok(PairOutcome::Paired(_))));
        registry.vanish(b);

        assert_eq!(engine.unpair(a), Release::Alone);
        assert_eq!(registry.status(a), Status::Ready);
        assert_eq!(engine.pairing_count(), 1);
    }

    #[test]
    fn disconnect_frees_the_partner() {
        let (registry, engine) = setup();
        let a = join(&registry);
        let b = join(&registry);
        assert!(matches!(engine.attempt_pair(a), Ok(PairOutcome::Paired(_))));

        assert_eq!(engine.disconnect(a), Some(Release::Both(b)));
        assert_eq!(registry.status(a), Status::Closed);
        assert_eq!(registry.status(b), Status::Ready);
        assert_eq!(engine.pairing_count(), 0);
        assert_eq!(engine.disconnect(a), None);
    }

    #[test]
    fn pair_after_disconnect_cannot_reach_the_closed_endpoint() {
        let (registry, engine) = setup();
        let a = join(&registry);
        let b = join(&registry);
        let c = join(&registry);
        assert!(matches!(engine.attempt_pair(a), Ok(PairOutcome::Paired(_))));
        assert_eq!(engine.disconnect(a), Some(Release::Both(b)));

        let PairOutcome::Paired(pairing) = engine.attempt_pair(c).unwrap() else {
            panic!("expected a pairing");
        };
        assert_eq!(pairing.answer.id, b);
        assert_eq!(engine.pairing_count(), 2);
    }

    /// Check the state left behind once `closed` has disconnected.
    fn assert_settled(registry: &Registry, engine: &PairingEngine, closed: PeerId, live: &[PeerId]) {
        assert_eq!(registry.status(closed), Status::Closed);
        assert_symmetric(registry, live);
        let mut matched = 0;
        for &id in live {
            let view = registry.view(id);
            match view.partner {
                Some(partner) => {
                    assert_ne!(partner.id, closed, "{id} is paired to a closed endpoint");
                    assert!(live.contains(&partner.id));
                    assert!(matches!(view.status, Status::Offer | Status::Answer));
                    matched += 1;
                }
                None => assert_eq!(view.status, Status::Ready),
            }
        }
        assert_eq!(engine.pairing_count(), matched);
        assert_eq!(engine.pairing_count() % 2, 0);
    }

    #[test]
    fn disconnect_races_a_pair_request() {
        for _ in 0..300 {
            let (registry, engine) = setup();
            let engine = Arc::new(engine);
            let closing = join(&registry);
            let requester = join(&registry);
            let barrier = Arc::new(Barrier::new(2));

            let leaver = {
                let (engine, barrier) = (Arc::clone(&engine), Arc::clone(&barrier));
                thread::spawn(move || {
                    let _ = barrier.wait();
                    engine.disconnect(closing)
                })
            };
            let pairer = {
                let (engine, barrier) = (Arc::clone(&engine), Arc::clone(&barrier));
                thread::spawn(move || {
                    let _ = barrier.wait();
                    engine.attempt_pair(requester)
                })
            };
            assert!(leaver.join().unwrap().is_some());
            let _ = pairer.join().unwrap();

            assert_settled(&registry, &engine, closing, &[requester]);
        }
    }

    #[test]
    fn disconnect_of_a_paired_endpoint_races_a_pair_request() {
        for _ in 0..300 {
            let (registry, engine) = setup();
            let engine = Arc::new(engine);
            let closing = join(&registry);
            let partner = join(&registry);
            let requester = join(&registry);
            assert!(registry.claim(closing, partner));
            assert!(registry.assign_roles(closing, partner));
            let _ = engine.pairing_count.fetch_add(2, Ordering::SeqCst);
            let barrier = Arc::new(Barrier::new(2));

            let leaver = {
                let (engine, barrier) = (Arc::clone(&engine), Arc::clone(&barrier));
                thread::spawn(move || {
                    let _ = barrier.wait();
                    engine.disconnect(closing)
                })
            };
            let pairer = {
                let (engine, barrier) = (Arc::clone(&engine), Arc::clone(&barrier));
                thread::spawn(move || {
                    let _ = barrier.wait();
                    engine.attempt_pair(requester)
                })
            };
            assert_eq!(leaver.join().unwrap(), Some(Release::Both(partner)));
            let _ = pairer.join().unwrap();

            assert_settled(&registry, &engine, closing, &[partner, requester]);
        }
    }

    #[test]
    fn alternating_pair_and_stop_keeps_links_symmetric() {
        let (registry, engine) = setup();
        let a = join(&registry);
        let b = join(&registry);

        for round in 0..50 {
            let (first, second) = if round % 2 == 0 { (a, b) } else { (b, a) };
            let _ = engine.attempt_pair(first);
            assert_symmetric(&registry, &[a, b]);
            let _ = engine.attempt_pair(second);
            assert_symmetric(&registry, &[a, b]);
            assert_eq!(engine.pairing_count() % 2, 0);
            let _ = engine.unpair(second);
            assert_symmetric(&registry, &[a, b]);
            assert_eq!(engine.pairing_count(), 0);
        }
    }

    #[test]
    fn concurrent_requests_pair_exactly_once() {
        for _ in 0..200 {
            let (registry, engine) = setup();
            let engine = Arc::new(engine);
            let a = join(&registry);
            let b = join(&registry);
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = [a, b]
                .into_iter()
                .map(|id| {
                    let engine = Arc::clone(&engine);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        let _ = barrier.wait();
                        engine.attempt_pair(id)
                    })
                })
                .collect();

            let paired = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|outcome| matches!(outcome, Ok(PairOutcome::Paired(_))))
                .count();

            assert_eq!(paired, 1);
            assert_eq!(engine.pairing_count(), 2);
            assert_eq!(registry.view(a).partner.map(|p| p.id), Some(b));
            assert_eq!(registry.view(b).partner.map(|p| p.id), Some(a));
            let mut statuses = [registry.status(a), registry.status(b)];
            statuses.sort_by_key(|s| *s == Status::Answer);
            assert_eq!(statuses, [Status::Offer, Status::Answer]);
        }
    }
}

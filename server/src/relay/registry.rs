//! Process-wide registry of live delivery channels.
//!
//! [`Registry`] is the single authority for mapping an [`Identifier`] to its
//! [`DeliveryChannel`]. It is constructed once in `main` and cloned into both
//! the SSH session handler and the webhook routes.
//!
//! ## Concurrency
//!
//! The map is a sharded `DashMap`, so unrelated identifiers never contend on a
//! single lock. `register` goes through the entry API, which holds the shard
//! lock across the existence check and the insert: two concurrent claims of
//! the same key cannot both succeed. No shard guard is ever held across an
//! `.await`; `lookup` clones the sender out and drops the guard immediately.
//!
//! ## Lifecycle
//!
//! Each registration gets a unique generation number. Release removes the
//! entry only if the generation still matches, so a late release from an old
//! session cannot evict a newer registration that happens to reuse the key.
//! Releasing also closes the receiving half, which wakes any producer blocked
//! on a full channel with [`DeliveryError::Closed`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, info, warn};

use super::{Identifier, Payload};

/// Errors from registry bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The key is already held by another live session.
    #[error("identifier {0} is already registered")]
    DuplicateIdentifier(Identifier),
    /// No live session owns the requested identifier.
    #[error("client id not found")]
    NotFound,
    /// Every generated identifier collided with a live one.
    #[error("no free identifier after {0} attempts")]
    Exhausted(usize),
}

/// Errors from handing a payload to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("client id not found")]
    NotFound,
    /// The channel stayed full for the whole bounded wait.
    #[error("session did not accept the payload within {0:?}")]
    Timeout(Duration),
    /// The owning session released the identifier while we were waiting.
    #[error("session closed before the payload was delivered")]
    Closed,
}

/// Producer handle for one identifier's queue.
///
/// Cheap to clone; webhook handlers hold one only for the duration of a
/// single delivery.
#[derive(Debug, Clone)]
pub struct DeliveryChannel {
    tx: mpsc::Sender<Payload>,
    generation: u64,
}

impl DeliveryChannel {
    /// Registration this channel belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueue `payload`, waiting at most `timeout` for room in the queue.
    pub async fn deliver(&self, payload: Payload, timeout: Duration) -> Result<(), DeliveryError> {
        self.tx
            .send_timeout(payload, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliveryError::Timeout(timeout),
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consuming end of a registration, exclusively owned by one session.
///
/// Dropping the inbox (or calling [`Inbox::release`]) removes the registry
/// entry and closes the queue.
pub struct Inbox {
    id: Identifier,
    generation: u64,
    rx: mpsc::Receiver<Payload>,
    registry: Registry,
    released: bool,
}

impl Inbox {
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next payload. Returns `None` once released.
    ///
    /// Cancel-safe: a payload is never lost if the future is dropped.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Release the identifier now instead of at drop.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let removed = self.registry.release(self.id.as_str(), self.generation);
        self.rx.close();
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }

        if discarded > 0 {
            warn!(id = %self.id, discarded, "Released identifier with undelivered payloads");
        }
        debug!(id = %self.id, removed, "Inbox closed");
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// Shared identifier → channel map.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    channels: DashMap<Identifier, DeliveryChannel>,
    /// Queue depth of each new channel.
    capacity: usize,
    next_generation: AtomicU64,
}

impl Registry {
    /// Create an empty registry whose channels buffer up to `capacity`
    /// payloads (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: DashMap::new(),
                capacity: capacity.max(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Insert a fresh channel under `id`.
    ///
    /// Never overwrites: if `id` is live, returns
    /// [`RegistryError::DuplicateIdentifier`] and leaves the existing entry
    /// untouched.
    pub fn register(&self, id: Identifier) -> Result<Inbox, RegistryError> {
        match self.inner.channels.entry(id) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateIdentifier(entry.key().clone())),
            Entry::Vacant(slot) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(self.inner.capacity);
                let id = slot.key().clone();
                slot.insert(DeliveryChannel { tx, generation });
                Ok(Inbox {
                    id,
                    generation,
                    rx,
                    registry: self.clone(),
                    released: false,
                })
            }
        }
    }

    /// Claim a freshly generated identifier, regenerating on collision up to
    /// `attempts` times.
    pub fn claim(&self, attempts: usize) -> Result<Inbox, RegistryError> {
        self.claim_with(attempts, Identifier::generate)
    }

    /// [`Registry::claim`] with a caller-supplied generator.
    pub fn claim_with<F>(&self, attempts: usize, mut generate: F) -> Result<Inbox, RegistryError>
    where
        F: FnMut() -> Identifier,
    {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.register(generate()) {
                Ok(inbox) => {
                    info!(id = %inbox.id(), "Identifier claimed");
                    return Ok(inbox);
                }
                Err(RegistryError::DuplicateIdentifier(id)) => {
                    warn!(id = %id, attempt, "Identifier collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(RegistryError::Exhausted(attempts))
    }

    /// Find the channel for `id`.
    pub fn lookup(&self, id: &str) -> Result<DeliveryChannel, RegistryError> {
        self.inner
            .channels
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NotFound)
    }

    /// Remove `id` if it still belongs to registration `generation`.
    /// Returns whether an entry was removed.
    pub fn release(&self, id: &str, generation: u64) -> bool {
        let removed = self
            .inner
            .channels
            .remove_if(id, |_, channel| channel.generation == generation)
            .is_some();
        if removed {
            info!(id = %id, "Identifier released");
        }
        removed
    }

    /// Look up `id` and enqueue `payload` with a bounded wait.
    pub async fn deliver(
        &self,
        id: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let channel = self.lookup(id).map_err(|_| DeliveryError::NotFound)?;
        channel.deliver(payload, timeout).await
    }

    /// Number of live identifiers.
    pub fn len(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    #[test]
    fn test_register_then_lookup_returns_same_channel() {
        let registry = Registry::new(8);
        let inbox = registry.register(Identifier::from("abc123")).unwrap();
        let channel = registry.lookup("abc123").unwrap();
        assert_eq!(channel.generation(), inbox.generation());
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_lookup_never_registered() {
        let registry = Registry::new(8);
        assert!(matches!(
            registry.lookup("nope"),
            Err(RegistryError::NotFound)
        ));
    }

    #[test]
    fn test_lookup_after_release() {
        let registry = Registry::new(8);
        let inbox = registry.register(Identifier::from("gone")).unwrap();
        inbox.release();
        assert!(matches!(
            registry.lookup("gone"),
            Err(RegistryError::NotFound)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_releases() {
        let registry = Registry::new(8);
        {
            let _inbox = registry.register(Identifier::from("scoped")).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.lookup("scoped").is_err());
    }

    #[test]
    fn test_duplicate_register_keeps_original() {
        let registry = Registry::new(8);
        let first = registry.register(Identifier::from("dup")).unwrap();
        let err = registry.register(Identifier::from("dup")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateIdentifier(ref id) if id.as_str() == "dup"));
        assert_eq!(
            registry.lookup("dup").unwrap().generation(),
            first.generation()
        );
    }

    #[test]
    fn test_claim_regenerates_on_collision() {
        let registry = Registry::new(8);
        let _taken = registry.register(Identifier::from("taken")).unwrap();

        let mut candidates = vec!["fresh", "taken", "taken"];
        let inbox = registry
            .claim_with(8, || Identifier::from(candidates.pop().unwrap()))
            .unwrap();
        assert_eq!(inbox.id().as_str(), "fresh");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_claim_exhausted() {
        let registry = Registry::new(8);
        let _taken = registry.register(Identifier::from("taken")).unwrap();
        let err = registry
            .claim_with(3, || Identifier::from("taken"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Exhausted(3)));
    }

    #[test]
    fn test_claim_generates_distinct_ids() {
        let registry = Registry::new(1);
        let a = registry.claim(8).unwrap();
        let b = registry.claim(8).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_concurrent_register_single_winner() {
        let registry = Registry::new(8);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.register(Identifier::from("contested"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(RegistryError::DuplicateIdentifier(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(duplicates, threads - 1);
    }

    #[test]
    fn test_stale_release_keeps_newer_registration() {
        let registry = Registry::new(8);
        let old = registry.register(Identifier::from("reuse")).unwrap();
        let old_generation = old.generation();
        old.release();

        let new = registry.register(Identifier::from("reuse")).unwrap();
        assert!(!registry.release("reuse", old_generation));
        assert_eq!(
            registry.lookup("reuse").unwrap().generation(),
            new.generation()
        );
    }

    #[tokio::test]
    async fn test_payloads_arrive_in_order() {
        let registry = Registry::new(64);
        let mut inbox = registry.register(Identifier::from("fifo")).unwrap();

        for i in 0..50 {
            registry
                .deliver("fifo", Payload::new(format!("p{i}")), WAIT)
                .await
                .unwrap();
        }
        for i in 0..50 {
            let payload = inbox.recv().await.unwrap();
            assert_eq!(payload.body, format!("p{i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn test_order_preserved_through_backpressure() {
        let registry = Registry::new(2);
        let mut inbox = registry.register(Identifier::from("slow")).unwrap();

        let producer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    registry
                        .deliver("slow", Payload::new(format!("{i}")), WAIT)
                        .await
                        .unwrap();
                }
            })
        };

        for i in 0..20 {
            let payload = inbox.recv().await.unwrap();
            assert_eq!(payload.body, format!("{i}").into_bytes());
        }
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_deliver_unknown_id() {
        let registry = Registry::new(8);
        let err = registry
            .deliver("unknown-id", Payload::new("x"), WAIT)
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::NotFound);
    }

    #[tokio::test]
    async fn test_deliver_times_out_when_full() {
        let registry = Registry::new(1);
        let _inbox = registry.register(Identifier::from("full")).unwrap();
        registry
            .deliver("full", Payload::new("first"), WAIT)
            .await
            .unwrap();

        let timeout = Duration::from_millis(50);
        let err = registry
            .deliver("full", Payload::new("second"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Timeout(timeout));
    }

    #[tokio::test]
    async fn test_release_wakes_blocked_producer() {
        let registry = Registry::new(1);
        let inbox = registry.register(Identifier::from("blocked")).unwrap();
        let channel = registry.lookup("blocked").unwrap();
        channel.deliver(Payload::new("fill"), WAIT).await.unwrap();

        let pending = tokio::spawn(async move {
            channel
                .deliver(Payload::new("stuck"), Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.release();

        let result = tokio::time::timeout(WAIT, pending)
            .await
            .expect("producer should fail fast after release")
            .unwrap();
        assert_eq!(result, Err(DeliveryError::Closed));
    }
}

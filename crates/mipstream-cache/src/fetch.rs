//! Fetch Pipeline
//!
//! Asynchronous transport then decode, one in-flight request per key.
//!
//! Workers never touch the registry. Each job reports through a completion
//! channel that the scheduler drains once per tick with [`FetchPipeline::poll`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam::channel::{Receiver, Sender, unbounded};
use mipstream_core::{TextureKey, WorkerPool};

use crate::backend::{Codec, ImageSource, RawImage, Transport};
use crate::fast_path::FastPathLoader;
use crate::{CacheError, CacheResult};

/// Identifies one fetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchTicket(pub u64);

/// Completion reported by the pipeline
#[derive(Debug)]
pub enum FetchEvent {
    /// Transport delivered compressed bytes; decoding follows
    Fetched {
        key: TextureKey,
        ticket: FetchTicket,
        bytes: usize,
    },
    /// Pixels are ready
    Decoded {
        key: TextureKey,
        ticket: FetchTicket,
        image: RawImage,
        from_snapshot: bool,
    },
    /// No usable snapshot; fall back to the transport
    SnapshotMiss {
        key: TextureKey,
        ticket: FetchTicket,
    },
    Failed {
        key: TextureKey,
        ticket: FetchTicket,
        error: CacheError,
    },
}

impl FetchEvent {
    /// Key the event belongs to
    pub fn key(&self) -> TextureKey {
        match self {
            Self::Fetched { key, .. }
            | Self::Decoded { key, .. }
            | Self::SnapshotMiss { key, .. }
            | Self::Failed { key, .. } => *key,
        }
    }

    /// Ticket the event belongs to
    pub fn ticket(&self) -> FetchTicket {
        match self {
            Self::Fetched { ticket, .. }
            | Self::Decoded { ticket, .. }
            | Self::SnapshotMiss { ticket, .. }
            | Self::Failed { ticket, .. } => *ticket,
        }
    }

    fn is_final(&self) -> bool {
        !matches!(self, Self::Fetched { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    ticket: FetchTicket,
    level: u8,
    started: Instant,
}

/// Fetch and decode on a worker pool
pub struct FetchPipeline {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    pool: Arc<WorkerPool>,
    fast_path: Option<Arc<FastPathLoader>>,
    sender: Sender<FetchEvent>,
    receiver: Receiver<FetchEvent>,
    in_flight: AHashMap<TextureKey, InFlight>,
    next_ticket: u64,
    timeout: Duration,
    issued: u64,
    failed: u64,
    timed_out: u64,
}

impl FetchPipeline {
    /// Create a new pipeline
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        pool: Arc<WorkerPool>,
        timeout: Duration,
    ) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            transport,
            codec,
            pool,
            fast_path: None,
            sender,
            receiver,
            in_flight: AHashMap::new(),
            next_ticket: 1,
            timeout,
            issued: 0,
            failed: 0,
            timed_out: 0,
        }
    }

    /// Enable snapshot requests
    pub fn with_fast_path(mut self, loader: FastPathLoader) -> Self {
        self.fast_path = Some(Arc::new(loader));
        self
    }

    /// Whether snapshot requests are available
    pub fn has_fast_path(&self) -> bool {
        self.fast_path.is_some()
    }

    fn begin(&mut self, key: TextureKey, level: u8, now: Instant) -> CacheResult<FetchTicket> {
        if self.in_flight.contains_key(&key) {
            return Err(CacheError::AlreadyInFlight(key));
        }
        let ticket = FetchTicket(self.next_ticket);
        self.next_ticket += 1;
        // Registered before submitting: an inline pool completes during submit
        self.in_flight.insert(
            key,
            InFlight {
                ticket,
                level,
                started: now,
            },
        );
        Ok(ticket)
    }

    /// Request `key` at `level` from the transport
    pub fn request_fetch(
        &mut self,
        key: TextureKey,
        level: u8,
        now: Instant,
    ) -> CacheResult<FetchTicket> {
        let ticket = self.begin(key, level, now)?;
        self.issued += 1;

        let transport = self.transport.clone();
        let codec = self.codec.clone();
        let sender = self.sender.clone();
        self.pool.submit(move || {
            let bytes = match transport.fetch(key, level) {
                Ok(bytes) => bytes,
                Err(error) => {
                    let _ = sender.send(FetchEvent::Failed { key, ticket, error });
                    return;
                }
            };
            let _ = sender.send(FetchEvent::Fetched {
                key,
                ticket,
                bytes: bytes.len(),
            });

            let event = match codec.decode(&bytes, level) {
                Ok(image) => FetchEvent::Decoded {
                    key,
                    ticket,
                    image,
                    from_snapshot: false,
                },
                Err(error) => FetchEvent::Failed { key, ticket, error },
            };
            let _ = sender.send(event);
        });

        Ok(ticket)
    }

    /// Request the on-disk snapshot for `key`
    pub fn request_snapshot(&mut self, key: TextureKey, now: Instant) -> CacheResult<FetchTicket> {
        let Some(loader) = self.fast_path.clone() else {
            return Err(CacheError::Config("fast path is disabled".to_string()));
        };
        let ticket = self.begin(key, u8::MAX, now)?;

        let sender = self.sender.clone();
        self.pool.submit(move || {
            let event = match loader.load(key) {
                Ok(Some(image)) => FetchEvent::Decoded {
                    key,
                    ticket,
                    image,
                    from_snapshot: true,
                },
                Ok(None) => FetchEvent::SnapshotMiss { key, ticket },
                Err(err) => {
                    log::debug!("Ignoring unreadable snapshot for {}: {}", key, err);
                    FetchEvent::SnapshotMiss { key, ticket }
                }
            };
            let _ = sender.send(event);
        });

        Ok(ticket)
    }

    /// Whether a creation from `image` should be written back as a snapshot
    pub fn wants_snapshot(&self, image: &RawImage) -> bool {
        image.source == ImageSource::Network
            && self.fast_path.as_ref().is_some_and(|loader| loader.fits(image))
    }

    /// Write a snapshot in the background
    pub fn store_snapshot(&self, key: TextureKey, image: RawImage) {
        let Some(loader) = self.fast_path.clone() else {
            return;
        };
        if !loader.fits(&image) {
            return;
        }
        self.pool.submit(move || {
            if let Err(err) = loader.store(key, &image) {
                log::warn!("Failed to store snapshot for {}: {}", key, err);
            }
        });
    }

    /// Advisory cancellation; the ticket stays live
    pub fn cancel(&self, key: TextureKey) {
        if self.in_flight.contains_key(&key) {
            self.transport.cancel(key);
        }
    }

    /// Forget an in-flight request; its result will be dropped
    pub fn abandon(&mut self, key: TextureKey) -> Option<FetchTicket> {
        let entry = self.in_flight.remove(&key)?;
        self.transport.cancel(key);
        Some(entry.ticket)
    }

    /// Drain completions and expire stale requests
    pub fn poll(&mut self, now: Instant) -> Vec<FetchEvent> {
        let mut events = Vec::new();

        for event in self.receiver.try_iter() {
            let key = event.key();
            match self.in_flight.get(&key) {
                Some(entry) if entry.ticket == event.ticket() => {}
                _ => {
                    log::trace!("Dropping late fetch result for {} ({:?})", key, event.ticket());
                    continue;
                }
            }
            if event.is_final() {
                self.in_flight.remove(&key);
            }
            if matches!(event, FetchEvent::Failed { .. }) {
                self.failed += 1;
            }
            events.push(event);
        }

        let timeout = self.timeout;
        let expired: Vec<(TextureKey, InFlight)> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.started) >= timeout)
            .map(|(key, entry)| (*key, *entry))
            .collect();
        for (key, entry) in expired {
            self.in_flight.remove(&key);
            self.transport.cancel(key);
            self.failed += 1;
            self.timed_out += 1;
            log::warn!("Fetch of {} at level {} timed out", key, entry.level);
            events.push(FetchEvent::Failed {
                key,
                ticket: entry.ticket,
                error: CacheError::Transient("timed out".to_string()),
            });
        }

        events
    }

    /// Whether a request for `key` is outstanding
    pub fn is_in_flight(&self, key: TextureKey) -> bool {
        self.in_flight.contains_key(&key)
    }

    /// Number of outstanding requests
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Transport requests issued so far
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Failures reported so far, including timeouts
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Requests expired by the timeout
    pub fn timed_out(&self) -> u64 {
        self.timed_out
    }

    /// Worker pool shared with snapshot writes
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SyntheticCodec, SyntheticTransport};

    fn pipeline(transport: SyntheticTransport) -> FetchPipeline {
        FetchPipeline::new(
            Arc::new(transport),
            Arc::new(SyntheticCodec),
            Arc::new(WorkerPool::inline("fetch")),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_fetch_and_decode() {
        let transport = SyntheticTransport::new();
        let key = TextureKey::from_u128(1);
        transport.insert(key, 256, 256, 4);
        let mut fetch = pipeline(transport.clone());
        let now = Instant::now();

        let ticket = fetch.request_fetch(key, 2, now).unwrap();
        assert!(fetch.is_in_flight(key));

        let events = fetch.poll(now);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], FetchEvent::Fetched { .. }));
        match &events[1] {
            FetchEvent::Decoded { image, ticket: t, from_snapshot, .. } => {
                assert_eq!(*t, ticket);
                assert!(!from_snapshot);
                assert_eq!((image.width, image.height), (64, 64));
                assert_eq!(image.discard_level, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!fetch.is_in_flight(key));
        assert_eq!(transport.requests(), vec![(key, 2)]);
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let transport = SyntheticTransport::new();
        let key = TextureKey::from_u128(1);
        transport.insert(key, 64, 64, 4);
        let mut fetch = pipeline(transport);
        let now = Instant::now();

        fetch.request_fetch(key, 0, now).unwrap();
        assert!(matches!(
            fetch.request_fetch(key, 0, now),
            Err(CacheError::AlreadyInFlight(_))
        ));
        fetch.poll(now);
        assert!(fetch.request_fetch(key, 0, now).is_ok());
    }

    #[test]
    fn test_not_found() {
        let mut fetch = pipeline(SyntheticTransport::new());
        let key = TextureKey::from_u128(5);
        let now = Instant::now();
        fetch.request_fetch(key, 0, now).unwrap();

        let events = fetch.poll(now);
        assert!(matches!(
            events.as_slice(),
            [FetchEvent::Failed { error: CacheError::NotFound(_), .. }]
        ));
        assert_eq!(fetch.failed(), 1);
    }

    #[test]
    fn test_timeout_and_late_result() {
        let transport = SyntheticTransport::new();
        let key = TextureKey::from_u128(1);
        transport.insert(key, 64, 64, 4);
        let mut fetch = pipeline(transport);
        let start = Instant::now();

        fetch.request_fetch(key, 0, start).unwrap();
        // The inline job already completed, but the poll happens after the deadline
        let events = fetch.poll(start + Duration::from_secs(1));
        assert!(matches!(events.last(), Some(FetchEvent::Decoded { .. })));

        fetch.request_fetch(key, 0, start).unwrap();
        fetch.abandon(key);
        assert!(fetch.poll(start).is_empty());
    }

    #[test]
    fn test_timeout_expires_request() {
        let transport = SyntheticTransport::new();
        let key = TextureKey::from_u128(1);
        transport.insert(key, 64, 64, 4);
        let mut fetch = FetchPipeline::new(
            Arc::new(transport),
            Arc::new(SyntheticCodec),
            Arc::new(WorkerPool::new("fetch-slow", 1)),
            Duration::from_millis(10),
        );
        let start = Instant::now();
        // Hold the worker so the request cannot finish before the poll
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);
        fetch.pool().submit(move || {
            let _ = release_rx.recv();
        });

        fetch.request_fetch(key, 0, start).unwrap();
        let events = fetch.poll(start + Duration::from_millis(20));
        assert!(matches!(
            events.as_slice(),
            [FetchEvent::Failed { error: CacheError::Transient(_), .. }]
        ));
        assert_eq!(fetch.timed_out(), 1);
        assert!(!fetch.is_in_flight(key));

        let _ = release_tx.send(());
        assert!(fetch.pool().wait_idle(Duration::from_secs(5)));
        // The real result arrives late and is dropped
        assert!(fetch.poll(start).is_empty());
    }

    #[test]
    fn test_snapshot_requests() {
        let dir = std::env::temp_dir().join(format!("mipstream-fetch-snap-{}", std::process::id()));
        let loader = FastPathLoader::new(&dir, 64);
        let key = TextureKey::from_u128(77);
        let mut fetch = pipeline(SyntheticTransport::new()).with_fast_path(loader.clone());
        let now = Instant::now();

        fetch.request_snapshot(key, now).unwrap();
        assert!(matches!(
            fetch.poll(now).as_slice(),
            [FetchEvent::SnapshotMiss { .. }]
        ));

        let image = SyntheticCodec::image(64, 64, 4, 2);
        fetch.store_snapshot(key, image.clone());
        fetch.request_snapshot(key, now).unwrap();
        match fetch.poll(now).as_slice() {
            [FetchEvent::Decoded { image: loaded, from_snapshot: true, .. }] => {
                assert_eq!(loaded, &image)
            }
            other => panic!("unexpected events {:?}", other),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Streaming Scheduler
//!
//! Owns every [`TextureResource`] and drives them once per frame.
//!
//! `tick` runs these phases in order:
//! 1. drain fetch completions (and expire timed-out requests)
//! 2. observe GPU usage once and update the discard bias
//! 3. re-score a round-robin slice of the registry
//! 4. dispatch queued fetches, most important first, up to the concurrency cap
//! 5. hand decoded images to assembly within a byte budget, then finalize
//!    assembled payloads on this thread within the supplied time budget
//! 6. sweep a round-robin slice for eviction and purge old tombstones
//!
//! The scheduler owns a non-`Send` [`GpuDevice`] and therefore stays on the
//! render thread that created it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use indexmap::{IndexMap, IndexSet};
use mipstream_core::{Clock, MemoryStats, ScopedTimer, Stopwatch, SystemClock, TextureKey, WorkerPool};

use crate::backend::{AccountingEvent, Codec, GpuDevice, GpuHandle, ImageSource, RawImage, Transport, UploadImage};
use crate::budget::BudgetController;
use crate::config::StreamingConfig;
use crate::creation::{CreationLimits, CreationPipeline, CreationTicket};
use crate::eviction::{EvictionPolicy, EvictionStep, RoundRobin};
use crate::fast_path::FastPathLoader;
use crate::fetch::{FetchEvent, FetchPipeline};
use crate::manifest::{Manifest, ManifestEntry};
use crate::references::{ConsumerId, ReferenceTable};
use crate::resource::{
    BoostClass, DiscardLadder, FailureOutcome, FetchHint, GpuPayload, ResourceState, TextureHandle,
    TextureResource,
};
use crate::scorer::{Footprint, PriorityScorer};
use crate::stats::CacheStats;
use crate::{CacheError, CacheResult};

/// Key reserved for the placeholder texture
pub const PLACEHOLDER_KEY: TextureKey = TextureKey::from_u128(u128::MAX);

/// Hash state for the registry and fetch queue
type Hasher = ahash::RandomState;

/// What one `tick` did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub fetch_events: usize,
    pub rescored: usize,
    pub fetches_dispatched: usize,
    pub creations_submitted: usize,
    pub creations_finalized: usize,
    /// Uploads declined under acute pressure, retried next tick
    pub creations_deferred: usize,
    /// Assembled payloads left for the next tick by the time budget
    pub creations_postponed: usize,
    pub evicted: usize,
    pub purged: usize,
    pub discard_bias: f32,
    pub creation_time: Duration,
}

/// Assembled payload waiting for the render thread
struct ReadyUpload {
    key: TextureKey,
    ticket: CreationTicket,
    result: CacheResult<UploadImage>,
}

/// Texture registry and per-frame driver
pub struct Scheduler {
    config: StreamingConfig,
    clock: Arc<dyn Clock>,
    scorer: PriorityScorer,
    budget: BudgetController,
    eviction: EvictionPolicy,
    fetch: FetchPipeline,
    creation: CreationPipeline,
    gpu: Box<dyn GpuDevice>,
    memory: Arc<MemoryStats>,
    registry: IndexMap<TextureKey, TextureResource, Hasher>,
    references: ReferenceTable,
    rescore_cursor: RoundRobin,
    sweep_cursor: RoundRobin,
    fetch_queue: IndexSet<TextureKey, Hasher>,
    creation_queue: VecDeque<TextureKey>,
    ready: VecDeque<ReadyUpload>,
    pending_snapshots: AHashMap<TextureKey, RawImage>,
    placeholder: Option<GpuPayload>,
    next_generation: u64,
    next_queue_seq: u64,
    evictions: u64,
}

impl Scheduler {
    /// Create a new scheduler on the wall clock
    pub fn new(
        config: StreamingConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        gpu: Box<dyn GpuDevice>,
    ) -> CacheResult<Self> {
        Self::with_clock(config, transport, codec, gpu, Arc::new(SystemClock))
    }

    /// Create a new scheduler driven by `clock`
    pub fn with_clock(
        config: StreamingConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        mut gpu: Box<dyn GpuDevice>,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        config.validate()?;

        let pool = Arc::new(WorkerPool::new("mipstream-fetch", config.fetch_workers));
        let mut fetch = FetchPipeline::new(transport, codec, pool, config.fetch_timeout());
        if let Some(fast_path) = &config.fast_path {
            fetch = fetch.with_fast_path(FastPathLoader::from_config(fast_path));
        }

        let memory = Arc::new(MemoryStats::new());
        let mut creation = CreationPipeline::new(
            CreationLimits {
                max_texture_size: config.max_texture_size,
            },
            memory.clone(),
            config.threaded_creation,
        );

        let placeholder = match creation.create_now(
            gpu.as_mut(),
            PLACEHOLDER_KEY,
            checkerboard(config.placeholder_size),
        ) {
            Ok(payload) => Some(payload),
            Err(err) => {
                log::warn!("Failed to create placeholder texture: {}", err);
                None
            }
        };

        let budget = BudgetController::new(config.budget.clone(), gpu.memory_ceiling());
        log::info!(
            "Texture streaming: {} fetch workers, {} assembly, target {} bytes",
            config.fetch_workers,
            if creation.is_threaded() { "threaded" } else { "inline" },
            budget.target()
        );

        Ok(Self {
            scorer: PriorityScorer::from_config(&config),
            eviction: EvictionPolicy::from_config(&config),
            config,
            clock,
            budget,
            fetch,
            creation,
            gpu,
            memory,
            registry: IndexMap::with_hasher(Hasher::new()),
            references: ReferenceTable::new(),
            rescore_cursor: RoundRobin::new(),
            sweep_cursor: RoundRobin::new(),
            fetch_queue: IndexSet::with_hasher(Hasher::new()),
            creation_queue: VecDeque::new(),
            ready: VecDeque::new(),
            pending_snapshots: AHashMap::new(),
            placeholder,
            next_generation: 1,
            next_queue_seq: 0,
            evictions: 0,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Install a callback invoked on every GPU allocation and free
    pub fn set_accounting_callback<F>(&mut self, callback: F)
    where
        F: Fn(AccountingEvent) + 'static,
    {
        self.creation.set_accounting_callback(Box::new(callback));
    }

    /// Return the resource for `key`, registering it if needed
    ///
    /// Idempotent for live resources. A tombstone is replaced by a fresh
    /// resource with a new generation. A hint's boost, when present, replaces
    /// the boost of an existing resource.
    pub fn get_or_create(&mut self, key: TextureKey, hint: FetchHint) -> TextureHandle {
        let now = self.clock.now();

        if let Some(res) = self.registry.get_mut(&key).filter(|r| !r.is_evicted()) {
            if res.ladder.is_none() {
                if let Some((width, height)) = hint.full_size {
                    res.ladder = Some(DiscardLadder::new(
                        width,
                        height,
                        self.config.max_discard_level,
                    ));
                }
            }
            if let Some(boost) = hint.boost {
                res.boost = boost;
            }
            if res.virtual_size <= 0.0 {
                if let Some(size) = hint.initial_virtual_size {
                    res.virtual_size = size.max(0.0);
                }
            }
            return res.handle();
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let res = TextureResource::new(key, generation, &hint, self.config.max_discard_level, now);
        log::trace!("Registered {} (generation {})", key, generation);
        self.registry.insert(key, res);

        if hint.initial_virtual_size.is_some() {
            self.refresh(key);
        }
        TextureHandle { key, generation }
    }

    /// Whether a handle still names a live resource
    pub fn is_valid(&self, handle: TextureHandle) -> bool {
        self.registry
            .get(&handle.key)
            .is_some_and(|r| !r.is_evicted() && r.generation() == handle.generation)
    }

    /// A surface or volume starts using `key`
    pub fn reference(&mut self, key: TextureKey, consumer: ConsumerId) -> TextureHandle {
        let handle = self.get_or_create(key, FetchHint::default());
        let now = self.clock.now();
        self.references.add(key, consumer);
        if let Some(res) = self.registry.get_mut(&key) {
            res.reactivate(now);
        }
        self.refresh(key);
        handle
    }

    /// A surface or volume stops using `key`
    pub fn unreference(&mut self, key: TextureKey, consumer: ConsumerId) {
        let now = self.clock.now();
        let emptied = self.references.remove(key, consumer);
        let Some(res) = self.registry.get_mut(&key) else {
            return;
        };
        res.touch(now);
        if emptied {
            res.deactivate();
            if res.fetch_in_flight() {
                self.fetch.cancel(key);
            }
            log::trace!("{} has no references", key);
        }
    }

    /// Number of consumers of `key`
    pub fn reference_count(&self, key: TextureKey) -> usize {
        self.references.count(key)
    }

    /// Record this frame's footprint of one surface using `key`
    pub fn report_footprint(&mut self, key: TextureKey, footprint: &Footprint) {
        let score = self.scorer.score(footprint);
        match self.registry.get_mut(&key) {
            Some(res) if !res.is_evicted() => res.record_score(score.virtual_size, score.importance),
            _ => log::trace!("Footprint for unknown texture {}", key),
        }
    }

    /// GPU handle for drawing `key`
    ///
    /// The real handle while resident, the placeholder when the content is
    /// missing, otherwise none.
    pub fn gpu_handle_for(&self, key: TextureKey) -> Option<GpuHandle> {
        let res = self.registry.get(&key)?;
        if res.state() == ResourceState::Resident {
            return res.payload().map(|p| p.handle);
        }
        if res.is_missing() && !res.is_evicted() {
            return self.placeholder_handle();
        }
        None
    }

    /// Best handle to draw right now
    ///
    /// Unlike [`Scheduler::gpu_handle_for`] this keeps returning the old
    /// payload while a finer level is being fetched.
    pub fn display_handle_for(&self, key: TextureKey) -> Option<GpuHandle> {
        let res = self.registry.get(&key)?;
        if let Some(payload) = res.payload() {
            return Some(payload.handle);
        }
        if res.is_missing() && !res.is_evicted() {
            return self.placeholder_handle();
        }
        None
    }

    /// Handle of the placeholder texture
    pub fn placeholder_handle(&self) -> Option<GpuHandle> {
        self.placeholder.map(|p| p.handle)
    }

    /// Assign a boost class; returns false for unknown keys
    pub fn set_boost(&mut self, key: TextureKey, boost: BoostClass) -> bool {
        let Some(res) = self.registry.get_mut(&key).filter(|r| !r.is_evicted()) else {
            return false;
        };
        res.boost = boost;
        self.refresh(key);
        true
    }

    /// Clear a missing flag so the texture is fetched again
    pub fn rerequest(&mut self, key: TextureKey) -> bool {
        let Some(res) = self.registry.get_mut(&key).filter(|r| !r.is_evicted()) else {
            return false;
        };
        res.clear_failure();
        log::debug!("Re-requesting {}", key);
        self.refresh(key);
        true
    }

    /// Resource for `key`, including tombstones
    pub fn resource(&self, key: TextureKey) -> Option<&TextureResource> {
        self.registry.get(&key)
    }

    /// State of `key`
    pub fn state_of(&self, key: TextureKey) -> Option<ResourceState> {
        self.registry.get(&key).map(|r| r.state())
    }

    /// Registered resources, tombstones included
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Current discard bias
    pub fn discard_bias(&self) -> f32 {
        self.budget.bias()
    }

    /// Budget controller state
    pub fn budget(&self) -> &BudgetController {
        &self.budget
    }

    /// GPU byte counters
    pub fn memory(&self) -> &Arc<MemoryStats> {
        &self.memory
    }

    /// Counters across the whole registry
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for res in self.registry.values() {
            stats.count_state(res.state());
            stats.resident_bytes += res.gpu_bytes();
            if res.is_missing() {
                stats.missing += 1;
            }
        }
        stats.gpu_bytes = self.memory.current();
        stats.peak_gpu_bytes = self.memory.peak_usage();
        stats.target_bytes = self.budget.target();
        stats.over_budget = self.budget.over_budget();
        stats.budget_observations = self.budget.observations();
        stats.discard_bias = self.budget.bias();
        stats.fetches_in_flight = self.fetch.in_flight();
        stats.creations_outstanding = self.creation.outstanding() + self.ready.len();
        stats.fetches_issued = self.fetch.issued();
        stats.fetches_failed = self.fetch.failed();
        stats.creations = self.creation.created();
        stats.evictions = self.evictions;
        stats
    }

    /// Resident textures with their last virtual size, largest first
    pub fn manifest(&self) -> Manifest {
        Manifest::new(
            self.registry
                .values()
                .filter(|r| r.state() == ResourceState::Resident && r.virtual_size() > 0.0)
                .map(|r| ManifestEntry {
                    key: r.key(),
                    virtual_size: r.virtual_size(),
                    boost: r.boost_class(),
                })
                .collect(),
        )
    }

    /// Register textures from a previous session so they are fetched early
    ///
    /// Entries without a payload stay queued and are skipped by the eviction
    /// sweep until they become resident or `manifest_hold` runs out. From then
    /// on the usual grace periods apply. Returns the number of entries applied.
    pub fn apply_manifest(&mut self, manifest: &Manifest) -> usize {
        let hold_until = self.clock.now() + self.config.manifest_hold();
        let mut applied = 0;
        for entry in &manifest.entries {
            if !entry.virtual_size.is_finite() || entry.virtual_size <= 0.0 {
                log::debug!("Skipping manifest entry {} with size {}", entry.key, entry.virtual_size);
                continue;
            }
            self.get_or_create(
                entry.key,
                FetchHint {
                    boost: Some(entry.boost),
                    initial_virtual_size: Some(entry.virtual_size),
                    ..FetchHint::default()
                },
            );
            if let Some(res) = self.registry.get_mut(&entry.key) {
                if res.payload().is_none() && !res.is_missing() {
                    res.hold(hold_until);
                }
            }
            self.refresh(entry.key);
            applied += 1;
        }
        log::debug!("Applied {} of {} manifest entries", applied, manifest.len());
        applied
    }

    /// Run one bounded pass; `time_budget` bounds the finalization phase
    ///
    /// A zero budget finalizes nothing. Otherwise the first upload of the
    /// tick always goes through, even when its estimated cost alone exceeds
    /// the budget, so an expensive texture cannot be postponed forever; every
    /// further upload must fit in what is left.
    pub fn tick(&mut self, time_budget: Duration) -> TickReport {
        let _timer = ScopedTimer::traced("texture_tick");
        let now = self.clock.now();
        let mut report = TickReport::default();

        report.fetch_events = self.process_fetch_events(now);
        report.discard_bias = self.budget.observe(self.memory.current());
        report.rescored = self.rescore(now);
        report.fetches_dispatched = self.dispatch_fetches(now);
        report.creations_submitted = self.submit_creations();
        self.finalize_creations(now, time_budget, &mut report);
        self.sweep(now, &mut report);

        report
    }

    /// Recompute the desired level of one resource and queue a fetch if needed
    fn refresh(&mut self, key: TextureKey) {
        let bias = self.budget.bias();
        let now = self.clock.now();
        let Some(res) = self.registry.get_mut(&key) else {
            return;
        };
        update_desired(res, &self.scorer, bias, self.config.initial_discard_level);
        if res
            .fetch_target(now, self.config.initial_discard_level, bias > 1.0)
            .is_some()
        {
            enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
        }
    }

    fn process_fetch_events(&mut self, now: Instant) -> usize {
        let events = self.fetch.poll(now);
        let count = events.len();
        let backoff = self.config.retry_backoff();
        let level_limit = self.config.max_discard_level;
        let bias = self.budget.bias();

        for event in events {
            let key = event.key();
            let ticket = event.ticket();
            let Some(res) = self.registry.get_mut(&key) else {
                continue;
            };
            if res.fetch_ticket != Some(ticket) {
                log::trace!("Discarding stale fetch result for {} ({:?})", key, ticket);
                continue;
            }

            match event {
                FetchEvent::Fetched { .. } => res.mark_decoding(),
                FetchEvent::Decoded {
                    image, from_snapshot, ..
                } => {
                    if !res.accepts_level(image.discard_level) {
                        log::trace!(
                            "Dropping level {} for {}; resident payload is finer",
                            image.discard_level,
                            key
                        );
                        res.abandon_fetch();
                        continue;
                    }
                    if !from_snapshot && self.fetch.wants_snapshot(&image) {
                        self.pending_snapshots.insert(key, image.clone());
                    }
                    res.accept_image(image, level_limit, from_snapshot);
                    update_desired(res, &self.scorer, bias, self.config.initial_discard_level);
                    self.creation_queue.push_back(key);
                }
                FetchEvent::SnapshotMiss { .. } => {
                    res.abandon_fetch();
                    enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
                }
                FetchEvent::Failed { error, .. } => {
                    match res.fail(&error, now, backoff) {
                        FailureOutcome::Missing => {
                            log::warn!("Texture {} is unavailable: {}", key, error);
                        }
                        FailureOutcome::Retrying => {
                            log::warn!("Fetch of {} failed, retrying: {}", key, error);
                            enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
                        }
                        FailureOutcome::Deferred => {
                            enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
                        }
                    }
                }
            }
        }
        count
    }

    fn rescore(&mut self, now: Instant) -> usize {
        let bias = self.budget.bias();
        let initial = self.config.initial_discard_level;
        let allow_downgrade = bias > 1.0;
        let slice = self
            .rescore_cursor
            .next_slice(self.registry.len(), self.config.rescore_slice);

        let mut rescored = 0;
        for index in slice {
            let Some((_, res)) = self.registry.get_index_mut(index) else {
                continue;
            };
            if res.is_evicted() {
                continue;
            }
            res.close_window();
            update_desired(res, &self.scorer, bias, initial);
            if res.fetch_target(now, initial, allow_downgrade).is_some() {
                enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
            }
            rescored += 1;
        }
        rescored
    }

    fn dispatch_fetches(&mut self, now: Instant) -> usize {
        let capacity = self
            .config
            .max_concurrent_fetches
            .saturating_sub(self.fetch.in_flight());
        if capacity == 0 || self.fetch_queue.is_empty() {
            return 0;
        }

        let registry = &self.registry;
        self.fetch_queue
            .retain(|key| registry.get(key).is_some_and(|r| !r.is_evicted()));

        let mut order: Vec<(TextureKey, f32, u64)> = self
            .fetch_queue
            .iter()
            .filter_map(|key| self.registry.get(key).map(|r| (*key, r.importance, r.queue_seq)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));

        let initial = self.config.initial_discard_level;
        let allow_downgrade = self.budget.bias() > 1.0;
        let backoff = self.config.retry_backoff();
        let mut dispatched = 0;

        for (key, _, _) in order {
            if dispatched == capacity {
                break;
            }
            let Some(res) = self.registry.get_mut(&key) else {
                continue;
            };
            let Some(level) = res.fetch_target(now, initial, allow_downgrade) else {
                let backing_off = !res.missing && res.retry_not_before.is_some_and(|t| now < t);
                if !backing_off {
                    self.fetch_queue.swap_remove(&key);
                }
                continue;
            };
            self.fetch_queue.swap_remove(&key);

            let use_snapshot =
                self.fetch.has_fast_path() && !res.fast_path_tried && res.payload().is_none();
            let result = if use_snapshot {
                res.fast_path_tried = true;
                self.fetch.request_snapshot(key, now)
            } else {
                self.fetch.request_fetch(key, level, now)
            };

            match result {
                Ok(ticket) => {
                    res.begin_fetch(ticket, level);
                    dispatched += 1;
                }
                Err(err) => {
                    log::debug!("Could not dispatch fetch for {}: {}", key, err);
                    if res.fail(&err, now, backoff) != FailureOutcome::Missing {
                        enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
                    }
                }
            }
        }
        dispatched
    }

    fn submit_creations(&mut self) -> usize {
        let byte_budget = self.config.max_creation_bytes_per_tick;
        let mut bytes = 0u64;
        let mut submitted = 0;

        while self.creation.has_capacity() {
            let Some(&key) = self.creation_queue.front() else {
                break;
            };
            let Some(res) = self.registry.get_mut(&key) else {
                self.creation_queue.pop_front();
                continue;
            };
            let Some(size) = res
                .pending_image
                .as_ref()
                .filter(|_| res.creation_ticket.is_none())
                .map(|image| image.byte_len())
            else {
                self.creation_queue.pop_front();
                continue;
            };
            // Always admit one image so a large texture cannot stall the queue
            if submitted > 0 && bytes + size > byte_budget {
                break;
            }
            self.creation_queue.pop_front();

            let Some(image) = res.pending_image.take() else {
                continue;
            };
            let ticket = self.creation.submit(key, image);
            res.creation_ticket = Some(ticket);
            bytes += size;
            submitted += 1;
        }
        submitted
    }

    fn finalize_creations(&mut self, now: Instant, time_budget: Duration, report: &mut TickReport) {
        let stopwatch = Stopwatch::new();
        for assembled in self.creation.drain_ready() {
            self.ready.push_back(ReadyUpload {
                key: assembled.key,
                ticket: assembled.ticket,
                result: assembled.result,
            });
        }

        let acute = self.budget.acute_pressure();
        let backoff = self.config.retry_backoff();
        let mut deferred = Vec::new();

        while let Some(item) = self.ready.pop_front() {
            let key = item.key;
            let Some(res) = self
                .registry
                .get_mut(&key)
                .filter(|r| r.creation_ticket == Some(item.ticket))
            else {
                log::trace!("Discarding stale creation for {}", key);
                self.pending_snapshots.remove(&key);
                continue;
            };

            let upload = match item.result {
                Ok(upload) => upload,
                Err(err) => {
                    self.pending_snapshots.remove(&key);
                    if res.fail(&err, now, backoff) == FailureOutcome::Missing {
                        log::warn!("Texture {} cannot be created: {}", key, err);
                    } else {
                        enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
                    }
                    continue;
                }
            };

            let requested = self.gpu.allocation_size(&upload);
            let grows = res.payload().is_some_and(|p| requested > p.bytes);
            if acute && grows && !res.boost.forces_full_resolution() {
                let declined = CacheError::OutOfBudget {
                    requested,
                    used: self.budget.last_used(),
                    target: self.budget.target(),
                };
                log::trace!("Deferring creation of {}: {}", key, declined);
                report.creations_deferred += 1;
                deferred.push(ReadyUpload {
                    key,
                    ticket: item.ticket,
                    result: Ok(upload),
                });
                continue;
            }

            let allowed = if report.creations_finalized == 0 {
                !time_budget.is_zero()
            } else {
                stopwatch.fits(time_budget, self.creation.estimated_upload_cost())
            };
            if !allowed {
                self.ready.push_front(ReadyUpload {
                    key,
                    ticket: item.ticket,
                    result: Ok(upload),
                });
                break;
            }

            match self.creation.finalize(self.gpu.as_mut(), &upload) {
                Ok(payload) => {
                    if let Some(old) = res.install_payload(payload) {
                        self.creation.release(self.gpu.as_mut(), key, old);
                    }
                    report.creations_finalized += 1;
                    if let Some(image) = self.pending_snapshots.remove(&key) {
                        self.fetch.store_snapshot(key, image);
                    }
                    if res
                        .fetch_target(now, self.config.initial_discard_level, self.budget.bias() > 1.0)
                        .is_some()
                    {
                        enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
                    } else {
                        res.release_hold(now);
                    }
                }
                Err(err) => {
                    self.pending_snapshots.remove(&key);
                    log::warn!("Upload of {} failed: {}", key, err);
                    if res.fail(&err, now, backoff) != FailureOutcome::Missing {
                        enqueue(&mut self.fetch_queue, res, &mut self.next_queue_seq);
                    }
                }
            }
        }

        report.creations_postponed = self.ready.len();
        self.ready.extend(deferred);
        report.creation_time = stopwatch.elapsed();
    }

    fn sweep(&mut self, now: Instant, report: &mut TickReport) {
        let scale = self.budget.grace_scale();
        let acute = self.budget.acute_pressure();
        let retention = self.config.tombstone_retention();
        let slice = self
            .sweep_cursor
            .next_slice(self.registry.len(), self.config.eviction_slice);

        let mut purge = Vec::new();
        for index in slice {
            let Some((&key, res)) = self.registry.get_index_mut(index) else {
                continue;
            };
            let referenced = self.references.is_referenced(key);

            // Active -> Inactive -> Candidate -> Evicted can all happen in one visit
            for _ in 0..3 {
                match self.eviction.evaluate(res, referenced, now, scale, acute) {
                    EvictionStep::Keep => break,
                    EvictionStep::Deactivate => res.deactivate(),
                    EvictionStep::Promote => {
                        log::trace!("{} is an eviction candidate", key);
                        res.promote_to_candidate();
                    }
                    EvictionStep::Evict => {
                        if let Some(payload) = res.evict(now) {
                            self.creation.release(self.gpu.as_mut(), key, payload);
                        }
                        self.fetch.abandon(key);
                        self.fetch_queue.swap_remove(&key);
                        self.pending_snapshots.remove(&key);
                        self.evictions += 1;
                        report.evicted += 1;
                        log::debug!("Evicted {}", key);
                        break;
                    }
                }
            }

            if res.is_evicted()
                && res
                    .evicted_at
                    .is_some_and(|t| now.saturating_duration_since(t) >= retention)
            {
                purge.push(key);
            }
        }

        for key in purge {
            self.registry.swap_remove(&key);
            report.purged += 1;
        }
    }

    fn release_all(&mut self) {
        for (&key, res) in self.registry.iter_mut() {
            if let Some(payload) = res.payload.take() {
                self.creation.release(self.gpu.as_mut(), key, payload);
            }
        }
        if let Some(placeholder) = self.placeholder.take() {
            self.creation.release(self.gpu.as_mut(), PLACEHOLDER_KEY, placeholder);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn update_desired(res: &mut TextureResource, scorer: &PriorityScorer, bias: f32, initial_level: u8) {
    if res.virtual_size <= 0.0 && !res.boost.forces_full_resolution() {
        return;
    }
    let level = match res.ladder {
        Some(ladder) => {
            let size = res.virtual_size.max(scorer.min_virtual_size());
            scorer.desired_level(size, &ladder, bias, res.boost, res.importance)
        }
        None => initial_level,
    };
    res.desired_level = Some(level);
}

fn enqueue(queue: &mut IndexSet<TextureKey, Hasher>, res: &mut TextureResource, seq: &mut u64) {
    if queue.insert(res.key()) {
        res.queue_seq = *seq;
        *seq += 1;
    }
}

/// Two-tone RGBA checkerboard in 2x2 pixel cells
fn checkerboard(size: u32) -> RawImage {
    let edge = size as usize;
    let mut data = Vec::with_capacity(edge * edge * 4);
    for y in 0..size {
        for x in 0..size {
            let value = if ((x / 2) + (y / 2)) % 2 == 0 { 0xff } else { 0x40 };
            data.extend_from_slice(&[value, 0x00, value, 0xff]);
        }
    }
    RawImage {
        width: size,
        height: size,
        components: 4,
        discard_level: 0,
        full_width: size,
        full_height: size,
        source: ImageSource::Local,
        data,
    }
}

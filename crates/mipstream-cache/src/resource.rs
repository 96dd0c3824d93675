//! Texture Resources
//!
//! The cached entity: identity, discard ladder, lifecycle and pipeline stage.
//!
//! The public [`ResourceState`] is derived from three independent facts held
//! by the resource: its lifecycle (referenced, inactive, candidate, evicted),
//! the pipeline stage of any in-flight work, and whether a GPU payload exists.
//! Keeping them apart means an inactive resource remembers which stage it was
//! in, so reactivation resumes exactly where it left off.

use std::time::Instant;

use mipstream_core::TextureKey;
use mipstream_core::math::{discard_dimension, max_discard_for};
use serde::{Deserialize, Serialize};

use crate::backend::{GpuHandle, ImageSource, RawImage};
use crate::creation::CreationTicket;
use crate::fetch::FetchTicket;
use crate::{CacheError, RetryPolicy};

/// Externally assigned priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BoostClass {
    /// Ordinary scene content
    #[default]
    Scene,
    /// Large ground surfaces, slightly favoured under pressure
    Terrain,
    /// Textures an avatar needs to look correct
    AvatarCritical,
    /// Interface chrome, always full resolution
    Ui,
    /// Never evicted for the lifetime of the process
    Permanent,
}

impl BoostClass {
    /// Whether this tier always wants discard level 0
    pub fn forces_full_resolution(&self) -> bool {
        matches!(self, Self::Ui)
    }

    /// Whether this tier is exempt from eviction
    pub fn exempt_from_eviction(&self) -> bool {
        matches!(self, Self::Permanent)
    }

    /// Lowest importance a resource of this tier reports
    pub fn importance_floor(&self) -> f32 {
        match self {
            Self::Scene => 0.0,
            Self::Terrain => 0.2,
            Self::AvatarCritical => 0.75,
            Self::Ui => 1.0,
            Self::Permanent => 0.5,
        }
    }

    /// Share of the global discard bias applied to this tier
    pub fn bias_weight(&self) -> f32 {
        match self {
            Self::Scene => 1.0,
            Self::Terrain => 0.8,
            Self::AvatarCritical => 0.5,
            Self::Ui => 0.0,
            Self::Permanent => 0.5,
        }
    }
}

/// Externally visible resource state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Unrequested,
    Fetching,
    Decoding,
    PendingCreation,
    Resident,
    Inactive,
    EvictionCandidate,
    Evicted,
}

impl ResourceState {
    /// Whether the state is the terminal one
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Evicted)
    }
}

/// Reference-driven lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Active,
    Inactive,
    Candidate,
    Evicted,
}

/// Stage of the fetch/creation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineStage {
    Idle,
    Fetching,
    Decoding,
    PendingCreation,
}

/// Resolutions available for a texture, finest at level 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardLadder {
    pub full_width: u32,
    pub full_height: u32,
    /// Coarsest usable level
    pub max_level: u8,
}

impl DiscardLadder {
    /// Build a ladder limited to `level_limit` and to a one-pixel edge
    pub fn new(full_width: u32, full_height: u32, level_limit: u8) -> Self {
        let full_width = full_width.max(1);
        let full_height = full_height.max(1);
        Self {
            full_width,
            full_height,
            max_level: max_discard_for(full_width, full_height).min(level_limit),
        }
    }

    /// Dimensions at a level
    pub fn dimensions(&self, level: u8) -> (u32, u32) {
        let level = self.clamp(level);
        (
            discard_dimension(self.full_width, level),
            discard_dimension(self.full_height, level),
        )
    }

    /// Clamp a level onto the ladder
    pub fn clamp(&self, level: u8) -> u8 {
        level.min(self.max_level)
    }

    /// Pixel area at level 0
    pub fn full_area(&self) -> f32 {
        self.full_width as f32 * self.full_height as f32
    }
}

/// Handle returned to collaborators; stale once its resource is evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    pub key: TextureKey,
    pub generation: u64,
}

/// Seed information supplied when a texture is first registered
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchHint {
    /// Level-0 dimensions when already known
    pub full_size: Option<(u32, u32)>,
    /// Boost to assign; `None` leaves an existing resource's boost alone
    pub boost: Option<BoostClass>,
    pub source: ImageSource,
    /// Virtual size remembered from a previous session
    pub initial_virtual_size: Option<f32>,
}

impl FetchHint {
    /// Hint carrying only a boost class
    pub fn boosted(boost: BoostClass) -> Self {
        Self {
            boost: Some(boost),
            ..Self::default()
        }
    }
}

/// GPU texture currently owned by a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuPayload {
    pub handle: GpuHandle,
    pub level: u8,
    pub bytes: u64,
    pub width: u32,
    pub height: u32,
}

/// What a failure did to the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    /// Will be retried automatically after the backoff
    Retrying,
    /// Marked missing until re-requested
    Missing,
    /// Not counted as a failure; retried next tick
    Deferred,
}

/// A streamed texture and its bookkeeping
#[derive(Debug)]
pub struct TextureResource {
    key: TextureKey,
    generation: u64,
    pub(crate) ladder: Option<DiscardLadder>,
    pub(crate) source: ImageSource,
    pub(crate) boost: BoostClass,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) stage: PipelineStage,
    pub(crate) payload: Option<GpuPayload>,
    pub(crate) desired_level: Option<u8>,
    pub(crate) virtual_size: f32,
    pub(crate) importance: f32,
    /// Largest virtual size reported since the last rescoring
    pub(crate) window_virtual_size: f32,
    pub(crate) window_importance: f32,
    pub(crate) touched_in_window: bool,
    pub(crate) pending_image: Option<RawImage>,
    pub(crate) fetch_ticket: Option<FetchTicket>,
    pub(crate) requested_level: Option<u8>,
    pub(crate) creation_ticket: Option<CreationTicket>,
    pub(crate) retries: u8,
    pub(crate) retry_not_before: Option<Instant>,
    pub(crate) missing: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) fast_path_tried: bool,
    pub(crate) from_snapshot: bool,
    pub(crate) last_touched: Instant,
    pub(crate) evicted_at: Option<Instant>,
    /// Kept queued and out of the sweep until resident or this instant
    pub(crate) held_until: Option<Instant>,
    pub(crate) queue_seq: u64,
}

impl TextureResource {
    pub(crate) fn new(
        key: TextureKey,
        generation: u64,
        hint: &FetchHint,
        level_limit: u8,
        now: Instant,
    ) -> Self {
        let boost = hint.boost.unwrap_or_default();
        Self {
            key,
            generation,
            ladder: hint
                .full_size
                .map(|(w, h)| DiscardLadder::new(w, h, level_limit)),
            source: hint.source,
            boost,
            lifecycle: Lifecycle::Active,
            stage: PipelineStage::Idle,
            payload: None,
            desired_level: None,
            virtual_size: hint.initial_virtual_size.unwrap_or(0.0).max(0.0),
            importance: boost.importance_floor(),
            window_virtual_size: 0.0,
            window_importance: 0.0,
            touched_in_window: false,
            pending_image: None,
            fetch_ticket: None,
            requested_level: None,
            creation_ticket: None,
            retries: 0,
            retry_not_before: None,
            missing: false,
            last_error: None,
            fast_path_tried: false,
            from_snapshot: false,
            last_touched: now,
            evicted_at: None,
            held_until: None,
            queue_seq: 0,
        }
    }

    /// Content key
    pub fn key(&self) -> TextureKey {
        self.key
    }

    /// Registration generation; bumps every time the key is re-registered
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Handle identifying this incarnation
    pub fn handle(&self) -> TextureHandle {
        TextureHandle {
            key: self.key,
            generation: self.generation,
        }
    }

    /// Derived externally visible state
    pub fn state(&self) -> ResourceState {
        match self.lifecycle {
            Lifecycle::Evicted => ResourceState::Evicted,
            Lifecycle::Candidate => ResourceState::EvictionCandidate,
            Lifecycle::Inactive => ResourceState::Inactive,
            Lifecycle::Active => match self.stage {
                PipelineStage::Fetching => ResourceState::Fetching,
                PipelineStage::Decoding => ResourceState::Decoding,
                PipelineStage::PendingCreation => ResourceState::PendingCreation,
                PipelineStage::Idle if self.payload.is_some() => ResourceState::Resident,
                PipelineStage::Idle => ResourceState::Unrequested,
            },
        }
    }

    /// Discard ladder, once dimensions are known
    pub fn ladder(&self) -> Option<DiscardLadder> {
        self.ladder
    }

    /// Level of the uploaded payload
    pub fn resident_level(&self) -> Option<u8> {
        self.payload.map(|p| p.level)
    }

    /// Level the scorer currently wants
    pub fn desired_level(&self) -> Option<u8> {
        self.desired_level
    }

    /// Latest importance score
    pub fn importance(&self) -> f32 {
        self.importance
    }

    /// Latest virtual size score
    pub fn virtual_size(&self) -> f32 {
        self.virtual_size
    }

    /// Priority tier
    pub fn boost_class(&self) -> BoostClass {
        self.boost
    }

    /// Whether the content was confirmed missing or unusable
    pub fn is_missing(&self) -> bool {
        self.missing
    }

    /// Description of the most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Timestamp of the last reference-set change
    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    /// Bytes held on the GPU
    pub fn gpu_bytes(&self) -> u64 {
        self.payload.map(|p| p.bytes).unwrap_or(0)
    }

    /// Whether a fetch ticket is outstanding
    pub fn fetch_in_flight(&self) -> bool {
        self.fetch_ticket.is_some()
    }

    pub(crate) fn payload(&self) -> Option<GpuPayload> {
        self.payload
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.lifecycle == Lifecycle::Evicted
    }

    /// Whether a manifest hold still protects the resource
    pub fn is_held(&self, now: Instant) -> bool {
        self.held_until.is_some_and(|until| now < until)
    }

    pub(crate) fn hold(&mut self, until: Instant) {
        self.held_until = Some(until);
    }

    /// End a hold; the grace periods start counting from `now`
    pub(crate) fn release_hold(&mut self, now: Instant) {
        if self.held_until.take().is_some() {
            self.last_touched = now;
        }
    }

    /// Level to fetch next, if any
    ///
    /// `allow_downgrade` lets an over-budget cache replace a payload that is
    /// at least two levels finer than wanted with a coarser one.
    pub(crate) fn fetch_target(
        &self,
        now: Instant,
        initial_level: u8,
        allow_downgrade: bool,
    ) -> Option<u8> {
        if !self.is_active()
            || self.stage != PipelineStage::Idle
            || self.missing
            || self.fetch_ticket.is_some()
        {
            return None;
        }
        if self.retry_not_before.is_some_and(|t| now < t) {
            return None;
        }
        let desired = self.desired_level?;

        let Some(ladder) = self.ladder else {
            return Some(initial_level.max(desired));
        };
        let desired = ladder.clamp(desired);

        match self.payload {
            None => Some(desired),
            Some(payload) if desired < payload.level => Some(desired),
            Some(payload) if allow_downgrade && desired >= payload.level.saturating_add(2) => {
                Some(desired)
            }
            Some(_) => None,
        }
    }

    /// Whether an in-flight result for `level` should replace the payload
    ///
    /// Finer or equal results always win. A coarser result is only kept when
    /// the scorer has itself moved to that level or coarser.
    pub(crate) fn accepts_level(&self, level: u8) -> bool {
        match self.payload {
            None => true,
            Some(payload) if level <= payload.level => true,
            Some(_) => self.desired_level.is_some_and(|d| d >= level),
        }
    }

    pub(crate) fn begin_fetch(&mut self, ticket: FetchTicket, level: u8) {
        self.fetch_ticket = Some(ticket);
        self.requested_level = Some(level);
        self.stage = PipelineStage::Fetching;
        log::trace!("{} fetching level {} ({:?})", self.key, level, ticket);
    }

    pub(crate) fn mark_decoding(&mut self) {
        if self.stage == PipelineStage::Fetching {
            self.stage = PipelineStage::Decoding;
        }
    }

    /// Store a decoded image and adopt its ladder
    pub(crate) fn accept_image(&mut self, image: RawImage, level_limit: u8, from_snapshot: bool) {
        if self.ladder.is_none() || !from_snapshot {
            self.ladder = Some(DiscardLadder::new(
                image.full_width,
                image.full_height,
                level_limit,
            ));
        }
        if image.source == ImageSource::Local {
            self.source = ImageSource::Local;
        }
        self.fetch_ticket = None;
        self.requested_level = None;
        self.from_snapshot = from_snapshot;
        self.pending_image = Some(image);
        self.stage = PipelineStage::PendingCreation;
    }

    /// Drop a fetch without counting it as a failure
    pub(crate) fn abandon_fetch(&mut self) {
        self.fetch_ticket = None;
        self.requested_level = None;
        if matches!(self.stage, PipelineStage::Fetching | PipelineStage::Decoding) {
            self.stage = PipelineStage::Idle;
        }
    }

    /// Install a new payload, returning the one it replaces
    pub(crate) fn install_payload(&mut self, payload: GpuPayload) -> Option<GpuPayload> {
        self.creation_ticket = None;
        self.pending_image = None;
        self.stage = PipelineStage::Idle;
        self.retries = 0;
        self.retry_not_before = None;
        self.missing = false;
        self.last_error = None;
        self.payload.replace(payload)
    }

    /// Apply a fetch, decode or creation failure
    pub(crate) fn fail(
        &mut self,
        error: &CacheError,
        now: Instant,
        backoff: std::time::Duration,
    ) -> FailureOutcome {
        self.fetch_ticket = None;
        self.requested_level = None;
        self.creation_ticket = None;
        self.pending_image = None;
        self.stage = PipelineStage::Idle;
        self.last_error = Some(error.to_string());

        match error.retry_policy() {
            RetryPolicy::NextTick => FailureOutcome::Deferred,
            RetryPolicy::Once if self.retries == 0 => {
                self.retries = 1;
                self.retry_not_before = Some(now + backoff);
                FailureOutcome::Retrying
            }
            RetryPolicy::Once | RetryPolicy::Never => {
                self.missing = true;
                self.retry_not_before = None;
                FailureOutcome::Missing
            }
        }
    }

    /// Clear the missing flag so the next tick fetches again
    pub(crate) fn clear_failure(&mut self) {
        self.missing = false;
        self.retries = 0;
        self.retry_not_before = None;
        self.last_error = None;
        self.fast_path_tried = false;
    }

    /// Nothing references the resource; `last_touched` is left as it was
    pub(crate) fn deactivate(&mut self) {
        if self.lifecycle == Lifecycle::Active {
            self.lifecycle = Lifecycle::Inactive;
        }
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_touched = now;
    }

    /// A reference arrived before eviction
    pub(crate) fn reactivate(&mut self, now: Instant) {
        if matches!(self.lifecycle, Lifecycle::Inactive | Lifecycle::Candidate) {
            self.lifecycle = Lifecycle::Active;
        }
        self.last_touched = now;
    }

    pub(crate) fn promote_to_candidate(&mut self) {
        if self.lifecycle == Lifecycle::Inactive {
            self.lifecycle = Lifecycle::Candidate;
        }
    }

    /// Terminal transition; returns the payload that must be released
    pub(crate) fn evict(&mut self, now: Instant) -> Option<GpuPayload> {
        self.lifecycle = Lifecycle::Evicted;
        self.held_until = None;
        self.stage = PipelineStage::Idle;
        self.pending_image = None;
        self.fetch_ticket = None;
        self.requested_level = None;
        self.creation_ticket = None;
        self.evicted_at = Some(now);
        self.payload.take()
    }

    /// Fold a scorer result into the current scoring window
    pub(crate) fn record_score(&mut self, virtual_size: f32, importance: f32) {
        self.window_virtual_size = self.window_virtual_size.max(virtual_size);
        self.window_importance = self.window_importance.max(importance);
        self.touched_in_window = true;
    }

    /// Close the scoring window; untouched resources keep their last score
    pub(crate) fn close_window(&mut self) {
        if self.touched_in_window {
            self.virtual_size = self.window_virtual_size;
            self.importance = self
                .window_importance
                .max(self.boost.importance_floor());
        }
        self.window_virtual_size = 0.0;
        self.window_importance = 0.0;
        self.touched_in_window = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resource() -> TextureResource {
        TextureResource::new(
            TextureKey::from_u128(1),
            1,
            &FetchHint::default(),
            5,
            Instant::now(),
        )
    }

    fn payload(level: u8) -> GpuPayload {
        GpuPayload {
            handle: GpuHandle(9),
            level,
            bytes: 64,
            width: 4,
            height: 4,
        }
    }

    #[test]
    fn test_boost_class_functions() {
        assert!(BoostClass::Ui.forces_full_resolution());
        assert!(!BoostClass::Scene.forces_full_resolution());
        assert!(BoostClass::Permanent.exempt_from_eviction());
        assert!(!BoostClass::AvatarCritical.exempt_from_eviction());
        assert_eq!(BoostClass::Ui.bias_weight(), 0.0);
        assert!(BoostClass::AvatarCritical.importance_floor() > BoostClass::Scene.importance_floor());
    }

    #[test]
    fn test_ladder() {
        let ladder = DiscardLadder::new(1024, 512, 5);
        assert_eq!(ladder.max_level, 5);
        assert_eq!(ladder.dimensions(0), (1024, 512));
        assert_eq!(ladder.dimensions(2), (256, 128));
        assert_eq!(ladder.dimensions(9), (32, 16));

        let tiny = DiscardLadder::new(8, 4, 5);
        assert_eq!(tiny.max_level, 2);
    }

    #[test]
    fn test_derived_states() {
        let mut res = resource();
        assert_eq!(res.state(), ResourceState::Unrequested);

        res.begin_fetch(FetchTicket(1), 5);
        assert_eq!(res.state(), ResourceState::Fetching);

        res.mark_decoding();
        assert_eq!(res.state(), ResourceState::Decoding);

        // Inactive hides the stage but remembers it
        res.deactivate();
        assert_eq!(res.state(), ResourceState::Inactive);
        res.reactivate(Instant::now());
        assert_eq!(res.state(), ResourceState::Decoding);

        res.accept_image(
            RawImage {
                width: 32,
                height: 32,
                components: 4,
                discard_level: 5,
                full_width: 1024,
                full_height: 1024,
                source: ImageSource::Network,
                data: vec![0; 32 * 32 * 4],
            },
            5,
            false,
        );
        assert_eq!(res.state(), ResourceState::PendingCreation);
        assert_eq!(res.ladder().unwrap().full_width, 1024);

        assert!(res.install_payload(payload(5)).is_none());
        assert_eq!(res.state(), ResourceState::Resident);
        assert_eq!(res.resident_level(), Some(5));

        res.deactivate();
        res.promote_to_candidate();
        assert_eq!(res.state(), ResourceState::EvictionCandidate);

        let released = res.evict(Instant::now());
        assert_eq!(released.map(|p| p.level), Some(5));
        assert_eq!(res.state(), ResourceState::Evicted);
        assert!(res.state().is_terminal());
    }

    #[test]
    fn test_fetch_target() {
        let now = Instant::now();
        let mut res = resource();
        // Nothing wanted yet
        assert_eq!(res.fetch_target(now, 5, false), None);

        // Unknown ladder starts at the initial level
        res.desired_level = Some(2);
        assert_eq!(res.fetch_target(now, 5, false), Some(5));

        res.ladder = Some(DiscardLadder::new(1024, 1024, 5));
        assert_eq!(res.fetch_target(now, 5, false), Some(2));

        res.install_payload(payload(5));
        assert_eq!(res.fetch_target(now, 5, false), Some(2));

        res.install_payload(payload(2));
        assert_eq!(res.fetch_target(now, 5, false), None);

        // Downgrade needs a two-level gap and permission
        res.desired_level = Some(4);
        assert_eq!(res.fetch_target(now, 5, false), None);
        assert_eq!(res.fetch_target(now, 5, true), Some(4));
        res.desired_level = Some(3);
        assert_eq!(res.fetch_target(now, 5, true), None);
    }

    #[test]
    fn test_accepts_level() {
        let mut res = resource();
        assert!(res.accepts_level(5));
        res.install_payload(payload(2));
        res.desired_level = Some(2);
        assert!(res.accepts_level(1));
        assert!(!res.accepts_level(4));
        res.desired_level = Some(4);
        assert!(res.accepts_level(4));
    }

    #[test]
    fn test_failure_retry_then_missing() {
        let now = Instant::now();
        let backoff = Duration::from_millis(500);
        let mut res = resource();
        res.desired_level = Some(0);

        let corrupt = CacheError::Corrupt("bad".into());
        assert_eq!(res.fail(&corrupt, now, backoff), FailureOutcome::Retrying);
        assert!(!res.is_missing());
        assert_eq!(res.fetch_target(now, 5, false), None);
        assert_eq!(res.fetch_target(now + backoff, 5, false), Some(5));

        assert_eq!(res.fail(&corrupt, now, backoff), FailureOutcome::Missing);
        assert!(res.is_missing());
        assert_eq!(res.state(), ResourceState::Unrequested);
        assert_eq!(res.fetch_target(now + backoff, 5, false), None);

        res.clear_failure();
        assert_eq!(res.fetch_target(now, 5, false), Some(5));
    }

    #[test]
    fn test_not_found_is_immediately_missing() {
        let mut res = resource();
        let outcome = res.fail(
            &CacheError::NotFound(res.key()),
            Instant::now(),
            Duration::ZERO,
        );
        assert_eq!(outcome, FailureOutcome::Missing);
        assert!(res.last_error().unwrap().contains("not found"));
    }

    #[test]
    fn test_scoring_window() {
        let mut res = resource();
        res.record_score(256.0, 0.2);
        res.record_score(1024.0, 0.1);
        res.close_window();
        assert_eq!(res.virtual_size(), 1024.0);
        assert_eq!(res.importance(), 0.2);

        // Untouched windows keep the previous score
        res.close_window();
        assert_eq!(res.virtual_size(), 1024.0);
    }

    #[test]
    fn test_hold_release_restarts_grace() {
        let start = Instant::now();
        let mut res = resource();
        res.hold(start + Duration::from_secs(10));
        assert!(res.is_held(start));
        assert!(!res.is_held(start + Duration::from_secs(10)));

        let later = start + Duration::from_secs(3);
        res.release_hold(later);
        assert!(!res.is_held(start));
        assert_eq!(res.last_touched(), later);

        // Releasing twice leaves the timestamp alone
        res.release_hold(start + Duration::from_secs(5));
        assert_eq!(res.last_touched(), later);
    }

    #[test]
    fn test_hint_without_boost_uses_default() {
        let res = resource();
        assert_eq!(res.boost_class(), BoostClass::Scene);

        let res = TextureResource::new(
            TextureKey::from_u128(2),
            1,
            &FetchHint::boosted(BoostClass::AvatarCritical),
            5,
            Instant::now(),
        );
        assert_eq!(res.boost_class(), BoostClass::AvatarCritical);
        assert_eq!(res.importance(), BoostClass::AvatarCritical.importance_floor());
    }
}

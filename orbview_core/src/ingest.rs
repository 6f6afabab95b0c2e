//! Sample Ingest Pipeline
//!
//! Routes bulk history and live telemetry into the track store:
//! - Bulk history: normalize, sort ascending, insert. Empty input leaves the
//!   track in its "not yet available" state; that is not an error.
//! - Live path: one sample per push event, gated by the track's monotonic
//!   timestamp check. Stale/duplicate deliveries are dropped and counted,
//!   never surfaced; an accepted sample advances the render clock and runs
//!   the opportunistic pruner.
//! - Offload (optional): raw batches cross to a worker thread over
//!   crossbeam channels and come back normalized in submission order. The
//!   pipeline stays correct without the worker; if it dies, later batches
//!   are normalized synchronously and the live path is untouched.

use crossbeam::channel::{unbounded, Receiver, Sender};
use nalgebra::{Quaternion, UnitQuaternion};
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;

use crate::orbview_clock::ClockSync;
use crate::orbview_geometry::{EntityId, Geodetic};
use crate::orbview_track::{
    Attitude, SampleOutcome, TelemetrySample, TrackError, TrackStore,
};

// ============================================================================
// RAW SAMPLES & NORMALIZATION
// ============================================================================

/// Telemetry record as delivered by the host, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Unix seconds
    pub t: f64,
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_m: f64,
    /// Body-to-ECEF rotation as [w, x, y, z], preferred when present
    pub quaternion: Option<[f64; 4]>,
    /// Fallback attitude: [heading, pitch, roll] degrees in the local ENU
    /// frame at the sample position
    pub euler_deg: Option<[f64; 3]>,
}

/// Parse a JSON array of raw records as delivered by wire-format feeds.
pub fn parse_raw_batch(json: &str) -> Result<Vec<RawSample>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Validate and convert one raw record. `None` means the record is
/// malformed and must be dropped (counted, not raised).
pub fn normalize(raw: &RawSample) -> Option<TelemetrySample> {
    let finite = raw.t.is_finite()
        && raw.lat_deg.is_finite()
        && raw.lon_deg.is_finite()
        && raw.alt_m.is_finite();
    if !finite {
        return None;
    }

    let attitude = if let Some([w, x, y, z]) = raw.quaternion {
        let q = Quaternion::new(w, x, y, z);
        if !q.norm().is_finite() || q.norm() < 1.0e-9 {
            return None;
        }
        Attitude::Quaternion(UnitQuaternion::from_quaternion(q))
    } else if let Some([heading, pitch, roll]) = raw.euler_deg {
        if !(heading.is_finite() && pitch.is_finite() && roll.is_finite()) {
            return None;
        }
        Attitude::EulerEnu {
            heading_deg: heading,
            pitch_deg: pitch,
            roll_deg: roll,
        }
    } else {
        Attitude::None
    };

    Some(TelemetrySample {
        timestamp: raw.t,
        position: Geodetic::new(raw.lat_deg, raw.lon_deg, raw.alt_m),
        attitude,
    })
}

// ============================================================================
// INGEST STATISTICS
// ============================================================================

/// Counters for the drop-don't-raise ingest policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted: u64,
    /// Timestamp at or before the track's newest sample
    pub stale_dropped: u64,
    /// Failed validation (non-finite fields, zero-norm quaternion)
    pub malformed_dropped: u64,
    /// Arrived for an entity already destroyed
    pub orphaned_dropped: u64,
}

// ============================================================================
// OFFLOAD CHANNEL
// ============================================================================

#[derive(Debug)]
struct OffloadRequest {
    entity: EntityId,
    batch: Vec<RawSample>,
}

#[derive(Debug)]
struct OffloadResponse {
    entity: EntityId,
    samples: Vec<TelemetrySample>,
    malformed: u64,
}

/// Message-passing normalization worker. No shared mutable memory: raw
/// batches go out, normalized samples come back, in submission order.
pub struct OffloadChannel {
    tx: Option<Sender<OffloadRequest>>,
    rx: Receiver<OffloadResponse>,
    worker: Option<JoinHandle<()>>,
}

impl OffloadChannel {
    /// Spawn the worker thread.
    pub fn spawn() -> Self {
        let (req_tx, req_rx) = unbounded::<OffloadRequest>();
        let (resp_tx, resp_rx) = unbounded::<OffloadResponse>();

        let worker = std::thread::Builder::new()
            .name("orbview-offload".into())
            .spawn(move || {
                // Exits when the request sender is dropped
                for req in req_rx.iter() {
                    let mut samples = Vec::with_capacity(req.batch.len());
                    let mut malformed = 0;
                    for raw in &req.batch {
                        match normalize(raw) {
                            Some(s) => samples.push(s),
                            None => malformed += 1,
                        }
                    }
                    if resp_tx
                        .send(OffloadResponse {
                            entity: req.entity,
                            samples,
                            malformed,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .ok();

        Self {
            tx: Some(req_tx),
            rx: resp_rx,
            worker,
        }
    }

    /// Submit a batch. On a dead worker the batch is handed back so the
    /// caller can normalize synchronously.
    fn submit(&self, entity: EntityId, batch: Vec<RawSample>) -> Result<(), Vec<RawSample>> {
        match &self.tx {
            Some(tx) => tx
                .send(OffloadRequest { entity, batch })
                .map_err(|e| e.into_inner().batch),
            None => Err(batch),
        }
    }

    fn is_alive(&self) -> bool {
        self.worker.is_some() && self.tx.is_some()
    }

    /// Drop the request channel and join the worker.
    fn teardown(&mut self) {
        self.tx = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OffloadChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Front door for all telemetry entering a session's track store.
pub struct IngestPipeline {
    stats: IngestStats,
    offload: Option<OffloadChannel>,
    offload_warned: bool,
}

impl IngestPipeline {
    /// Fully synchronous pipeline.
    pub fn new() -> Self {
        Self {
            stats: IngestStats::default(),
            offload: None,
            offload_warned: false,
        }
    }

    /// Pipeline with the normalization worker attached.
    pub fn with_offload() -> Self {
        Self {
            stats: IngestStats::default(),
            offload: Some(OffloadChannel::spawn()),
            offload_warned: false,
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn offload_active(&self) -> bool {
        self.offload.as_ref().is_some_and(|o| o.is_alive())
    }

    // ========================================================================
    // BULK HISTORY
    // ========================================================================

    /// One-shot bulk load at entity creation. Unsorted and duplicated input
    /// is fine; empty input leaves the track EMPTY.
    ///
    /// With an offload worker attached the batch is normalized off the
    /// frame path and applied on a later [`IngestPipeline::pump`]; otherwise
    /// it is applied immediately. Returns the number of samples accepted so
    /// far (always 0 on the offloaded path).
    pub fn ingest_history(
        &mut self,
        store: &mut TrackStore,
        entity: EntityId,
        raw: Vec<RawSample>,
    ) -> usize {
        if raw.is_empty() {
            return 0;
        }

        let mut raw = raw;
        if let Some(offload) = self.offload.take() {
            if offload.is_alive() {
                match offload.submit(entity, raw) {
                    Ok(()) => {
                        self.offload = Some(offload);
                        return 0;
                    }
                    Err(returned) => {
                        // Worker gone; drop the channel and go synchronous
                        raw = returned;
                        self.note_offload_failure();
                    }
                }
            } else {
                self.note_offload_failure();
            }
        }

        let mut samples = Vec::with_capacity(raw.len());
        for r in &raw {
            match normalize(r) {
                Some(s) => samples.push(s),
                None => self.stats.malformed_dropped += 1,
            }
        }
        self.apply_history(store, entity, samples)
    }

    /// Sort and insert a normalized batch. Stale entries (duplicates after
    /// sorting, or older than existing data) are counted and skipped.
    fn apply_history(
        &mut self,
        store: &mut TrackStore,
        entity: EntityId,
        mut samples: Vec<TelemetrySample>,
    ) -> usize {
        samples.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut accepted = 0;
        for (i, sample) in samples.iter().enumerate() {
            match store.add_sample(entity, sample) {
                Ok(SampleOutcome::Accepted) => {
                    accepted += 1;
                    self.stats.accepted += 1;
                }
                Ok(SampleOutcome::Stale) => self.stats.stale_dropped += 1,
                Ok(SampleOutcome::Malformed) => self.stats.malformed_dropped += 1,
                Err(TrackError::TrackNotFound(_)) => {
                    // Entity destroyed while the batch was in flight
                    self.stats.orphaned_dropped += (samples.len() - i) as u64;
                    break;
                }
                Err(_) => break,
            }
        }
        accepted
    }

    /// Apply any finished offload batches. Called once per frame, between
    /// renders; results for destroyed entities are idempotently discarded.
    pub fn pump(&mut self, store: &mut TrackStore) -> usize {
        let responses: Vec<OffloadResponse> = match &self.offload {
            Some(offload) => offload.rx.try_iter().collect(),
            None => return 0,
        };

        let mut accepted = 0;
        for resp in responses {
            self.stats.malformed_dropped += resp.malformed;
            if !store.contains(resp.entity) {
                self.stats.orphaned_dropped += resp.samples.len() as u64;
                log::debug!(
                    "dropping {} offloaded samples for destroyed entity {}",
                    resp.samples.len(),
                    resp.entity
                );
                continue;
            }
            accepted += self.apply_history(store, resp.entity, resp.samples);
        }
        accepted
    }

    // ========================================================================
    // LIVE PATH
    // ========================================================================

    /// Ingest one live sample from the push subscription.
    ///
    /// Accepted iff strictly newer than the track's newest timestamp. An
    /// accepted sample advances the clock synchronizer and prunes telemetry
    /// behind the retention horizon. Samples for destroyed entities are
    /// dropped silently.
    pub fn ingest_live(
        &mut self,
        store: &mut TrackStore,
        clock: &mut ClockSync,
        entity: EntityId,
        raw: &RawSample,
    ) -> Option<SampleOutcome> {
        let Some(sample) = normalize(raw) else {
            self.stats.malformed_dropped += 1;
            return None;
        };

        match store.add_sample(entity, &sample) {
            Ok(SampleOutcome::Accepted) => {
                self.stats.accepted += 1;
                clock.note_live_sample(sample.timestamp);
                // Opportunistic pruner: horizon trails the sample we just
                // accepted, protecting the bracket at the render time the
                // frame loop is about to draw
                let _ = store.prune_behind(entity, sample.timestamp, clock.render_time());
                Some(SampleOutcome::Accepted)
            }
            Ok(SampleOutcome::Stale) => {
                self.stats.stale_dropped += 1;
                Some(SampleOutcome::Stale)
            }
            Ok(SampleOutcome::Malformed) => {
                self.stats.malformed_dropped += 1;
                Some(SampleOutcome::Malformed)
            }
            Err(TrackError::TrackNotFound(_)) => {
                self.stats.orphaned_dropped += 1;
                None
            }
            Err(_) => None,
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    fn note_offload_failure(&mut self) {
        if !self.offload_warned {
            log::warn!("offload worker unavailable, normalizing synchronously");
            self.offload_warned = true;
        }
    }

    /// Stop the offload worker. Subsequent bulk loads run synchronously.
    pub fn teardown(&mut self) {
        if let Some(mut offload) = self.offload.take() {
            offload.teardown();
        }
    }
}

impl Default for IngestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! The "TRACK" Engine - Interpolated Pose Tracks
//!
//! Turns discrete, possibly out-of-order timestamped telemetry into a
//! continuously queryable position+orientation function per entity:
//! - Monotonic ingest gate (stale/duplicate samples rejected, never raised)
//! - Lagrange interpolation of configurable degree (1..=3) for position,
//!   slerp over the identical bracketing pair for orientation
//! - HOLD / EXTRAPOLATE policy outside the sampled range
//! - Retention-window pruning that never removes the current bracket
//!
//! Position and orientation share one sample vector, so the two curves can
//! never phase-drift: every accepted sample carries both.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::orbview_geometry::{euler_enu_to_ecef, EntityId, Geodetic};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Runtime configuration for the track store.
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// Polynomial interpolation degree for position, 1..=3.
    ///
    /// Degree 1 is the exact affine combination of the bracketing pair;
    /// higher degrees use a Lagrange window anchored on the bracket.
    pub interpolation_degree: usize,

    /// Boundary behavior for query times past the newest sample
    pub default_policy: ExtrapolationPolicy,

    /// Seconds of telemetry kept behind the newest accepted live sample
    pub retention_window: f64,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            interpolation_degree: 1,
            default_policy: ExtrapolationPolicy::Hold,
            retention_window: 600.0, // 10 minutes of history
        }
    }
}

impl TrackConfig {
    /// Degree clamped to the supported range.
    fn degree(&self) -> usize {
        self.interpolation_degree.clamp(1, 3)
    }

    /// Minimum number of samples that must survive pruning so the current
    /// query time stays bracketable at the configured degree.
    pub fn minimum_bracket_window(&self) -> usize {
        self.degree() + 1
    }
}

// ============================================================================
// SAMPLE & POSE TYPES
// ============================================================================

/// Orientation payload of a telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Attitude {
    /// Body-to-ECEF rotation, the preferred form
    Quaternion(UnitQuaternion<f64>),
    /// Euler triple applied in the local East-North-Up frame at the
    /// sample's position
    EulerEnu {
        heading_deg: f64,
        pitch_deg: f64,
        roll_deg: f64,
    },
    /// No attitude telemetry; the track holds the previous orientation
    None,
}

/// One immutable telemetry point as delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Unix seconds
    pub timestamp: f64,
    pub position: Geodetic,
    pub attitude: Attitude,
}

/// Interpolated pose in world (ECEF) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vector3<f64>,
    /// Body-to-world rotation
    pub orientation: UnitQuaternion<f64>,
}

/// Result of a pose query. Queries never panic and never return an
/// undefined pose: before the first sample the entity is explicitly
/// not yet available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoseQuery {
    NotYetAvailable,
    Pose(Pose),
}

impl PoseQuery {
    pub fn pose(&self) -> Option<&Pose> {
        match self {
            PoseQuery::Pose(p) => Some(p),
            PoseQuery::NotYetAvailable => None,
        }
    }
}

/// Behavior for query times past the newest sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtrapolationPolicy {
    /// Freeze at the last known sample rather than disappearing
    Hold,
    /// Project position along the boundary segment's velocity;
    /// orientation holds (telemetry carries no angular rate)
    Extrapolate,
}

/// Outcome of an ingest attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    /// Timestamp at or before `last_sample_time`; dropped, counted upstream
    Stale,
    /// Non-finite timestamp; dropped, counted upstream as malformed
    Malformed,
}

// ============================================================================
// TRACK
// ============================================================================

/// Lifecycle state of a track. A destroyed track is simply absent from the
/// store; there are no transitions out of that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Created but no sample accepted yet ("not yet available")
    Empty,
    Live,
}

#[derive(Debug, Clone, Copy)]
struct PoseSample {
    t: f64,
    position: Vector3<f64>,
    orientation: UnitQuaternion<f64>,
}

/// Per-entity pose curve. Exclusively owned by the [`TrackStore`].
#[derive(Debug)]
pub struct Track {
    entity: EntityId,

    /// Time-ascending; position and orientation always inserted together
    samples: Vec<PoseSample>,

    /// Newest accepted timestamp; monotonically non-decreasing
    last_sample_time: Option<f64>,

    policy: ExtrapolationPolicy,
    state: TrackState,
}

impl Track {
    fn new(entity: EntityId, policy: ExtrapolationPolicy) -> Self {
        Self {
            entity,
            samples: Vec::new(),
            last_sample_time: None,
            policy,
            state: TrackState::Empty,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn policy(&self) -> ExtrapolationPolicy {
        self.policy
    }

    pub fn last_sample_time(&self) -> Option<f64> {
        self.last_sample_time
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Oldest retained sample time, if any.
    pub fn first_sample_time(&self) -> Option<f64> {
        self.samples.first().map(|s| s.t)
    }

    /// Insert a pose point under the monotonic gate.
    ///
    /// Rejects ties: a timestamp equal to `last_sample_time` is stale. A
    /// redelivered identical sample therefore leaves the track unchanged.
    fn insert(&mut self, t: f64, position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> SampleOutcome {
        if !t.is_finite() {
            return SampleOutcome::Malformed;
        }
        if let Some(last) = self.last_sample_time {
            if t <= last {
                return SampleOutcome::Stale;
            }
        }

        self.samples.push(PoseSample {
            t,
            position,
            orientation,
        });
        self.last_sample_time = Some(t);
        self.state = TrackState::Live;
        SampleOutcome::Accepted
    }

    /// Orientation used when a sample carries no attitude: the previous
    /// accepted orientation, identity before any attitude arrives.
    fn carried_orientation(&self) -> UnitQuaternion<f64> {
        self.samples
            .last()
            .map(|s| s.orientation)
            .unwrap_or_else(UnitQuaternion::identity)
    }

    /// Interpolated/extrapolated pose at `t`.
    fn query(&self, t: f64, config: &TrackConfig) -> PoseQuery {
        let (first, last) = match (self.samples.first(), self.samples.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return PoseQuery::NotYetAvailable,
        };

        // Before the first retained sample the entity has no defined pose
        if t < first.t {
            return PoseQuery::NotYetAvailable;
        }

        if t >= last.t {
            return PoseQuery::Pose(self.boundary_pose(t, last));
        }

        // partition_point gives the first sample with s.t > t; the bracket
        // is [idx-1, idx]
        let idx = self.samples.partition_point(|s| s.t <= t);
        let (lo, hi) = (&self.samples[idx - 1], &self.samples[idx]);

        let span = hi.t - lo.t;
        let u = (t - lo.t) / span;

        // Degree falls back toward linear while the track is still short
        let degree = config.degree().min(self.samples.len() - 1);
        let position = match degree {
            1 => lo.position + (hi.position - lo.position) * u,
            d => self.lagrange_position(idx - 1, d, t),
        };

        // Same bracketing pair and parameter as the position curve
        let orientation = lo
            .orientation
            .try_slerp(&hi.orientation, u, 1.0e-9)
            .unwrap_or(lo.orientation);

        PoseQuery::Pose(Pose {
            position,
            orientation,
        })
    }

    /// Pose past the newest sample, per the track's policy.
    fn boundary_pose(&self, t: f64, last: &PoseSample) -> Pose {
        match self.policy {
            ExtrapolationPolicy::Hold => Pose {
                position: last.position,
                orientation: last.orientation,
            },
            ExtrapolationPolicy::Extrapolate => {
                let n = self.samples.len();
                if n < 2 {
                    return Pose {
                        position: last.position,
                        orientation: last.orientation,
                    };
                }
                let prev = &self.samples[n - 2];
                let dt = last.t - prev.t;
                let velocity = (last.position - prev.position) / dt;
                Pose {
                    position: last.position + velocity * (t - last.t),
                    orientation: last.orientation,
                }
            }
        }
    }

    /// Lagrange evaluation over a degree+1 window anchored on the bracket
    /// starting at `bracket_lo`.
    fn lagrange_position(&self, bracket_lo: usize, degree: usize, t: f64) -> Vector3<f64> {
        let window = degree + 1;
        let start = bracket_lo
            .saturating_sub((degree - 1) / 2)
            .min(self.samples.len() - window);
        let pts = &self.samples[start..start + window];

        let mut acc = Vector3::zeros();
        for (j, pj) in pts.iter().enumerate() {
            let mut basis = 1.0;
            for (k, pk) in pts.iter().enumerate() {
                if k != j {
                    basis *= (t - pk.t) / (pj.t - pk.t);
                }
            }
            acc += pj.position * basis;
        }
        acc
    }

    /// Drop samples strictly older than `horizon`, always retaining enough
    /// trailing history to bracket the current query time.
    ///
    /// `protect` is the render time being drawn; its bracketing sample
    /// survives even when the retention window is shorter than the render
    /// lag, so a pose defined this frame stays defined.
    fn prune(&mut self, horizon: f64, min_window: usize, protect: Option<f64>) -> usize {
        let mut cut = self.samples.partition_point(|s| s.t < horizon);
        if let Some(t) = protect {
            // First sample with s.t > t; the bracket starts one earlier
            let bracket_lo = self.samples.partition_point(|s| s.t <= t);
            cut = cut.min(bracket_lo.saturating_sub(1));
        }
        cut = cut.min(self.samples.len().saturating_sub(min_window));
        self.samples.drain(..cut);
        cut
    }
}

// ============================================================================
// TRACK STORE
// ============================================================================

/// Owns every track in a view session and answers all pose queries.
pub struct TrackStore {
    tracks: HashMap<EntityId, Track>,
    config: TrackConfig,
}

impl TrackStore {
    pub fn new(config: TrackConfig) -> Self {
        Self {
            tracks: HashMap::new(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TrackConfig::default())
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Create an empty track for `entity`. Default policy comes from the
    /// store configuration (HOLD unless overridden).
    pub fn create_track(&mut self, entity: EntityId) -> Result<(), TrackError> {
        if self.tracks.contains_key(&entity) {
            return Err(TrackError::DuplicateTrack(entity));
        }
        self.tracks
            .insert(entity, Track::new(entity, self.config.default_policy));
        log::debug!("track created for entity {entity}");
        Ok(())
    }

    /// Destroy the track. Late results targeting it are dropped by callers
    /// observing the absence.
    pub fn remove_track(&mut self, entity: EntityId) -> bool {
        let removed = self.tracks.remove(&entity).is_some();
        if removed {
            log::debug!("track destroyed for entity {entity}");
        }
        removed
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.tracks.contains_key(&entity)
    }

    pub fn track(&self, entity: EntityId) -> Option<&Track> {
        self.tracks.get(&entity)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Override the boundary policy for one track.
    pub fn set_policy(
        &mut self,
        entity: EntityId,
        policy: ExtrapolationPolicy,
    ) -> Result<(), TrackError> {
        let track = self
            .tracks
            .get_mut(&entity)
            .ok_or(TrackError::TrackNotFound(entity))?;
        track.policy = policy;
        Ok(())
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Insert a telemetry sample: geodetic position converted to ECEF,
    /// orientation taken from the quaternion, derived from the ENU Euler
    /// triple, or carried over when the sample has no attitude.
    pub fn add_sample(
        &mut self,
        entity: EntityId,
        sample: &TelemetrySample,
    ) -> Result<SampleOutcome, TrackError> {
        let track = self
            .tracks
            .get_mut(&entity)
            .ok_or(TrackError::TrackNotFound(entity))?;

        let orientation = match sample.attitude {
            Attitude::Quaternion(q) => q,
            Attitude::EulerEnu {
                heading_deg,
                pitch_deg,
                roll_deg,
            } => euler_enu_to_ecef(&sample.position, heading_deg, pitch_deg, roll_deg),
            Attitude::None => track.carried_orientation(),
        };

        Ok(track.insert(sample.timestamp, sample.position.to_ecef(), orientation))
    }

    /// Insert a pre-converted world-frame pose point. Hosts with cartesian
    /// telemetry skip the geodetic conversion.
    pub fn add_pose(
        &mut self,
        entity: EntityId,
        t: f64,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
    ) -> Result<SampleOutcome, TrackError> {
        let track = self
            .tracks
            .get_mut(&entity)
            .ok_or(TrackError::TrackNotFound(entity))?;
        Ok(track.insert(t, position, orientation))
    }

    // ========================================================================
    // QUERY
    // ========================================================================

    /// Pose at `t`: interpolated within the sampled range, boundary policy
    /// outside it, `NotYetAvailable` before the first sample.
    pub fn query(&self, entity: EntityId, t: f64) -> Result<PoseQuery, TrackError> {
        let track = self
            .tracks
            .get(&entity)
            .ok_or(TrackError::TrackNotFound(entity))?;
        Ok(track.query(t, &self.config))
    }

    // ========================================================================
    // MEMORY PRUNER
    // ========================================================================

    /// Drop samples strictly older than `horizon`.
    ///
    /// The cut is clamped two ways: at least `degree + 1` samples survive,
    /// and the sample bracketing `render_time` (when given) is kept, so a
    /// pose defined at the current render time never flips back to
    /// not-yet-available.
    pub fn prune(
        &mut self,
        entity: EntityId,
        horizon: f64,
        render_time: Option<f64>,
    ) -> Result<usize, TrackError> {
        let min_window = self.config.minimum_bracket_window();
        let track = self
            .tracks
            .get_mut(&entity)
            .ok_or(TrackError::TrackNotFound(entity))?;
        Ok(track.prune(horizon, min_window, render_time))
    }

    /// Opportunistic prune driven by an accepted live sample: the horizon
    /// trails the newest sample by the retention window, protecting the
    /// bracket at `render_time`.
    pub fn prune_behind(
        &mut self,
        entity: EntityId,
        newest_sample_time: f64,
        render_time: Option<f64>,
    ) -> Result<usize, TrackError> {
        self.prune(
            entity,
            newest_sample_time - self.config.retention_window,
            render_time,
        )
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors from track store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("track not found: {0}")]
    TrackNotFound(EntityId),

    #[error("track already exists: {0}")]
    DuplicateTrack(EntityId),
}

// ============================================================================
// TESTS
// ============================================================================

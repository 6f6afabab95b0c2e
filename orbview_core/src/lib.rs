//! OrbView Core - Telemetry-to-Pose Synchronization Engine
//!
//! Keeps moving 3D entities (spacecraft and their pointing sensors)
//! continuously queryable in time:
//! 1. **Teleporting Entities**: out-of-order/duplicate telemetry is gated
//!    into smooth interpolated tracks (TRACK engine)
//! 2. **Jitter at the Stream Head**: the render clock trails the live feed
//!    by a configurable lag buffer so a bracket always exists (CLOCK engine)
//! 3. **Derived Sensor Geometry**: cone/footprint poses are pure functions
//!    of the parent track, recomputed per frame (GEOMETRY engine)
//!
//! The renderer itself (camera, textures, scene graph) lives in the host;
//! this crate only decides *what* pose and geometry to hand it each frame.

pub mod ingest;
pub mod orbview_clock;
pub mod orbview_geometry;
pub mod orbview_track;
pub mod session;

// Re-export key types for convenience
pub use ingest::{parse_raw_batch, IngestPipeline, IngestStats, RawSample};
pub use orbview_clock::{ClockBounds, ClockConfig, ClockMode, ClockSync, TimeAuthorityEvent};
pub use orbview_geometry::{
    axis_correction, footprint, sensor_pose, ConfigError, EntityId, Footprint, Geodetic,
    SensorAxis, SensorDefinition, SensorId, SensorPose, ShapeKind,
};
pub use orbview_track::{
    Attitude, ExtrapolationPolicy, Pose, PoseQuery, TelemetrySample, TrackConfig, TrackStore,
};
pub use session::{
    CameraDirective, CapabilityRegistry, ConfigEvent, EntityConfig, EntityPatch, FetchError,
    HistoryProvider, LiveHandle, LiveSource, SensorPatch, SessionConfig, ViewContext,
};

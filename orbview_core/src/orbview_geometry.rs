//! The "GEOMETRY" Engine - Derived Sensor Geometry Resolver
//!
//! Computes everything the renderer needs that is *derived* from a parent
//! track rather than sampled directly:
//! - Sensor volume pose (apex pinned at the parent, center offset by range/2)
//! - Exact axis corrections from the six signed principal axes
//! - Boresight footprint against the WGS84 ellipsoid
//! - Geodetic <-> ECEF and local ENU frame conversions
//!
//! The pose function is pure: `(parent pose, sensor definition) -> SensorPose`
//! with no captured state, so the renderer can call it every frame.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use uuid::Uuid;

use crate::orbview_track::Pose;

/// Entity identifier shared across all engines.
pub type EntityId = Uuid;

/// Sensor identifier, assigned by the session when a sensor is added.
pub type SensorId = Uuid;

// ============================================================================
// WGS84 REFERENCE ELLIPSOID
// ============================================================================

/// WGS84 semi-major axis in meters.
pub const WGS84_A: f64 = 6_378_137.0;

/// WGS84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// WGS84 first eccentricity squared.
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// WGS84 semi-minor axis in meters.
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);

/// A position on the reference ellipsoid in geodetic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geodetic {
    /// Latitude in degrees, north positive
    pub lat_deg: f64,
    /// Longitude in degrees, east positive
    pub lon_deg: f64,
    /// Height above the ellipsoid in meters
    pub alt_m: f64,
}

impl Geodetic {
    pub fn new(lat_deg: f64, lon_deg: f64, alt_m: f64) -> Self {
        Self {
            lat_deg,
            lon_deg,
            alt_m,
        }
    }

    /// Convert to Earth-Centered Earth-Fixed coordinates (meters).
    pub fn to_ecef(&self) -> Vector3<f64> {
        let lat = self.lat_deg.to_radians();
        let lon = self.lon_deg.to_radians();
        let sin_lat = lat.sin();
        let cos_lat = lat.cos();

        // Prime vertical radius of curvature
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

        Vector3::new(
            (n + self.alt_m) * cos_lat * lon.cos(),
            (n + self.alt_m) * cos_lat * lon.sin(),
            (n * (1.0 - WGS84_E2) + self.alt_m) * sin_lat,
        )
    }
}

/// Convert ECEF coordinates (meters) back to geodetic.
///
/// Fixed-point iteration on the latitude; converges to sub-millimeter in a
/// handful of rounds for anything from the surface out to GEO.
pub fn ecef_to_geodetic(ecef: &Vector3<f64>) -> Geodetic {
    let p = (ecef.x * ecef.x + ecef.y * ecef.y).sqrt();
    let lon = ecef.y.atan2(ecef.x);

    // Pole singularity: latitude is +/-90, altitude measured along Z
    if p < 1e-9 {
        return Geodetic::new(
            90.0_f64.copysign(ecef.z),
            lon.to_degrees(),
            ecef.z.abs() - WGS84_B,
        );
    }

    let mut lat = (ecef.z / (p * (1.0 - WGS84_E2))).atan();
    let mut n = WGS84_A;
    for _ in 0..6 {
        let sin_lat = lat.sin();
        n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        lat = ((ecef.z + WGS84_E2 * n * sin_lat) / p).atan();
    }

    let alt = p / lat.cos() - n;
    Geodetic::new(lat.to_degrees(), lon.to_degrees(), alt)
}

// ============================================================================
// LOCAL EAST-NORTH-UP FRAME
// ============================================================================

/// Rotation taking local East-North-Up axes at `origin` into the ECEF frame.
///
/// Columns of the underlying matrix are the ENU basis vectors expressed in
/// ECEF: x=east, y=north, z=up.
pub fn enu_to_ecef_rotation(origin: &Geodetic) -> UnitQuaternion<f64> {
    let lat = origin.lat_deg.to_radians();
    let lon = origin.lon_deg.to_radians();
    let (sin_lat, cos_lat) = (lat.sin(), lat.cos());
    let (sin_lon, cos_lon) = (lon.sin(), lon.cos());

    let east = Vector3::new(-sin_lon, cos_lon, 0.0);
    let north = Vector3::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat);
    let up = Vector3::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat);

    let m = nalgebra::Matrix3::from_columns(&[east, north, up]);
    UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(m))
}

/// Build an ECEF body orientation from heading/pitch/roll in the local ENU
/// frame at `origin`.
///
/// Convention: the body starts aligned with ENU (forward=north, right=east,
/// z=up). Heading rotates clockwise from north (viewed from above), pitch
/// raises the nose, roll banks about the forward axis. All intrinsic.
pub fn euler_enu_to_ecef(
    origin: &Geodetic,
    heading_deg: f64,
    pitch_deg: f64,
    roll_deg: f64,
) -> UnitQuaternion<f64> {
    let yaw = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), -heading_deg.to_radians());
    let pitch = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), pitch_deg.to_radians());
    let roll = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), roll_deg.to_radians());

    enu_to_ecef_rotation(origin) * yaw * pitch * roll
}

// ============================================================================
// SENSOR DEFINITION
// ============================================================================

/// The six signed principal axes a sensor can point along in its parent's
/// body frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorAxis {
    PlusX,
    MinusX,
    PlusY,
    MinusY,
    PlusZ,
    MinusZ,
}

impl SensorAxis {
    /// Unit vector of this axis in the parent body frame.
    pub fn unit(&self) -> Vector3<f64> {
        match self {
            SensorAxis::PlusX => Vector3::x(),
            SensorAxis::MinusX => -Vector3::x(),
            SensorAxis::PlusY => Vector3::y(),
            SensorAxis::MinusY => -Vector3::y(),
            SensorAxis::PlusZ => Vector3::z(),
            SensorAxis::MinusZ => -Vector3::z(),
        }
    }
}

/// Shape of the rendered sensor volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    /// Circular cross-section (full field of view as cone apex angle)
    Cone,
    /// Rectangular cross-section, width/height set by `aspect_ratio`
    Pyramid,
}

/// Static description of one pointing sensor attached to an entity.
///
/// Owned by the session; the geometry resolver only ever borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    /// Entity whose track supplies the parent pose
    pub parent: EntityId,

    /// Pointing axis in the parent body frame
    pub local_axis: SensorAxis,

    /// Full apex angle of the volume, degrees, (0, 180)
    pub fov_degrees: f64,

    /// Length of the volume along the boresight, meters, > 0
    pub range_meters: f64,

    /// RGBA display color
    pub color: [f32; 4],

    /// Volume cross-section shape
    pub shape: ShapeKind,

    /// Width/height ratio for `ShapeKind::Pyramid`, > 0
    pub aspect_ratio: f64,
}

impl SensorDefinition {
    /// Validate the definition. Called synchronously on every add/edit; a
    /// failing edit leaves the previously valid geometry in place.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.range_meters.is_finite() || self.range_meters <= 0.0 {
            return Err(ConfigError::NonPositiveRange(self.range_meters));
        }
        if !self.fov_degrees.is_finite()
            || self.fov_degrees <= 0.0
            || self.fov_degrees >= 180.0
        {
            return Err(ConfigError::InvalidFov(self.fov_degrees));
        }
        if !self.aspect_ratio.is_finite() || self.aspect_ratio <= 0.0 {
            return Err(ConfigError::NonPositiveAspect(self.aspect_ratio));
        }
        Ok(())
    }
}

// ============================================================================
// AXIS CORRECTION TABLE
// ============================================================================

/// Exact rotation reorienting the canonical +Z-pointing volume primitive to
/// the requested axis.
///
/// Each entry is a single 90 or 180 degree rotation about a principal axis;
/// `axis_correction(a) * +Z == a.unit()` holds exactly. +Z is the identity.
pub fn axis_correction(axis: SensorAxis) -> UnitQuaternion<f64> {
    match axis {
        SensorAxis::PlusZ => UnitQuaternion::identity(),
        SensorAxis::MinusZ => UnitQuaternion::from_axis_angle(&Vector3::x_axis(), PI),
        SensorAxis::PlusX => UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2),
        SensorAxis::MinusX => UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -FRAC_PI_2),
        SensorAxis::PlusY => UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -FRAC_PI_2),
        SensorAxis::MinusY => UnitQuaternion::from_axis_angle(&Vector3::x_axis(), FRAC_PI_2),
    }
}

// ============================================================================
// SENSOR POSE
// ============================================================================

/// Pose handed to the renderer for one sensor volume at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorPose {
    /// Center of the volume primitive in ECEF meters.
    ///
    /// The primitive is centered on its own axis, so the center sits
    /// `range/2` down the boresight; the apex stays pinned at the parent.
    pub position: Vector3<f64>,

    /// Orientation taking the canonical +Z primitive into the world frame
    pub orientation: UnitQuaternion<f64>,

    /// World-frame boresight direction (unit)
    pub boresight: Vector3<f64>,
}

/// Resolve the sensor volume pose from the parent pose.
///
/// Pure function of its inputs; the renderer calls it once per sensor per
/// frame with the pose it already queried from the track store.
pub fn sensor_pose(parent: &Pose, sensor: &SensorDefinition) -> SensorPose {
    let boresight = parent.orientation * sensor.local_axis.unit();
    let position = parent.position + boresight * (sensor.range_meters / 2.0);
    let orientation = parent.orientation * axis_correction(sensor.local_axis);

    SensorPose {
        position,
        orientation,
        boresight,
    }
}

// ============================================================================
// FOOTPRINT
// ============================================================================

/// Intersection of the sensor boresight with the reference body surface.
///
/// A miss is a valid state for the tick, not an error: the footprint is
/// simply hidden until the boresight sweeps back onto the body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Footprint {
    /// Boresight misses the ellipsoid (or points away from it)
    Hidden,
    /// Surface intersection point nearest the sensor
    Surface(Geodetic),
}

/// Cast the boresight ray from the parent position against the WGS84
/// ellipsoid and report the nearest forward intersection.
pub fn footprint(parent: &Pose, sensor: &SensorDefinition) -> Footprint {
    let dir = parent.orientation * sensor.local_axis.unit();
    raycast_ellipsoid(&parent.position, &dir)
}

/// Ray/ellipsoid intersection in the scaled unit-sphere space.
fn raycast_ellipsoid(origin: &Vector3<f64>, dir: &Vector3<f64>) -> Footprint {
    // Scale the ellipsoid to the unit sphere
    let scale = Vector3::new(1.0 / WGS84_A, 1.0 / WGS84_A, 1.0 / WGS84_B);
    let o = origin.component_mul(&scale);
    let d = dir.component_mul(&scale);

    // Solve |o + t*d|^2 = 1
    let a = d.dot(&d);
    let b = 2.0 * o.dot(&d);
    let c = o.dot(&o) - 1.0;

    if a <= 0.0 {
        return Footprint::Hidden;
    }

    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 {
        return Footprint::Hidden;
    }

    let sqrt_disc = discriminant.sqrt();
    let t_near = (-b - sqrt_disc) / (2.0 * a);
    let t_far = (-b + sqrt_disc) / (2.0 * a);

    // Nearest intersection in front of the sensor
    let t = if t_near > 0.0 {
        t_near
    } else if t_far > 0.0 {
        t_far
    } else {
        return Footprint::Hidden;
    };

    let hit = origin + dir * t;
    Footprint::Surface(ecef_to_geodetic(&hit))
}

// ============================================================================
// ERRORS
// ============================================================================

/// Validation failures for sensor/entity configuration edits.
///
/// The only error class surfaced synchronously to the caller; everything
/// else in the pipeline degrades to an explicit hidden/unavailable state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("sensor range must be positive and finite, got {0}")]
    NonPositiveRange(f64),

    #[error("sensor field of view must be in (0, 180) degrees, got {0}")]
    InvalidFov(f64),

    #[error("sensor aspect ratio must be positive and finite, got {0}")]
    NonPositiveAspect(f64),

    #[error("unknown sensor: {0}")]
    UnknownSensor(SensorId),

    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    #[error("entity already exists: {0}")]
    DuplicateEntity(EntityId),

    #[error("session already torn down")]
    TornDown,
}

// ============================================================================
// TESTS
// ============================================================================

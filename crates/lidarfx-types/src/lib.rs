use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of elements in every keypoint [`Descriptor`].
pub const DESCRIPTOR_LEN: usize = 352;

/// A single LiDAR return: position in metres plus sensor metadata that the
/// pipeline carries through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Return intensity as reported by the sensor (not interpreted).
    #[serde(default)]
    pub intensity: f32,
}

impl Point {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, intensity: 0.0 }
    }

    pub fn with_intensity(x: f32, y: f32, z: f32, intensity: f32) -> Self {
        Self { x, y, z, intensity }
    }
}

/// One frame of points tagged with the coordinate frame it was captured in.
///
/// Point order is preserved by every processing stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    /// e.g. `"velodyne"`
    pub frame_id: String,
    pub points: Vec<Point>,
}

impl PointCloud {
    pub fn new(frame_id: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            frame_id: frame_id.into(),
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Build a cloud with the same frame id but a different point set.
    pub fn with_points(&self, points: Vec<Point>) -> Self {
        Self {
            frame_id: self.frame_id.clone(),
            points,
        }
    }
}

/// Orientation as delivered by the inertial sensor (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Standard Z-Y-X Euler decomposition, returned as `(roll, pitch, yaw)`
    /// in radians.
    ///
    /// No normalisation is applied; a degenerate quaternion yields whatever
    /// angles the formulas produce.
    pub fn to_euler(&self) -> (f64, f64, f64) {
        let Self { w, x, y, z } = *self;

        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

        (roll, pitch, yaw)
    }
}

/// Estimated surface normal. The zero vector marks an invalid normal
/// (too few neighbours to fit a plane).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normal {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Normal {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn invalid() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn is_valid(&self) -> bool {
        let n2 = self.x * self.x + self.y * self.y + self.z * self.z;
        n2.is_finite() && n2 > 0.5
    }
}

/// Fixed-length local shape descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor(pub Vec<f32>);

impl Descriptor {
    /// All-zero descriptor of [`DESCRIPTOR_LEN`] elements.
    pub fn zeros() -> Self {
        Self(vec![0.0; DESCRIPTOR_LEN])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// A detected keypoint with everything downstream matching needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointRecord {
    pub position: Point,
    pub normal: Normal,
    pub descriptor: Descriptor,
    /// Corner response that selected this keypoint.
    pub response: f32,
}

/// All keypoints extracted from one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeypointSet {
    pub frame_id: String,
    pub keypoints: Vec<KeypointRecord>,
}

// ────────────────────────────────────────────────────────────────────────────
// Stage configuration
// ────────────────────────────────────────────────────────────────────────────

/// Coordinate axis referenced by a [`RangePredicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn of(self, p: &Point) -> f32 {
        match self {
            Axis::X => p.x,
            Axis::Y => p.y,
            Axis::Z => p.z,
        }
    }
}

/// Whether a predicate keeps the points inside its interval or outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeMode {
    Keep,
    Exclude,
}

/// One axis-aligned interval test. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangePredicate {
    pub axis: Axis,
    pub lower: f32,
    pub upper: f32,
    pub mode: RangeMode,
}

impl RangePredicate {
    pub fn keep(axis: Axis, lower: f32, upper: f32) -> Self {
        Self { axis, lower, upper, mode: RangeMode::Keep }
    }

    pub fn exclude(axis: Axis, lower: f32, upper: f32) -> Self {
        Self { axis, lower, upper, mode: RangeMode::Exclude }
    }

    /// True when `p` survives this predicate. NaN coordinates are outside
    /// every interval.
    pub fn accepts(&self, p: &Point) -> bool {
        let v = self.axis.of(p);
        let inside = v >= self.lower && v <= self.upper;
        match self.mode {
            RangeMode::Keep => inside,
            RangeMode::Exclude => !inside,
        }
    }
}

/// Ordered list of predicates; a point must pass all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub predicates: Vec<RangePredicate>,
}

impl FilterSpec {
    pub fn new(predicates: Vec<RangePredicate>) -> Self {
        Self { predicates }
    }
}

/// Keypoint detector settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Worker lanes for response computation; `0` lets the runtime decide.
    pub num_threads: usize,
    /// Move keypoints toward the local corner extremum.
    pub refine: bool,
    /// Keep only the strongest candidate among mutual neighbours.
    pub non_max_suppression: bool,
    /// Neighbourhood radius (metres).
    pub radius: f32,
    /// Minimum corner response, in `[0, 1]`.
    pub threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            refine: false,
            non_max_suppression: true,
            radius: 1.0,
            threshold: 0.1,
        }
    }
}

impl DetectorConfig {
    /// Reject settings that cannot produce a meaningful neighbourhood.
    pub fn validate(&self) -> Result<(), PerceptionError> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(PerceptionError::InvalidConfig(format!(
                "detector radius must be a positive number, got {}",
                self.radius
            )));
        }
        if !self.threshold.is_finite() {
            return Err(PerceptionError::InvalidConfig(format!(
                "detector threshold must be finite, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the output bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "lidarfx-runtime::node"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the output bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Orientation-compensated, range-filtered cloud.
    FilteredCloud(PointCloud),
    Keypoints(KeypointSet),
    /// A frame that could not be processed at all.
    FrameDropped { frame_id: String, reason: String },
}

/// Error type shared by every lidarfx crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PerceptionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("I/O error: {0}")]
    Io(String),
}

//! Orientation Tracker.
//!
//! Holds the most recent roll/pitch reported by the inertial sensor so that
//! every point-cloud frame can be levelled before filtering.
//!
//! Orientation samples and cloud frames arrive on independent streams.  The
//! tracker is the only state they share: writers overwrite the stored
//! (roll, pitch) pair, readers take a [`OrientationSnapshot`] that is always
//! one self-consistent pair.  No timestamp matching is attempted; frames use
//! whatever orientation is newest when they are processed, and the snapshot
//! reports how old that orientation is.
//!
//! # Example
//!
//! ```rust
//! use lidarfx_perception::orientation::OrientationTracker;
//! use lidarfx_types::Quaternion;
//!
//! let tracker = OrientationTracker::new();
//! tracker.update_from_quaternion(Quaternion::identity());
//!
//! let snap = tracker.snapshot();
//! // The IMU is mounted upside down: identity reads as roll = −π.
//! assert!((snap.roll + std::f64::consts::PI).abs() < 1e-9);
//! assert!(snap.pitch.abs() < 1e-9);
//! ```

use std::f64::consts::PI;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use lidarfx_types::Quaternion;

/// Subtracted from the raw roll of every sample.  Encodes the sensor
/// mounting: the IMU sits rotated half a turn about its longitudinal axis
/// relative to the LiDAR.
pub const ROLL_MOUNT_OFFSET_RAD: f64 = PI;

// ────────────────────────────────────────────────────────────────────────────
// Input / output types
// ────────────────────────────────────────────────────────────────────────────

/// Euler angles of one inertial measurement, roll already mount-corrected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationSample {
    /// Rotation about the longitudinal (X) axis (radians).
    pub roll: f64,
    /// Rotation about the lateral (Y) axis (radians).
    pub pitch: f64,
    /// Rotation about the vertical (Z) axis (radians).  Carried for
    /// diagnostics only.
    pub yaw: f64,
}

impl OrientationSample {
    /// Decompose `q` and apply [`ROLL_MOUNT_OFFSET_RAD`].
    pub fn from_quaternion(q: Quaternion) -> Self {
        let (raw_roll, pitch, yaw) = q.to_euler();
        Self {
            roll: raw_roll - ROLL_MOUNT_OFFSET_RAD,
            pitch,
            yaw,
        }
    }
}

/// A consistent read of the tracker state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationSnapshot {
    pub roll: f64,
    pub pitch: f64,
    /// Time since the stored sample was written; `None` if no sample has
    /// arrived yet (roll and pitch are then zero).
    pub age: Option<Duration>,
}

impl OrientationSnapshot {
    /// True when the orientation is older than `max_age` or was never set.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.age {
            Some(age) => age > max_age,
            None => true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OrientationTracker
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct OrientationState {
    roll: f64,
    pitch: f64,
    updated_at: Option<Instant>,
}

/// Latest-value store for platform roll and pitch.
///
/// Share it between the orientation handler and the frame pipeline with an
/// `Arc`; both sides only ever hold the lock for a copy of three scalars.
#[derive(Debug, Default)]
pub struct OrientationTracker {
    state: RwLock<OrientationState>,
}

impl OrientationTracker {
    /// Create a tracker with zero roll/pitch and no sample.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored roll and pitch with `sample`.
    pub fn update(&self, sample: OrientationSample) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = OrientationState {
            roll: sample.roll,
            pitch: sample.pitch,
            updated_at: Some(Instant::now()),
        };
    }

    /// Convert `q` into a sample, store it, and return it.
    pub fn update_from_quaternion(&self, q: Quaternion) -> OrientationSample {
        let sample = OrientationSample::from_quaternion(q);
        self.update(sample);
        sample
    }

    /// Read the current roll/pitch pair.
    pub fn snapshot(&self) -> OrientationSnapshot {
        let state = *self.state.read().unwrap_or_else(PoisonError::into_inner);
        OrientationSnapshot {
            roll: state.roll,
            pitch: state.pitch,
            age: state.updated_at.map(|t| t.elapsed()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

//! Orientation-compensating rigid transform.
//!
//! Levels a point-cloud frame using the platform's measured roll and pitch:
//! every point is rotated by `R = R_y(pitch) · R_x(roll)`, i.e. first by
//! roll about the longitudinal X axis, then by pitch about the lateral Y
//! axis.  There is no translation.  The order matters: for non-small angles
//! `R_x · R_y` levels the cloud to a visibly different pose.
//!
//! # Example
//!
//! ```rust
//! use lidarfx_perception::transform::RigidTransformer;
//! use lidarfx_types::{Point, PointCloud};
//!
//! // A quarter turn of roll maps +Y onto +Z.
//! let t = RigidTransformer::from_roll_pitch(std::f64::consts::FRAC_PI_2, 0.0);
//! let cloud = PointCloud::new("velodyne", vec![Point::new(0.0, 1.0, 0.0)]);
//! let out = t.apply(&cloud);
//!
//! assert!((out.points[0].z - 1.0).abs() < 1e-6);
//! assert_eq!(out.frame_id, "velodyne");
//! ```

use nalgebra::{Rotation3, Vector3};

use lidarfx_types::{Point, PointCloud};

use crate::orientation::OrientationSnapshot;

// ────────────────────────────────────────────────────────────────────────────
// RigidTransformer
// ────────────────────────────────────────────────────────────────────────────

/// A pure rotation applied point-by-point to a cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransformer {
    rotation: Rotation3<f64>,
}

impl RigidTransformer {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: Rotation3::identity(),
        }
    }

    /// Build `R_y(pitch) · R_x(roll)`.
    pub fn from_roll_pitch(roll: f64, pitch: f64) -> Self {
        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), roll);
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), pitch);
        Self { rotation: ry * rx }
    }

    /// Build the levelling transform for the orientation in `snapshot`.
    pub fn from_snapshot(snapshot: &OrientationSnapshot) -> Self {
        Self::from_roll_pitch(snapshot.roll, snapshot.pitch)
    }

    /// The transform that undoes this one.
    pub fn inverse(&self) -> Self {
        Self {
            rotation: self.rotation.inverse(),
        }
    }

    /// Rotate a single point; intensity is carried over.
    pub fn apply_point(&self, p: &Point) -> Point {
        let v = self.rotation * Vector3::new(p.x as f64, p.y as f64, p.z as f64);
        Point::with_intensity(v.x as f32, v.y as f32, v.z as f32, p.intensity)
    }

    /// Rotate every point of `cloud` into a new cloud with the same frame id,
    /// count and order.
    pub fn apply(&self, cloud: &PointCloud) -> PointCloud {
        cloud.with_points(cloud.points.iter().map(|p| self.apply_point(p)).collect())
    }
}

impl Default for RigidTransformer {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

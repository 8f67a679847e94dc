//! Surface normal estimation.
//!
//! A normal is the eigenvector belonging to the smallest eigenvalue of the
//! covariance of all cloud points within [`NORMAL_SEARCH_RADIUS`] of the
//! query position.  Its sign is not constrained; consumers that need a
//! direction resolve it themselves.

use std::sync::OnceLock;

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rayon::prelude::*;

use lidarfx_types::{Normal, Point, PointCloud};

use crate::octree::{Octree, Point3};

/// Neighbourhood radius used for every normal (metres).
pub const NORMAL_SEARCH_RADIUS: f32 = 0.1;

/// Fewest points, query point included, that define a plane.
pub const MIN_NORMAL_POINTS: usize = 3;

/// Fit a plane to `points` and return its unit normal, or
/// [`Normal::invalid`] when there are too few points or the fit is not
/// finite.
pub fn fit_normal(points: &[Vector3<f64>]) -> Normal {
    if points.len() < MIN_NORMAL_POINTS {
        return Normal::invalid();
    }

    let centroid = points.iter().sum::<Vector3<f64>>() / points.len() as f64;
    let mut cov = Matrix3::<f64>::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    cov /= points.len() as f64;

    let eigen = SymmetricEigen::new(cov);
    let min_idx = eigen.eigenvalues.imin();
    let n = eigen.eigenvectors.column(min_idx).into_owned();
    let len = n.norm();
    if !len.is_finite() || len == 0.0 {
        return Normal::invalid();
    }
    let n = n / len;
    Normal::new(n.x as f32, n.y as f32, n.z as f32)
}

/// Estimates normals against one cloud and its spatial index.
#[derive(Debug, Clone, Copy)]
pub struct NormalEstimator<'a> {
    cloud: &'a PointCloud,
    index: &'a Octree,
}

impl<'a> NormalEstimator<'a> {
    pub fn new(cloud: &'a PointCloud, index: &'a Octree) -> Self {
        Self { cloud, index }
    }

    /// Normal of the surface around `position`.
    pub fn normal_at(&self, position: &Point) -> Normal {
        let neighbours: Vec<Vector3<f64>> = self
            .index
            .radius_search(Point3::from(position), NORMAL_SEARCH_RADIUS)
            .into_iter()
            .map(|j| {
                let p = &self.cloud.points[j];
                Vector3::new(p.x as f64, p.y as f64, p.z as f64)
            })
            .collect();
        fit_normal(&neighbours)
    }

    /// Normals for each of `positions`, in order.  Runs on the current rayon
    /// pool.
    pub fn normals_for(&self, positions: &[Point]) -> Vec<Normal> {
        positions.par_iter().map(|p| self.normal_at(p)).collect()
    }

    /// Normals for every point of the cloud, in cloud order.
    pub fn estimate_all(&self) -> Vec<Normal> {
        self.normals_for(&self.cloud.points)
    }
}

/// Lazily computed normals for the points of one cloud.
///
/// Descriptor computation only needs normals for points that fall inside
/// some keypoint's support, so each slot is filled on first use.  Slots are
/// `OnceLock`s and the cache can be shared across rayon workers.
#[derive(Debug)]
pub struct NormalCache<'a> {
    estimator: NormalEstimator<'a>,
    slots: Vec<OnceLock<Normal>>,
}

impl<'a> NormalCache<'a> {
    pub fn new(estimator: NormalEstimator<'a>) -> Self {
        let slots = (0..estimator.cloud.len()).map(|_| OnceLock::new()).collect();
        Self { estimator, slots }
    }

    /// Normal of cloud point `index`; [`Normal::invalid`] when out of range.
    pub fn get(&self, index: usize) -> Normal {
        match self.slots.get(index) {
            Some(slot) => *slot.get_or_init(|| {
                self.estimator.normal_at(&self.estimator.cloud.points[index])
            }),
            None => Normal::invalid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_cloud(f: impl Fn(f32, f32) -> (f32, f32, f32)) -> PointCloud {
        let mut points = Vec::new();
        for i in -4..=4 {
            for j in -4..=4 {
                let (x, y, z) = f(i as f32 * 0.03, j as f32 * 0.03);
                points.push(Point::new(x, y, z));
            }
        }
        PointCloud::new("test", points)
    }

    fn assert_parallel(n: Normal, axis: [f32; 3]) {
        let dot = n.x * axis[0] + n.y * axis[1] + n.z * axis[2];
        assert!((dot.abs() - 1.0).abs() < 1e-4, "{n:?} not parallel to {axis:?}");
    }

    #[test]
    fn horizontal_plane_has_vertical_normal() {
        let cloud = grid_cloud(|x, y| (x, y, 2.0));
        let tree = Octree::from_cloud(&cloud);
        let est = NormalEstimator::new(&cloud, &tree);
        let n = est.normal_at(&Point::new(0.0, 0.0, 2.0));
        assert!(n.is_valid());
        assert_parallel(n, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn vertical_wall_has_horizontal_normal() {
        let cloud = grid_cloud(|a, b| (3.0, a, b));
        let tree = Octree::from_cloud(&cloud);
        let normals = NormalEstimator::new(&cloud, &tree).estimate_all();
        assert_eq!(normals.len(), cloud.len());
        for n in normals {
            assert_parallel(n, [1.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn sparse_neighbourhood_is_invalid() {
        // The query point plus one neighbour inside 0.1.
        let cloud = PointCloud::new(
            "test",
            vec![Point::new(0.0, 0.0, 0.0), Point::new(0.05, 0.0, 0.0), Point::new(1.0, 0.0, 0.0)],
        );
        let tree = Octree::from_cloud(&cloud);
        let n = NormalEstimator::new(&cloud, &tree).normal_at(&cloud.points[0]);
        assert!(!n.is_valid());
    }

    #[test]
    fn fit_rejects_fewer_than_three_points() {
        let pts = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)];
        assert!(!fit_normal(&pts).is_valid());
    }

    #[test]
    fn cache_matches_direct_estimation() {
        let cloud = grid_cloud(|x, y| (x, y, 0.5 * x * x));
        let tree = Octree::from_cloud(&cloud);
        let est = NormalEstimator::new(&cloud, &tree);
        let cache = NormalCache::new(est);
        for i in [0, 17, 40, 80] {
            assert_eq!(cache.get(i), est.normal_at(&cloud.points[i]));
            // Second read hits the filled slot.
            assert_eq!(cache.get(i), est.normal_at(&cloud.points[i]));
        }
        assert!(!cache.get(cloud.len()).is_valid());
    }
}

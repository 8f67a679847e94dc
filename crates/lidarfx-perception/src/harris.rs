//! Covariance-based 3-D corner detector.
//!
//! Fits a plane to every point's neighbourhood and scores the point by how
//! far it stands off that plane relative to the spread of its neighbours.
//! Points inside a flat patch score zero; tips, corners and creases score
//! high.  Survivors of the threshold are optionally thinned to local maxima
//! and optionally pulled onto the nearest corner of the local tangent
//! planes.
//!
//! # Example
//!
//! ```rust
//! use lidarfx_perception::harris::KeypointDetector;
//! use lidarfx_types::{DetectorConfig, Point, PointCloud};
//!
//! // A flat plus sign with one point lifted sharply above its centre.
//! let cloud = PointCloud::new("velodyne", vec![
//!     Point::new(0.0, 0.0, 0.0),
//!     Point::new(0.4, 0.0, 0.0),
//!     Point::new(-0.4, 0.0, 0.0),
//!     Point::new(0.0, 0.4, 0.0),
//!     Point::new(0.0, -0.4, 0.0),
//!     Point::new(0.0, 0.0, 0.5),
//! ]);
//! let detector = KeypointDetector::new(DetectorConfig::default()).unwrap();
//!
//! let keypoints = detector.detect(&cloud);
//! assert_eq!(keypoints.len(), 1);
//! assert_eq!(keypoints[0].index, 5);
//! ```

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use lidarfx_types::{DetectorConfig, Normal, PerceptionError, Point, PointCloud};

use crate::normals::{NormalEstimator, fit_normal};
use crate::octree::{Octree, Point3};

/// Fewest non-self neighbours that give a meaningful response.
pub const MIN_RESPONSE_NEIGHBOURS: usize = 3;

/// Upper bound on corner-refinement steps per keypoint.
pub const MAX_REFINE_ITERATIONS: usize = 10;

/// Refinement stops once a step moves less than this (metres).
pub const REFINE_CONVERGENCE: f64 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Keypoint
// ────────────────────────────────────────────────────────────────────────────

/// A detected corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Index of the originating point in the detector's input cloud.
    pub index: usize,
    /// Position; differs from the cloud point only after refinement.
    pub position: Point,
    pub response: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Response and refinement
// ────────────────────────────────────────────────────────────────────────────

fn to_vector(p: &Point) -> Vector3<f64> {
    Vector3::new(p.x as f64, p.y as f64, p.z as f64)
}

fn to_point3(v: &Vector3<f64>) -> Point3 {
    Point3::new(v.x as f32, v.y as f32, v.z as f32)
}

fn is_finite_point(p: &Point) -> bool {
    p.x.is_finite() && p.y.is_finite() && p.z.is_finite()
}

/// Corner response of cloud point `index`.
///
/// `n` is the normal of the plane fitted to the point and its neighbours
/// within `radius`, `m` the mean offset from the point to its neighbours and
/// `s²` their mean squared distance.  The response is `(n·m)² / s²`, which
/// lies in `[0, 1]`: zero when the neighbours spread evenly around the point
/// along the surface, growing as they all fall to one side of it across the
/// surface.  Fewer than [`MIN_RESPONSE_NEIGHBOURS`] neighbours, a degenerate
/// plane fit, or a non-finite point give zero.
pub fn corner_response(index: usize, cloud: &PointCloud, tree: &Octree, radius: f32) -> f32 {
    let Some(p) = cloud.points.get(index) else {
        return 0.0;
    };
    if !is_finite_point(p) {
        return 0.0;
    }
    let centre = to_vector(p);

    // The query point is its own neighbour at distance zero.
    let patch: Vec<Vector3<f64>> = tree
        .radius_search(Point3::from(p), radius)
        .into_iter()
        .map(|j| to_vector(&cloud.points[j]))
        .collect();
    let others = patch.len().saturating_sub(1);
    if others < MIN_RESPONSE_NEIGHBOURS {
        return 0.0;
    }

    let normal = fit_normal(&patch);
    if !normal.is_valid() {
        return 0.0;
    }
    let n = Vector3::new(normal.x as f64, normal.y as f64, normal.z as f64);

    let (offset_sum, spread) = patch
        .iter()
        .fold((Vector3::<f64>::zeros(), 0.0), |(sum, sq), q| {
            let d = q - centre;
            (sum + d, sq + d.norm_squared())
        });
    let mean_sq = spread / others as f64;
    if mean_sq <= 1e-12 {
        return 0.0;
    }
    let lift = n.dot(&(offset_sum / others as f64));
    (lift * lift / mean_sq).clamp(0.0, 1.0) as f32
}

/// Move `start` to the point closest to all tangent planes around it.
///
/// Each step solves `(Σ n nᵀ) x = Σ n nᵀ p` over the cloud points within
/// `radius` of the current estimate that carry a valid normal.  A singular
/// system ends refinement at the current estimate.  A result further than
/// `radius` from `start` is discarded and `start` is returned.
pub fn refine_corner(
    cloud: &PointCloud,
    tree: &Octree,
    normals: &[Normal],
    start: &Point,
    radius: f32,
) -> Point {
    let origin = to_vector(start);
    let mut x = origin;

    for _ in 0..MAX_REFINE_ITERATIONS {
        let mut a = Matrix3::<f64>::zeros();
        let mut b = Vector3::<f64>::zeros();
        for j in tree.radius_search(to_point3(&x), radius) {
            let Some(n) = normals.get(j).filter(|n| n.is_valid()) else {
                continue;
            };
            let n = Vector3::new(n.x as f64, n.y as f64, n.z as f64);
            let nnt = n * n.transpose();
            a += nnt;
            b += nnt * to_vector(&cloud.points[j]);
        }

        let trace = a.trace();
        if trace <= 0.0 || a.determinant().abs() <= 1e-9 * trace.powi(3) {
            break;
        }
        let Some(inv) = a.try_inverse() else {
            break;
        };
        let next = inv * b;
        let step = (next - x).norm();
        x = next;
        if step < REFINE_CONVERGENCE {
            break;
        }
    }

    if !x.iter().all(|c| c.is_finite()) || (x - origin).norm() > radius as f64 {
        return *start;
    }
    Point::with_intensity(x.x as f32, x.y as f32, x.z as f32, start.intensity)
}

// ────────────────────────────────────────────────────────────────────────────
// KeypointDetector
// ────────────────────────────────────────────────────────────────────────────

/// Threshold + NMS + refine detector bound to one worker pool.
#[derive(Debug)]
pub struct KeypointDetector {
    config: DetectorConfig,
    pool: ThreadPool,
}

impl KeypointDetector {
    /// Validate `config` and build the worker pool.
    ///
    /// # Errors
    ///
    /// [`PerceptionError::InvalidConfig`] for an invalid radius/threshold or
    /// when the pool cannot be started.
    pub fn new(config: DetectorConfig) -> Result<Self, PerceptionError> {
        config.validate()?;
        let mut builder =
            ThreadPoolBuilder::new().thread_name(|i| format!("lidarfx-harris-{i}"));
        if config.num_threads > 0 {
            builder = builder.num_threads(config.num_threads);
        }
        let pool = builder.build().map_err(|e| {
            PerceptionError::InvalidConfig(format!("failed to start detector pool: {e}"))
        })?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run `op` on the detector's worker pool.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Detect keypoints in `cloud`, ordered by point index.
    pub fn detect(&self, cloud: &PointCloud) -> Vec<Keypoint> {
        let tree = Octree::from_cloud(cloud);
        self.detect_indexed(cloud, &tree)
    }

    /// Same as [`detect`](Self::detect) with a prebuilt index over `cloud`.
    pub fn detect_indexed(&self, cloud: &PointCloud, tree: &Octree) -> Vec<Keypoint> {
        if cloud.is_empty() {
            return Vec::new();
        }
        let radius = self.config.radius;
        let threshold = self.config.threshold;

        self.pool.install(|| {
            let responses = self.responses(cloud, tree);
            let candidates: Vec<usize> = (0..cloud.len())
                .filter(|&i| is_finite_point(&cloud.points[i]) && responses[i] >= threshold)
                .collect();

            let survivors: Vec<usize> = if self.config.non_max_suppression {
                candidates
                    .par_iter()
                    .copied()
                    .filter(|&i| is_local_maximum(i, cloud, tree, &responses, radius))
                    .collect()
            } else {
                candidates.clone()
            };

            let normals = if self.config.refine {
                NormalEstimator::new(cloud, tree).estimate_all()
            } else {
                Vec::new()
            };

            let keypoints: Vec<Keypoint> = survivors
                .par_iter()
                .map(|&i| {
                    let source = &cloud.points[i];
                    let position = if self.config.refine {
                        refine_corner(cloud, tree, &normals, source, radius)
                    } else {
                        *source
                    };
                    Keypoint {
                        index: i,
                        position,
                        response: responses[i],
                    }
                })
                .collect();

            debug!(
                points = cloud.len(),
                candidates = candidates.len(),
                keypoints = keypoints.len(),
                "keypoint detection finished"
            );
            keypoints
        })
    }

    /// Response for every point, partitioned into one contiguous chunk per
    /// lane and merged back in index order.
    fn responses(&self, cloud: &PointCloud, tree: &Octree) -> Vec<f32> {
        let n = cloud.len();
        let lanes = self.pool.current_num_threads().max(1);
        let chunk = n.div_ceil(lanes).max(1);
        let indices: Vec<usize> = (0..n).collect();
        indices
            .par_chunks(chunk)
            .map(|part| {
                part.iter()
                    .map(|&i| corner_response(i, cloud, tree, self.config.radius))
                    .collect::<Vec<f32>>()
            })
            .collect::<Vec<Vec<f32>>>()
            .concat()
    }
}

/// No neighbour within `radius` has a higher response; equal responses
/// defer to the lower index.
fn is_local_maximum(
    i: usize,
    cloud: &PointCloud,
    tree: &Octree,
    responses: &[f32],
    radius: f32,
) -> bool {
    let r = responses[i];
    tree.radius_search(Point3::from(&cloud.points[i]), radius)
        .into_iter()
        .filter(|&j| j != i)
        .all(|j| responses[j] < r || (responses[j] == r && j > i))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    /// Plus sign of spacing 0.4 in z = 0 plus one point 0.5 above the centre.
    /// Every point lies within 1.0 of every other.
    fn plus_with_apex() -> PointCloud {
        PointCloud::new(
            "test",
            vec![
                Point::new(0.0, 0.0, 0.0),
                Point::new(0.4, 0.0, 0.0),
                Point::new(-0.4, 0.0, 0.0),
                Point::new(0.0, 0.4, 0.0),
                Point::new(0.0, -0.4, 0.0),
                Point::new(0.0, 0.0, 0.5),
            ],
        )
    }

    fn detector(threshold: f32, nms: bool) -> KeypointDetector {
        KeypointDetector::new(DetectorConfig {
            num_threads: 2,
            refine: false,
            non_max_suppression: nms,
            radius: 1.0,
            threshold,
        })
        .unwrap()
    }

    /// Deterministic pseudo-random cloud around a box corner.
    fn corner_scene() -> PointCloud {
        let mut points = Vec::new();
        let mut seed: u32 = 12345;
        let mut next = || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 8) as f32 / (1u32 << 24) as f32
        };
        for _ in 0..400 {
            let (a, b) = (next() * 2.0, next() * 2.0);
            match (next() * 3.0) as u32 {
                0 => points.push(Point::new(0.0, a, b)),
                1 => points.push(Point::new(a, 0.0, b)),
                _ => points.push(Point::new(a, b, 0.0)),
            }
        }
        PointCloud::new("scene", points)
    }

    /// Regular grids on the three faces meeting at the origin, `cells` steps
    /// of `spacing` along each axis.  The corner is point 0.
    fn box_corner(cells: i32, spacing: f32) -> PointCloud {
        let mut points = Vec::new();
        for a in 0..=cells {
            for b in 0..=cells {
                let (u, v) = (a as f32 * spacing, b as f32 * spacing);
                points.push(Point::new(u, v, 0.0));
                if b > 0 {
                    points.push(Point::new(u, 0.0, v));
                }
                if a > 0 && b > 0 {
                    points.push(Point::new(0.0, u, v));
                }
            }
        }
        PointCloud::new("box", points)
    }

    fn index_of(cloud: &PointCloud, x: f32, y: f32, z: f32) -> usize {
        cloud
            .points
            .iter()
            .position(|p| (p.x - x).abs() < 1e-5 && (p.y - y).abs() < 1e-5 && (p.z - z).abs() < 1e-5)
            .unwrap()
    }

    #[test]
    fn responses_match_hand_computed_values() {
        let cloud = plus_with_apex();
        let tree = Octree::from_cloud(&cloud);

        // Fitted normal is +z for every point.  Centre: m = (0, 0, 0.1),
        // s² = 0.89 / 5.
        let centre = corner_response(0, &cloud, &tree, 1.0);
        assert!((centre - 0.01 / 0.178).abs() < 1e-4, "centre {centre}");

        // Arm tips: m_z = 0.1, s² = 1.85 / 5.
        for i in 1..5 {
            let arm = corner_response(i, &cloud, &tree, 1.0);
            assert!((arm - 0.01 / 0.37).abs() < 1e-4, "arm {i}: {arm}");
        }

        // Apex: m = (0, 0, -0.5), s² = 1.89 / 5.
        let apex = corner_response(5, &cloud, &tree, 1.0);
        assert!((apex - 0.25 / 0.378).abs() < 1e-4, "apex {apex}");
    }

    #[test]
    fn default_config_detects_only_the_lifted_point() {
        let cloud = plus_with_apex();
        let tree = Octree::from_cloud(&cloud);
        let config = DetectorConfig::default();
        assert_eq!(config.radius, 1.0);
        assert_eq!(config.threshold, 0.1);
        assert!(config.non_max_suppression);

        for i in 0..5 {
            let r = corner_response(i, &cloud, &tree, config.radius);
            assert!(r < config.threshold, "coplanar point {i} responds {r}");
        }
        assert!(corner_response(5, &cloud, &tree, config.radius) >= config.threshold);

        let keypoints = KeypointDetector::new(config).unwrap().detect(&cloud);
        assert_eq!(keypoints.iter().map(|k| k.index).collect::<Vec<_>>(), vec![5]);
        assert_eq!(keypoints[0].position, cloud.points[5]);
    }

    #[test]
    fn planar_neighbourhood_has_zero_response() {
        let mut points = Vec::new();
        for i in -3..=3 {
            for j in -3..=3 {
                points.push(Point::new(i as f32 * 0.2, j as f32 * 0.2, 1.0));
            }
        }
        let cloud = PointCloud::new("plane", points);
        let tree = Octree::from_cloud(&cloud);
        for i in 0..cloud.len() {
            assert!(corner_response(i, &cloud, &tree, 0.5) < 1e-6);
        }
    }

    #[test]
    fn box_corner_outscores_edge_and_face() {
        let cloud = box_corner(10, 0.1);
        let tree = Octree::from_cloud(&cloud);

        let corner = corner_response(0, &cloud, &tree, 0.3);
        let edge = corner_response(index_of(&cloud, 0.5, 0.0, 0.0), &cloud, &tree, 0.3);
        let face = corner_response(index_of(&cloud, 0.5, 0.5, 0.0), &cloud, &tree, 0.3);

        assert!(corner > 0.3, "corner {corner}");
        assert!(edge > 0.05 && edge < corner, "edge {edge}");
        assert!(face < 1e-6, "face {face}");
    }

    #[test]
    fn too_few_neighbours_give_zero() {
        let cloud = PointCloud::new(
            "t",
            vec![
                Point::new(0.0, 0.0, 0.0),
                Point::new(0.1, 0.0, 0.0),
                Point::new(0.0, 0.1, 0.3),
            ],
        );
        let tree = Octree::from_cloud(&cloud);
        for i in 0..3 {
            assert_eq!(corner_response(i, &cloud, &tree, 1.0), 0.0);
        }
    }

    #[test]
    fn nms_suppresses_the_weaker_neighbour() {
        // Centre responds ~0.056, apex ~0.66.
        let with_nms = detector(0.05, true).detect(&plus_with_apex());
        assert_eq!(with_nms.iter().map(|k| k.index).collect::<Vec<_>>(), vec![5]);

        let without = detector(0.05, false).detect(&plus_with_apex());
        assert_eq!(without.iter().map(|k| k.index).collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn nms_tie_goes_to_lower_index() {
        let cloud = plus_with_apex();
        let tree = Octree::from_cloud(&cloud);
        let responses = vec![0.5, 0.0, 0.0, 0.0, 0.0, 0.5];
        assert!(is_local_maximum(0, &cloud, &tree, &responses, 1.0));
        assert!(!is_local_maximum(5, &cloud, &tree, &responses, 1.0));
    }

    #[test]
    fn empty_and_tiny_clouds_yield_nothing() {
        let d = detector(0.0, true);
        assert!(d.detect(&PointCloud::default()).is_empty());

        let two = PointCloud::new("t", vec![Point::new(0.0, 0.0, 0.0), Point::new(0.1, 0.0, 0.0)]);
        assert!(detector(0.01, true).detect(&two).is_empty());
    }

    #[test]
    fn non_finite_points_are_never_keypoints() {
        let mut points = vec![Point::new(f32::NAN, 0.0, 2.0)];
        points.extend(plus_with_apex().points);
        let cloud = PointCloud::new("t", points);

        // A zero threshold admits every finite point.
        let keypoints = detector(0.0, false).detect(&cloud);
        assert_eq!(
            keypoints.iter().map(|k| k.index).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );
        assert!(keypoints.iter().all(|k| is_finite_point(&k.position)));
    }

    #[test]
    fn output_is_independent_of_thread_count() {
        let run = |cloud: &PointCloud, threads, refine, radius| {
            KeypointDetector::new(DetectorConfig {
                num_threads: threads,
                refine,
                radius,
                threshold: 0.05,
                ..DetectorConfig::default()
            })
            .unwrap()
            .detect(cloud)
        };

        let scene = corner_scene();
        let single = run(&scene, 1, false, 0.4);
        assert_eq!(single, run(&scene, 4, false, 0.4));
        assert_eq!(single, run(&scene, 7, false, 0.4));
        assert_eq!(single, run(&scene, 1, false, 0.4));

        // Dense enough for every point to carry a normal at radius 0.1.
        let dense = box_corner(10, 0.05);
        let refined = run(&dense, 1, true, 0.2);
        assert!(!refined.is_empty());
        assert_eq!(refined, run(&dense, 5, true, 0.2));
        for k in &refined {
            let source = Point3::from(&dense.points[k.index]);
            assert!(is_finite_point(&k.position));
            assert!(Point3::from(&k.position).distance_squared(&source) <= 0.2 * 0.2 + 1e-6);
        }
    }

    #[test]
    fn keypoints_are_sorted_and_above_threshold() {
        let keypoints = KeypointDetector::new(DetectorConfig {
            radius: 0.4,
            threshold: 0.05,
            non_max_suppression: false,
            ..DetectorConfig::default()
        })
        .unwrap()
        .detect(&corner_scene());
        assert!(keypoints.windows(2).all(|w| w[0].index < w[1].index));
        assert!(keypoints.iter().all(|k| k.response >= 0.05 && k.response <= 1.0));
    }

    fn three_faces() -> (PointCloud, Vec<Normal>) {
        let mut points = Vec::new();
        let mut normals = Vec::new();
        for a in 1..=5 {
            for b in 1..=5 {
                let (u, v) = (a as f32 * 0.1, b as f32 * 0.1);
                points.push(Point::new(0.0, u, v));
                normals.push(Normal::new(1.0, 0.0, 0.0));
                points.push(Point::new(u, 0.0, v));
                normals.push(Normal::new(0.0, 1.0, 0.0));
                points.push(Point::new(u, v, 0.0));
                normals.push(Normal::new(0.0, 0.0, 1.0));
            }
        }
        (PointCloud::new("faces", points), normals)
    }

    #[test]
    fn refinement_converges_on_the_shared_corner() {
        let (cloud, normals) = three_faces();
        let tree = Octree::from_cloud(&cloud);
        let start = Point::new(0.1, 0.1, 0.1);
        let refined = refine_corner(&cloud, &tree, &normals, &start, 1.0);
        assert!(refined.x.abs() < 1e-5 && refined.y.abs() < 1e-5 && refined.z.abs() < 1e-5);
    }

    #[test]
    fn refinement_keeps_start_when_system_is_singular() {
        let (cloud, normals) = three_faces();
        // Keep only the z = 0 face.
        let (points, normals): (Vec<Point>, Vec<Normal>) = cloud
            .points
            .iter()
            .zip(&normals)
            .filter(|(_, n)| n.z == 1.0)
            .map(|(p, n)| (*p, *n))
            .unzip();
        let cloud = PointCloud::new("floor", points);
        let tree = Octree::from_cloud(&cloud);
        let start = Point::new(0.2, 0.2, 0.05);
        assert_eq!(refine_corner(&cloud, &tree, &normals, &start, 1.0), start);
    }

    #[test]
    fn refinement_discards_large_drift() {
        let (cloud, normals) = three_faces();
        let tree = Octree::from_cloud(&cloud);
        // Radius 0.25 still sees all three faces but the corner lies
        // further than 0.25 from the start.
        let start = Point::new(0.2, 0.2, 0.2);
        assert_eq!(refine_corner(&cloud, &tree, &normals, &start, 0.25), start);
    }

    #[test]
    fn rejects_invalid_radius() {
        let err = KeypointDetector::new(DetectorConfig {
            radius: 0.0,
            ..DetectorConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, PerceptionError::InvalidConfig(_)));
    }
}

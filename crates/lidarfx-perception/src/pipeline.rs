//! Per-frame processing: level → crop → detect → describe.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use lidarfx_types::{
    DetectorConfig, FilterSpec, KeypointRecord, KeypointSet, PerceptionError, PointCloud,
};

use crate::descriptor::DescriptorComputer;
use crate::filter::RangeFilter;
use crate::harris::{Keypoint, KeypointDetector};
use crate::normals::{NormalCache, NormalEstimator};
use crate::octree::Octree;
use crate::orientation::OrientationTracker;
use crate::transform::RigidTransformer;

/// Everything a [`FramePipeline`] needs, validated once at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub z_min: f32,
    pub z_max: f32,
    /// Orientation older than this marks the frame as stale.
    pub max_orientation_age: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            z_min: 2.0,
            z_max: 2.0,
            max_orientation_age: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PerceptionError> {
        self.detector.validate()?;
        if !self.z_min.is_finite() || !self.z_max.is_finite() {
            return Err(PerceptionError::InvalidConfig(format!(
                "z range must be finite, got [{}, {}]",
                self.z_min, self.z_max
            )));
        }
        if self.z_min > self.z_max {
            return Err(PerceptionError::InvalidConfig(format!(
                "z_min {} exceeds z_max {}",
                self.z_min, self.z_max
            )));
        }
        if self.max_orientation_age.is_zero() {
            return Err(PerceptionError::InvalidConfig(
                "max orientation age must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters for one processed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub input_points: usize,
    pub filtered_points: usize,
    /// Keypoints after threshold, NMS and refinement.
    pub keypoints_detected: usize,
    /// Keypoints that also received a normal and a descriptor.
    pub keypoints_described: usize,
    pub orientation_stale: bool,
    pub elapsed: Duration,
}

/// Both outputs of a frame plus its counters.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub filtered: PointCloud,
    pub keypoints: KeypointSet,
    pub stats: FrameStats,
}

/// Stateless per-frame processor; the only shared input is the
/// [`OrientationTracker`] passed to [`process`](Self::process).
#[derive(Debug)]
pub struct FramePipeline {
    config: PipelineConfig,
    filter: RangeFilter,
    detector: KeypointDetector,
    descriptors: DescriptorComputer,
}

impl FramePipeline {
    /// # Errors
    ///
    /// [`PerceptionError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: PipelineConfig) -> Result<Self, PerceptionError> {
        config.validate()?;
        Ok(Self {
            filter: RangeFilter::with_z_range(config.z_min, config.z_max)?,
            detector: KeypointDetector::new(config.detector)?,
            descriptors: DescriptorComputer::new(),
            config,
        })
    }

    /// Replace the default crop with `spec`.
    pub fn with_filter_spec(mut self, spec: FilterSpec) -> Result<Self, PerceptionError> {
        self.filter = RangeFilter::new(spec)?;
        Ok(self)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one frame through every stage.
    #[instrument(skip_all, fields(frame_id = %frame.frame_id, points = frame.len()))]
    pub fn process(&self, frame: &PointCloud, tracker: &OrientationTracker) -> FrameOutput {
        let started = Instant::now();

        let orientation = tracker.snapshot();
        let stale = orientation.is_stale(self.config.max_orientation_age);
        if stale {
            warn!(
                age_ms = orientation.age.map(|a| a.as_millis() as u64),
                "orientation is stale, levelling with the latest sample"
            );
        }

        let levelled = RigidTransformer::from_snapshot(&orientation).apply(frame);
        let filtered = self.filter.apply(&levelled);
        debug!(
            roll = orientation.roll,
            pitch = orientation.pitch,
            kept = filtered.len(),
            "frame levelled and cropped"
        );

        let tree = Octree::from_cloud(&filtered);
        let detected = self.detector.detect_indexed(&filtered, &tree);
        let keypoints = self.describe_indexed(&filtered, &tree, &detected);

        let stats = FrameStats {
            input_points: frame.len(),
            filtered_points: filtered.len(),
            keypoints_detected: detected.len(),
            keypoints_described: keypoints.keypoints.len(),
            orientation_stale: stale,
            elapsed: started.elapsed(),
        };
        info!(
            filtered = stats.filtered_points,
            detected = stats.keypoints_detected,
            described = stats.keypoints_described,
            elapsed_ms = stats.elapsed.as_secs_f64() * 1e3,
            "frame processed"
        );

        FrameOutput {
            filtered,
            keypoints,
            stats,
        }
    }

    /// Attach normals and descriptors to `keypoints` detected in `cloud`.
    /// Keypoints without a valid normal or descriptor are dropped; the rest
    /// keep their order.
    pub fn describe(&self, cloud: &PointCloud, keypoints: &[Keypoint]) -> KeypointSet {
        let tree = Octree::from_cloud(cloud);
        self.describe_indexed(cloud, &tree, keypoints)
    }

    fn describe_indexed(
        &self,
        cloud: &PointCloud,
        tree: &Octree,
        keypoints: &[Keypoint],
    ) -> KeypointSet {
        let estimator = NormalEstimator::new(cloud, tree);
        let cache = NormalCache::new(estimator);

        let records: Vec<KeypointRecord> = self.detector.install(|| {
            keypoints
                .par_iter()
                .filter_map(|k| {
                    let normal = estimator.normal_at(&k.position);
                    if !normal.is_valid() {
                        return None;
                    }
                    let descriptor =
                        self.descriptors
                            .compute(cloud, tree, &cache, &k.position, &normal)?;
                    Some(KeypointRecord {
                        position: k.position,
                        normal,
                        descriptor,
                        response: k.response,
                    })
                })
                .collect()
        });

        if records.len() < keypoints.len() {
            debug!(
                skipped = keypoints.len() - records.len(),
                "keypoints without a usable normal or descriptor"
            );
        }
        KeypointSet {
            frame_id: cloud.frame_id.clone(),
            keypoints: records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orientation::OrientationSample;
    use lidarfx_types::{Axis, Point, RangePredicate};

    fn config(z_min: f32, z_max: f32, threshold: f32) -> PipelineConfig {
        PipelineConfig {
            detector: DetectorConfig {
                num_threads: 2,
                threshold,
                ..DetectorConfig::default()
            },
            z_min,
            z_max,
            max_orientation_age: Duration::from_secs(60),
        }
    }

    fn fresh_tracker() -> OrientationTracker {
        let tracker = OrientationTracker::new();
        tracker.update(OrientationSample {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        });
        tracker
    }

    /// Plus sign of spacing 0.4 at z = 2 inside the kept corridor, with one
    /// point lifted sharply, 0.5 above its centre.
    fn plus_frame() -> PointCloud {
        PointCloud::new(
            "velodyne",
            vec![
                Point::new(5.0, 0.0, 2.0),
                Point::new(5.4, 0.0, 2.0),
                Point::new(4.6, 0.0, 2.0),
                Point::new(5.0, 0.4, 2.0),
                Point::new(5.0, -0.4, 2.0),
                Point::new(5.0, 0.0, 2.5),
            ],
        )
    }

    #[test]
    fn only_the_lifted_point_is_detected() {
        let pipeline = FramePipeline::new(config(1.5, 3.0, 0.1)).unwrap();
        let out = pipeline.process(&plus_frame(), &fresh_tracker());

        assert_eq!(out.filtered.len(), 6);
        assert_eq!(out.stats.keypoints_detected, 1);
        assert!(!out.stats.orientation_stale);

        let detected = pipeline.detector.detect(&out.filtered);
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].index, 5);
        // The coplanar points respond, but below the threshold.
        let tree = Octree::from_cloud(&out.filtered);
        for i in 0..5 {
            let r = crate::harris::corner_response(i, &out.filtered, &tree, 1.0);
            assert!(r > 0.0 && r < 0.1, "point {i} responds {r}");
        }
        // Six sparse points cannot support a normal at radius 0.1.
        assert!(out.keypoints.keypoints.is_empty());
        assert_eq!(out.keypoints.frame_id, "velodyne");
    }

    #[test]
    fn frame_on_the_x_band_is_filtered_away() {
        let pipeline = FramePipeline::new(config(0.0, 5.0, 0.1)).unwrap();
        let frame = PointCloud::new(
            "velodyne",
            (0..20).map(|i| Point::new(0.0, 0.0, i as f32 * 0.1)).collect(),
        );
        let out = pipeline.process(&frame, &fresh_tracker());
        assert!(out.filtered.is_empty());
        assert!(out.keypoints.keypoints.is_empty());
        assert_eq!(out.stats.input_points, 20);
        assert_eq!(out.stats.filtered_points, 0);
    }

    #[test]
    fn orientation_levels_before_cropping() {
        // A quarter turn of roll maps +Y onto +Z: the point at y = 2 lands
        // at z = 2 and survives, the point at z = 2 leaves the y corridor.
        let pipeline = FramePipeline::new(config(1.5, 2.5, 0.1)).unwrap();
        let tracker = OrientationTracker::new();
        tracker.update(OrientationSample {
            roll: std::f64::consts::FRAC_PI_2,
            pitch: 0.0,
            yaw: 0.0,
        });
        let frame = PointCloud::new(
            "velodyne",
            vec![Point::new(5.0, 2.0, 0.0), Point::new(5.0, 0.0, 2.0)],
        );
        let out = pipeline.process(&frame, &tracker);
        assert_eq!(out.filtered.len(), 1);
        assert!((out.filtered.points[0].z - 2.0).abs() < 1e-5);
    }

    #[test]
    fn missing_orientation_is_reported_stale() {
        let pipeline = FramePipeline::new(config(1.5, 3.0, 0.1)).unwrap();
        let out = pipeline.process(&plus_frame(), &OrientationTracker::new());
        assert!(out.stats.orientation_stale);
        assert_eq!(out.filtered.len(), 6);
    }

    /// Dense, gently curved patch of spacing 0.02 around (5, 0, 2).
    fn patch() -> Vec<Point> {
        let mut points = Vec::new();
        for i in -10..=10 {
            for j in -10..=10 {
                let (x, y) = (i as f32 * 0.02, j as f32 * 0.02);
                points.push(Point::new(5.0 + x, y, 2.0 + 0.4 * x * x - 0.2 * y * y));
            }
        }
        points
    }

    #[test]
    fn sparse_keypoint_is_skipped_while_dense_one_is_described() {
        let pipeline = FramePipeline::new(config(0.0, 5.0, 0.1))
            .unwrap()
            .with_filter_spec(FilterSpec::default())
            .unwrap();

        let mut points = patch();
        let dense = points.len() / 2; // patch centre
        let lonely = points.len();
        points.push(Point::new(20.0, 0.0, 2.0));
        points.push(Point::new(20.05, 0.0, 2.0));
        let cloud = PointCloud::new("velodyne", points);

        let keypoints = vec![
            Keypoint {
                index: dense,
                position: cloud.points[dense],
                response: 0.4,
            },
            Keypoint {
                index: lonely,
                position: cloud.points[lonely],
                response: 0.7,
            },
        ];
        let set = pipeline.describe(&cloud, &keypoints);

        assert_eq!(set.keypoints.len(), 1);
        let record = &set.keypoints[0];
        assert_eq!(record.position, cloud.points[dense]);
        assert_eq!(record.response, 0.4);
        assert!(record.normal.is_valid());
        assert_eq!(record.descriptor.as_slice().len(), lidarfx_types::DESCRIPTOR_LEN);
    }

    #[test]
    fn processing_is_repeatable() {
        let pipeline = FramePipeline::new(config(0.0, 5.0, 0.01))
            .unwrap()
            .with_filter_spec(FilterSpec::new(vec![RangePredicate::keep(Axis::Z, 0.0, 5.0)]))
            .unwrap();
        let frame = PointCloud::new("velodyne", patch());
        let tracker = fresh_tracker();
        let a = pipeline.process(&frame, &tracker);
        let b = pipeline.process(&frame, &tracker);
        assert_eq!(a.filtered, b.filtered);
        assert_eq!(a.keypoints, b.keypoints);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(FramePipeline::new(config(3.0, 1.0, 0.1)).is_err());
        assert!(FramePipeline::new(config(f32::NAN, 1.0, 0.1)).is_err());
        assert!(FramePipeline::new(config(0.0, 1.0, f32::INFINITY)).is_err());

        let mut zero_age = config(0.0, 1.0, 0.1);
        zero_age.max_orientation_age = Duration::ZERO;
        assert!(matches!(
            FramePipeline::new(zero_age),
            Err(PerceptionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn default_config_matches_node_parameters() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.detector, DetectorConfig::default());
        assert_eq!(cfg.z_min, 2.0);
        assert_eq!(cfg.z_max, 2.0);
        assert!(cfg.validate().is_ok());
    }
}

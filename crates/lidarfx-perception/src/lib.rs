//! `lidarfx-perception` – geometric front-end for LiDAR frames.
//!
//! Levels each point-cloud frame with the platform's latest roll/pitch,
//! crops it to a region of interest, detects covariance-based 3-D corners
//! and attaches a surface normal and a 352-element shape descriptor to each.
//!
//! # Modules
//!
//! - [`orientation`] – [`OrientationTracker`][orientation::OrientationTracker]:
//!   latest-value store for IMU roll/pitch shared with frame processing.
//! - [`transform`] – [`RigidTransformer`][transform::RigidTransformer]:
//!   roll-then-pitch rotation applied to every point.
//! - [`filter`] – [`RangeFilter`][filter::RangeFilter]: ordered axis-range
//!   keep/exclude predicates.
//! - [`octree`] – [`Octree`][octree::Octree]: spatial index answering the
//!   radius queries every stage below depends on.
//! - [`harris`] – [`KeypointDetector`][harris::KeypointDetector]: corner
//!   response, threshold, non-maximum suppression and refinement.
//! - [`normals`] – [`NormalEstimator`][normals::NormalEstimator]: plane fit
//!   over a fixed small radius.
//! - [`descriptor`] – [`DescriptorComputer`][descriptor::DescriptorComputer]:
//!   SHOT-style histogram in a local reference frame.
//! - [`pipeline`] – [`FramePipeline`][pipeline::FramePipeline]: runs the
//!   stages above for one frame.

pub mod descriptor;
pub mod filter;
pub mod harris;
pub mod normals;
pub mod octree;
pub mod orientation;
pub mod pipeline;
pub mod transform;

pub use orientation::OrientationTracker;
pub use pipeline::{FrameOutput, FramePipeline, FrameStats, PipelineConfig};

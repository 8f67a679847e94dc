//! Sequential axis-aligned range filter.
//!
//! A [`FilterSpec`] is an ordered list of interval predicates.  Each
//! predicate runs on the survivors of the previous one, so the result is the
//! logical AND of all predicates while point order is preserved.

use tracing::debug;

use lidarfx_types::{Axis, FilterSpec, PerceptionError, PointCloud, RangePredicate};

/// Lower edge of the X band removed from every frame (metres).
pub const X_EXCLUSION_MIN: f32 = -131.0;
/// Upper edge of the X band removed from every frame (metres).
pub const X_EXCLUSION_MAX: f32 = 1.0;
/// Lateral corridor kept in every frame (metres).
pub const Y_KEEP_MIN: f32 = -1.0;
pub const Y_KEEP_MAX: f32 = 1.0;

/// The pipeline's default crop: keep z in `[z_min, z_max]`, drop the
/// `[X_EXCLUSION_MIN, X_EXCLUSION_MAX]` band in x, keep the
/// `[Y_KEEP_MIN, Y_KEEP_MAX]` corridor in y.
pub fn default_filter_spec(z_min: f32, z_max: f32) -> FilterSpec {
    FilterSpec::new(vec![
        RangePredicate::keep(Axis::Z, z_min, z_max),
        RangePredicate::exclude(Axis::X, X_EXCLUSION_MIN, X_EXCLUSION_MAX),
        RangePredicate::keep(Axis::Y, Y_KEEP_MIN, Y_KEEP_MAX),
    ])
}

/// Applies a validated [`FilterSpec`] to clouds.
#[derive(Debug, Clone)]
pub struct RangeFilter {
    spec: FilterSpec,
}

impl RangeFilter {
    /// Validate `spec` and build the filter.
    ///
    /// # Errors
    ///
    /// [`PerceptionError::InvalidConfig`] when a bound is NaN or a lower bound
    /// exceeds its upper bound.
    pub fn new(spec: FilterSpec) -> Result<Self, PerceptionError> {
        for (i, p) in spec.predicates.iter().enumerate() {
            if p.lower.is_nan() || p.upper.is_nan() {
                return Err(PerceptionError::InvalidConfig(format!(
                    "range predicate {i} on {:?} has a NaN bound",
                    p.axis
                )));
            }
            if p.lower > p.upper {
                return Err(PerceptionError::InvalidConfig(format!(
                    "range predicate {i} on {:?}: lower bound {} exceeds upper bound {}",
                    p.axis, p.lower, p.upper
                )));
            }
        }
        Ok(Self { spec })
    }

    /// Filter with [`default_filter_spec`].
    pub fn with_z_range(z_min: f32, z_max: f32) -> Result<Self, PerceptionError> {
        Self::new(default_filter_spec(z_min, z_max))
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Return a new cloud holding the points of `cloud` that pass every
    /// predicate, in their original order.
    pub fn apply(&self, cloud: &PointCloud) -> PointCloud {
        let mut points = cloud.points.clone();
        for predicate in &self.spec.predicates {
            let before = points.len();
            points.retain(|p| predicate.accepts(p));
            debug!(
                axis = ?predicate.axis,
                mode = ?predicate.mode,
                before,
                after = points.len(),
                "range predicate applied"
            );
        }
        cloud.with_points(points)
    }
}

//! Spatial index for neighbourhood queries.
//!
//! Partitions 3-D space using a recursive **Octree** whose leaves hold
//! `(cloud index, position)` entries.  Every geometric stage of the frame
//! pipeline (corner response, normals, descriptors) asks the same question:
//! "which points of this cloud lie within `r` of here?".
//!
//! # Key types
//!
//! | Type | Role |
//! |------|------|
//! | [`Point3`]   | A 3-D coordinate.                                      |
//! | [`Aabb`]     | An axis-aligned bounding box.                          |
//! | [`Octree`]   | Spatial index; insert indexed points, radius search.   |
//!
//! # Example
//!
//! ```rust
//! use lidarfx_perception::octree::{Octree, Point3};
//! use lidarfx_types::{Point, PointCloud};
//!
//! let cloud = PointCloud::new("velodyne", vec![
//!     Point::new(0.0, 0.0, 0.0),
//!     Point::new(0.05, 0.0, 0.0),
//!     Point::new(3.0, 0.0, 0.0),
//! ]);
//! let tree = Octree::from_cloud(&cloud);
//!
//! assert_eq!(tree.radius_search(Point3::new(0.0, 0.0, 0.0), 0.1), vec![0, 1]);
//! ```

use lidarfx_types::{Point, PointCloud};

/// Leaf capacity used by [`Octree::from_cloud`].
pub const DEFAULT_LEAF_CAPACITY: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Point3
// ────────────────────────────────────────────────────────────────────────────

/// A point in 3-D space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    /// Create a new point.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean distance to `other`.
    pub fn distance_squared(&self, other: &Point3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl From<&Point> for Point3 {
    fn from(p: &Point) -> Self {
        Self::new(p.x, p.y, p.z)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3,
    pub max: Point3,
}

impl Aabb {
    /// Create a bounding box from its two opposite corners.
    ///
    /// The constructor normalises the corners so that `min ≤ max` per axis.
    pub fn new(a: Point3, b: Point3) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Smallest box containing every finite point of `cloud`, grown by
    /// `margin` on each side.  Returns `None` when the cloud holds no finite
    /// point.
    pub fn enclosing(cloud: &PointCloud, margin: f32) -> Option<Self> {
        let mut finite = cloud.points.iter().map(Point3::from).filter(Point3::is_finite);
        let first = finite.next()?;
        let (min, max) = finite.fold((first, first), |(lo, hi), p| {
            (
                Point3::new(lo.x.min(p.x), lo.y.min(p.y), lo.z.min(p.z)),
                Point3::new(hi.x.max(p.x), hi.y.max(p.y), hi.z.max(p.z)),
            )
        });
        Some(Self::new(
            Point3::new(min.x - margin, min.y - margin, min.z - margin),
            Point3::new(max.x + margin, max.y + margin, max.z + margin),
        ))
    }

    /// Cube of half-width `radius` centred on `centre`.
    pub fn around(centre: Point3, radius: f32) -> Self {
        Self::new(
            Point3::new(centre.x - radius, centre.y - radius, centre.z - radius),
            Point3::new(centre.x + radius, centre.y + radius, centre.z + radius),
        )
    }

    /// Return the centre point of the box.
    pub fn centre(&self) -> Point3 {
        Point3::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    /// True when the point lies inside or on the boundary of the box.
    pub fn contains_point(&self, p: Point3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// True when `other` overlaps (intersects or touches) this box.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Octree
// ────────────────────────────────────────────────────────────────────────────

/// A recursive spatial index that subdivides 3-D space into eight octants.
///
/// Entries are stored in the deepest node whose bounding box still contains
/// them.  Subdividing stops when either
/// - the number of entries in a node is ≤ `capacity`, or
/// - `max_depth` levels have already been created.
///
/// Build one per frame with [`Octree::from_cloud`], then query with
/// [`Octree::radius_search`].
#[derive(Debug)]
pub struct Octree {
    root: OctreeNode,
    max_depth: usize,
}

impl Octree {
    /// Create an empty octree with an explicit maximum subdivision depth.
    pub fn with_max_depth(bounds: Aabb, capacity: usize, max_depth: usize) -> Self {
        Self {
            root: OctreeNode::new(bounds, capacity),
            max_depth,
        }
    }

    /// Index every finite point of `cloud` under its position in
    /// `cloud.points`.  Non-finite points are left out and therefore never
    /// show up as anybody's neighbour.
    pub fn from_cloud(cloud: &PointCloud) -> Self {
        let bounds = Aabb::enclosing(cloud, 1e-3)
            .unwrap_or_else(|| Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.0, 0.0)));
        let mut tree = Self::with_max_depth(bounds, DEFAULT_LEAF_CAPACITY, 10);
        for (index, p) in cloud.points.iter().enumerate() {
            tree.insert(index, Point3::from(p));
        }
        tree
    }

    /// Insert an entry into the tree.
    ///
    /// Points outside the root bounding box are silently ignored.
    pub fn insert(&mut self, index: usize, point: Point3) {
        self.root.insert(Entry { index, point }, self.max_depth, 0);
    }

    /// Return the total number of entries stored in the tree.
    pub fn len(&self) -> usize {
        self.root.count()
    }

    /// True when the tree contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of all entries within `radius` (inclusive) of `centre`,
    /// sorted ascending.
    pub fn radius_search(&self, centre: Point3, radius: f32) -> Vec<usize> {
        let mut out = Vec::new();
        if !centre.is_finite() || radius.is_nan() || radius < 0.0 {
            return out;
        }
        let region = Aabb::around(centre, radius);
        self.root
            .collect_within(&region, centre, radius * radius, &mut out);
        out.sort_unstable();
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OctreeNode – internal implementation
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Entry {
    index: usize,
    point: Point3,
}

#[derive(Debug)]
struct OctreeNode {
    bounds: Aabb,
    capacity: usize,
    /// Entries stored at this node (only non-empty when the node is a leaf).
    entries: Vec<Entry>,
    /// Eight children; `None` while this node is a leaf.
    children: Option<Box<[OctreeNode; 8]>>,
}

impl OctreeNode {
    fn new(bounds: Aabb, capacity: usize) -> Self {
        Self {
            bounds,
            capacity,
            entries: Vec::new(),
            children: None,
        }
    }

    fn count(&self) -> usize {
        match &self.children {
            None => self.entries.len(),
            Some(children) => children.iter().map(|c| c.count()).sum(),
        }
    }

    fn insert(&mut self, entry: Entry, max_depth: usize, depth: usize) {
        if !self.bounds.contains_point(entry.point) {
            return;
        }

        match self.children.as_mut() {
            None => {
                self.entries.push(entry);
                // Subdivide when over capacity and depth budget remains.
                if self.entries.len() > self.capacity && depth < max_depth {
                    self.subdivide(max_depth, depth);
                }
            }
            Some(children) => {
                if let Some(child) = children
                    .iter_mut()
                    .find(|c| c.bounds.contains_point(entry.point))
                {
                    child.insert(entry, max_depth, depth + 1);
                }
            }
        }
    }

    fn collect_within(&self, region: &Aabb, centre: Point3, radius_sq: f32, out: &mut Vec<usize>) {
        if !self.bounds.overlaps(region) {
            return;
        }
        match &self.children {
            None => out.extend(
                self.entries
                    .iter()
                    .filter(|e| e.point.distance_squared(&centre) <= radius_sq)
                    .map(|e| e.index),
            ),
            Some(children) => {
                for child in children.iter() {
                    child.collect_within(region, centre, radius_sq, out);
                }
            }
        }
    }

    /// Split this leaf into eight children and redistribute existing entries.
    fn subdivide(&mut self, max_depth: usize, depth: usize) {
        let c = self.bounds.centre();
        let min = self.bounds.min;
        let max = self.bounds.max;

        let octants = [
            Aabb::new(min, c),
            Aabb::new(Point3::new(c.x, min.y, min.z), Point3::new(max.x, c.y, c.z)),
            Aabb::new(Point3::new(min.x, c.y, min.z), Point3::new(c.x, max.y, c.z)),
            Aabb::new(Point3::new(c.x, c.y, min.z), Point3::new(max.x, max.y, c.z)),
            Aabb::new(Point3::new(min.x, min.y, c.z), Point3::new(c.x, c.y, max.z)),
            Aabb::new(Point3::new(c.x, min.y, c.z), Point3::new(max.x, c.y, max.z)),
            Aabb::new(Point3::new(min.x, c.y, c.z), Point3::new(c.x, max.y, max.z)),
            Aabb::new(c, max),
        ];

        let cap = self.capacity;
        let mut children = Box::new(octants.map(|b| OctreeNode::new(b, cap)));

        let entries = std::mem::take(&mut self.entries);
        for e in entries {
            if let Some(child) = children.iter_mut().find(|c| c.bounds.contains_point(e.point)) {
                child.insert(e, max_depth, depth + 1);
            }
        }

        self.children = Some(children);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud_of(points: &[(f32, f32, f32)]) -> PointCloud {
        PointCloud::new(
            "test",
            points.iter().map(|&(x, y, z)| Point::new(x, y, z)).collect(),
        )
    }

    /// Brute-force reference for radius queries.
    fn brute_force(cloud: &PointCloud, centre: Point3, radius: f32) -> Vec<usize> {
        cloud
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| Point3::from(*p).distance_squared(&centre) <= radius * radius)
            .map(|(i, _)| i)
            .collect()
    }

    // ── Aabb ────────────────────────────────────────────────────────────────

    #[test]
    fn aabb_contains_boundary_point() {
        let b = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        assert!(b.contains_point(Point3::new(0.0, 0.0, 0.0)));
        assert!(b.contains_point(Point3::new(1.0, 1.0, 1.0)));
        assert!(!b.contains_point(Point3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn aabb_overlaps_touching_boxes() {
        let a = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let b = Aabb::new(Point3::new(1.0, 0.0, 0.0), Point3::new(2.0, 1.0, 1.0));
        let c = Aabb::new(Point3::new(2.5, 0.0, 0.0), Point3::new(3.0, 1.0, 1.0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn aabb_normalises_min_max() {
        let b = Aabb::new(Point3::new(2.0, 2.0, 2.0), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.max, Point3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn enclosing_skips_non_finite_points() {
        let cloud = cloud_of(&[(f32::NAN, 0.0, 0.0), (1.0, 2.0, 3.0), (-1.0, 0.0, 5.0)]);
        let b = Aabb::enclosing(&cloud, 0.0).unwrap();
        assert_eq!(b.min, Point3::new(-1.0, 0.0, 3.0));
        assert_eq!(b.max, Point3::new(1.0, 2.0, 5.0));
    }

    #[test]
    fn enclosing_empty_cloud_is_none() {
        assert!(Aabb::enclosing(&PointCloud::default(), 0.1).is_none());
    }

    // ── Octree ──────────────────────────────────────────────────────────────

    #[test]
    fn empty_cloud_yields_empty_tree() {
        let tree = Octree::from_cloud(&PointCloud::default());
        assert!(tree.is_empty());
        assert!(tree.radius_search(Point3::new(0.0, 0.0, 0.0), 10.0).is_empty());
    }

    #[test]
    fn non_finite_points_are_not_indexed() {
        let cloud = cloud_of(&[(0.0, 0.0, 0.0), (f32::NAN, 0.0, 0.0), (0.0, f32::INFINITY, 0.0)]);
        let tree = Octree::from_cloud(&cloud);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn radius_search_is_inclusive_and_sorted() {
        let cloud = cloud_of(&[(2.0, 0.0, 0.0), (1.0, 0.0, 0.0), (0.0, 0.0, 0.0), (0.5, 0.0, 0.0)]);
        let tree = Octree::from_cloud(&cloud);
        assert_eq!(tree.radius_search(Point3::new(0.0, 0.0, 0.0), 1.0), vec![1, 2, 3]);
    }

    #[test]
    fn radius_search_with_nan_centre_is_empty() {
        let cloud = cloud_of(&[(0.0, 0.0, 0.0)]);
        let tree = Octree::from_cloud(&cloud);
        assert!(tree.radius_search(Point3::new(f32::NAN, 0.0, 0.0), 1.0).is_empty());
    }

    #[test]
    fn radius_search_matches_brute_force_after_subdivision() {
        // 10×10×4 grid forces several levels of subdivision.
        let mut pts = Vec::new();
        for ix in 0..10 {
            for iy in 0..10 {
                for iz in 0..4 {
                    pts.push((ix as f32 * 0.1, iy as f32 * 0.1, iz as f32 * 0.25));
                }
            }
        }
        let cloud = cloud_of(&pts);
        let tree = Octree::from_cloud(&cloud);
        assert_eq!(tree.len(), pts.len());

        for centre in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.45, 0.45, 0.4),
            Point3::new(0.9, 0.1, 0.75),
            Point3::new(5.0, 5.0, 5.0),
        ] {
            for radius in [0.05, 0.15, 0.3] {
                assert_eq!(
                    tree.radius_search(centre, radius),
                    brute_force(&cloud, centre, radius),
                    "centre={centre:?} radius={radius}"
                );
            }
        }
    }

    #[test]
    fn coincident_points_beyond_capacity_are_all_kept() {
        let pts = vec![(1.0, 1.0, 1.0); DEFAULT_LEAF_CAPACITY * 3];
        let mut cloud = cloud_of(&pts);
        cloud.points.push(Point::new(0.0, 0.0, 0.0));
        let tree = Octree::from_cloud(&cloud);
        assert_eq!(tree.len(), pts.len() + 1);
        assert_eq!(
            tree.radius_search(Point3::new(1.0, 1.0, 1.0), 0.01).len(),
            pts.len()
        );
    }
}

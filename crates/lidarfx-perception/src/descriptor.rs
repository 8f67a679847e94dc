//! SHOT-style local shape descriptor.
//!
//! The support sphere of radius [`DESCRIPTOR_SEARCH_RADIUS`] around a
//! keypoint is split into 2 radial shells × 2 elevation halves × 8 azimuth
//! sectors, expressed in a local reference frame (LRF) anchored on the
//! keypoint normal.  Each of the 32 volumes holds an 11-bin histogram of the
//! unsigned cosine between a neighbour's normal and the LRF z axis.
//! Contributions are spread over adjacent bins in all four dimensions and
//! the 352-element result is L2-normalised.

use std::f64::consts::{FRAC_PI_2, PI, TAU};

use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use lidarfx_types::{DESCRIPTOR_LEN, Descriptor, Normal, Point, PointCloud};

use crate::normals::NormalCache;
use crate::octree::{Octree, Point3};

/// Support radius of every descriptor (metres).
pub const DESCRIPTOR_SEARCH_RADIUS: f32 = 0.5;

/// Usable neighbours required before a reference frame is attempted.
pub const MIN_LRF_NEIGHBOURS: usize = 3;

pub const RADIAL_BINS: usize = 2;
pub const ELEVATION_BINS: usize = 2;
pub const AZIMUTH_BINS: usize = 8;
pub const COSINE_BINS: usize = 11;

const _: () = assert!(RADIAL_BINS * ELEVATION_BINS * AZIMUTH_BINS * COSINE_BINS == DESCRIPTOR_LEN);

/// Neighbours closer than this to the keypoint are treated as the keypoint.
const SELF_EPSILON: f64 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Local reference frame
// ────────────────────────────────────────────────────────────────────────────

struct Neighbour {
    index: usize,
    offset: Vector3<f64>,
    distance: f64,
}

/// Orthonormal frame attached to a keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFrame {
    pub x: Vector3<f64>,
    pub y: Vector3<f64>,
    pub z: Vector3<f64>,
}

/// Flip `axis` so that most offsets lie on its positive side.  Offsets
/// within `tol` of the plane do not vote; a tie falls back to the sign of the
/// weighted sum.
fn disambiguate(axis: Vector3<f64>, neighbours: &[Neighbour], radius: f64) -> Vector3<f64> {
    let tol = 1e-6 * radius;
    let (mut pos, mut neg) = (0usize, 0usize);
    let mut weighted = 0.0;
    for n in neighbours {
        let proj = n.offset.dot(&axis);
        if proj > tol {
            pos += 1;
        } else if proj < -tol {
            neg += 1;
        }
        weighted += (radius - n.distance) * proj;
    }
    if neg > pos || (neg == pos && weighted < 0.0) {
        -axis
    } else {
        axis
    }
}

fn local_frame(normal: &Normal, neighbours: &[Neighbour], radius: f64) -> Option<LocalFrame> {
    if neighbours.len() < MIN_LRF_NEIGHBOURS {
        return None;
    }
    let z = Vector3::new(normal.x as f64, normal.y as f64, normal.z as f64).try_normalize(1e-12)?;
    let z = disambiguate(z, neighbours, radius);

    let mut scatter = Matrix3::<f64>::zeros();
    let mut total = 0.0;
    for n in neighbours {
        let w = radius - n.distance;
        scatter += w * n.offset * n.offset.transpose();
        total += w;
    }
    if total <= 0.0 {
        return None;
    }
    scatter /= total;

    let eigen = SymmetricEigen::new(scatter);
    let principal = eigen.eigenvectors.column(eigen.eigenvalues.imax()).into_owned();
    let projected = principal - principal.dot(&z) * z;
    if projected.norm() < 1e-6 {
        return None;
    }
    let x = disambiguate(projected.normalize(), neighbours, radius);
    let y = z.cross(&x);
    Some(LocalFrame { x, y, z })
}

// ────────────────────────────────────────────────────────────────────────────
// Interpolation helpers
// ────────────────────────────────────────────────────────────────────────────

/// Split a continuous bin coordinate (bin centres at integers) between the
/// two nearest bins, clamping at both ends.
fn linear_split(pos: f64, bins: usize) -> [(usize, f64); 2] {
    let last = bins - 1;
    let lower = pos.floor();
    if lower < 0.0 {
        return [(0, 1.0), (0, 0.0)];
    }
    let lower_idx = lower as usize;
    if lower_idx >= last {
        return [(last, 1.0), (last, 0.0)];
    }
    let frac = pos - lower;
    [(lower_idx, 1.0 - frac), (lower_idx + 1, frac)]
}

/// Like [`linear_split`] but wrapping around.
fn circular_split(pos: f64, bins: usize) -> [(usize, f64); 2] {
    let lower = pos.floor();
    let frac = pos - lower;
    let n = bins as i64;
    let i0 = (lower as i64).rem_euclid(n) as usize;
    let i1 = (lower as i64 + 1).rem_euclid(n) as usize;
    [(i0, 1.0 - frac), (i1, frac)]
}

fn bin_index(radial: usize, elevation: usize, azimuth: usize, cosine: usize) -> usize {
    ((radial * ELEVATION_BINS + elevation) * AZIMUTH_BINS + azimuth) * COSINE_BINS + cosine
}

// ────────────────────────────────────────────────────────────────────────────
// DescriptorComputer
// ────────────────────────────────────────────────────────────────────────────

/// Computes descriptors for keypoints of one cloud.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorComputer {
    radius: f32,
}

impl Default for DescriptorComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorComputer {
    pub fn new() -> Self {
        Self {
            radius: DESCRIPTOR_SEARCH_RADIUS,
        }
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    fn neighbours(&self, cloud: &PointCloud, tree: &Octree, centre: &Vector3<f64>) -> Vec<Neighbour> {
        let query = Point3::new(centre.x as f32, centre.y as f32, centre.z as f32);
        tree.radius_search(query, self.radius)
            .into_iter()
            .filter_map(|index| {
                let p = &cloud.points[index];
                let offset = Vector3::new(p.x as f64, p.y as f64, p.z as f64) - centre;
                let distance = offset.norm();
                (distance >= SELF_EPSILON).then_some(Neighbour {
                    index,
                    offset,
                    distance,
                })
            })
            .collect()
    }

    /// Reference frame for a keypoint, or `None` when it cannot be resolved.
    pub fn local_frame(
        &self,
        cloud: &PointCloud,
        tree: &Octree,
        keypoint: &Point,
        normal: &Normal,
    ) -> Option<LocalFrame> {
        let centre = Vector3::new(keypoint.x as f64, keypoint.y as f64, keypoint.z as f64);
        let neighbours = self.neighbours(cloud, tree, &centre);
        local_frame(normal, &neighbours, self.radius as f64)
    }

    /// Descriptor of `keypoint` with surface normal `normal`.
    ///
    /// Returns `None` when the normal is invalid, the reference frame is
    /// undefined, or no neighbour with a valid normal falls inside the
    /// support.
    pub fn compute(
        &self,
        cloud: &PointCloud,
        tree: &Octree,
        normals: &NormalCache<'_>,
        keypoint: &Point,
        normal: &Normal,
    ) -> Option<Descriptor> {
        if !normal.is_valid() {
            return None;
        }
        let radius = self.radius as f64;
        let centre = Vector3::new(keypoint.x as f64, keypoint.y as f64, keypoint.z as f64);
        let neighbours = self.neighbours(cloud, tree, &centre);
        let frame = local_frame(normal, &neighbours, radius)?;

        let mut hist = vec![0.0f64; DESCRIPTOR_LEN];
        for n in &neighbours {
            let nj = normals.get(n.index);
            if !nj.is_valid() {
                continue;
            }
            let nj = Vector3::new(nj.x as f64, nj.y as f64, nj.z as f64);
            let cosine = nj.dot(&frame.z).abs().min(1.0);

            let (lx, ly, lz) = (
                n.offset.dot(&frame.x),
                n.offset.dot(&frame.y),
                n.offset.dot(&frame.z),
            );
            let mut azimuth = ly.atan2(lx);
            if azimuth < 0.0 {
                azimuth += TAU;
            }
            let elevation = (lz / n.distance).clamp(-1.0, 1.0).asin();

            let c_bins = linear_split(cosine * COSINE_BINS as f64 - 0.5, COSINE_BINS);
            let a_bins = circular_split(azimuth / TAU * AZIMUTH_BINS as f64 - 0.5, AZIMUTH_BINS);
            let e_bins = linear_split(
                (elevation + FRAC_PI_2) / PI * ELEVATION_BINS as f64 - 0.5,
                ELEVATION_BINS,
            );
            let r_bins = linear_split(n.distance / radius * RADIAL_BINS as f64 - 0.5, RADIAL_BINS);

            for &(r, wr) in &r_bins {
                for &(e, we) in &e_bins {
                    for &(a, wa) in &a_bins {
                        for &(c, wc) in &c_bins {
                            let w = wr * we * wa * wc;
                            if w > 0.0 {
                                hist[bin_index(r, e, a, c)] += w;
                            }
                        }
                    }
                }
            }
        }

        let norm = hist.iter().map(|v| v * v).sum::<f64>().sqrt();
        if !norm.is_finite() || norm <= 0.0 {
            return None;
        }
        Some(Descriptor(hist.iter().map(|v| (v / norm) as f32).collect()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

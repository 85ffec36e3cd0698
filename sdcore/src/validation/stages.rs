//! Detection, validation and smoothing stages of the raster validator.
//!
//! Each stage takes the per-cluster grid planes of the previous stage and
//! returns a fresh set; clusters that fail a stage are invalidated in place
//! (validity only ever goes from `true` to `false`).

use log::{debug, info};
use nalgebra::DMatrix;

use crate::algorithm::geometry::{convolve2d, GridIndex};
use crate::cluster::region::{Cluster, RegionEntry};
use crate::validation::rule::ClusterRule;

/// Per-cluster grid planes, `[cluster](ix, iy)`.
pub type GridCluster = Vec<DMatrix<f64>>;

/// Detection-stage flag thresholds (raw weighted counts).
pub const DETECTION_THRESHOLDS: [f64; 2] = [1.5, 0.5];

/// Decimal weight of each stage's digit in the flag planes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Detection,
    Validation,
    Smoothing,
    Final,
}

impl Stage {
    pub fn digit_weight(self) -> u16 {
        match self {
            Stage::Detection => 1000,
            Stage::Validation => 100,
            Stage::Smoothing => 10,
            Stage::Final => 1,
        }
    }
}

/// Diagnostic flag planes, one decimal digit per stage.
///
/// Digits are written once per stage and accumulate; later stages never read them.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterFlags {
    pub planes: Vec<DMatrix<u16>>,
}

impl ClusterFlags {
    pub fn new(ncluster: usize, nra: usize, ndec: usize) -> Self {
        ClusterFlags {
            planes: vec![DMatrix::zeros(nra, ndec); ncluster],
        }
    }

    /// Add `stage`'s digit: the number of `thresholds` each cell value exceeds.
    pub fn record(&mut self, stage: Stage, planes: &GridCluster, thresholds: &[f64]) {
        let weight = stage.digit_weight();
        for (flag, plane) in self.planes.iter_mut().zip(planes.iter()) {
            for (f, &v) in flag.iter_mut().zip(plane.iter()) {
                let digit = thresholds.iter().filter(|&&t| v > t).count() as u16;
                *f += digit * weight;
            }
        }
    }

    /// `[cluster][ix][iy]` nested vectors for serialisation.
    pub fn to_nested(&self) -> Vec<Vec<Vec<u16>>> {
        self.planes
            .iter()
            .map(|p| {
                (0..p.nrows())
                    .map(|ix| (0..p.ncols()).map(|iy| p[(ix, iy)]).collect())
                    .collect()
            })
            .collect()
    }
}

/// Binning-aware contribution of one detection.
#[inline]
pub fn detection_weight(binning: u32) -> f64 {
    if binning > 1 { 0.5 } else { 1.0 }
}

/// Detection: accumulate valid, clustered region entries into their grid cells.
pub fn detect(
    ncluster: usize,
    regions: &[RegionEntry],
    category: &[Option<usize>],
    index: &GridIndex,
) -> GridCluster {
    let grid = &index.grid;
    let mut planes = vec![grid.zeros(); ncluster];
    for (region, cat) in regions.iter().zip(category.iter()) {
        let c = match cat {
            Some(c) if region.valid && *c < ncluster => *c,
            _ => continue,
        };
        let (ix, iy) = grid.cell_of(region.ra, region.dec);
        planes[c][(ix, iy)] += detection_weight(region.binning);
    }
    debug!("detection: {} cluster plane(s) on a {}x{} grid", ncluster, grid.nra, grid.ndec);
    planes
}

/// Validation: normalise counts by the observed spectra per cell (capped at
/// 1.0) and invalidate clusters with no cell above `Questionable`.
pub fn validate(
    planes: &GridCluster,
    members: &DMatrix<f64>,
    clusters: &mut [Cluster],
    rule: &ClusterRule,
) -> GridCluster {
    let normalised: GridCluster = planes
        .iter()
        .map(|p| {
            p.zip_map(members, |count, n| if n > 0.0 { (count / n).min(1.0) } else { 0.0 })
        })
        .collect();

    for (c, (cluster, plane)) in clusters.iter_mut().zip(normalised.iter()).enumerate() {
        if !cluster.valid {
            continue;
        }
        if !plane.iter().any(|&v| v > rule.threshold_questionable) {
            info!("validation: cluster {} (center {:.1}) rejected", c, cluster.center);
            cluster.invalidate();
        }
    }
    normalised
}

/// Fixed 5x5 smoothing kernel: 6 at the center, `1/d^2` for neighbours within
/// two cells, zero beyond. Normalised to unit sum.
pub fn smoothing_kernel() -> DMatrix<f64> {
    let raw = DMatrix::from_fn(5, 5, |i, j| {
        let dx = i as i64 - 2;
        let dy = j as i64 - 2;
        let d2 = (dx * dx + dy * dy) as f64;
        if d2 == 0.0 {
            6.0
        } else if d2 <= 5.0 {
            1.0 / d2
        } else {
            0.0
        }
    });
    let total = raw.sum();
    raw / total
}

/// Smoothing: convolve each valid cluster's plane and invalidate clusters
/// whose smoothed plane never exceeds `Questionable`.
pub fn smooth(planes: &GridCluster, clusters: &mut [Cluster], rule: &ClusterRule) -> GridCluster {
    let kernel = smoothing_kernel();
    planes
        .iter()
        .zip(clusters.iter_mut())
        .enumerate()
        .map(|(c, (plane, cluster))| {
            if !cluster.valid {
                return plane.clone();
            }
            let smoothed = convolve2d(plane, &kernel);
            if !smoothed.iter().any(|&v| v > rule.threshold_questionable) {
                info!("smoothing: cluster {} (center {:.1}) rejected", c, cluster.center);
                cluster.invalidate();
            }
            smoothed
        })
        .collect()
}

/// Planes the final stage thresholds: the smoothed rate of each cell, but never
/// less than its validated rate, so a well observed single-cell source stays
/// above `Marginal`.
pub fn final_support(validated: &GridCluster, smoothed: &GridCluster) -> GridCluster {
    validated
        .iter()
        .zip(smoothed.iter())
        .map(|(v, s)| v.zip_map(s, f64::max))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::geometry::Grid;
    use approx::assert_abs_diff_eq;

    fn line_index() -> GridIndex {
        // 5 positions along RA, one cell each
        let ra: Vec<f64> = (0..5).map(|i| i as f64 * 0.1).collect();
        let dec = vec![0.0; 5];
        let grid = Grid::from_positions(&ra, &dec, 0.1, 0.1).unwrap();
        GridIndex::build(grid, ra.iter().enumerate().map(|(i, &r)| (i, r, 0.0)))
    }

    fn region(sample_id: usize, ra: f64, binning: u32) -> RegionEntry {
        RegionEntry {
            sample_id,
            chan_start: 10,
            chan_end: 20,
            ra,
            dec: 0.0,
            valid: true,
            binning,
        }
    }

    #[test]
    fn test_kernel_is_normalised_and_symmetric() {
        let k = smoothing_kernel();
        assert_abs_diff_eq!(k.sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k[(2, 2)], 6.0 / 14.6, epsilon = 1e-12);
        assert_eq!(k[(0, 0)], 0.0);
        assert_abs_diff_eq!(k[(0, 1)], k[(1, 0)], epsilon = 1e-15);
    }

    #[test]
    fn test_detect_weights_binning() {
        let index = line_index();
        let regions = vec![region(0, 0.0, 1), region(0, 0.0, 2), region(1, 0.1, 1)];
        let mut invalid = region(2, 0.2, 1);
        invalid.valid = false;
        let mut all = regions.clone();
        all.push(invalid);
        let category = vec![Some(0), Some(0), Some(0), Some(0)];

        let planes = detect(1, &all, &category, &index);
        let (ix0, iy0) = index.grid.cell_of(0.0, 0.0);
        let (ix2, iy2) = index.grid.cell_of(0.2, 0.0);
        assert_abs_diff_eq!(planes[0][(ix0, iy0)], 1.5);
        assert_eq!(planes[0][(ix2, iy2)], 0.0);
    }

    #[test]
    fn test_validate_rejects_sparse_cluster() {
        let index = line_index();
        let members = index.member_counts();
        let mut dense = index.grid.zeros();
        dense.fill(1.0);
        let mut sparse = index.grid.zeros();
        sparse[(0, 0)] = 0.1;

        let mut clusters = vec![Cluster::new(15.0, 10.0, 0.0), Cluster::new(50.0, 10.0, 0.0)];
        let out = validate(&vec![dense, sparse], &members, &mut clusters, &ClusterRule::default());

        assert!(clusters[0].valid);
        assert!(!clusters[1].valid);
        assert!(out[0].iter().all(|&v| v <= 1.0));
    }

    #[test]
    fn test_smooth_keeps_isolated_strong_cell() {
        let mut plane = DMatrix::zeros(5, 5);
        plane[(2, 2)] = 1.0;
        let mut clusters = vec![Cluster::new(15.0, 10.0, 0.0)];
        let out = smooth(&vec![plane], &mut clusters, &ClusterRule::default());
        assert!(clusters[0].valid);
        assert_abs_diff_eq!(out[0][(2, 2)], 6.0 / 14.6, epsilon = 1e-12);
    }

    #[test]
    fn test_smooth_rejects_faint_cluster() {
        let mut plane = DMatrix::zeros(5, 5);
        plane[(2, 2)] = 0.3;
        let mut clusters = vec![Cluster::new(15.0, 10.0, 0.0)];
        smooth(&vec![plane], &mut clusters, &ClusterRule::default());
        assert!(!clusters[0].valid);
    }

    #[test]
    fn test_final_support_keeps_isolated_cell() {
        let mut plane = DMatrix::zeros(5, 5);
        plane[(2, 2)] = 1.0;
        let mut clusters = vec![Cluster::new(15.0, 10.0, 0.0)];
        let validated = vec![plane];
        let smoothed = smooth(&validated, &mut clusters, &ClusterRule::default());
        assert!(smoothed[0][(2, 2)] < ClusterRule::default().threshold_marginal);

        let support = final_support(&validated, &smoothed);
        assert_eq!(support[0][(2, 2)], 1.0);
        assert_abs_diff_eq!(support[0][(2, 3)], 1.0 / 14.6, epsilon = 1e-12);
    }

    #[test]
    fn test_flags_accumulate_digits() {
        let mut flags = ClusterFlags::new(1, 1, 2);
        let plane = DMatrix::from_row_slice(1, 2, &[2.0, 0.6]);
        flags.record(Stage::Detection, &vec![plane.clone()], &DETECTION_THRESHOLDS);
        flags.record(Stage::Validation, &vec![DMatrix::from_row_slice(1, 2, &[0.8, 0.3])], &[0.7, 0.5, 0.2]);
        assert_eq!(flags.planes[0][(0, 0)], 2300);
        assert_eq!(flags.planes[0][(0, 1)], 1100);
    }
}

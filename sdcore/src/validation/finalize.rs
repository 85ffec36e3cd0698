//! Final stage: turn each surviving cluster's smoothed footprint into
//! per-sample line ranges.
//!
//! Every cluster plane is thresholded at `Marginal` and split into connected
//! sub-clusters. Inside a sub-cluster ("solid" cells) the line start and end
//! channels are fit as two polynomial surfaces over the sky plane; cells within
//! the blur radius but outside the footprint ("fringe") copy the line of the
//! nearest solid sample.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use nalgebra::DMatrix;

use crate::algorithm::geometry::{blur_footprint, blur_radius, connected_components, nearest_index, GridIndex};
use crate::algorithm::stats::std_dev;
use crate::algorithm::svd::{SurfaceFit, SvdSolver2D};
use crate::cluster::region::{Candidates, Cluster, RealSignal, RegionEntry};
use crate::error::{Error, Result};
use crate::validation::protect::{calc_protect_mask, clamp_line};
use crate::validation::rule::{ClusterRule, LineSetup};
use crate::validation::stages::GridCluster;

/// Largest polynomial order chosen automatically.
pub const MAX_AUTO_ORDER: usize = 5;

/// Result of a surface fit after order reduction.
#[derive(Clone, Debug)]
pub enum FitOutcome {
    Fit(SurfaceFit),
    /// Even a constant surface could not be fit.
    Singular,
}

/// What the final stage hands back to the driver.
#[derive(Clone, Debug, Default)]
pub struct FinalStage {
    pub signal: RealSignal,
    /// Cluster planes restricted to the emitted (solid + fringe) cells.
    pub planes: GridCluster,
    /// Widened `(center, width, valid)` reporting range per surviving cluster.
    pub channelmap_range: Vec<Cluster>,
}

/// Maps sky positions into a unit box around the fit points.
#[derive(Clone, Copy, Debug)]
struct Normalizer {
    cx: f64,
    cy: f64,
    sx: f64,
    sy: f64,
}

impl Normalizer {
    fn new(points: &[(f64, f64)], cell: (f64, f64)) -> Self {
        let n = points.len().max(1) as f64;
        let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
        let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
        let sx = points.iter().map(|p| (p.0 - cx).abs()).fold(cell.0, f64::max);
        let sy = points.iter().map(|p| (p.1 - cy).abs()).fold(cell.1, f64::max);
        Normalizer { cx, cy, sx, sy }
    }

    #[inline]
    fn apply(&self, p: (f64, f64)) -> (f64, f64) {
        ((p.0 - self.cx) / self.sx, (p.1 - self.cy) / self.sy)
    }
}

/// Automatic order from the number of occupied grid columns along one axis.
pub fn auto_order(occupied: usize) -> usize {
    (occupied.saturating_sub(1) / 2).min(MAX_AUTO_ORDER)
}

/// Fit at one fixed order with up to `iterations` rounds of n-sigma residual
/// clipping. Clipping stops early once the kept set no longer changes or would
/// leave fewer points than terms.
pub fn fit_with_clipping(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    xorder: usize,
    yorder: usize,
    nsigma: f64,
    iterations: usize,
    threshold: f64,
) -> Result<SurfaceFit> {
    let mut solver = SvdSolver2D::new(xorder, yorder);
    let mut keep: Vec<usize> = (0..z.len()).collect();
    let mut fit = None;

    for _ in 0..iterations.max(1) {
        let xs: Vec<f64> = keep.iter().map(|&i| x[i]).collect();
        let ys: Vec<f64> = keep.iter().map(|&i| y[i]).collect();
        let zs: Vec<f64> = keep.iter().map(|&i| z[i]).collect();
        solver.set_data_points(&xs, &ys)?;
        let current = solver.find_good_solution(&zs, threshold)?;

        let residuals: Vec<f64> = (0..z.len()).map(|i| z[i] - current.evaluate(x[i], y[i])).collect();
        let kept_res: Vec<f64> = keep.iter().map(|&i| residuals[i]).collect();
        let spread = std_dev(&kept_res);
        fit = Some(current);
        if spread < 1e-9 {
            break;
        }
        let limit = nsigma * spread;

        let next: Vec<usize> = (0..z.len()).filter(|&i| residuals[i].abs() <= limit).collect();
        if next == keep || next.len() < solver.num_terms() {
            break;
        }
        keep = next;
    }
    fit.ok_or_else(|| Error::IllPosedFit("no fit produced".to_string()))
}

/// Try `(xorder, yorder)`; on failure retry one order lower on both axes,
/// down to a constant surface.
pub fn fit_with_order_fallback(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    xorder: usize,
    yorder: usize,
    rule: &ClusterRule,
    nsigma: f64,
) -> FitOutcome {
    match fit_with_clipping(x, y, z, xorder, yorder, nsigma, rule.clip_iterations, rule.fit_threshold) {
        Ok(fit) => FitOutcome::Fit(fit),
        Err(e) if xorder == 0 && yorder == 0 => {
            debug!("surface fit failed at order 0: {}", e);
            FitOutcome::Singular
        }
        Err(e) => {
            debug!("surface fit failed at order ({}, {}): {}; reducing", xorder, yorder, e);
            fit_with_order_fallback(
                x,
                y,
                z,
                xorder.saturating_sub(1),
                yorder.saturating_sub(1),
                rule,
                nsigma,
            )
        }
    }
}

fn requested_order(configured: i32, occupied: usize) -> usize {
    if configured < 0 {
        auto_order(occupied)
    } else {
        configured as usize
    }
}

/// Which connected components of a thresholded plane survive isolation cleaning.
///
/// Single-cell components must be backed by at least `min_support` observed spectra.
pub fn clean_isolation(
    components: Vec<Vec<(usize, usize)>>,
    members: &DMatrix<f64>,
    min_support: usize,
) -> Vec<Vec<(usize, usize)>> {
    components
        .into_iter()
        .filter(|comp| match comp.len() {
            0 => false,
            1 => members[comp[0]] >= min_support as f64,
            _ => true,
        })
        .collect()
}

/// Accumulates what one cluster emitted.
#[derive(Default)]
struct Coverage {
    emitted: usize,
    lo: i32,
    hi: i32,
}

impl Coverage {
    fn add(&mut self, range: [i32; 2]) {
        if self.emitted == 0 {
            self.lo = range[0];
            self.hi = range[1];
        } else {
            self.lo = self.lo.min(range[0]);
            self.hi = self.hi.max(range[1]);
        }
        self.emitted += 1;
    }
}

fn finalize_subcluster(
    c: usize,
    component: &[(usize, usize)],
    regions: &[RegionEntry],
    category: &[Option<usize>],
    candidates: &Candidates,
    index: &GridIndex,
    rule: &ClusterRule,
    setup: &LineSetup,
    max_fwhm: f64,
    signal: &mut RealSignal,
    coverage: &mut Coverage,
    emitted_cells: &mut DMatrix<bool>,
) {
    let grid = &index.grid;
    let in_solid = |ra: f64, dec: f64| component.contains(&grid.cell_of(ra, dec));

    // fit data: this cluster's surviving detections inside the footprint
    let fit_points: Vec<&RegionEntry> = regions
        .iter()
        .zip(category.iter())
        .filter(|(r, cat)| **cat == Some(c) && r.valid && in_solid(r.ra, r.dec))
        .map(|(r, _)| r)
        .collect();
    if fit_points.is_empty() {
        debug!("final: cluster {} sub-cluster without detections, skipped", c);
        return;
    }

    let positions: Vec<(f64, f64)> = fit_points.iter().map(|r| (r.ra, r.dec)).collect();
    let norm = Normalizer::new(&positions, (grid.grid_ra, grid.grid_dec));
    let (x, y): (Vec<f64>, Vec<f64>) = positions.iter().map(|&p| norm.apply(p)).unzip();
    let starts: Vec<f64> = fit_points.iter().map(|r| r.chan_start as f64).collect();
    let ends: Vec<f64> = fit_points.iter().map(|r| r.chan_end as f64).collect();

    let nx = component.iter().map(|p| p.0).collect::<BTreeSet<_>>().len();
    let ny = component.iter().map(|p| p.1).collect::<BTreeSet<_>>().len();
    let xorder = requested_order(setup.xorder, nx);
    let yorder = requested_order(setup.yorder, ny);

    let start_fit = fit_with_order_fallback(&x, &y, &starts, xorder, yorder, rule, setup.nsigma);
    let end_fit = fit_with_order_fallback(&x, &y, &ends, xorder, yorder, rule, setup.nsigma);
    let (start_fit, end_fit) = match (start_fit, end_fit) {
        (FitOutcome::Fit(s), FitOutcome::Fit(e)) => (s, e),
        _ => {
            warn!("final: cluster {} sub-cluster of {} cell(s) could not be fit, skipped", c, component.len());
            return;
        }
    };
    debug!(
        "final: cluster {} fit orders start=({}, {}) end=({}, {})",
        c, start_fit.xorder, start_fit.yorder, end_fit.xorder, end_fit.yorder
    );

    // solid cells: evaluate the surfaces at every observed sample
    let mut solid_lines: Vec<((f64, f64), (f64, f64))> = Vec::new();
    for &(ix, iy) in component {
        for &id in index.samples_in(ix, iy) {
            let cand = match candidates.get(&id) {
                Some(cand) => cand,
                None => continue,
            };
            let (u, v) = norm.apply((cand.ra, cand.dec));
            let (center, width) = clamp_line(start_fit.evaluate(u, v), end_fit.evaluate(u, v), rule.min_fwhm, max_fwhm);
            let range = calc_protect_mask(center, width, setup.nchan, setup.edge, max_fwhm);
            signal.push_range(id, cand.ra, cand.dec, range);
            coverage.add(range);
            solid_lines.push(((cand.ra, cand.dec), (center, width)));
        }
        emitted_cells[(ix, iy)] = true;
    }
    if solid_lines.is_empty() {
        return;
    }

    // fringe cells: nearest-neighbour extrapolation from solid samples
    let radius = blur_radius(component.len(), rule.blur_ratio);
    let blurred = blur_footprint(component, radius, grid.nra, grid.ndec);
    let solid_positions: Vec<(f64, f64)> = solid_lines.iter().map(|l| l.0).collect();
    for ix in 0..grid.nra {
        for iy in 0..grid.ndec {
            if !blurred[(ix, iy)] || component.contains(&(ix, iy)) {
                continue;
            }
            for &id in index.samples_in(ix, iy) {
                let cand = match candidates.get(&id) {
                    Some(cand) => cand,
                    None => continue,
                };
                if let Some(k) = nearest_index(&solid_positions, (cand.ra, cand.dec)) {
                    let (center, width) = solid_lines[k].1;
                    let range = calc_protect_mask(center, width, setup.nchan, setup.edge, max_fwhm);
                    signal.push_range(id, cand.ra, cand.dec, range);
                    coverage.add(range);
                }
            }
            emitted_cells[(ix, iy)] = true;
        }
    }
}

/// Final stage over all clusters. Clusters that end up emitting nothing are
/// invalidated and left out of the channel-map ranges; the others take the
/// `(center, width)` of the channel span they emitted.
pub fn finalize(
    planes: &GridCluster,
    clusters: &mut [Cluster],
    regions: &[RegionEntry],
    category: &[Option<usize>],
    candidates: &Candidates,
    index: &GridIndex,
    rule: &ClusterRule,
    setup: &LineSetup,
) -> FinalStage {
    let grid = &index.grid;
    let members = index.member_counts();
    let max_fwhm = rule.max_fwhm(setup.nchan, setup.edge);

    let mut signal = RealSignal::new();
    let mut final_planes = Vec::with_capacity(planes.len());
    let mut channelmap_range = Vec::new();

    for (c, (plane, cluster)) in planes.iter().zip(clusters.iter_mut()).enumerate() {
        let mut emitted_cells = DMatrix::from_element(grid.nra, grid.ndec, false);
        let mut coverage = Coverage::default();

        if cluster.valid {
            let mask = plane.map(|v| v > rule.threshold_marginal);
            let components = clean_isolation(connected_components(&mask), &members, rule.min_isolated_support);
            debug!("final: cluster {} has {} sub-cluster(s)", c, components.len());

            for component in components.iter() {
                finalize_subcluster(
                    c,
                    component,
                    regions,
                    category,
                    candidates,
                    index,
                    rule,
                    setup,
                    max_fwhm,
                    &mut signal,
                    &mut coverage,
                    &mut emitted_cells,
                );
            }

            if coverage.emitted == 0 {
                info!("final: cluster {} (center {:.1}) has no final coverage, rejected", c, cluster.center);
                cluster.invalidate();
            } else {
                let lo = coverage.lo as f64;
                let hi = coverage.hi as f64;
                // the reported line is what was emitted, not the clustering estimate
                cluster.center = 0.5 * (lo + hi);
                cluster.width = hi - lo;
                channelmap_range.push(cluster.clone());
            }
        }

        final_planes.push(plane.zip_map(&emitted_cells, |v, keep| if keep { v } else { 0.0 }));
    }

    FinalStage {
        signal,
        planes: final_planes,
        channelmap_range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::geometry::Grid;
    use crate::cluster::region::{Candidate, ChannelRange};

    /// 5x5 map with one sample per cell. The line start rises by 10 channels
    /// per RA column and is detected only in the 3x3 block at the origin.
    fn ramp_map() -> (Candidates, Vec<RegionEntry>, GridIndex) {
        let mut candidates = Candidates::new();
        let mut regions = Vec::new();
        for ix in 0..5 {
            for iy in 0..5 {
                let id = ix * 5 + iy;
                let (ra, dec) = (ix as f64 * 0.1, iy as f64 * 0.1);
                let start = 100 + 10 * ix as i32;
                let mut ranges = Vec::new();
                if ix < 3 && iy < 3 {
                    ranges.push(ChannelRange::new(start, start + 20, 1));
                    regions.push(RegionEntry {
                        sample_id: id,
                        chan_start: start,
                        chan_end: start + 20,
                        ra,
                        dec,
                        valid: true,
                        binning: 1,
                    });
                }
                candidates.insert(id, Candidate { ra, dec, ranges });
            }
        }
        let ra: Vec<f64> = candidates.values().map(|c| c.ra).collect();
        let dec: Vec<f64> = candidates.values().map(|c| c.dec).collect();
        let grid = Grid::from_positions(&ra, &dec, 0.1, 0.1).unwrap();
        let index = GridIndex::build(grid, candidates.iter().map(|(&id, c)| (id, c.ra, c.dec)));
        (candidates, regions, index)
    }

    #[test]
    fn test_fringe_copies_nearest_solid_line() {
        let (candidates, regions, index) = ramp_map();
        assert_eq!((index.grid.nra, index.grid.ndec), (5, 5));
        let category = vec![Some(0); regions.len()];
        let mut plane = index.grid.zeros();
        for ix in 0..3 {
            for iy in 0..3 {
                plane[(ix, iy)] = 1.0;
            }
        }
        let rule = ClusterRule::default();
        let setup = LineSetup::default();
        let mut clusters = vec![Cluster::new(120.0, 20.0, 0.0)];

        let stage = finalize(&vec![plane], &mut clusters, &regions, &category, &candidates, &index, &rule, &setup);
        assert!(clusters[0].valid);

        // (3, 1) is outside the footprint but within the blur radius of (2, 1)
        let solid = stage.signal.ranges(2 * 5 + 1).to_vec();
        let fringe = stage.signal.ranges(3 * 5 + 1).to_vec();
        assert_eq!(solid.len(), 1);
        assert_eq!(fringe, solid);

        // the ramp itself would have moved the line 10 channels further
        let max_fwhm = rule.max_fwhm(setup.nchan, setup.edge);
        let ramp = calc_protect_mask(140.0, 20.0, setup.nchan, setup.edge, max_fwhm);
        assert_ne!(fringe[0], ramp);

        // two columns away is beyond the blur radius
        assert!(stage.signal.ranges(4 * 5 + 1).is_empty());
        assert_eq!(stage.planes[0][(4, 1)], 0.0);

        assert_eq!(stage.channelmap_range, clusters);
    }

    #[test]
    fn test_auto_order() {
        assert_eq!(auto_order(0), 0);
        assert_eq!(auto_order(1), 0);
        assert_eq!(auto_order(5), 2);
        assert_eq!(auto_order(40), MAX_AUTO_ORDER);
    }

    #[test]
    fn test_order_fallback_reaches_constant() {
        // three points cannot carry a (2, 2) surface; the constant fit remains
        let x = vec![0.0, 0.5, 1.0];
        let y = vec![0.0, 0.2, -0.3];
        let z = vec![100.0, 100.0, 100.0];
        match fit_with_order_fallback(&x, &y, &z, 2, 2, &ClusterRule::default(), 3.0) {
            FitOutcome::Fit(fit) => {
                assert!(fit.xorder <= 1 && fit.yorder <= 1);
                assert!((fit.evaluate(0.3, 0.1) - 100.0).abs() < 1e-6);
            }
            FitOutcome::Singular => panic!("expected a fit"),
        }
    }

    #[test]
    fn test_order_fallback_singular_without_points() {
        let outcome = fit_with_order_fallback(&[], &[], &[], 1, 1, &ClusterRule::default(), 3.0);
        assert!(matches!(outcome, FitOutcome::Singular));
    }

    #[test]
    fn test_clipping_rejects_outlier() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = (0..10).map(|i| ((i * 7) % 10) as f64 / 10.0).collect();
        let mut z: Vec<f64> = x.iter().map(|v| 50.0 + 2.0 * v).collect();
        z[4] += 300.0;
        let fit = fit_with_clipping(&x, &y, &z, 1, 0, 2.0, 3, 0.05).unwrap();
        assert!((fit.evaluate(0.5, 0.0) - 51.0).abs() < 1e-3);
    }

    #[test]
    fn test_clean_isolation() {
        let mut members = DMatrix::zeros(3, 3);
        members[(0, 0)] = 1.0;
        members[(2, 2)] = 5.0;
        let comps = vec![vec![(0, 0)], vec![(2, 2)], vec![(1, 0), (1, 1)]];
        let kept = clean_isolation(comps, &members, 3);
        assert_eq!(kept, vec![vec![(2, 2)], vec![(1, 0), (1, 1)]]);
    }
}

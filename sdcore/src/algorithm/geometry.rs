//! Spatial helpers for the raster validator: grid binning of sample positions,
//! connected components of cluster footprints, radius blur, 2D convolution.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

// ==========================================================
// Grid
// ==========================================================

/// Regular tiling of the bounding box of all sample positions.
///
/// Cell `(i, j)` spans `[x0 + i*grid_ra, x0 + (i+1)*grid_ra)` in RA and the
/// analogous interval in Dec. `grid_ra` is already corrected by `1/cos(dec)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub x0: f64,
    pub y0: f64,
    pub grid_ra: f64,
    pub grid_dec: f64,
    pub nra: usize,
    pub ndec: usize,
}

impl Grid {
    /// Cover the bounding box of `(ra, dec)` with odd cell counts on both axes.
    ///
    /// Returns `None` for an empty position list or non-positive cell sizes.
    pub fn from_positions(ra: &[f64], dec: &[f64], grid_ra: f64, grid_dec: f64) -> Option<Self> {
        if ra.is_empty() || ra.len() != dec.len() || !(grid_ra > 0.0) || !(grid_dec > 0.0) {
            return None;
        }

        let (xmin, xmax) = min_max(ra);
        let (ymin, ymax) = min_max(dec);

        let dec_center = 0.5 * (ymin + ymax);
        let cos_dec = dec_center.to_radians().cos().abs().max(1e-6);
        let cell_ra = grid_ra / cos_dec;

        let nra = odd_extent(xmax - xmin, cell_ra);
        let ndec = odd_extent(ymax - ymin, grid_dec);

        let x0 = 0.5 * (xmin + xmax) - 0.5 * nra as f64 * cell_ra;
        let y0 = 0.5 * (ymin + ymax) - 0.5 * ndec as f64 * grid_dec;

        Some(Grid {
            x0,
            y0,
            grid_ra: cell_ra,
            grid_dec,
            nra,
            ndec,
        })
    }

    #[inline]
    pub fn num_cells(&self) -> usize {
        self.nra * self.ndec
    }

    /// Cell containing a position, clamped onto the grid.
    pub fn cell_of(&self, ra: f64, dec: f64) -> (usize, usize) {
        let ix = ((ra - self.x0) / self.grid_ra).floor();
        let iy = ((dec - self.y0) / self.grid_dec).floor();
        let ix = ix.clamp(0.0, (self.nra - 1) as f64) as usize;
        let iy = iy.clamp(0.0, (self.ndec - 1) as f64) as usize;
        (ix, iy)
    }

    /// Whether a position lies inside cell `(ix, iy)` (half-open intervals).
    pub fn cell_contains(&self, ix: usize, iy: usize, ra: f64, dec: f64) -> bool {
        let lx = self.x0 + ix as f64 * self.grid_ra;
        let ly = self.y0 + iy as f64 * self.grid_dec;
        ra >= lx && ra < lx + self.grid_ra && dec >= ly && dec < ly + self.grid_dec
    }

    pub fn zeros(&self) -> DMatrix<f64> {
        DMatrix::zeros(self.nra, self.ndec)
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Smallest odd cell count whose extent strictly exceeds `span`.
fn odd_extent(span: f64, cell: f64) -> usize {
    let half = (span / (2.0 * cell) + 0.5).floor() as usize;
    2 * half + 1
}

/// Grid cell -> sample ids observed there (`Grid2SpectrumID`).
#[derive(Clone, Debug)]
pub struct GridIndex {
    pub grid: Grid,
    cells: Vec<Vec<usize>>,
}

impl GridIndex {
    pub fn build<I>(grid: Grid, positions: I) -> Self
    where
        I: IntoIterator<Item = (usize, f64, f64)>,
    {
        let mut cells = vec![Vec::new(); grid.num_cells()];
        for (id, ra, dec) in positions {
            let (ix, iy) = grid.cell_of(ra, dec);
            cells[ix * grid.ndec + iy].push(id);
        }
        for ids in cells.iter_mut() {
            ids.sort_unstable();
        }
        GridIndex { grid, cells }
    }

    pub fn samples_in(&self, ix: usize, iy: usize) -> &[usize] {
        &self.cells[ix * self.grid.ndec + iy]
    }

    /// Number of observed spectra per cell (`GridMember`).
    pub fn member_counts(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.grid.nra, self.grid.ndec, |ix, iy| {
            self.samples_in(ix, iy).len() as f64
        })
    }
}

// ==========================================================
// Connected components
// ==========================================================

/// Label 8-connected components of `mask`; each component is returned as its
/// list of `(ix, iy)` cells, in discovery order.
pub fn connected_components(mask: &DMatrix<bool>) -> Vec<Vec<(usize, usize)>> {
    let (nx, ny) = mask.shape();
    let mut seen = DMatrix::from_element(nx, ny, false);
    let mut out = Vec::new();

    for ix in 0..nx {
        for iy in 0..ny {
            if !mask[(ix, iy)] || seen[(ix, iy)] {
                continue;
            }
            let mut component = Vec::new();
            let mut stack = vec![(ix, iy)];
            seen[(ix, iy)] = true;

            while let Some((cx, cy)) = stack.pop() {
                component.push((cx, cy));
                for dx in -1i64..=1 {
                    for dy in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx_ = cx as i64 + dx;
                        let ny_ = cy as i64 + dy;
                        if nx_ < 0 || ny_ < 0 || nx_ >= nx as i64 || ny_ >= ny as i64 {
                            continue;
                        }
                        let (ux, uy) = (nx_ as usize, ny_ as usize);
                        if mask[(ux, uy)] && !seen[(ux, uy)] {
                            seen[(ux, uy)] = true;
                            stack.push((ux, uy));
                        }
                    }
                }
            }
            component.sort_unstable();
            out.push(component);
        }
    }
    out
}

// ==========================================================
// Blur and convolution
// ==========================================================

/// Blur radius (in cells) for a footprint with `n_members` valid cells.
pub fn blur_radius(n_members: usize, blur_ratio: f64) -> f64 {
    (n_members as f64 / std::f64::consts::PI).sqrt() * blur_ratio + 1.5
}

/// Mark every cell within `radius` (cell units) of any footprint cell.
pub fn blur_footprint(
    footprint: &[(usize, usize)],
    radius: f64,
    nra: usize,
    ndec: usize,
) -> DMatrix<bool> {
    let mut out = DMatrix::from_element(nra, ndec, false);
    let reach = radius.floor().max(0.0) as i64;
    let r2 = radius * radius;

    for &(cx, cy) in footprint {
        for dx in -reach..=reach {
            for dy in -reach..=reach {
                if (dx * dx + dy * dy) as f64 > r2 {
                    continue;
                }
                let x = cx as i64 + dx;
                let y = cy as i64 + dy;
                if x >= 0 && y >= 0 && (x as usize) < nra && (y as usize) < ndec {
                    out[(x as usize, y as usize)] = true;
                }
            }
        }
    }
    out
}

/// Same-size 2D convolution with zero padding. `kernel` must have odd extents.
pub fn convolve2d(plane: &DMatrix<f64>, kernel: &DMatrix<f64>) -> DMatrix<f64> {
    let (nx, ny) = plane.shape();
    let (kx, ky) = kernel.shape();
    debug_assert!(kx % 2 == 1 && ky % 2 == 1);
    let hx = (kx / 2) as i64;
    let hy = (ky / 2) as i64;

    DMatrix::from_fn(nx, ny, |ix, iy| {
        let mut acc = 0.0;
        for a in 0..kx {
            for b in 0..ky {
                // flipped kernel index
                let sx = ix as i64 + hx - a as i64;
                let sy = iy as i64 + hy - b as i64;
                if sx < 0 || sy < 0 || sx >= nx as i64 || sy >= ny as i64 {
                    continue;
                }
                acc += kernel[(a, b)] * plane[(sx as usize, sy as usize)];
            }
        }
        acc
    })
}

/// Index of the point in `points` closest to `query`.
pub fn nearest_index(points: &[(f64, f64)], query: (f64, f64)) -> Option<usize> {
    points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let dx = p.0 - query.0;
            let dy = p.1 - query.1;
            (i, dx * dx + dy * dy)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

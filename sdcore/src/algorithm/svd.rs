//! Least-squares fitting of a 2D polynomial surface through scattered samples.
//!
//! The surface is `z = Σ a_ij x^i y^j` for `i <= xorder`, `j <= yorder`. The
//! design matrix is decomposed once per point set and solved with a truncated
//! pseudo-inverse, so rank-deficient point layouts (clumped or collinear
//! positions near grid edges) degrade gracefully instead of blowing up.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Dyn, SVD};

use crate::error::{Error, Result};

/// Relative singular value cut-offs tried by [`SvdSolver2D::find_good_solution`].
pub const EPS_CANDIDATES: [f64; 8] = [1e-11, 1e-10, 1e-9, 1e-8, 1e-7, 1e-6, 1e-5, 1e-4];

/// Coefficients of a solved surface together with how they were obtained.
#[derive(Clone, Debug)]
pub struct SurfaceFit {
    pub xorder: usize,
    pub yorder: usize,
    /// Coefficients ordered as `a[i * (yorder + 1) + j]` for the term `x^i y^j`.
    pub coeffs: DVector<f64>,
    /// Relative singular value cut-off that produced these coefficients.
    pub eps: f64,
    /// Mean fractional residual over the input points.
    pub score: f64,
}

impl SurfaceFit {
    /// Coefficient of the `x^i y^j` term.
    pub fn coefficient(&self, i: usize, j: usize) -> f64 {
        self.coeffs[i * (self.yorder + 1) + j]
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        evaluate_surface(self.coeffs.as_slice(), self.xorder, self.yorder, x, y)
    }
}

/// Evaluate `Σ a_ij x^i y^j` at a single point.
pub fn evaluate_surface(coeffs: &[f64], xorder: usize, yorder: usize, x: f64, y: f64) -> f64 {
    let mut acc = 0.0;
    let mut xp = 1.0;
    for i in 0..=xorder {
        let mut yp = 1.0;
        for j in 0..=yorder {
            acc += coeffs[i * (yorder + 1) + j] * xp * yp;
            yp *= y;
        }
        xp *= x;
    }
    acc
}

/// Mean fractional residual: `|fit - z| / |z|`, or the raw residual where `z == 0`.
pub fn fractional_residual(fit: &[f64], z: &[f64]) -> f64 {
    if z.is_empty() {
        return 0.0;
    }
    let total: f64 = fit
        .iter()
        .zip(z.iter())
        .map(|(&f, &v)| {
            let diff = (f - v).abs();
            if v != 0.0 { diff / v.abs() } else { diff }
        })
        .sum();
    total / z.len() as f64
}

pub struct SvdSolver2D {
    xorder: usize,
    yorder: usize,
    design: Option<DMatrix<f64>>,
    svd: Option<SVD<f64, Dyn, Dyn>>,
}

impl SvdSolver2D {
    pub fn new(xorder: usize, yorder: usize) -> Self {
        SvdSolver2D {
            xorder,
            yorder,
            design: None,
            svd: None,
        }
    }

    /// Number of polynomial terms, `(xorder + 1) * (yorder + 1)`.
    pub fn num_terms(&self) -> usize {
        (self.xorder + 1) * (self.yorder + 1)
    }

    pub fn num_points(&self) -> usize {
        self.design.as_ref().map(|g| g.nrows()).unwrap_or(0)
    }

    /// Build the design matrix `G[k, l] = x_k^i y_k^j` for a new point set.
    ///
    /// Fails if the coordinate slices differ in length or there are fewer
    /// points than terms; the caller is expected to shrink the order.
    pub fn set_data_points(&mut self, x: &[f64], y: &[f64]) -> Result<()> {
        if x.len() != y.len() {
            return Err(Error::IllPosedFit(format!(
                "coordinate length mismatch: {} x vs {} y",
                x.len(),
                y.len()
            )));
        }
        let n = x.len();
        let l = self.num_terms();
        if n < l {
            return Err(Error::IllPosedFit(format!(
                "{} points cannot constrain {} terms (xorder={}, yorder={})",
                n, l, self.xorder, self.yorder
            )));
        }

        let yorder = self.yorder;
        let xorder = self.xorder;
        let design = DMatrix::from_fn(n, l, |k, col| {
            let i = col / (yorder + 1);
            let j = col % (yorder + 1);
            debug_assert!(i <= xorder);
            x[k].powi(i as i32) * y[k].powi(j as i32)
        });

        self.design = Some(design);
        self.svd = None;
        Ok(())
    }

    fn decomposition(&mut self) -> Result<&SVD<f64, Dyn, Dyn>> {
        if self.svd.is_none() {
            let design = self
                .design
                .as_ref()
                .ok_or_else(|| Error::IllPosedFit("no data points set".to_string()))?;
            let (rows, cols) = design.shape();
            let svd = design
                .clone()
                .try_svd(true, true, f64::EPSILON, 0)
                .ok_or(Error::SvdFailed { rows, cols })?;
            self.svd = Some(svd);
        }
        self.svd
            .as_ref()
            .ok_or_else(|| Error::IllPosedFit("decomposition unavailable".to_string()))
    }

    /// Solve for the coefficients, discarding singular values below
    /// `eps * max(singular value)`.
    pub fn solve_with_eps(&mut self, z: &[f64], eps: f64) -> Result<DVector<f64>> {
        let n = self.num_points();
        if z.len() != n {
            return Err(Error::IllPosedFit(format!(
                "{} values supplied for {} points",
                z.len(),
                n
            )));
        }
        let svd = self.decomposition()?;
        let (u, v_t) = match (&svd.u, &svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return Err(Error::SvdFailed { rows: n, cols: svd.singular_values.len() }),
        };

        let sv = &svd.singular_values;
        let smax = sv.iter().cloned().fold(0.0_f64, f64::max);
        let cutoff = eps * smax;

        let z = DVector::from_column_slice(z);
        let mut projected = u.transpose() * z;
        for (k, value) in projected.iter_mut().enumerate() {
            if sv[k] > cutoff && sv[k] > 0.0 {
                *value /= sv[k];
            } else {
                *value = 0.0;
            }
        }

        Ok(v_t.transpose() * projected)
    }

    /// Evaluate the design matrix against a coefficient vector (the fit at every input point).
    pub fn fitted_values(&self, coeffs: &DVector<f64>) -> Vec<f64> {
        match &self.design {
            Some(g) => (g * coeffs).iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Scan [`EPS_CANDIDATES`] and keep the truncation with the lowest mean
    /// fractional residual.
    ///
    /// Returns [`Error::NoUsableSolution`] when even the best candidate is off
    /// by 100% or more on average. A best score above `threshold` is only
    /// logged.
    pub fn find_good_solution(&mut self, z: &[f64], threshold: f64) -> Result<SurfaceFit> {
        let mut best: Option<SurfaceFit> = None;

        for &eps in EPS_CANDIDATES.iter() {
            let coeffs = self.solve_with_eps(z, eps)?;
            let fit = self.fitted_values(&coeffs);
            let score = fractional_residual(&fit, z);
            if !score.is_finite() {
                continue;
            }
            debug!("svd solve eps={:e} score={:.4e}", eps, score);

            let better = best.as_ref().map(|b| score < b.score).unwrap_or(true);
            if better {
                best = Some(SurfaceFit {
                    xorder: self.xorder,
                    yorder: self.yorder,
                    coeffs,
                    eps,
                    score,
                });
            }
        }

        let best = best.ok_or(Error::NoUsableSolution { best_score: f64::INFINITY })?;
        if best.score >= 1.0 {
            return Err(Error::NoUsableSolution { best_score: best.score });
        }
        if best.score > threshold {
            warn!(
                "surface fit (xorder={}, yorder={}) residual {:.3} exceeds threshold {:.3}",
                self.xorder, self.yorder, best.score, threshold
            );
        }
        Ok(best)
    }
}

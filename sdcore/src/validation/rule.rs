use serde::{Deserialize, Serialize};

/// Linkage criterion for the hierarchical clustering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    Single,
    Complete,
    Average,
}

/// Tunables for clustering and spatial validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterRule {
    /// Normalised detection rate above which a cell is a confident detection.
    pub threshold_valid: f64,
    /// Rate above which a cell takes part in the final surface fit.
    pub threshold_marginal: f64,
    /// Rate a cluster must exceed somewhere to survive validation/smoothing.
    pub threshold_questionable: f64,
    /// Upper bound on the number of k-means clusters. The search stops early
    /// only after 10 non-improving counts, so caps up to 10 are always reached.
    pub max_cluster: usize,
    /// Scales the blur radius derived from a sub-cluster's footprint.
    pub blur_ratio: f64,
    /// First hierarchical cut at `mean + n_threshold * sigma` of link heights.
    pub n_threshold: f64,
    /// Second, per-sub-cluster cut.
    pub n_threshold2: f64,
    /// Line widths are divided by this before clustering.
    pub whiten: f64,
    pub linkage: Linkage,
    /// Random restarts per k-means run (best distortion wins).
    pub kmeans_restarts: usize,
    /// Lloyd iterations per restart.
    pub kmeans_iterations: usize,
    /// Seed of the k-means initialisation.
    pub seed: u64,
    /// Narrowest plausible line, in channels.
    pub min_fwhm: f64,
    /// Broadest plausible line as a fraction of the usable channels.
    pub max_fwhm_ratio: f64,
    /// Residual clipping rounds in the final surface fit.
    pub clip_iterations: usize,
    /// Residual level above which a surface fit is reported as poor.
    pub fit_threshold: f64,
    /// Components of a single cell need at least this many observed spectra.
    pub min_isolated_support: usize,
}

impl Default for ClusterRule {
    fn default() -> Self {
        ClusterRule {
            threshold_valid: 0.7,
            threshold_marginal: 0.5,
            threshold_questionable: 0.2,
            max_cluster: 10,
            blur_ratio: 0.1,
            n_threshold: 3.0,
            n_threshold2: 4.5,
            whiten: 4.0,
            linkage: Linkage::Single,
            kmeans_restarts: 10,
            kmeans_iterations: 50,
            seed: 0,
            min_fwhm: 4.0,
            max_fwhm_ratio: 0.5,
            clip_iterations: 3,
            fit_threshold: 0.05,
            min_isolated_support: 3,
        }
    }
}

impl ClusterRule {
    /// Broadest plausible line for a spectrum of `nchan` channels with `edge` dropped.
    pub fn max_fwhm(&self, nchan: usize, edge: (usize, usize)) -> f64 {
        let usable = nchan.saturating_sub(edge.0 + edge.1) as f64;
        (usable * self.max_fwhm_ratio).max(self.min_fwhm)
    }

    /// Validation thresholds in the order they are counted into flag digits.
    pub fn thresholds(&self) -> [f64; 3] {
        [
            self.threshold_valid,
            self.threshold_marginal,
            self.threshold_questionable,
        ]
    }
}

/// Per-invocation parameters of the spectral setup being validated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineSetup {
    pub nchan: usize,
    /// Channels excluded at the `(low, high)` ends of the band.
    pub edge: (usize, usize),
    /// Clipping level for cluster outliers and fit residuals.
    pub nsigma: f64,
    /// Polynomial order along RA, `-1` selects it from the footprint.
    pub xorder: i32,
    /// Polynomial order along Dec, `-1` selects it from the footprint.
    pub yorder: i32,
    /// Accepted for compatibility; the surface fit does not use it.
    pub broad_component: bool,
}

impl Default for LineSetup {
    fn default() -> Self {
        LineSetup {
            nchan: 1024,
            edge: (0, 0),
            nsigma: 3.0,
            xorder: -1,
            yorder: -1,
            broad_component: false,
        }
    }
}

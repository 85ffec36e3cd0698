//! Job configuration for the mask orchestrator.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use sdcore::validation::rule::{ClusterRule, LineSetup};

use crate::error::{Error, Result};

/// Observing pattern of the reduction-group member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Raster,
    SinglePoint,
    MultiPoint,
}

impl Pattern {
    pub fn is_pointed(self) -> bool {
        matches!(self, Pattern::SinglePoint | Pattern::MultiPoint)
    }
}

/// How a manual line window combines with detected lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowMode {
    /// Skip detection entirely and use the window as the mask.
    Replace,
    /// Add the window to whatever validation accepts.
    Merge,
}

impl FromStr for WindowMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replace" => Ok(WindowMode::Replace),
            "merge" => Ok(WindowMode::Merge),
            other => Err(Error::InvalidWindowMode(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskLineConfig {
    // Spatial grid cell, degrees
    pub grid_ra: f64,
    pub grid_dec: f64,

    // Spectral setup
    pub nchan: usize,
    pub edge: (usize, usize),

    // Fit and clipping
    pub nsigma: f64,
    pub xorder: i32,
    pub yorder: i32,
    pub broad_component: bool,

    /// `kmean`, `hierarchy` or `both`; parsed at dispatch.
    pub clustering_algorithm: String,

    // Manual line window
    pub window: Vec<[i64; 2]>,
    pub windowmode: String,

    /// Outer iteration of the baseline/line-finding loop, starting at 1.
    pub iteration: u32,
    pub pattern: Pattern,

    // False-detection cleaning across time-grouped copies
    pub clean_ratio: f64,
    pub clean_overlap: f64,

    pub rule: ClusterRule,
}

impl Default for MaskLineConfig {
    fn default() -> Self {
        Self {
            grid_ra: 10.0 / 3600.0,
            grid_dec: 10.0 / 3600.0,
            nchan: 1024,
            edge: (0, 0),
            nsigma: 3.0,
            xorder: -1,
            yorder: -1,
            broad_component: false,
            clustering_algorithm: "hierarchy".to_string(),
            window: Vec::new(),
            windowmode: "replace".to_string(),
            iteration: 1,
            pattern: Pattern::Raster,
            clean_ratio: 2.0 / 3.0,
            clean_overlap: 0.7,
            rule: ClusterRule::default(),
        }
    }
}

impl MaskLineConfig {
    /// Raster map with the given grid cell, everything else default.
    pub fn raster(grid_ra: f64, grid_dec: f64) -> Self {
        Self {
            grid_ra,
            grid_dec,
            ..Default::default()
        }
    }

    /// Single pointing: detections are trusted as-is.
    pub fn single_point() -> Self {
        Self {
            pattern: Pattern::SinglePoint,
            ..Default::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn window_mode(&self) -> Result<WindowMode> {
        self.windowmode.parse()
    }

    /// The manual window as channel ranges; rejects negative channels and
    /// reversed ranges.
    pub fn validated_window(&self) -> Result<Vec<[i32; 2]>> {
        self.window
            .iter()
            .map(|&[start, end]| {
                if start < 0 || end < 0 {
                    return Err(Error::InvalidWindow(format!("negative channel in [{}, {}]", start, end)));
                }
                if start > end {
                    return Err(Error::InvalidWindow(format!("start after end in [{}, {}]", start, end)));
                }
                if end > i32::MAX as i64 {
                    return Err(Error::InvalidWindow(format!("channel out of range in [{}, {}]", start, end)));
                }
                Ok([start as i32, end as i32])
            })
            .collect()
    }

    pub fn line_setup(&self) -> LineSetup {
        LineSetup {
            nchan: self.nchan,
            edge: self.edge,
            nsigma: self.nsigma,
            xorder: self.xorder,
            yorder: self.yorder,
            broad_component: self.broad_component,
        }
    }
}

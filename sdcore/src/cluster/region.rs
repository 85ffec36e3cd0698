//! Data model shared by the clustering algorithms and the validator.

use std::collections::{BTreeMap, BTreeSet};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::algorithm::geometry::Grid;

/// One candidate line range reported by the line finder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub start: i32,
    pub end: i32,
    /// Channel binning at which the range was detected (1 = native).
    pub binning: u32,
}

impl ChannelRange {
    pub fn new(start: i32, end: i32, binning: u32) -> Self {
        ChannelRange { start, end, binning }
    }
}

/// Unvalidated detections at one sample position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub ra: f64,
    pub dec: f64,
    pub ranges: Vec<ChannelRange>,
}

/// sample id -> candidate
pub type Candidates = BTreeMap<usize, Candidate>;

/// One (sample, range) pair flattened for clustering.
///
/// Entries are never removed; cluster membership arrays are aligned to their
/// position in the region list. Only `valid` changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub sample_id: usize,
    pub chan_start: i32,
    pub chan_end: i32,
    pub ra: f64,
    pub dec: f64,
    pub valid: bool,
    pub binning: u32,
}

impl RegionEntry {
    #[inline]
    pub fn width(&self) -> f64 {
        (self.chan_end - self.chan_start) as f64
    }

    #[inline]
    pub fn center(&self) -> f64 {
        0.5 * (self.chan_start + self.chan_end) as f64
    }
}

/// Flatten candidates into region entries, in sample-id order.
pub fn build_regions(candidates: &Candidates) -> Vec<RegionEntry> {
    candidates
        .iter()
        .flat_map(|(&sample_id, c)| {
            c.ranges.iter().map(move |r| RegionEntry {
                sample_id,
                chan_start: r.start.min(r.end),
                chan_end: r.start.max(r.end),
                ra: c.ra,
                dec: c.dec,
                valid: true,
                binning: r.binning.max(1),
            })
        })
        .collect()
}

/// `(width / whiten, center)` for every region entry.
pub fn whiten_regions(regions: &[RegionEntry], whiten: f64) -> Vec<[f64; 2]> {
    regions
        .iter()
        .map(|r| [r.width() / whiten, r.center()])
        .collect()
}

// ==========================================================
// Clusters
// ==========================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Line center in channels.
    pub center: f64,
    /// Line width in channels (not whitened).
    pub width: f64,
    pub valid: bool,
    /// k-means: clipping radius in whitened units. Hierarchy: cut threshold.
    pub extra: f64,
}

impl Cluster {
    pub fn new(center: f64, width: f64, extra: f64) -> Self {
        Cluster { center, width, valid: true, extra }
    }

    /// Validity only ever goes from `true` to `false`.
    #[inline]
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

#[derive(Clone, Debug)]
struct ArenaSlot {
    center: f64,
    width: f64,
    extra: f64,
}

/// Clusters addressed by stable ids while points are moved between them and
/// clusters are dropped; compacted only once at the end.
#[derive(Clone, Debug, Default)]
pub struct ClusterArena {
    slots: Vec<ArenaSlot>,
    active: BTreeSet<usize>,
}

impl ClusterArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cluster with `center`/`width` given in whitened coordinates.
    pub fn insert(&mut self, center: f64, width: f64, extra: f64) -> usize {
        let id = self.slots.len();
        self.slots.push(ArenaSlot { center, width, extra });
        self.active.insert(id);
        id
    }

    pub fn deactivate(&mut self, id: usize) {
        self.active.remove(&id);
    }

    pub fn active_ids(&self) -> Vec<usize> {
        self.active.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Compact the active clusters into a list ordered by ascending center and
    /// remap `category` (arena ids) onto the new positions. Points whose arena
    /// id is inactive map to `None`.
    pub fn finish(
        &self,
        category: &[Option<usize>],
        whiten: f64,
    ) -> (Vec<Cluster>, Vec<Option<usize>>) {
        let mut ids = self.active_ids();
        ids.sort_by_key(|&id| (OrderedFloat(self.slots[id].center), id));

        let remap: BTreeMap<usize, usize> = ids.iter().enumerate().map(|(k, &id)| (id, k)).collect();
        let clusters = ids
            .iter()
            .map(|&id| {
                let s = &self.slots[id];
                Cluster::new(s.center, s.width * whiten, s.extra)
            })
            .collect();
        let category = category
            .iter()
            .map(|c| c.and_then(|id| remap.get(&id).cloned()))
            .collect();
        (clusters, category)
    }
}

/// Output of either clustering algorithm.
#[derive(Clone, Debug, Default)]
pub struct ClusteringResult {
    pub clusters: Vec<Cluster>,
    /// Region index -> cluster index (`None` for points assigned nowhere).
    pub category: Vec<Option<usize>>,
    pub regions: Vec<RegionEntry>,
    pub info: ClusterInfo,
}

impl ClusteringResult {
    pub fn ncluster(&self) -> usize {
        self.clusters.len()
    }

    pub fn empty(regions: Vec<RegionEntry>) -> Self {
        let n = regions.len();
        ClusteringResult {
            clusters: Vec::new(),
            category: vec![None; n],
            regions,
            info: ClusterInfo::default(),
        }
    }
}

// ==========================================================
// Final output
// ==========================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    pub ra: f64,
    pub dec: f64,
    pub ranges: Vec<[i32; 2]>,
}

/// sample id -> accepted line ranges. Built additively.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RealSignal {
    pub entries: BTreeMap<usize, SignalEntry>,
}

impl RealSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_range(&mut self, sample_id: usize, ra: f64, dec: f64, range: [i32; 2]) {
        self.entries
            .entry(sample_id)
            .or_insert_with(|| SignalEntry { ra, dec, ranges: Vec::new() })
            .ranges
            .push(range);
    }

    /// Per-sample union with another signal.
    pub fn union_with(&mut self, other: &RealSignal) {
        for (&id, e) in other.entries.iter() {
            for &r in e.ranges.iter() {
                self.push_range(id, e.ra, e.dec, r);
            }
        }
    }

    pub fn ranges(&self, sample_id: usize) -> &[[i32; 2]] {
        self.entries
            .get(&sample_id)
            .map(|e| e.ranges.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==========================================================
// Diagnostics
// ==========================================================

/// Per-stage thresholds as reported for plotting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageThresholds {
    pub detection: Vec<f64>,
    pub validation: Vec<f64>,
    pub smoothing: Vec<f64>,
    #[serde(rename = "final")]
    pub final_: Vec<f64>,
}

/// Diagnostics for weblog rendering. Only the key names are a contract.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub axis_label: Option<String>,
    pub grid: Option<Grid>,
    pub thresholds: Option<StageThresholds>,
    /// `[cluster][ix][iy]` flag digits, see `validation::stages`.
    pub cluster_flag: Option<Vec<Vec<Vec<u16>>>>,
    /// Raw `(width, center)` of every flattened range.
    pub detected_lines: Option<Vec<[f64; 2]>>,
    /// `(ncluster, score)` trace of the k-means model-order search.
    pub cluster_score: Option<Vec<(usize, f64)>>,
    /// `[center, width, valid, extra]` per cluster, accumulated across algorithms.
    pub cluster_property: Vec<[f64; 4]>,
    pub cluster_scale: Option<f64>,
}

impl ClusterInfo {
    /// Merge another algorithm's diagnostics into `self`.
    ///
    /// The k-means score trace replaces any existing one, cluster properties
    /// accumulate, every other key keeps its first value.
    pub fn merge(&mut self, other: ClusterInfo, other_is_kmeans: bool) {
        if other_is_kmeans && other.cluster_score.is_some() {
            self.cluster_score = other.cluster_score;
        } else if self.cluster_score.is_none() {
            self.cluster_score = other.cluster_score;
        }
        self.cluster_property.extend(other.cluster_property);

        if self.axis_label.is_none() {
            self.axis_label = other.axis_label;
        }
        if self.grid.is_none() {
            self.grid = other.grid;
        }
        if self.thresholds.is_none() {
            self.thresholds = other.thresholds;
        }
        if self.cluster_flag.is_none() {
            self.cluster_flag = other.cluster_flag;
        }
        if self.detected_lines.is_none() {
            self.detected_lines = other.detected_lines;
        }
        if self.cluster_scale.is_none() {
            self.cluster_scale = other.cluster_scale;
        }
    }
}

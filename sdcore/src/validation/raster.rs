//! Spatial validation of clustered line candidates for raster maps.

use std::str::FromStr;

use log::{debug, info};

use crate::algorithm::geometry::{Grid, GridIndex};
use crate::cluster::hierarchy::clustering_hierarchy;
use crate::cluster::kmeans::clustering_kmean;
use crate::cluster::region::{build_regions, Candidates, Cluster, ClusterInfo, ClusteringResult, RealSignal, RegionEntry, StageThresholds};
use crate::validation::finalize::finalize;
use crate::validation::rule::{ClusterRule, LineSetup};
use crate::validation::stages::{detect, final_support, smooth, validate, ClusterFlags, Stage, DETECTION_THRESHOLDS};

/// Clustering algorithm selectable per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusteringAlgorithm {
    KMean,
    Hierarchy,
}

impl ClusteringAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ClusteringAlgorithm::KMean => "kmean",
            ClusteringAlgorithm::Hierarchy => "hierarchy",
        }
    }

    pub fn run(self, regions: Vec<RegionEntry>, rule: &ClusterRule, setup: &LineSetup) -> ClusteringResult {
        match self {
            ClusteringAlgorithm::KMean => clustering_kmean(regions, rule, setup.nsigma),
            ClusteringAlgorithm::Hierarchy => clustering_hierarchy(regions, rule, setup.nsigma, setup.nchan),
        }
    }
}

/// `"kmean"`, `"hierarchy"` or `"both"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlgorithmSelection(pub Vec<ClusteringAlgorithm>);

impl FromStr for AlgorithmSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kmean" => Ok(AlgorithmSelection(vec![ClusteringAlgorithm::KMean])),
            "hierarchy" => Ok(AlgorithmSelection(vec![ClusteringAlgorithm::Hierarchy])),
            "both" => Ok(AlgorithmSelection(vec![ClusteringAlgorithm::KMean, ClusteringAlgorithm::Hierarchy])),
            other => Err(format!("unknown clustering algorithm '{}'", other)),
        }
    }
}

/// Outcome of validating one clustering result.
#[derive(Clone, Debug, Default)]
pub struct RasterValidation {
    /// Final cluster set as `(center, width, valid)`.
    pub lines: Vec<Cluster>,
    pub channelmap_range: Vec<Cluster>,
    pub signal: RealSignal,
    pub info: ClusterInfo,
}

impl RasterValidation {
    pub fn ncluster(&self) -> usize {
        self.lines.len()
    }
}

pub struct ValidateLineRaster<'a> {
    pub rule: &'a ClusterRule,
    pub setup: &'a LineSetup,
    pub grid_ra: f64,
    pub grid_dec: f64,
}

impl<'a> ValidateLineRaster<'a> {
    pub fn new(rule: &'a ClusterRule, setup: &'a LineSetup, grid_ra: f64, grid_dec: f64) -> Self {
        ValidateLineRaster { rule, setup, grid_ra, grid_dec }
    }

    /// Grid over every sample position in `candidates`, with its cell index.
    pub fn grid_index(&self, candidates: &Candidates) -> Option<GridIndex> {
        let ra: Vec<f64> = candidates.values().map(|c| c.ra).collect();
        let dec: Vec<f64> = candidates.values().map(|c| c.dec).collect();
        let grid = Grid::from_positions(&ra, &dec, self.grid_ra, self.grid_dec)?;
        Some(GridIndex::build(
            grid,
            candidates.iter().map(|(&id, c)| (id, c.ra, c.dec)),
        ))
    }

    /// Run the four validation stages on a clustering result.
    pub fn validate(&self, clustering: ClusteringResult, candidates: &Candidates) -> RasterValidation {
        let ClusteringResult { mut clusters, category, regions, info: clustering_info } = clustering;
        let ncluster = clusters.len();

        let index = match self.grid_index(candidates) {
            Some(index) => index,
            None => {
                info!("no usable grid for {} sample(s); nothing to validate", candidates.len());
                for c in clusters.iter_mut() {
                    c.invalidate();
                }
                let mut info = ClusterInfo::default();
                info.merge(clustering_info, false);
                return RasterValidation { lines: clusters, info, ..Default::default() };
            }
        };
        let grid = index.grid.clone();
        let members = index.member_counts();
        let rule = self.rule;
        let mut flags = ClusterFlags::new(ncluster, grid.nra, grid.ndec);

        let detected = detect(ncluster, &regions, &category, &index);
        flags.record(Stage::Detection, &detected, &DETECTION_THRESHOLDS);

        let validated = validate(&detected, &members, &mut clusters, rule);
        flags.record(Stage::Validation, &validated, &rule.thresholds());

        let smoothed = smooth(&validated, &mut clusters, rule);
        flags.record(Stage::Smoothing, &smoothed, &rule.thresholds());

        let support = final_support(&validated, &smoothed);
        let stage = finalize(&support, &mut clusters, &regions, &category, candidates, &index, rule, self.setup);
        flags.record(Stage::Final, &stage.planes, &rule.thresholds());

        let nvalid = clusters.iter().filter(|c| c.valid).count();
        info!(
            "validated {} of {} cluster(s) on a {}x{} grid; {} sample(s) masked",
            nvalid,
            ncluster,
            grid.nra,
            grid.ndec,
            stage.signal.len()
        );
        for (c, cluster) in clusters.iter().enumerate() {
            debug!("cluster {}: center={:.2} width={:.2} valid={}", c, cluster.center, cluster.width, cluster.valid);
        }

        let thresholds = rule.thresholds().to_vec();
        let mut info = ClusterInfo {
            axis_label: Some("RA/DEC".to_string()),
            grid: Some(grid),
            thresholds: Some(StageThresholds {
                detection: DETECTION_THRESHOLDS.to_vec(),
                validation: thresholds.clone(),
                smoothing: thresholds.clone(),
                final_: thresholds,
            }),
            cluster_flag: Some(flags.to_nested()),
            ..Default::default()
        };
        info.merge(clustering_info, false);
        // properties reflect validity after all four stages
        info.cluster_property = clusters
            .iter()
            .map(|c| [c.center, c.width, if c.valid { 1.0 } else { 0.0 }, c.extra])
            .collect();

        RasterValidation {
            lines: clusters,
            channelmap_range: stage.channelmap_range,
            signal: stage.signal,
            info,
        }
    }
}

/// Cluster `candidates` with `algorithm` and validate the result on the raster grid.
pub fn validate_raster(
    candidates: &Candidates,
    algorithm: ClusteringAlgorithm,
    rule: &ClusterRule,
    setup: &LineSetup,
    grid_ra: f64,
    grid_dec: f64,
) -> RasterValidation {
    let regions = build_regions(candidates);
    debug!("{}: clustering {} detection(s)", algorithm.name(), regions.len());
    let clustering = algorithm.run(regions, rule, setup);
    ValidateLineRaster::new(rule, setup, grid_ra, grid_dec).validate(clustering, candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::region::{Candidate, ChannelRange};

    /// 9x9 raster with a line at channels 100-120 everywhere and a second
    /// line at 400-430 only in the lower-left quadrant.
    fn raster_candidates() -> Candidates {
        let mut c = Candidates::new();
        let mut id = 0;
        for ix in 0..9 {
            for iy in 0..9 {
                let mut ranges = vec![ChannelRange::new(100, 120, 1)];
                if ix < 4 && iy < 4 {
                    ranges.push(ChannelRange::new(400, 430, 1));
                }
                c.insert(id, Candidate { ra: ix as f64 * 0.01, dec: iy as f64 * 0.01, ranges });
                id += 1;
            }
        }
        c
    }

    fn setup() -> LineSetup {
        LineSetup { nchan: 1024, edge: (0, 0), ..Default::default() }
    }

    #[test]
    fn test_algorithm_selection_parse() {
        assert_eq!("both".parse::<AlgorithmSelection>().unwrap().0.len(), 2);
        assert_eq!(
            "kmean".parse::<AlgorithmSelection>().unwrap().0,
            vec![ClusteringAlgorithm::KMean]
        );
        assert!("dbscan".parse::<AlgorithmSelection>().is_err());
    }

    #[test]
    fn test_raster_validation_masks_both_lines() {
        let rule = ClusterRule::default();
        let setup = setup();
        let candidates = raster_candidates();
        let result = validate_raster(&candidates, ClusteringAlgorithm::Hierarchy, &rule, &setup, 0.01, 0.01);

        let valid: Vec<&Cluster> = result.lines.iter().filter(|c| c.valid).collect();
        assert_eq!(valid.len(), 2);
        assert_eq!(result.channelmap_range.len(), 2);

        // corner sample 0 sits in both footprints, the far corner only in the first
        let corner = result.signal.ranges(0);
        assert_eq!(corner.len(), 2);
        let far = result.signal.ranges(80);
        assert_eq!(far.len(), 1);
        assert!(far[0][0] <= 100 && far[0][1] >= 120);

        let info = result.info;
        assert_eq!(info.cluster_flag.as_ref().unwrap().len(), result.lines.len());
        assert!(info.grid.is_some());
    }

    #[test]
    fn test_compact_source_in_one_cell_is_kept() {
        // three more spectra at the map center, which alone show a second line
        let mut candidates = Candidates::new();
        let mut id = 0;
        for ix in 0..9 {
            for iy in 0..9 {
                let mut ranges = vec![ChannelRange::new(100, 120, 1)];
                if (ix, iy) == (4, 4) {
                    ranges.push(ChannelRange::new(500, 530, 1));
                }
                candidates.insert(id, Candidate { ra: ix as f64 * 0.01, dec: iy as f64 * 0.01, ranges });
                id += 1;
            }
        }
        for extra in 0..3 {
            let ranges = vec![ChannelRange::new(100, 120, 1), ChannelRange::new(500, 530, 1)];
            candidates.insert(100 + extra, Candidate { ra: 0.04, dec: 0.04, ranges });
        }

        let rule = ClusterRule::default();
        let result = validate_raster(&candidates, ClusteringAlgorithm::Hierarchy, &rule, &setup(), 0.01, 0.01);
        assert_eq!(result.ncluster(), 2);
        assert!(result.lines.iter().all(|c| c.valid));

        let center = result.signal.ranges(4 * 9 + 4);
        assert_eq!(center.len(), 2);
        assert!(center.iter().any(|r| r[0] <= 500 && r[1] >= 530));
        assert!(result.signal.ranges(100).iter().any(|r| r[0] <= 500 && r[1] >= 530));
        assert!(result.signal.ranges(0).iter().all(|r| r[1] < 500));
    }

    #[test]
    fn test_map_inside_one_cell() {
        let mut candidates = Candidates::new();
        for i in 0..6 {
            let offset = i as f64 * 0.0005;
            candidates.insert(
                i,
                Candidate { ra: 20.0 + offset, dec: -5.0 + offset, ranges: vec![ChannelRange::new(100, 120, 1)] },
            );
        }
        let rule = ClusterRule::default();
        let result = validate_raster(&candidates, ClusteringAlgorithm::Hierarchy, &rule, &setup(), 0.01, 0.01);

        let grid = result.info.grid.as_ref().unwrap();
        assert_eq!((grid.nra, grid.ndec), (1, 1));
        assert_eq!(result.ncluster(), 1);
        assert!(result.lines[0].valid);
        assert_eq!(result.signal.len(), 6);
        for i in 0..6 {
            let r = result.signal.ranges(i);
            assert!(r[0][0] <= 100 && r[0][1] >= 120);
        }
    }

    #[test]
    fn test_no_candidates_no_clusters() {
        let rule = ClusterRule::default();
        let result = validate_raster(&Candidates::new(), ClusteringAlgorithm::KMean, &rule, &setup(), 0.01, 0.01);
        assert_eq!(result.ncluster(), 0);
        assert!(result.signal.is_empty());
    }

    #[test]
    fn test_validity_never_returns() {
        let rule = ClusterRule::default();
        let setup = setup();
        let candidates = raster_candidates();
        let regions = build_regions(&candidates);
        let clustering = ClusteringAlgorithm::Hierarchy.run(regions, &rule, &setup);
        let mut clusters = clustering.clusters.clone();
        clusters.iter_mut().for_each(|c| c.invalidate());
        let forced = ClusteringResult { clusters, ..clustering };

        let result = ValidateLineRaster::new(&rule, &setup, 0.01, 0.01).validate(forced, &candidates);
        assert!(result.lines.iter().all(|c| !c.valid));
        assert!(result.signal.is_empty());
    }
}

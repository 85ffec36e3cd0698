//! Mode dispatch from candidate detections to per-sample MASKLIST records.

use std::collections::BTreeSet;

use log::{debug, error, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use sdcore::cluster::region::{Candidates, Cluster, ClusterInfo, RealSignal};
use sdcore::validation::raster::{validate_raster, AlgorithmSelection, ClusteringAlgorithm};
use sdcore::validation::single::validate_pointing;

use crate::clean::clean_detect_signal;
use crate::config::{MaskLineConfig, WindowMode};
use crate::error::Result;
use crate::lines::merge_lines;
use crate::table::{DataTable, NO_LINE};

/// Which dispatch branch produced the masks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskSource {
    ManualWindow,
    NoCandidates,
    Pointing,
    Raster,
}

#[derive(Clone, Debug, Serialize)]
pub struct MaskLineResult {
    pub source: MaskSource,
    pub ncluster: usize,
    /// Final line set as `(center, width, valid)`.
    pub lines: Vec<Cluster>,
    pub channelmap_range: Vec<Cluster>,
    pub cluster_info: ClusterInfo,
    /// Samples whose stored mask was rewritten.
    pub changed: usize,
}

impl MaskLineResult {
    fn new(source: MaskSource) -> Self {
        Self {
            source,
            ncluster: 0,
            lines: Vec::new(),
            channelmap_range: Vec::new(),
            cluster_info: ClusterInfo::default(),
            changed: 0,
        }
    }
}

/// Detected line ranges for one reduction-group member.
pub struct MaskLine<'a> {
    config: &'a MaskLineConfig,
}

impl<'a> MaskLine<'a> {
    pub fn new(config: &'a MaskLineConfig) -> Self {
        Self { config }
    }

    /// Run the branch selected by the configuration and write every sample's
    /// mask into `table`.
    ///
    /// Fails only on a malformed window or window mode; an empty detection is
    /// reported through `ncluster == 0` and the `[-1, -1]` mask.
    pub fn run<T: DataTable>(&self, candidates: &Candidates, table: &mut T) -> Result<MaskLineResult> {
        let config = self.config;
        let window = config.validated_window()?;
        let mode = config.window_mode()?;
        let window = merge_lines(&window, config.nchan);

        let ids: BTreeSet<usize> = table
            .sample_ids()
            .into_iter()
            .chain(candidates.keys().cloned())
            .collect();

        if !window.is_empty() && mode == WindowMode::Replace {
            info!("manual window {:?} replaces line detection", window);
            let mut result = MaskLineResult::new(MaskSource::ManualWindow);
            result.lines = window.iter().map(|&r| window_line(r)).collect();
            result.ncluster = result.lines.len();
            result.changed = self.write_all(table, &ids, |_| window.clone());
            return Ok(result);
        }

        // a merge-mode window is added to whatever the detection accepts
        let extra = window;

        if candidates.values().all(|c| c.ranges.is_empty()) {
            info!("no line candidates in {} sample(s)", ids.len());
            let mut result = MaskLineResult::new(MaskSource::NoCandidates);
            result.changed = self.write_all(table, &ids, |_| extra.clone());
            return Ok(result);
        }

        let setup = config.line_setup();
        if config.pattern.is_pointed() {
            let pointing = validate_pointing(candidates, &setup);
            info!("{:?}: accepted {} distinct line range(s) without clustering", config.pattern, pointing.lines.len());
            let mut result = MaskLineResult::new(MaskSource::Pointing);
            result.ncluster = pointing.lines.len();
            result.lines = pointing.lines;
            result.changed = self.write_all(table, &ids, |id| with_window(pointing.signal.ranges(id), &extra));
            return Ok(result);
        }

        let cleaned = clean_detect_signal(
            candidates,
            config.grid_ra,
            config.grid_dec,
            config.clean_ratio,
            config.clean_overlap,
        );
        let algorithms = match config.clustering_algorithm.parse::<AlgorithmSelection>() {
            Ok(selection) => selection.0,
            Err(e) => {
                error!("{}; no lines will be validated", e);
                Vec::new()
            }
        };

        let mut result = MaskLineResult::new(MaskSource::Raster);
        let mut signal = RealSignal::new();
        for algorithm in algorithms {
            let validation = validate_raster(&cleaned, algorithm, &config.rule, &setup, config.grid_ra, config.grid_dec);
            debug!(
                "{}: {} cluster(s), {} sample(s) with signal",
                algorithm.name(),
                validation.ncluster(),
                validation.signal.len()
            );
            signal.union_with(&validation.signal);
            result.ncluster += validation.ncluster();
            result.lines.extend(validation.lines);
            result.channelmap_range.extend(validation.channelmap_range);
            result
                .cluster_info
                .merge(validation.info, algorithm == ClusteringAlgorithm::KMean);
        }

        result.changed = self.write_all(table, &ids, |id| with_window(signal.ranges(id), &extra));
        Ok(result)
    }

    /// Write `mask_for(id)` (merged, or the no-line sentinel when empty) for
    /// every id. Returns the number of rewritten records.
    fn write_all<T, F>(&self, table: &mut T, ids: &BTreeSet<usize>, mask_for: F) -> usize
    where
        T: DataTable,
        F: Fn(usize) -> Vec<[i32; 2]>,
    {
        let nchan = self.config.nchan;
        let iteration = self.config.iteration;
        let mut changed = 0;
        for &id in ids.iter() {
            let mut mask = merge_lines(&mask_for(id), nchan);
            if mask.is_empty() {
                mask = vec![NO_LINE];
            }
            if table.update_mask(id, mask, iteration) {
                changed += 1;
            }
        }
        debug!("iteration {}: {} of {} mask(s) rewritten", iteration, changed, ids.len());
        changed
    }
}

fn window_line(range: [i32; 2]) -> Cluster {
    let (start, end) = (range[0] as f64, range[1] as f64);
    Cluster::new(0.5 * (start + end), end - start, 0.0)
}

fn with_window(ranges: &[[i32; 2]], window: &[[i32; 2]]) -> Vec<[i32; 2]> {
    ranges.iter().chain(window.iter()).cloned().collect()
}

/// One independent reduction-group member.
#[derive(Clone, Debug)]
pub struct MemberJob<T> {
    pub name: String,
    pub config: MaskLineConfig,
    pub candidates: Candidates,
    pub table: T,
}

/// Run independent members in parallel; each job writes only its own table.
pub fn run_members_par<T: DataTable + Send>(jobs: &mut [MemberJob<T>]) -> Vec<Result<MaskLineResult>> {
    jobs.par_iter_mut()
        .map(|job| {
            debug!("member {}: {} sample(s)", job.name, job.candidates.len());
            MaskLine::new(&job.config).run(&job.candidates, &mut job.table)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::InMemoryTable;
    use sdcore::cluster::region::{Candidate, ChannelRange};

    fn sparse_candidates() -> Candidates {
        let mut c = Candidates::new();
        c.insert(0, Candidate { ra: 0.0, dec: 0.0, ranges: vec![ChannelRange::new(30, 40, 1)] });
        c.insert(1, Candidate { ra: 0.1, dec: 0.0, ranges: vec![] });
        c
    }

    #[test]
    fn test_invalid_window_mode_fails_fast() {
        let mut config = MaskLineConfig::default();
        config.windowmode = "overwrite".to_string();
        let mut table = InMemoryTable::new();
        assert!(MaskLine::new(&config).run(&sparse_candidates(), &mut table).is_err());
        assert!(table.rows.is_empty());
    }

    #[test]
    fn test_merge_window_without_candidates() {
        let mut config = MaskLineConfig::default();
        config.window = vec![[10, 20]];
        config.windowmode = "merge".to_string();
        let mut table = InMemoryTable::with_samples([0, 1]);

        let result = MaskLine::new(&config).run(&Candidates::new(), &mut table).unwrap();
        assert_eq!(result.source, MaskSource::NoCandidates);
        assert_eq!(result.ncluster, 0);
        assert_eq!(table.masklist(1), &[[10, 20]]);
    }

    #[test]
    fn test_pointing_merges_window() {
        let mut config = MaskLineConfig::single_point();
        config.window = vec![[35, 50]];
        config.windowmode = "merge".to_string();
        let mut table = InMemoryTable::new();

        let result = MaskLine::new(&config).run(&sparse_candidates(), &mut table).unwrap();
        assert_eq!(result.source, MaskSource::Pointing);
        assert_eq!(table.masklist(0), &[[30, 50]]);
        assert_eq!(table.masklist(1), &[[35, 50]]);
    }

    #[test]
    fn test_unknown_algorithm_gives_empty_result() {
        let mut config = MaskLineConfig::raster(0.1, 0.1);
        config.clustering_algorithm = "dbscan".to_string();
        let mut table = InMemoryTable::new();

        let result = MaskLine::new(&config).run(&sparse_candidates(), &mut table).unwrap();
        assert_eq!(result.source, MaskSource::Raster);
        assert_eq!(result.ncluster, 0);
        assert_eq!(table.masklist(0), &[NO_LINE]);
    }

    #[test]
    fn test_raster_drops_spike_seen_in_one_pass() {
        // three passes over a 5x5 raster; the first pass alone shows a spike
        let mut candidates = Candidates::new();
        for pass in 0..3 {
            for ix in 0..5 {
                for iy in 0..5 {
                    let mut ranges = vec![ChannelRange::new(300, 321, 1)];
                    if pass == 0 {
                        ranges.push(ChannelRange::new(800, 803, 1));
                    }
                    let jitter = pass as f64 * 1e-7;
                    let position = Candidate { ra: ix as f64 * 0.01 + jitter, dec: iy as f64 * 0.01 - jitter, ranges };
                    candidates.insert(pass * 25 + ix * 5 + iy, position);
                }
            }
        }
        let config = MaskLineConfig::raster(0.01, 0.01);
        let mut table = InMemoryTable::new();

        let result = MaskLine::new(&config).run(&candidates, &mut table).unwrap();
        assert_eq!(result.source, MaskSource::Raster);
        assert_eq!(result.ncluster, 1);
        assert!(result.lines[0].valid);
        assert_eq!(table.rows.len(), 75);
        for row in table.rows.values() {
            assert_eq!(row.masklist.len(), 1);
            assert!(row.masklist[0][0] <= 300 && row.masklist[0][1] < 800);
        }
    }

    #[test]
    fn test_members_in_parallel() {
        let mut replace = MaskLineConfig::default();
        replace.window = vec![[1, 2]];
        let mut jobs = vec![
            MemberJob { name: "a".into(), config: replace, candidates: sparse_candidates(), table: InMemoryTable::new() },
            MemberJob { name: "b".into(), config: MaskLineConfig::single_point(), candidates: sparse_candidates(), table: InMemoryTable::new() },
        ];
        let results = run_members_par(&mut jobs);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(jobs[0].table.masklist(1), &[[1, 2]]);
        assert_eq!(jobs[1].table.masklist(0), &[[30, 40]]);
        assert_eq!(jobs[1].table.masklist(1), &[NO_LINE]);
    }
}

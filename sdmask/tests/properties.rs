use std::collections::BTreeSet;

use approx::assert_abs_diff_eq;

use sdcore::algorithm::geometry::Grid;
use sdcore::algorithm::svd::SvdSolver2D;
use sdcore::cluster::hierarchy::clustering_hierarchy;
use sdcore::cluster::kmeans::clustering_kmean;
use sdcore::cluster::region::{build_regions, Candidate, Candidates, ChannelRange};
use sdcore::validation::finalize::finalize;
use sdcore::validation::raster::ValidateLineRaster;
use sdcore::validation::stages::{detect, final_support, smooth, validate};
use sdcore::{ClusterRule, LineSetup};
use sdmask::{merge_lines, DataTable, InMemoryTable, MaskLine, MaskLineConfig, MaskSource, NO_LINE};

/// `n x n` raster, one sample per position, `ranges(ix, iy)` detections each.
fn raster<F>(n: usize, step: f64, ranges: F) -> Candidates
where
    F: Fn(usize, usize) -> Vec<ChannelRange>,
{
    let mut c = Candidates::new();
    for ix in 0..n {
        for iy in 0..n {
            c.insert(
                ix * n + iy,
                Candidate { ra: ix as f64 * step, dec: iy as f64 * step, ranges: ranges(ix, iy) },
            );
        }
    }
    c
}

fn raster_config() -> MaskLineConfig {
    MaskLineConfig::raster(0.01, 0.01)
}

fn mask_set(table: &InMemoryTable) -> BTreeSet<Vec<[i32; 2]>> {
    table.rows.values().map(|r| r.masklist.clone()).collect()
}

#[test]
fn test_revalidation_with_own_output_is_idempotent() {
    let candidates = raster(7, 0.01, |_, _| vec![ChannelRange::new(200, 221, 1)]);
    let config = raster_config();
    let mut first = InMemoryTable::new();
    let result = MaskLine::new(&config).run(&candidates, &mut first).unwrap();
    assert_eq!(result.source, MaskSource::Raster);

    let masks = mask_set(&first);
    assert_eq!(masks.len(), 1);

    let mut again = config.clone();
    again.window = result
        .lines
        .iter()
        .filter(|l| l.valid)
        .map(|l| [(l.center - 0.5 * l.width).round() as i64, (l.center + 0.5 * l.width).round() as i64])
        .collect();
    assert!(!again.window.is_empty());
    again.windowmode = "replace".to_string();
    let mut second = InMemoryTable::new();
    MaskLine::new(&again).run(&candidates, &mut second).unwrap();
    assert_eq!(mask_set(&second), masks);
}

#[test]
fn test_kmeans_cluster_count_bound() {
    // five well separated lines, but at most three clusters allowed
    let candidates = raster(5, 0.01, |ix, iy| {
        let k = ((ix + 2 * iy) % 5) as i32;
        vec![ChannelRange::new(100 + 150 * k, 115 + 150 * k + (ix as i32 % 2), 1)]
    });
    let rule = ClusterRule { max_cluster: 3, ..Default::default() };
    let result = clustering_kmean(build_regions(&candidates), &rule, 3.0);
    assert!(result.ncluster() <= 3);
    assert_eq!(result.ncluster(), result.clusters.len());
    assert_eq!(result.category.len(), result.regions.len());
}

#[test]
fn test_validity_is_monotonic_across_stages() {
    // a real line everywhere, a spurious one in three isolated corners
    let candidates = raster(7, 0.01, |ix, iy| {
        let mut r = vec![ChannelRange::new(200, 221, 1)];
        if (ix, iy) == (0, 0) || (ix, iy) == (6, 0) || (ix, iy) == (0, 6) {
            r.push(ChannelRange::new(600, 611, 1));
        }
        r
    });
    let rule = ClusterRule::default();
    let setup = LineSetup::default();
    let clustering = clustering_hierarchy(build_regions(&candidates), &rule, setup.nsigma, setup.nchan);
    assert_eq!(clustering.ncluster(), 2);

    let validator = ValidateLineRaster::new(&rule, &setup, 0.01, 0.01);
    let index = validator.grid_index(&candidates).unwrap();
    let members = index.member_counts();
    let mut clusters = clustering.clusters.clone();
    let validity = |c: &[sdcore::Cluster]| c.iter().map(|c| c.valid).collect::<Vec<bool>>();

    let mut history = vec![validity(&clusters)];
    let planes = detect(clusters.len(), &clustering.regions, &clustering.category, &index);
    let validated = validate(&planes, &members, &mut clusters, &rule);
    history.push(validity(&clusters));
    let smoothed = smooth(&validated, &mut clusters, &rule);
    history.push(validity(&clusters));
    let support = final_support(&validated, &smoothed);
    finalize(&support, &mut clusters, &clustering.regions, &clustering.category, &candidates, &index, &rule, &setup);
    history.push(validity(&clusters));

    for pair in history.windows(2) {
        for (before, after) in pair[0].iter().zip(pair[1].iter()) {
            assert!(*before || !*after, "a rejected cluster came back");
        }
    }
    let last = history.last().unwrap();
    assert_eq!(last.iter().filter(|v| **v).count(), 1);
    assert!(clusters.iter().find(|c| c.valid).map(|c| (c.center - 210.5).abs() < 1.0).unwrap_or(false));
}

#[test]
fn test_every_sample_in_exactly_one_cell() {
    let ra: Vec<f64> = (0..40).map(|i| 150.0 + (i % 8) as f64 * 0.003).collect();
    let dec: Vec<f64> = (0..40).map(|i| 30.0 + (i / 8) as f64 * 0.003).collect();
    let grid = Grid::from_positions(&ra, &dec, 0.003, 0.003).unwrap();
    assert_eq!(grid.nra % 2, 1);
    assert_eq!(grid.ndec % 2, 1);

    for (&r, &d) in ra.iter().zip(dec.iter()) {
        let containing: Vec<(usize, usize)> = (0..grid.nra)
            .flat_map(|ix| (0..grid.ndec).map(move |iy| (ix, iy)))
            .filter(|&(ix, iy)| grid.cell_contains(ix, iy, r, d))
            .collect();
        assert_eq!(containing.len(), 1);
        assert_eq!(containing[0], grid.cell_of(r, d));
    }
}

#[test]
fn test_merge_lines_example() {
    assert_eq!(merge_lines(&[[0, 5], [3, 8], [20, 25]], 100), vec![[0, 8], [20, 25]]);
}

#[test]
fn test_no_candidates_writes_sentinel() {
    let config = raster_config();

    let mut table = InMemoryTable::with_samples(0..4);
    let result = MaskLine::new(&config).run(&Candidates::new(), &mut table).unwrap();
    assert_eq!(result.ncluster, 0);
    assert!(table.rows.values().all(|r| r.masklist == vec![NO_LINE]));

    let silent = raster(3, 0.01, |_, _| Vec::new());
    let mut table = InMemoryTable::new();
    let result = MaskLine::new(&config).run(&silent, &mut table).unwrap();
    assert_eq!(result.source, MaskSource::NoCandidates);
    assert_eq!(result.ncluster, 0);
    assert_eq!(table.rows.len(), 9);
    assert!(table.rows.values().all(|r| r.is_no_line()));
}

#[test]
fn test_svd_recovers_plane() {
    let x = vec![0.0, 1.0, 0.0, 1.0, 0.5, 2.0, -1.0];
    let y = vec![0.0, 0.0, 1.0, 1.0, 0.3, -0.5, 2.0];
    let z: Vec<f64> = x.iter().zip(y.iter()).map(|(x, y)| 2.0 + 3.0 * x - y).collect();

    let mut solver = SvdSolver2D::new(1, 1);
    solver.set_data_points(&x, &y).unwrap();
    let fit = solver.find_good_solution(&z, 0.05).unwrap();
    assert!(fit.score < 1e-3);
    assert_abs_diff_eq!(fit.coefficient(0, 0), 2.0, epsilon = 1e-6);
    assert_abs_diff_eq!(fit.coefficient(1, 0), 3.0, epsilon = 1e-6);
    assert_abs_diff_eq!(fit.coefficient(0, 1), -1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(fit.coefficient(1, 1), 0.0, epsilon = 1e-6);
}

#[test]
fn test_manual_window_short_circuits() {
    let candidates = raster(4, 0.01, |ix, _| vec![ChannelRange::new(10 * ix as i32, 10 * ix as i32 + 5, 1)]);
    let mut config = raster_config();
    config.window = vec![[100, 120]];

    let mut table = InMemoryTable::with_samples([99]);
    let result = MaskLine::new(&config).run(&candidates, &mut table).unwrap();
    assert_eq!(result.source, MaskSource::ManualWindow);
    assert_eq!(table.rows.len(), 17);
    assert!(table.rows.values().all(|r| r.masklist == vec![[100, 120]]));
}

#[test]
fn test_nochange_tracks_stable_iterations() {
    let candidates = raster(5, 0.01, |_, _| vec![ChannelRange::new(300, 321, 1)]);
    let mut config = raster_config();
    let mut table = InMemoryTable::new();

    let first = MaskLine::new(&config).run(&candidates, &mut table).unwrap();
    assert_eq!(first.changed, 25);

    config.iteration = 2;
    let second = MaskLine::new(&config).run(&candidates, &mut table).unwrap();
    assert_eq!(second.changed, 0);
    assert!(table.nochange_column().values().all(|&v| v == 1));

    config.iteration = 3;
    config.window = vec![[10, 20]];
    MaskLine::new(&config).run(&candidates, &mut table).unwrap();
    let ids = table.sample_ids();
    assert!(ids.iter().all(|&id| table.read_mask(id).map(|m| m.nochange()) == Some(-1)));
}

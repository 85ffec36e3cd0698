//! k-means clustering of whitened `(width, center)` points with a model-order
//! search over the number of clusters.
//!
//! For every candidate count the codebook is refined by alternating vector
//! quantisation, n-sigma clipping of each cluster and a median update, merging
//! clusters that collapse onto each other, until nothing changes. Each count is
//! scored and the search stops once the best score has not improved for
//! [`STALL_LIMIT`] consecutive counts. A cap `max_cluster <= STALL_LIMIT`
//! therefore always runs to the cap, and a warning is logged whenever the
//! search ends there without stalling.

use itertools::Itertools;
use log::{debug, info, warn};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::algorithm::stats::{distance, mean, median, std_dev};
use crate::cluster::region::{whiten_regions, ClusterArena, ClusterInfo, ClusteringResult, RegionEntry};
use crate::validation::rule::ClusterRule;

/// Non-improving candidate counts tolerated before the search stops.
pub const STALL_LIMIT: usize = 10;

/// Weight of the median whitened width in the score.
const WIDTH_WEIGHT: f64 = 0.1;

/// Upper bound on refine rounds per candidate count.
const MAX_REFINE_ROUNDS: usize = 20;

/// Lloyd convergence on relative distortion change.
const DISTORTION_TOL: f64 = 1e-5;

/// Nearest codeword and distance for every point.
pub fn vector_quantize(data: &[[f64; 2]], codebook: &[[f64; 2]]) -> (Vec<usize>, Vec<f64>) {
    data.iter()
        .map(|&p| {
            codebook
                .iter()
                .enumerate()
                .map(|(k, &c)| (k, distance(p, c)))
                .min_by_key(|&(_, d)| OrderedFloat(d))
                .unwrap_or((0, f64::INFINITY))
        })
        .unzip()
}

/// Lloyd iterations from one initial codebook. Codewords that lose all their
/// points are dropped. Returns `(codebook, mean distortion)`.
fn lloyd(data: &[[f64; 2]], mut codebook: Vec<[f64; 2]>, iterations: usize) -> (Vec<[f64; 2]>, f64) {
    let mut last = f64::INFINITY;
    for _ in 0..iterations.max(1) {
        let (category, dist) = vector_quantize(data, &codebook);
        let distortion = mean(&dist);

        let mut next = Vec::with_capacity(codebook.len());
        for k in 0..codebook.len() {
            let members: Vec<[f64; 2]> = data
                .iter()
                .zip(category.iter())
                .filter(|(_, &c)| c == k)
                .map(|(p, _)| *p)
                .collect();
            if members.is_empty() {
                continue;
            }
            let n = members.len() as f64;
            let w = members.iter().map(|p| p[0]).sum::<f64>() / n;
            let c = members.iter().map(|p| p[1]).sum::<f64>() / n;
            next.push([w, c]);
        }
        codebook = next;

        if (last - distortion).abs() <= DISTORTION_TOL * distortion.max(f64::MIN_POSITIVE) {
            break;
        }
        last = distortion;
    }
    let (_, dist) = vector_quantize(data, &codebook);
    (codebook, mean(&dist))
}

/// Best-of-`restarts` k-means on `data`; initial codewords are distinct points.
pub fn kmeans(
    data: &[[f64; 2]],
    k: usize,
    restarts: usize,
    iterations: usize,
    rng: &mut StdRng,
) -> (Vec<[f64; 2]>, f64) {
    let distinct: Vec<[f64; 2]> = data
        .iter()
        .cloned()
        .unique_by(|p| (OrderedFloat(p[0]), OrderedFloat(p[1])))
        .collect();
    let k = k.min(distinct.len());
    if k == 0 {
        return (Vec::new(), 0.0);
    }

    let mut best: Option<(Vec<[f64; 2]>, f64)> = None;
    for _ in 0..restarts.max(1) {
        let init: Vec<[f64; 2]> = distinct.choose_multiple(rng, k).cloned().collect();
        let (codebook, distortion) = lloyd(data, init, iterations);
        if best.as_ref().map(|b| distortion < b.1).unwrap_or(true) {
            best = Some((codebook, distortion));
        }
    }
    best.unwrap_or((Vec::new(), 0.0))
}

/// State of one candidate count after refinement.
#[derive(Clone, Debug)]
struct Trial {
    codebook: Vec<[f64; 2]>,
    radius: Vec<f64>,
    category: Vec<usize>,
    valid: Vec<bool>,
    score: f64,
}

/// Clip each cluster at `mean + nsigma * std` of member distances and move its
/// codeword to the member median. Returns the per-cluster radius and whether
/// any point was newly flagged.
fn clip_and_update(
    data: &[[f64; 2]],
    codebook: &mut [[f64; 2]],
    category: &[usize],
    dist: &[f64],
    valid: &mut [bool],
    nsigma: f64,
) -> (Vec<f64>, bool) {
    let mut radius = vec![0.0; codebook.len()];
    let mut flagged = false;

    for k in 0..codebook.len() {
        let members: Vec<usize> = (0..data.len()).filter(|&i| category[i] == k && valid[i]).collect();
        if members.is_empty() {
            continue;
        }
        let d: Vec<f64> = members.iter().map(|&i| dist[i]).collect();
        let threshold = mean(&d) + nsigma * std_dev(&d);
        radius[k] = threshold;

        let mut kept = Vec::with_capacity(members.len());
        for &i in members.iter() {
            if dist[i] > threshold {
                valid[i] = false;
                flagged = true;
            } else {
                kept.push(i);
            }
        }
        if kept.is_empty() {
            continue;
        }
        let widths: Vec<f64> = kept.iter().map(|&i| data[i][0]).collect();
        let centers: Vec<f64> = kept.iter().map(|&i| data[i][1]).collect();
        codebook[k] = [median(&widths), median(&centers)];
    }
    (radius, flagged)
}

/// Drop codewords without valid members and codewords sitting inside a larger
/// neighbour's radius. Returns `true` if the codebook shrank.
fn merge_codebook(
    codebook: &mut Vec<[f64; 2]>,
    radius: &mut Vec<f64>,
    category: &[usize],
    valid: &[bool],
) -> bool {
    let counts: Vec<usize> = (0..codebook.len())
        .map(|k| category.iter().zip(valid.iter()).filter(|(&c, &v)| c == k && v).count())
        .collect();

    let mut keep = vec![true; codebook.len()];
    for k in 0..codebook.len() {
        if counts[k] == 0 {
            keep[k] = false;
        }
    }
    for a in 0..codebook.len() {
        for b in (a + 1)..codebook.len() {
            if !keep[a] || !keep[b] {
                continue;
            }
            let d = distance(codebook[a], codebook[b]);
            if d < radius[a].min(radius[b]) || d < 1e-9 {
                // the smaller cluster is absorbed
                if counts[a] >= counts[b] {
                    keep[b] = false;
                } else {
                    keep[a] = false;
                }
            }
        }
    }

    let before = codebook.len();
    let mut it = keep.iter();
    codebook.retain(|_| *it.next().unwrap_or(&false));
    let mut it = keep.iter();
    radius.retain(|_| *it.next().unwrap_or(&false));
    codebook.len() < before
}

/// Score of a refined trial; lower is better.
///
/// Mean member distance plus a width term, scaled by the cluster count and
/// inflated by the fraction of points clipped as outliers.
fn trial_score(data: &[[f64; 2]], codebook: &[[f64; 2]], category: &[usize], valid: &[bool]) -> f64 {
    let survivors: Vec<usize> = (0..data.len()).filter(|&i| valid[i]).collect();
    if survivors.is_empty() || codebook.is_empty() {
        return f64::INFINITY;
    }
    let dist: Vec<f64> = survivors
        .iter()
        .map(|&i| distance(data[i], codebook[category[i]]))
        .collect();
    let widths: Vec<f64> = survivors.iter().map(|&i| data[i][0]).collect();

    let valid_fraction = survivors.len() as f64 / data.len() as f64;
    (mean(&dist) + WIDTH_WEIGHT * median(&widths)) * codebook.len() as f64 / valid_fraction.max(0.1)
}

fn refine_trial(
    data: &[[f64; 2]],
    mut codebook: Vec<[f64; 2]>,
    nsigma: f64,
) -> Trial {
    let mut valid = vec![true; data.len()];
    let mut radius = vec![0.0; codebook.len()];

    for round in 0..MAX_REFINE_ROUNDS {
        let (category, dist) = vector_quantize(data, &codebook);
        let previous = codebook.clone();

        let (r, flagged) = clip_and_update(data, &mut codebook, &category, &dist, &mut valid, nsigma);
        radius = r;
        let merged = merge_codebook(&mut codebook, &mut radius, &category, &valid);

        let moved = merged
            || previous
                .iter()
                .zip(codebook.iter())
                .any(|(a, b)| distance(*a, *b) > 1e-9);
        if !flagged && !moved {
            debug!("k-means refine converged after {} rounds", round + 1);
            break;
        }
    }

    let (category, _) = vector_quantize(data, &codebook);
    let score = trial_score(data, &codebook, &category, &valid);
    Trial { codebook, radius, category, valid, score }
}

/// Cluster the valid region entries with k-means and pick the cluster count by score.
///
/// An empty input or a search that ends without any cluster is not an error:
/// the result simply holds zero clusters.
pub fn clustering_kmean(mut regions: Vec<RegionEntry>, rule: &ClusterRule, nsigma: f64) -> ClusteringResult {
    let data = whiten_regions(&regions, rule.whiten);
    if data.is_empty() {
        return ClusteringResult::empty(regions);
    }

    let n_distinct = data
        .iter()
        .unique_by(|p| (OrderedFloat(p[0]), OrderedFloat(p[1])))
        .count();
    let max_cluster = rule.max_cluster.max(1);

    let mut rng = StdRng::seed_from_u64(rule.seed);
    let mut best: Option<(usize, Trial)> = None;
    let mut trace = Vec::new();
    let mut stalled = false;

    for ncluster in 1..=max_cluster.min(n_distinct) {
        let (codebook, _) = kmeans(&data, ncluster, rule.kmeans_restarts, rule.kmeans_iterations, &mut rng);
        if codebook.is_empty() {
            continue;
        }
        let trial = refine_trial(&data, codebook, nsigma);
        debug!("k-means ncluster={} effective={} score={:.4}", ncluster, trial.codebook.len(), trial.score);
        trace.push((ncluster, trial.score));

        let improved = best.as_ref().map(|(_, b)| trial.score < b.score).unwrap_or(true);
        if improved {
            best = Some((ncluster, trial));
        }

        let best_n = best.as_ref().map(|(n, _)| *n).unwrap_or(ncluster);
        if ncluster - best_n >= STALL_LIMIT {
            stalled = true;
            break;
        }
    }

    let (best_n, trial) = match best {
        Some(b) => b,
        None => return ClusteringResult::empty(regions),
    };
    // running out of distinct points ends the search as well as a stall does
    if !stalled && n_distinct > max_cluster {
        warn!(
            "k-means search reached the cluster cap ({}) before the score settled; keeping best at ncluster={}",
            max_cluster, best_n
        );
    }

    let mut arena = ClusterArena::new();
    let ids: Vec<usize> = trial
        .codebook
        .iter()
        .zip(trial.radius.iter())
        .map(|(c, &r)| arena.insert(c[1], c[0], r))
        .collect();
    let category: Vec<Option<usize>> = trial.category.iter().map(|&c| ids.get(c).cloned()).collect();
    for (region, &v) in regions.iter_mut().zip(trial.valid.iter()) {
        region.valid = v;
    }

    let (clusters, category) = arena.finish(&category, rule.whiten);
    info!("k-means selected {} cluster(s) (search best at ncluster={})", clusters.len(), best_n);

    let info = ClusterInfo {
        cluster_score: Some(trace),
        cluster_property: clusters
            .iter()
            .map(|c| [c.center, c.width, if c.valid { 1.0 } else { 0.0 }, c.extra])
            .collect(),
        cluster_scale: Some(rule.whiten),
        detected_lines: Some(regions.iter().map(|r| [r.width(), r.center()]).collect()),
        ..Default::default()
    };

    ClusteringResult { clusters, category, regions, info }
}

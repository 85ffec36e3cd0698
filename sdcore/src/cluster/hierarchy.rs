//! Agglomerative clustering of whitened `(width, center)` points.
//!
//! The dendrogram is cut twice: once globally at `mean + n_threshold * sigma`
//! of the link heights, then again inside every first-level cluster at
//! `mean + n_threshold2 * sigma` of that cluster's own heights, which splits
//! lines that were chained together. Two synthetic points at the channel
//! bounds join the first linkage so its height statistics stay meaningful
//! for small samples; they are dropped before clusters are formed.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::algorithm::stats::{distance, mean, median, std_dev};
use crate::cluster::region::{whiten_regions, ClusterArena, ClusterInfo, ClusteringResult, RegionEntry};
use crate::validation::rule::{ClusterRule, Linkage};

/// Clusters with fewer valid members than this are dropped after cleaning.
pub const MIN_CLUSTER_MEMBERS: usize = 2;

/// One agglomeration step: slot `absorbed` joined slot `into` at `height`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Merge {
    pub into: usize,
    pub absorbed: usize,
    pub height: f64,
}

/// Agglomerative linkage with the nearest-neighbour chain algorithm.
///
/// Clusters are identified by the index of a surviving point slot. Merges are
/// returned ordered by height. Memory is quadratic in the number of points.
pub fn linkage(data: &[[f64; 2]], method: Linkage) -> Vec<Merge> {
    let n = data.len();
    if n < 2 {
        return Vec::new();
    }

    let mut d = vec![0.0f64; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let v = distance(data[i], data[j]);
            d[i * n + j] = v;
            d[j * n + i] = v;
        }
    }

    let mut active = vec![true; n];
    let mut size = vec![1usize; n];
    let mut merges = Vec::with_capacity(n - 1);
    let mut chain: Vec<usize> = Vec::new();
    let mut remaining = n;

    while remaining > 1 {
        if chain.is_empty() {
            let first = (0..n).find(|&i| active[i]).unwrap_or(0);
            chain.push(first);
        }

        let (x, y) = loop {
            let x = chain[chain.len() - 1];
            let prev = if chain.len() >= 2 { Some(chain[chain.len() - 2]) } else { None };

            // ties go to the previous chain element so the chain terminates
            let mut best = prev;
            let mut best_d = prev.map(|p| d[x * n + p]).unwrap_or(f64::INFINITY);
            for i in 0..n {
                if i == x || !active[i] {
                    continue;
                }
                let v = d[x * n + i];
                if v < best_d {
                    best_d = v;
                    best = Some(i);
                }
            }
            let y = match best {
                Some(y) => y,
                None => break (x, x),
            };
            if Some(y) == prev {
                break (x, y);
            }
            chain.push(y);
        };
        if x == y {
            break;
        }
        chain.pop();
        chain.pop();

        let height = d[x * n + y];
        let (sx, sy) = (size[x] as f64, size[y] as f64);
        for k in 0..n {
            if !active[k] || k == x || k == y {
                continue;
            }
            let dxk = d[x * n + k];
            let dyk = d[y * n + k];
            let v = match method {
                Linkage::Single => dxk.min(dyk),
                Linkage::Complete => dxk.max(dyk),
                Linkage::Average => (sx * dxk + sy * dyk) / (sx + sy),
            };
            d[y * n + k] = v;
            d[k * n + y] = v;
        }
        active[x] = false;
        size[y] += size[x];
        merges.push(Merge { into: y, absorbed: x, height });
        remaining -= 1;
    }

    merges.sort_by(|a, b| a.height.total_cmp(&b.height));
    merges
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Flat clusters from a linkage: points joined by merges no higher than
/// `threshold` share a label. Labels are dense and ordered by first point.
pub fn cut_tree(n: usize, merges: &[Merge], threshold: f64) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..n).collect();
    for m in merges.iter().take_while(|m| m.height <= threshold) {
        let a = find(&mut parent, m.into);
        let b = find(&mut parent, m.absorbed);
        if a != b {
            parent[b] = a;
        }
    }

    let mut labels = BTreeMap::new();
    (0..n)
        .map(|i| {
            let root = find(&mut parent, i);
            let next = labels.len();
            *labels.entry(root).or_insert(next)
        })
        .collect()
}

/// `mean + nsigma * sigma` of the merge heights.
pub fn height_threshold(merges: &[Merge], nsigma: f64) -> f64 {
    let heights: Vec<f64> = merges.iter().map(|m| m.height).collect();
    if heights.is_empty() {
        return 0.0;
    }
    mean(&heights) + nsigma * std_dev(&heights)
}

/// Split every first-level cluster by a second cut on its own linkage.
/// Returns `(label per point, threshold per label)`.
fn second_cut(
    data: &[[f64; 2]],
    first: &[usize],
    first_threshold: f64,
    rule: &ClusterRule,
) -> (Vec<usize>, Vec<f64>) {
    let nfirst = first.iter().cloned().max().map(|m| m + 1).unwrap_or(0);
    let mut labels = vec![0usize; data.len()];
    let mut thresholds = Vec::new();

    for c in 0..nfirst {
        let members: Vec<usize> = (0..data.len()).filter(|&i| first[i] == c).collect();
        if members.len() < 3 {
            let label = thresholds.len();
            thresholds.push(first_threshold);
            for &i in members.iter() {
                labels[i] = label;
            }
            continue;
        }

        let sub: Vec<[f64; 2]> = members.iter().map(|&i| data[i]).collect();
        let merges = linkage(&sub, rule.linkage);
        let threshold = height_threshold(&merges, rule.n_threshold2);
        let sub_labels = cut_tree(sub.len(), &merges, threshold);
        let nsub = sub_labels.iter().cloned().max().map(|m| m + 1).unwrap_or(0);
        if nsub > 1 {
            debug!("hierarchy: first-level cluster {} split into {}", c, nsub);
        }

        let base = thresholds.len();
        for _ in 0..nsub {
            thresholds.push(threshold);
        }
        for (&i, &s) in members.iter().zip(sub_labels.iter()) {
            labels[i] = base + s;
        }
    }
    (labels, thresholds)
}

/// Remove distance outliers per cluster, drop clusters left with too few
/// members, and summarise the rest in an arena (median width/center).
fn clean_clusters(
    data: &[[f64; 2]],
    labels: &[usize],
    thresholds: &[f64],
    valid: &mut [bool],
    nsigma: f64,
) -> (ClusterArena, Vec<Option<usize>>) {
    let mut arena = ClusterArena::new();
    let mut category = vec![None; data.len()];

    for (label, &threshold) in thresholds.iter().enumerate() {
        let members: Vec<usize> = (0..data.len()).filter(|&i| labels[i] == label && valid[i]).collect();
        if members.is_empty() {
            continue;
        }
        let widths: Vec<f64> = members.iter().map(|&i| data[i][0]).collect();
        let centers: Vec<f64> = members.iter().map(|&i| data[i][1]).collect();
        let centroid = [median(&widths), median(&centers)];

        let dist: Vec<f64> = members.iter().map(|&i| distance(data[i], centroid)).collect();
        let limit = mean(&dist) + nsigma * std_dev(&dist);
        let kept: Vec<usize> = members
            .iter()
            .zip(dist.iter())
            .filter(|(_, &dv)| dv <= limit)
            .map(|(&i, _)| i)
            .collect();
        for (&i, &dv) in members.iter().zip(dist.iter()) {
            if dv > limit {
                valid[i] = false;
            }
        }

        let widths: Vec<f64> = kept.iter().map(|&i| data[i][0]).collect();
        let centers: Vec<f64> = kept.iter().map(|&i| data[i][1]).collect();
        let id = arena.insert(median(&centers), median(&widths), threshold);
        for &i in members.iter() {
            category[i] = Some(id);
        }
        if kept.len() < MIN_CLUSTER_MEMBERS {
            debug!("hierarchy: dropping cluster at center {:.1} ({} member(s))", median(&centers), kept.len());
            arena.deactivate(id);
        }
    }
    (arena, category)
}

/// Cluster region entries hierarchically. `nchan` places the synthetic
/// boundary points. Zero clusters is a valid outcome.
pub fn clustering_hierarchy(
    mut regions: Vec<RegionEntry>,
    rule: &ClusterRule,
    nsigma: f64,
    nchan: usize,
) -> ClusteringResult {
    let data = whiten_regions(&regions, rule.whiten);
    if data.is_empty() {
        return ClusteringResult::empty(regions);
    }
    let n = data.len();

    let widths: Vec<f64> = data.iter().map(|p| p[0]).collect();
    let median_width = median(&widths);
    let mut augmented = data.clone();
    augmented.push([median_width, 0.0]);
    augmented.push([median_width, nchan.saturating_sub(1) as f64]);

    let merges = linkage(&augmented, rule.linkage);
    let threshold = height_threshold(&merges, rule.n_threshold);
    let first_all = cut_tree(augmented.len(), &merges, threshold);

    // relabel without the synthetic points
    let mut relabel = BTreeMap::new();
    let first: Vec<usize> = first_all[..n]
        .iter()
        .map(|&l| {
            let next = relabel.len();
            *relabel.entry(l).or_insert(next)
        })
        .collect();
    debug!("hierarchy: first cut at {:.4} gives {} cluster(s)", threshold, relabel.len());

    let (labels, thresholds) = second_cut(&data, &first, threshold, rule);

    let mut valid: Vec<bool> = regions.iter().map(|r| r.valid).collect();
    let (arena, category) = clean_clusters(&data, &labels, &thresholds, &mut valid, nsigma);
    for (region, v) in regions.iter_mut().zip(valid.into_iter()) {
        region.valid = v;
    }

    let (clusters, category) = arena.finish(&category, rule.whiten);
    info!("hierarchy selected {} cluster(s)", clusters.len());

    let info = ClusterInfo {
        cluster_score: Some(vec![(clusters.len(), threshold)]),
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

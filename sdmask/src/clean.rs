//! False-detection cleaning for raster data.
//!
//! A raster position is usually observed several times, never at exactly the
//! same coordinates. Samples falling into one grid cell are split in id order
//! into three time-grouped copies; a detected range survives only if enough
//! copies report a matching range.

use itertools::Itertools;
use log::{debug, info};

use sdcore::algorithm::geometry::{Grid, GridIndex};
use sdcore::cluster::region::{Candidate, Candidates, ChannelRange};

/// Number of time-grouped copies compared per position.
pub const NUM_COPIES: usize = 3;

/// Fraction of the broader range two ranges must share to count as the same line.
pub fn range_overlap(a: &ChannelRange, b: &ChannelRange) -> f64 {
    let (a0, a1) = (a.start.min(a.end), a.start.max(a.end));
    let (b0, b1) = (b.start.min(b.end), b.start.max(b.end));
    let shared = (a1.min(b1) - a0.max(b0) + 1).max(0) as f64;
    let broadest = ((a1 - a0).max(b1 - b0) + 1) as f64;
    shared / broadest
}

/// Copies that must agree out of `ncopies`.
fn required_copies(ncopies: usize, ratio: f64) -> usize {
    ((ratio * ncopies as f64) - 1e-9).ceil().max(1.0) as usize
}

/// Lines confirmed across copies.
///
/// `copies[k]` holds every range detected in copy `k`. A range is kept when at
/// least `ceil(ratio * copies.len())` copies contain a range overlapping it by
/// `overlap` or more. Identical confirmed ranges are reported once.
pub fn clean_detect_line(copies: &[Vec<ChannelRange>], ratio: f64, overlap: f64) -> Vec<ChannelRange> {
    let required = required_copies(copies.len(), ratio);
    copies
        .iter()
        .flatten()
        .filter(|line| {
            let support = copies
                .iter()
                .filter(|copy| copy.iter().any(|other| range_overlap(line, other) >= overlap))
                .count();
            support >= required
        })
        .map(|line| (line.start, line.end, line.binning))
        .unique()
        .map(|(start, end, binning)| ChannelRange::new(start, end, binning))
        .collect()
}

/// Sample ids per occupied cell of a `(grid_ra, grid_dec)` grid over all positions.
fn group_by_cell(candidates: &Candidates, grid_ra: f64, grid_dec: f64) -> Option<Vec<Vec<usize>>> {
    let ra: Vec<f64> = candidates.values().map(|c| c.ra).collect();
    let dec: Vec<f64> = candidates.values().map(|c| c.dec).collect();
    let grid = Grid::from_positions(&ra, &dec, grid_ra, grid_dec)?;
    let index = GridIndex::build(grid, candidates.iter().map(|(&id, c)| (id, c.ra, c.dec)));
    let grid = &index.grid;
    let groups = (0..grid.nra)
        .flat_map(|ix| (0..grid.ndec).map(move |iy| (ix, iy)))
        .map(|(ix, iy)| index.samples_in(ix, iy).to_vec())
        .filter(|ids| !ids.is_empty())
        .collect();
    Some(groups)
}

/// Drop detections that are not reproduced across the time-grouped copies of
/// their grid cell.
///
/// Cells observed fewer than [`NUM_COPIES`] times are left untouched, as is
/// everything when no grid can be laid over the positions.
pub fn clean_detect_signal(
    candidates: &Candidates,
    grid_ra: f64,
    grid_dec: f64,
    ratio: f64,
    overlap: f64,
) -> Candidates {
    let groups = match group_by_cell(candidates, grid_ra, grid_dec) {
        Some(groups) => groups,
        None => return candidates.clone(),
    };

    let mut cleaned = Candidates::new();
    let mut dropped = 0usize;

    for ids in groups.iter() {
        let n = ids.len();
        if n < NUM_COPIES {
            for id in ids {
                cleaned.insert(*id, candidates[id].clone());
            }
            continue;
        }

        // ids are ascending, so contiguous chunks are time-ordered copies
        let copy_of = |k: usize| k * NUM_COPIES / n;
        let mut copies: Vec<Vec<ChannelRange>> = vec![Vec::new(); NUM_COPIES];
        for (k, id) in ids.iter().enumerate() {
            copies[copy_of(k)].extend(candidates[id].ranges.iter().cloned());
        }
        let confirmed = clean_detect_line(&copies, ratio, overlap);

        for id in ids {
            let source = &candidates[id];
            let ranges: Vec<ChannelRange> = source
                .ranges
                .iter()
                .filter(|r| confirmed.iter().any(|c| range_overlap(r, c) >= overlap))
                .cloned()
                .collect();
            dropped += source.ranges.len() - ranges.len();
            cleaned.insert(*id, Candidate { ra: source.ra, dec: source.dec, ranges });
        }
    }

    if dropped > 0 {
        info!("clean_detect_signal: dropped {} unconfirmed detection(s)", dropped);
    } else {
        debug!("clean_detect_signal: all detections confirmed");
    }
    cleaned
}

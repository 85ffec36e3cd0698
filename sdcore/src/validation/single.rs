//! Single- and multi-pointing data: no spatial context, so every detection is
//! accepted once it is brought inside the usable channel window.

use std::collections::BTreeSet;

use log::debug;

use crate::cluster::region::{Candidates, Cluster, RealSignal};
use crate::validation::rule::LineSetup;

#[derive(Clone, Debug, Default)]
pub struct PointingValidation {
    /// One valid cluster per distinct accepted range.
    pub lines: Vec<Cluster>,
    pub signal: RealSignal,
}

/// Clip `[start, end]` to the channels left after dropping `edge`.
///
/// Ranges lying entirely inside an edge are dropped.
pub fn clip_to_edge(range: [i32; 2], nchan: usize, edge: (usize, usize)) -> Option<[i32; 2]> {
    let lo = edge.0 as i64;
    let hi = nchan as i64 - 1 - edge.1 as i64;
    if hi < lo {
        return None;
    }
    let (start, end) = if range[0] <= range[1] {
        (range[0] as i64, range[1] as i64)
    } else {
        (range[1] as i64, range[0] as i64)
    };
    if end < lo || start > hi {
        return None;
    }
    Some([start.max(lo) as i32, end.min(hi) as i32])
}

pub fn validate_pointing(candidates: &Candidates, setup: &LineSetup) -> PointingValidation {
    let mut signal = RealSignal::new();
    let mut distinct = BTreeSet::new();
    let mut dropped = 0usize;

    for (&id, cand) in candidates.iter() {
        for r in cand.ranges.iter() {
            match clip_to_edge([r.start, r.end], setup.nchan, setup.edge) {
                Some(range) => {
                    signal.push_range(id, cand.ra, cand.dec, range);
                    distinct.insert(range);
                }
                None => dropped += 1,
            }
        }
    }
    if dropped > 0 {
        debug!("pointing: dropped {} range(s) inside the band edges", dropped);
    }

    let lines = distinct
        .into_iter()
        .map(|[s, e]| Cluster::new(0.5 * (s + e) as f64, (e - s) as f64, 0.0))
        .collect();
    PointingValidation { lines, signal }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::region::{Candidate, ChannelRange};

    #[test]
    fn test_clip_to_edge() {
        assert_eq!(clip_to_edge([2, 8], 100, (5, 5)), Some([5, 8]));
        assert_eq!(clip_to_edge([0, 4], 100, (5, 5)), None);
        assert_eq!(clip_to_edge([90, 99], 100, (5, 5)), Some([90, 94]));
        assert_eq!(clip_to_edge([96, 99], 100, (5, 5)), None);
        assert_eq!(clip_to_edge([30, 20], 100, (0, 0)), Some([20, 30]));
    }

    #[test]
    fn test_pointing_accepts_everything_in_band() {
        let mut c = Candidates::new();
        c.insert(0, Candidate { ra: 0.0, dec: 0.0, ranges: vec![ChannelRange::new(10, 20, 1), ChannelRange::new(0, 3, 1)] });
        c.insert(1, Candidate { ra: 0.0, dec: 0.0, ranges: vec![ChannelRange::new(10, 20, 1)] });
        let setup = LineSetup { nchan: 64, edge: (4, 4), ..Default::default() };

        let out = validate_pointing(&c, &setup);
        assert_eq!(out.signal.ranges(0), &[[10, 20]]);
        assert_eq!(out.signal.ranges(1), &[[10, 20]]);
        assert_eq!(out.lines.len(), 1);
        assert!(out.lines[0].valid);
        assert_eq!(out.lines[0].center, 15.0);
    }
}

use itertools::Itertools;

/// Collapse channel ranges into the minimal covering set, ordered by start.
///
/// Ranges are clipped to `[0, nchan - 1]`; ranges entirely outside the band
/// (including the `[-1, -1]` no-line sentinel) are dropped. Overlapping or
/// touching ranges are joined, as if the ranges were painted onto a channel
/// mask and read back as contiguous runs.
pub fn merge_lines(ranges: &[[i32; 2]], nchan: usize) -> Vec<[i32; 2]> {
    let last = nchan as i64 - 1;
    if last < 0 {
        return Vec::new();
    }

    let clipped = ranges.iter().filter_map(|&[a, b]| {
        let (lo, hi) = (a.min(b) as i64, a.max(b) as i64);
        if hi < 0 || lo > last {
            None
        } else {
            Some([lo.max(0), hi.min(last)])
        }
    });

    let mut merged: Vec<[i64; 2]> = Vec::new();
    for [lo, hi] in clipped.sorted() {
        match merged.last_mut() {
            Some(cur) if lo <= cur[1] + 1 => cur[1] = cur[1].max(hi),
            _ => merged.push([lo, hi]),
        }
    }
    merged.into_iter().map(|[lo, hi]| [lo as i32, hi as i32]).collect()
}

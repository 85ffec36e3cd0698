//! Conversion of fitted line parameters into protected channel ranges.

/// Multiplicative widening of the half width.
pub const PROTECT_FACTOR: f64 = 1.5;

/// Additive widening, in channels, on each side.
pub const PROTECT_PAD: f64 = 2.0;

/// Clamp a fitted `(start, end)` so the width lies in `[min_fwhm, max_fwhm]`,
/// keeping the center. Returns `(center, width)`.
pub fn clamp_line(start: f64, end: f64, min_fwhm: f64, max_fwhm: f64) -> (f64, f64) {
    let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
    let center = 0.5 * (lo + hi);
    let width = (hi - lo).clamp(min_fwhm, max_fwhm.max(min_fwhm));
    (center, width)
}

/// Channel range `[left, right]` to protect for a line at `center` of `width`.
///
/// The half width is widened by [`PROTECT_FACTOR`] and [`PROTECT_PAD`], capped
/// at half the broadest plausible line. When one side runs into the usable
/// channel window (`edge` excluded) the overflow is moved to the other side,
/// so broad lines near the band edges are not truncated.
pub fn calc_protect_mask(
    center: f64,
    width: f64,
    nchan: usize,
    edge: (usize, usize),
    max_fwhm: f64,
) -> [i32; 2] {
    let lo_limit = edge.0 as f64;
    let hi_limit = (nchan as f64 - 1.0 - edge.1 as f64).max(lo_limit);

    let allowance = (0.5 * width * PROTECT_FACTOR + PROTECT_PAD).min(0.5 * max_fwhm + PROTECT_PAD);
    let mut left = center - allowance;
    let mut right = center + allowance;

    if left < lo_limit {
        right += lo_limit - left;
        left = lo_limit;
    }
    if right > hi_limit {
        left -= right - hi_limit;
        right = hi_limit;
    }
    left = left.max(lo_limit);

    [left.floor() as i32, right.ceil() as i32]
}

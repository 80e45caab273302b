//! Interval algebra over nanosecond ranges
//!
//! The summarizer attributes wall-clock time by set arithmetic on sorted
//! `[start, end)` range lists. Everything here is pure: inputs are borrowed,
//! outputs are fresh vectors, and every operation normalizes through
//! [`collapse`] so results are sorted, merged, and clipped to the window.
//!
//! `collapse` is idempotent, and `not` is an involution up to collapse:
//! `not(not(rs, w), w) == collapse(rs, w)`. Those properties are what the
//! summarizer's remainder-consumption loop relies on.

/// Half-open nanosecond range: `[start, end)`.
pub type Range = [i64; 2];

/// Drops empty and inverted ranges, sorts by start, merges overlapping and
/// adjacent ranges, and clips the result to `window`.
///
/// # Example
///
/// ```
/// use tejedor::interval::collapse;
///
/// assert_eq!(collapse(&[[4, 7], [5, 8]], [0, 10]), vec![[4, 8]]);
/// assert_eq!(collapse(&[[4, 7]], [0, 6]), vec![[4, 6]]);
/// assert_eq!(collapse(&[[7, 4]], [0, 10]), Vec::<[i64; 2]>::new());
/// ```
pub fn collapse(ranges: &[Range], window: Range) -> Vec<Range> {
    let mut by_start: Vec<Range> = ranges.iter().copied().filter(|v| v[0] < v[1]).collect();
    by_start.sort_by_key(|v| v[0]);

    let mut merged: Vec<Range> = Vec::with_capacity(by_start.len());
    for v in by_start {
        match merged.last_mut() {
            Some(last) if v[0] <= last[1] => {
                if v[1] > last[1] {
                    last[1] = v[1];
                }
            }
            _ => merged.push(v),
        }
    }

    let mut keep = Vec::with_capacity(merged.len());
    for mut v in merged {
        if v[1] <= window[0] || v[0] >= window[1] {
            continue;
        }
        if v[0] < window[0] {
            v[0] = window[0];
        }
        if v[1] > window[1] {
            v[1] = window[1];
        }
        keep.push(v);
    }
    keep
}

/// The complement of `ranges` within `window`.
pub fn not(ranges: &[Range], window: Range) -> Vec<Range> {
    let ranges = collapse(ranges, window);
    let mut out = Vec::with_capacity(ranges.len() + 1);
    let mut start = window[0];
    for v in ranges {
        out.push([start, v[0]]);
        start = v[1];
    }
    out.push([start, window[1]]);
    collapse(&out, window)
}

/// Removes `delta` from `base`. The working window is the hull of `base`
/// (min start to max end, taken over the raw input), so parts of `delta`
/// outside `base` have no effect.
///
/// # Example
///
/// ```
/// use tejedor::interval::subtract;
///
/// assert_eq!(subtract(&[[0, 10]], &[[4, 7]]), vec![[0, 4], [7, 10]]);
/// assert_eq!(
///     subtract(&[[0, 10], [20, 30]], &[[5, 15], [25, 35]]),
///     vec![[0, 5], [20, 25]],
/// );
/// ```
pub fn subtract(base: &[Range], delta: &[Range]) -> Vec<Range> {
    let mut window = [0i64, 0];
    for (i, v) in base.iter().enumerate() {
        if i == 0 {
            window = *v;
            continue;
        }
        if v[0] < window[0] {
            window[0] = v[0];
        }
        if v[1] > window[1] {
            window[1] = v[1];
        }
    }

    let mut not_result = not(base, window);
    not_result.extend_from_slice(delta);
    not(&not_result, window)
}

/// Total length covered by `ranges`. Meaningful on collapsed input.
pub fn magnitude(ranges: &[Range]) -> i64 {
    ranges.iter().map(|v| v[1] - v[0]).sum()
}

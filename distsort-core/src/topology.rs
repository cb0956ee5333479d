//! Power-of-two helpers used to shape the sorting network.

/// True iff `x` is a positive power of two.
#[inline]
pub fn is_power_two(x: usize) -> bool {
    x != 0 && x & (x - 1) == 0
}

/// Largest power of two strictly below `x`.
///
/// Follows the doubling-from-two convention: every `x <= 2` maps to `1`, so
/// `power_two_below(4) == 2` while `power_two_below(5) == 4`. The sort only
/// consults this for group sizes that are not powers of two, where "strictly
/// below" and "at most" agree.
pub fn power_two_below(x: usize) -> usize {
    let mut r = 2;
    while r < x {
        r *= 2;
    }
    r / 2
}

/// Twice [`power_two_below`]: the smallest power of two `>= x` for `x >= 2`,
/// and `2` for `x` in `{0, 1}`.
pub fn power_two_above(x: usize) -> usize {
    2 * power_two_below(x)
}

//! Small bit-level helpers shared by the sub-pool geometry and the sorted
//! base-pointer index.

/// Returns the floor of the base-2 logarithm of `value`.
///
/// Zero has no logarithm; this returns 0 for it, which is exactly what the
/// dense-id mapping needs (ids 0 and 1 both live in sub-pool 0).
#[inline]
#[must_use]
pub(crate) fn floor_log2(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        // Cannot underflow: a non-zero word has at most BITS - 1 leading zeros.
        (usize::BITS - 1 - value.leading_zeros()) as usize
    }
}

/// Rounds `value` up to a power of two, saturating at `usize::MAX`.
///
/// Zero and existing powers of two are returned unchanged.
#[inline]
#[must_use]
pub(crate) fn round_up_pow2(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        value.checked_next_power_of_two().unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_log2_smoke() {
        assert_eq!(floor_log2(0), 0);
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(2), 1);
        assert_eq!(floor_log2(3), 1);
        assert_eq!(floor_log2(4), 2);
        assert_eq!(floor_log2(7), 2);
        assert_eq!(floor_log2(8), 3);
        assert_eq!(floor_log2(usize::MAX), usize::BITS as usize - 1);
    }

    #[test]
    fn round_up_pow2_smoke() {
        assert_eq!(round_up_pow2(0), 0);
        assert_eq!(round_up_pow2(1), 1);
        assert_eq!(round_up_pow2(2), 2);
        assert_eq!(round_up_pow2(3), 4);
        assert_eq!(round_up_pow2(5), 8);
        assert_eq!(round_up_pow2(64), 64);
        assert_eq!(round_up_pow2(65), 128);
    }

    #[test]
    fn round_up_pow2_saturates() {
        assert_eq!(round_up_pow2(usize::MAX), usize::MAX);
        assert_eq!(round_up_pow2((1 << (usize::BITS - 1)) + 1), usize::MAX);
    }
}

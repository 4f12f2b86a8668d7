//! Bit helpers for power-of-two buffer sizing
//!
//! Ring buffer capacities are rounded up to a power of two so that the
//! physical offset of a frame is `frame & mask` instead of a modulo.

/// Number of leading zero bits in a 32-bit value (32 for zero)
pub fn count_leading_zeroes(value: u32) -> u32 {
    value.leading_zeros()
}

/// Base-2 log of the smallest power of two that is >= `value`
///
/// `log2_ceil(0)` and `log2_ceil(1)` are both 0.
pub fn log2_ceil(value: u32) -> u32 {
    if value <= 1 {
        return 0;
    }
    32 - count_leading_zeroes(value - 1)
}

/// Smallest power of two that is >= `value`
///
/// Returns `None` when the result does not fit in a `u32`
/// (anything above 2^31). Zero rounds up to 1.
pub fn next_power_of_two(value: u32) -> Option<u32> {
    let shift = log2_ceil(value);
    if shift >= 32 {
        None
    } else {
        Some(1 << shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_leading_zeroes() {
        assert_eq!(count_leading_zeroes(0), 32);
        assert_eq!(count_leading_zeroes(1), 31);
        assert_eq!(count_leading_zeroes(0x8000_0000), 0);
        assert_eq!(count_leading_zeroes(0x00ff_0000), 8);
    }

    #[test]
    fn test_log2_ceil() {
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(2), 1);
        assert_eq!(log2_ceil(3), 2);
        assert_eq!(log2_ceil(128), 7);
        assert_eq!(log2_ceil(129), 8);
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), Some(1));
        assert_eq!(next_power_of_two(1), Some(1));
        assert_eq!(next_power_of_two(100), Some(128));
        assert_eq!(next_power_of_two(128), Some(128));
        assert_eq!(next_power_of_two(129), Some(256));
        assert_eq!(next_power_of_two(1 << 31), Some(1 << 31));
        assert_eq!(next_power_of_two((1 << 31) + 1), None);
    }

    #[test]
    fn test_matches_std_for_small_values() {
        for c in 1..5000u32 {
            assert_eq!(next_power_of_two(c), Some(c.next_power_of_two()));
        }
    }
}

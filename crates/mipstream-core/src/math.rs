//! Math utilities
//!
//! Power-of-two and discard-ladder helpers.

/// Clamp to the unit interval, mapping NaN to zero
#[inline]
pub fn clamp01(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Check whether a dimension is a power of two
#[inline]
pub fn is_power_of_two(value: u32) -> bool {
    value != 0 && value.is_power_of_two()
}

/// Round a positive float up to the next power of two
///
/// Values at or below one round to one; non-finite values return `f32::MAX`.
pub fn next_power_of_two_f32(value: f32) -> f32 {
    if !value.is_finite() {
        return f32::MAX;
    }
    if value <= 1.0 {
        return 1.0;
    }
    let exponent = value.log2().ceil();
    let rounded = exponent.exp2();
    // log2 of an exact power of two can land a hair above the integer
    if rounded / 2.0 >= value { rounded / 2.0 } else { rounded }
}

/// Edge length of a dimension at the given discard level
#[inline]
pub fn discard_dimension(full: u32, level: u8) -> u32 {
    full.checked_shr(level as u32).unwrap_or(0).max(1)
}

/// Deepest discard level before the smaller edge collapses below one pixel
pub fn max_discard_for(width: u32, height: u32) -> u8 {
    let min_edge = width.min(height).max(1);
    (31 - min_edge.leading_zeros()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp01() {
        assert_eq!(clamp01(-1.0), 0.0);
        assert_eq!(clamp01(0.25), 0.25);
        assert_eq!(clamp01(4.0), 1.0);
        assert_eq!(clamp01(f32::NAN), 0.0);
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two_f32(0.0), 1.0);
        assert_eq!(next_power_of_two_f32(1.0), 1.0);
        assert_eq!(next_power_of_two_f32(3.0), 4.0);
        assert_eq!(next_power_of_two_f32(256.0), 256.0);
        assert_eq!(next_power_of_two_f32(257.0), 512.0);
        assert_eq!(next_power_of_two_f32(f32::INFINITY), f32::MAX);
    }

    #[test]
    fn test_is_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(1024));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(600));
    }

    #[test]
    fn test_discard_dimension() {
        assert_eq!(discard_dimension(1024, 0), 1024);
        assert_eq!(discard_dimension(1024, 2), 256);
        assert_eq!(discard_dimension(4, 5), 1);
        assert_eq!(discard_dimension(1024, 40), 1);
    }

    #[test]
    fn test_max_discard_for() {
        assert_eq!(max_discard_for(1024, 1024), 10);
        assert_eq!(max_discard_for(1024, 64), 6);
        assert_eq!(max_discard_for(1, 1), 0);
        assert_eq!(max_discard_for(0, 0), 0);
    }
}

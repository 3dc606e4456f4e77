use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
pub type Fixed64 = I32F32;

/// Simulated time in seconds. Fixed-point so that accumulating many small
/// steps never drifts and interval comparisons are exact.
pub type SimTime = Fixed64;

/// Convert seconds to [`SimTime`]. Saturates at the representable range.
#[inline]
pub fn seconds(v: f64) -> SimTime {
    SimTime::saturating_from_num(v)
}

/// Convert [`SimTime`] to seconds.
#[inline]
pub fn to_seconds(t: SimTime) -> f64 {
    t.to_num::<f64>()
}

/// Smallest representable positive time increment, in seconds.
#[inline]
pub fn time_resolution() -> f64 {
    to_seconds(SimTime::DELTA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_round_trip_for_exact_values() {
        assert_eq!(to_seconds(seconds(1.5)), 1.5);
        assert_eq!(to_seconds(seconds(20.0)), 20.0);
    }

    #[test]
    fn accumulation_does_not_drift_for_dyadic_steps() {
        let mut t = SimTime::ZERO;
        for _ in 0..1000 {
            t += seconds(0.125);
        }
        assert_eq!(t, seconds(125.0));
    }

    #[test]
    fn saturates_instead_of_panicking() {
        assert_eq!(seconds(f64::INFINITY), SimTime::MAX);
        assert_eq!(seconds(-1e30), SimTime::MIN);
    }

    #[test]
    fn resolution_is_positive_and_tiny() {
        let r = time_resolution();
        assert!(r > 0.0);
        assert!(r < 1e-9);
    }

    #[test]
    fn ordering() {
        assert!(seconds(1.0) < seconds(2.0));
    }
}

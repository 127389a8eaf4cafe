//! Bounded exponential backoff for redeliveries
//!
//! Transient failures (timeouts, temporary I/O) start from a short base so
//! they retry quickly; everything else starts from a longer base and climbs
//! toward the dead-letter limits faster. Delays are always clamped to
//! `[min, max]` regardless of the delivery count.

use std::time::Duration;

use crate::errors::HandlerError;

/// Backoff policy applied between redeliveries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Lower clamp for any computed delay
    pub min: Duration,
    /// Upper clamp for any computed delay
    pub max: Duration,
    /// Cap on the exponent so the doubling stops growing
    pub max_exponent: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_exponent: 6,
        }
    }
}

impl BackoffPolicy {
    /// Compute the redelivery delay for the given 1-based delivery count.
    pub fn delay(&self, deliveries: u64, transient: bool) -> Duration {
        let base: f64 = if transient { 0.5 } else { 2.0 };
        let power = deliveries.saturating_sub(1).min(self.max_exponent as u64);
        let raw = (base * 2f64.powi(power as i32)).floor();
        let secs = raw.clamp(self.min.as_secs() as f64, self.max.as_secs() as f64);
        Duration::from_secs(secs as u64)
    }

    /// Delay for a classified handler error.
    pub fn delay_for(&self, deliveries: u64, error: &HandlerError) -> Duration {
        self.delay(deliveries, error.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_ramp() {
        let policy = BackoffPolicy::default();
        // base 0.5: 0.5, 1, 2, 4, 8, 16, 32 -> clamped below at 1s
        assert_eq!(policy.delay(1, true), Duration::from_secs(1));
        assert_eq!(policy.delay(2, true), Duration::from_secs(1));
        assert_eq!(policy.delay(3, true), Duration::from_secs(2));
        assert_eq!(policy.delay(4, true), Duration::from_secs(4));
        assert_eq!(policy.delay(7, true), Duration::from_secs(32));
    }

    #[test]
    fn test_permanent_ramp() {
        let policy = BackoffPolicy::default();
        // base 2.0: 2, 4, 8, 16, 32, 64 -> clamped above at 60s
        assert_eq!(policy.delay(1, false), Duration::from_secs(2));
        assert_eq!(policy.delay(2, false), Duration::from_secs(4));
        assert_eq!(policy.delay(5, false), Duration::from_secs(32));
        assert_eq!(policy.delay(6, false), Duration::from_secs(60));
    }

    #[test]
    fn test_exponent_cap() {
        let policy = BackoffPolicy::default();
        // Past the cap the delay stops growing.
        assert_eq!(policy.delay(7, false), policy.delay(100, false));
        assert_eq!(policy.delay(1000, true), Duration::from_secs(32));
    }

    #[test]
    fn test_bounds_hold_for_all_inputs() {
        let policy = BackoffPolicy::default();
        for deliveries in 1..=64 {
            for transient in [true, false] {
                let d = policy.delay(deliveries, transient);
                assert!(d >= Duration::from_secs(1), "delay below floor: {d:?}");
                assert!(d <= Duration::from_secs(60), "delay above ceiling: {d:?}");
            }
        }
    }

    #[test]
    fn test_delay_for_error_classification() {
        let policy = BackoffPolicy::default();
        let transient = HandlerError::transient("timed out");
        let permanent = HandlerError::failed("boom");
        assert_eq!(policy.delay_for(3, &transient), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, &permanent), Duration::from_secs(8));
    }
}

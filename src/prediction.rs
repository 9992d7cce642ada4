use std::collections::VecDeque;
use std::time::{Duration, Instant};

const HISTORY_WINDOW: Duration = Duration::from_secs(30 * 60);
const MIN_SPAN: Duration = Duration::from_secs(120);
const MAX_ESTIMATE: Duration = Duration::from_secs(5 * 3600);

/// Estimates when the five-hour window will hit 100% from its recent rate.
#[derive(Debug, Default)]
pub struct UsagePredictor {
    history: VecDeque<(Instant, f64)>,
}

impl UsagePredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading and return the estimated time until 100%, if usage is
    /// climbing steadily enough to say.
    pub fn record(&mut self, utilization: f64, now: Instant) -> Option<Duration> {
        while let Some(&(t, _)) = self.history.front() {
            if now.saturating_duration_since(t) >= HISTORY_WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }
        self.history.push_back((now, utilization));

        let &(oldest_time, oldest_usage) = self.history.front()?;
        let span = now.saturating_duration_since(oldest_time);
        if self.history.len() < 2 || span < MIN_SPAN {
            return None;
        }

        let rise = utilization - oldest_usage;
        let remaining = 100.0 - utilization;
        if rise <= 0.0 || remaining <= 0.0 {
            return None;
        }

        let rate = rise / span.as_secs_f64();
        // A vanishing rate gives an infinite or unrepresentable estimate.
        let estimate = Duration::try_from_secs_f64(remaining / rate).ok()?;
        (estimate <= MAX_ESTIMATE).then_some(estimate)
    }

    /// Forget history, e.g. after the window resets.
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_two_minutes_of_history() {
        let t0 = Instant::now();
        let mut p = UsagePredictor::new();
        assert_eq!(p.record(10.0, t0), None);
        assert_eq!(p.record(20.0, t0 + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_linear_estimate() {
        let t0 = Instant::now();
        let mut p = UsagePredictor::new();
        p.record(40.0, t0);
        // 10% in 10 minutes, 50% left -> 50 minutes
        let eta = p.record(50.0, t0 + Duration::from_secs(600)).unwrap();
        assert_eq!(eta.as_secs_f64().round() as u64, 3000);
    }

    #[test]
    fn test_flat_or_falling_usage_has_no_estimate() {
        let t0 = Instant::now();
        let mut p = UsagePredictor::new();
        p.record(50.0, t0);
        assert_eq!(p.record(50.0, t0 + Duration::from_secs(300)), None);
        assert_eq!(p.record(45.0, t0 + Duration::from_secs(400)), None);
    }

    #[test]
    fn test_slow_climb_beyond_five_hours_is_dropped() {
        let t0 = Instant::now();
        let mut p = UsagePredictor::new();
        p.record(10.0, t0);
        assert_eq!(p.record(10.5, t0 + Duration::from_secs(600)), None);
    }

    #[test]
    fn test_old_readings_expire() {
        let t0 = Instant::now();
        let mut p = UsagePredictor::new();
        p.record(0.0, t0);
        p.record(60.0, t0 + Duration::from_secs(20 * 60));
        // The t0 reading is now 31 minutes old and dropped; rate is 10% over 11 minutes
        let eta = p.record(70.0, t0 + Duration::from_secs(31 * 60)).unwrap();
        assert_eq!(eta.as_secs_f64().round() as u64, 30 * 66);
    }

    #[test]
    fn test_vanishing_rise_has_no_estimate() {
        let t0 = Instant::now();
        let mut p = UsagePredictor::new();
        p.record(0.0, t0);
        assert_eq!(p.record(1e-320, t0 + Duration::from_secs(600)), None);
        assert_eq!(p.record(f64::MIN_POSITIVE, t0 + Duration::from_secs(900)), None);
    }

    #[test]
    fn test_at_limit() {
        let t0 = Instant::now();
        let mut p = UsagePredictor::new();
        p.record(90.0, t0);
        assert_eq!(p.record(100.0, t0 + Duration::from_secs(300)), None);
    }
}

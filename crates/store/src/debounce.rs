//! Per-entry rate limiter for subscriber fan-out.

use std::time::Duration;

use tokio::time::Instant;

/// Collapses bursts to at most one emission per window. A zero window never suppresses.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    last_emit: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self { Self { window, last_emit: None } }

    pub fn window(&self) -> Duration { self.window }
    pub fn is_enabled(&self) -> bool { !self.window.is_zero() }

    /// Call once per candidate notification.
    pub fn should_suppress(&mut self) -> bool { self.should_suppress_at(Instant::now()) }

    /// True if an earlier call returned false less than `window` before `now`.
    pub fn should_suppress_at(&mut self, now: Instant) -> bool {
        if !self.is_enabled() { return false; }
        match self.last_emit {
            Some(prev) if now.saturating_duration_since(prev) < self.window => true,
            _ => {
                self.last_emit = Some(now);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_never_suppresses() {
        let mut d = Debouncer::new(Duration::ZERO);
        let t = Instant::now();
        assert!(!d.should_suppress_at(t));
        assert!(!d.should_suppress_at(t));
        assert!(!d.is_enabled());
    }

    #[test]
    fn burst_collapses_to_one_per_window() {
        let mut d = Debouncer::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(!d.should_suppress_at(t0));
        assert!(d.should_suppress_at(t0 + Duration::from_millis(10)));
        assert!(d.should_suppress_at(t0 + Duration::from_millis(999)));
        assert!(!d.should_suppress_at(t0 + Duration::from_secs(1)));
        // window restarts from the last emission, not the last suppressed call
        assert!(d.should_suppress_at(t0 + Duration::from_millis(1500)));
        assert!(!d.should_suppress_at(t0 + Duration::from_millis(2001)));
    }
}

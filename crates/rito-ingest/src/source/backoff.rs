//! Reconnect scheduling with exponential backoff and endpoint failover.

use std::time::Duration;

/// Backoff settings.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Spread delays by up to ±20% so that many consumers restarting
    /// together do not reconnect in lockstep.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Tracks the active endpoint and the next reconnect delay.
///
/// Transport failures are never fatal: there is no retry limit, the delay
/// just stops growing at `max_delay`.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ReconnectConfig,
    endpoints: Vec<String>,
    current: usize,
    attempt: u32,
    next_delay: Duration,
}

impl ConnectionManager {
    /// `endpoints` must be non-empty; the first is primary.
    pub fn new(endpoints: Vec<String>, config: ReconnectConfig) -> Self {
        Self {
            next_delay: config.initial_delay,
            config,
            endpoints,
            current: 0,
            attempt: 0,
        }
    }

    pub fn current_endpoint(&self) -> &str {
        self.endpoints
            .get(self.current)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Connection succeeded: start the next failure sequence from scratch.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = self.config.initial_delay;
        tracing::debug!(endpoint = %self.current_endpoint(), "connected, backoff reset");
    }

    /// Advance to the next endpoint and return how long to wait first.
    pub fn next_backoff(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        if !self.endpoints.is_empty() {
            self.current = (self.current + 1) % self.endpoints.len();
        }

        let base = self.next_delay;
        let delay = if self.config.jitter {
            jittered(base, self.attempt)
        } else {
            base
        };

        let grown_ms = (base.as_millis() as f64 * self.config.multiplier) as u64;
        self.next_delay = Duration::from_millis(grown_ms).min(self.config.max_delay);

        tracing::warn!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            endpoint = %self.current_endpoint(),
            "scheduling reconnect"
        );
        delay
    }
}

/// Scale `base` into [0.8, 1.2] using a cheap hash of the attempt and the
/// wall clock.
fn jittered(base: Duration, attempt: u32) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let mixed = (nanos ^ attempt.wrapping_mul(0x9E37_79B9)) % 1000;
    let factor = 0.8 + (mixed as f64 / 1000.0) * 0.4;
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_failover_cycles_endpoints() {
        let mut mgr = ConnectionManager::new(
            vec!["wss://a".into(), "wss://b".into(), "wss://c".into()],
            config(),
        );
        assert_eq!(mgr.current_endpoint(), "wss://a");
        mgr.next_backoff();
        assert_eq!(mgr.current_endpoint(), "wss://b");
        mgr.next_backoff();
        assert_eq!(mgr.current_endpoint(), "wss://c");
        mgr.next_backoff();
        assert_eq!(mgr.current_endpoint(), "wss://a");
    }

    #[test]
    fn test_exponential_and_capped() {
        let mut mgr = ConnectionManager::new(vec!["wss://a".into()], config());
        let delays: Vec<_> = (0..6).map(|_| mgr.next_backoff()).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[4], Duration::from_secs(1));
        assert_eq!(delays[5], Duration::from_secs(1));
        assert_eq!(mgr.attempt(), 6);
    }

    #[test]
    fn test_reset() {
        let mut mgr = ConnectionManager::new(vec!["wss://a".into()], config());
        mgr.next_backoff();
        mgr.next_backoff();
        mgr.reset();
        assert_eq!(mgr.attempt(), 0);
        assert_eq!(mgr.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for attempt in 0..50 {
            let d = jittered(base, attempt);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
        }
    }
}

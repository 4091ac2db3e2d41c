use crate::config::ThrottleConfig;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound of the adaptive delay multiplier
const MAX_MULTIPLIER: f64 = 5.0;

/// Growth of the multiplier on each failed unit
const ERROR_GROWTH: f64 = 1.5;

/// Decay of the multiplier on each successful unit
const SUCCESS_DECAY: f64 = 0.9;

/// Politeness state for one host
#[derive(Debug, Clone)]
pub struct HostState {
    /// Units dispatched to this host
    pub request_count: u32,

    /// Units against this host that failed
    pub error_count: u32,

    /// Earliest instant the next unit for this host may be dispatched
    pub next_allowed: Option<Instant>,

    /// Factor applied to the random base delay; grows on failures
    pub multiplier: f64,
}

impl HostState {
    pub fn new() -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            next_allowed: None,
            multiplier: 1.0,
        }
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks per-host politeness delays across all jobs
///
/// Each dispatch pushes the host's next allowed instant out by a random
/// delay between the configured bounds, scaled by an adaptive multiplier.
/// Every `long_pause_every` dispatches the host gets a long pause instead.
#[derive(Debug)]
pub struct HostThrottle {
    config: ThrottleConfig,
    hosts: HashMap<String, HostState>,
}

impl HostThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            hosts: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Returns when the host may next be dispatched to, or `None` if it may be now
    pub fn wait_until(&self, host: &str, now: Instant) -> Option<Instant> {
        if !self.config.enabled {
            return None;
        }

        self.hosts
            .get(host)
            .and_then(|state| state.next_allowed)
            .filter(|next| *next > now)
    }

    /// Records a dispatch and schedules the host's next allowed instant
    pub fn record_dispatch(&mut self, host: &str, now: Instant) {
        if !self.config.enabled {
            return;
        }

        let state = self.hosts.entry(host.to_string()).or_default();
        state.request_count += 1;

        let mut rng = rand::thread_rng();
        let delay_ms = if self.config.long_pause_every > 0
            && state.request_count % self.config.long_pause_every == 0
        {
            let pause =
                rng.gen_range(self.config.long_pause_min_ms..=self.config.long_pause_max_ms);
            tracing::info!(
                "Long pause of {}ms for {} after {} requests",
                pause,
                host,
                state.request_count
            );
            pause
        } else {
            let base = rng.gen_range(self.config.min_delay_ms..=self.config.max_delay_ms);
            (base as f64 * state.multiplier) as u64
        };

        state.next_allowed = Some(now + Duration::from_millis(delay_ms));
    }

    /// Decays the host's multiplier back towards 1.0
    pub fn record_success(&mut self, host: &str) {
        if let Some(state) = self.hosts.get_mut(host) {
            if state.multiplier > 1.0 {
                state.multiplier = (state.multiplier * SUCCESS_DECAY).max(1.0);
            }
        }
    }

    /// Grows the host's multiplier after a failed unit
    pub fn record_error(&mut self, host: &str) {
        if !self.config.enabled {
            return;
        }

        let state = self.hosts.entry(host.to_string()).or_default();
        state.error_count += 1;
        state.multiplier = (state.multiplier * ERROR_GROWTH).min(MAX_MULTIPLIER);
        tracing::debug!(
            "Failure on {}; delay multiplier now {:.2}x",
            host,
            state.multiplier
        );
    }

    pub fn host_state(&self, host: &str) -> Option<&HostState> {
        self.hosts.get(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool) -> ThrottleConfig {
        ThrottleConfig {
            enabled,
            min_delay_ms: 100,
            max_delay_ms: 100,
            long_pause_every: 3,
            long_pause_min_ms: 1_000,
            long_pause_max_ms: 1_000,
        }
    }

    #[test]
    fn test_disabled_throttle_never_waits() {
        let mut throttle = HostThrottle::new(config(false));
        let now = Instant::now();
        throttle.record_dispatch("example.com", now);
        assert!(throttle.wait_until("example.com", now).is_none());
        assert!(throttle.host_state("example.com").is_none());
    }

    #[test]
    fn test_dispatch_schedules_next_allowed() {
        let mut throttle = HostThrottle::new(config(true));
        let now = Instant::now();

        assert!(throttle.wait_until("example.com", now).is_none());
        throttle.record_dispatch("example.com", now);

        let next = throttle.wait_until("example.com", now).unwrap();
        assert_eq!(next, now + Duration::from_millis(100));
        assert!(throttle
            .wait_until("example.com", now + Duration::from_millis(100))
            .is_none());
        assert!(throttle.wait_until("other.com", now).is_none());
    }

    #[test]
    fn test_long_pause_every_n_dispatches() {
        let mut throttle = HostThrottle::new(config(true));
        let now = Instant::now();

        throttle.record_dispatch("example.com", now);
        throttle.record_dispatch("example.com", now);
        throttle.record_dispatch("example.com", now);

        let state = throttle.host_state("example.com").unwrap();
        assert_eq!(state.request_count, 3);
        assert_eq!(state.next_allowed, Some(now + Duration::from_millis(1_000)));
    }

    #[test]
    fn test_multiplier_grows_and_decays() {
        let mut throttle = HostThrottle::new(config(true));

        for _ in 0..10 {
            throttle.record_error("example.com");
        }
        let state = throttle.host_state("example.com").unwrap();
        assert_eq!(state.multiplier, MAX_MULTIPLIER);
        assert_eq!(state.error_count, 10);

        throttle.record_success("example.com");
        let multiplier = throttle.host_state("example.com").unwrap().multiplier;
        assert!((multiplier - 4.5).abs() < 1e-9);

        for _ in 0..100 {
            throttle.record_success("example.com");
        }
        assert_eq!(throttle.host_state("example.com").unwrap().multiplier, 1.0);
    }

    #[test]
    fn test_multiplier_scales_delay() {
        let mut throttle = HostThrottle::new(config(true));
        let now = Instant::now();

        throttle.record_error("example.com");
        throttle.record_dispatch("example.com", now);

        let next = throttle.wait_until("example.com", now).unwrap();
        assert_eq!(next, now + Duration::from_millis(150));
    }
}

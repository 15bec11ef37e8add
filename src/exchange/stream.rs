// =============================================================================
// Stream Reconnect Backoff — exponential delay with full jitter
// =============================================================================

use std::time::Duration;

use rand::Rng;

/// Reconnect delay policy for streaming sockets: exponential growth from
/// `base` to `cap`, with full jitter so a fleet of sockets does not thunder
/// back in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Default policy for exchange streams: base 5 s, cap 60 s.
    pub fn for_stream() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }

    /// Short policy for HTTP request retries: base 1 s, cap 10 s.
    pub fn for_request() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Next delay to sleep before reconnecting.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let max_ms = exp.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(max_ms / 2..=max_ms.max(1));
        Duration::from_millis(jittered)
    }

    /// Call after a healthy connection to restart the schedule.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

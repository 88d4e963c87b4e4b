use std::time::Duration;

/// Delays between reconnect attempts after a live channel drops. The attempt
/// count is the number of delays; once they run out the connection is
/// declared offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

impl ReconnectPolicy {
    pub fn fixed(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Doubling delays starting at `initial`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration, attempts: usize) -> Self {
        let mut delays = Vec::with_capacity(attempts);
        let mut delay = initial;
        for _ in 0..attempts {
            delays.push(delay.min(max));
            delay = delay.saturating_mul(2);
        }
        Self { delays }
    }

    pub fn disabled() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }

    /// Delay before the 1-based `attempt`, `None` when attempts are exhausted.
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        attempt
            .checked_sub(1)
            .and_then(|idx| self.delays.get(idx))
            .copied()
    }

    pub fn is_enabled(&self) -> bool {
        !self.delays.is_empty()
    }
}

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^(attempt-1), cap)`; attempt is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
        self.base.saturating_mul(mult).min(self.cap)
    }
}

/// Consecutive-crash bookkeeping for the tunnel agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    crashes: u32,
    next_delay: Duration,
}

impl RetryState {
    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Counts one unexpected exit and returns how long to wait before restarting.
    pub fn record_crash(&mut self, policy: &RetryPolicy) -> Duration {
        self.crashes = self.crashes.saturating_add(1);
        self.next_delay = policy.delay_for(self.crashes);
        self.next_delay
    }

    /// Only a clean, operator-initiated stop resets the sequence.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

use std::time::Duration;

use crate::error::SessionError;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Delay before the reconnect that follows `consecutive_failures` failures.
    ///
    /// The first failure waits `base`, each further failure doubles it, and a
    /// larger server retry hint wins. The result never exceeds `max`.
    pub fn delay_after_failures(
        &self,
        consecutive_failures: u32,
        retry_after_hint_ms: Option<u64>,
    ) -> Duration {
        let shift = consecutive_failures.saturating_sub(1).min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        Duration::from_millis(calculated.max(hinted).min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

/// Reconnect bookkeeping owned by the connection state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    consecutive_failures: u32,
    last_error: Option<SessionError>,
}

impl RetryState {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Count a reconnect-eligible failure and return the new count.
    pub fn record_failure(&mut self, error: SessionError) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error);
        self.consecutive_failures
    }

    /// Zero the failure counter, keeping the last error for diagnostics.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn clear(&mut self) {
        self.consecutive_failures = 0;
        self.last_error = None;
    }
}

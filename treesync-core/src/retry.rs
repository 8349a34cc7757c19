use rand::Rng;
use std::time::Duration;

/// Reconnect attempts made for one request before giving up.
pub const RECONNECT_CAP: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(5), true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Send the request on the current connection.
    Attempt,
    /// Drop the connection, connect, log in and reopen the directory.
    Reconnect { attempt: u32 },
    GiveUp,
}

/// Per-request retry bookkeeping: up to `cap` reconnects, after which the
/// original request is retried once. A second failed call gives up.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    cap: u32,
    reconnects: u32,
    failed_calls: u32,
}

impl RetryMachine {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            reconnects: 0,
            failed_calls: 0,
        }
    }

    pub fn start(&mut self, connected: bool) -> RetryStep {
        if connected {
            RetryStep::Attempt
        } else {
            self.next_reconnect()
        }
    }

    pub fn call_failed(&mut self) -> RetryStep {
        self.failed_calls += 1;
        if self.failed_calls >= 2 {
            return RetryStep::GiveUp;
        }
        self.next_reconnect()
    }

    pub fn reconnect_failed(&mut self) -> RetryStep {
        self.next_reconnect()
    }

    pub fn reconnected(&mut self) -> RetryStep {
        RetryStep::Attempt
    }

    /// True once every allowed reconnect has been spent.
    pub fn exhausted(&self) -> bool {
        self.reconnects >= self.cap
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    fn next_reconnect(&mut self) -> RetryStep {
        if self.exhausted() {
            return RetryStep::GiveUp;
        }
        self.reconnects += 1;
        RetryStep::Reconnect {
            attempt: self.reconnects,
        }
    }
}

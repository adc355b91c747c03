use std::time::Duration;

/// Configuration for automatic resume after a server disconnect.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first resume attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier applied after each scheduled attempt.
    pub backoff_factor: u32,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2,
            // One day of attempts at the capped interval.
            max_attempts: 1440,
        }
    }
}

/// Running backoff state between a disconnect and the next reconnect.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    wait: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let wait = config.initial_delay;
        Self {
            config,
            wait,
            attempts: 0,
        }
    }

    /// Consecutive attempts scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the next scheduled attempt will use.
    pub fn current_wait(&self) -> Duration {
        self.wait
    }

    /// Registers one more attempt and returns how long to wait before it,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.config.max_attempts {
            return None;
        }
        let delay = self.wait;
        self.wait = (self.wait * self.config.backoff_factor).min(self.config.max_delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.wait = self.config.initial_delay;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Reconnect delay configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0 means retry forever.
    pub max_attempts: u32,
    /// Fraction of the base delay used as a symmetric random perturbation,
    /// e.g. 0.25 turns a 4s delay into 3s..5s. 0 disables jitter.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
            jitter_fraction: 0.25,
        }
    }
}

/// Exponential backoff state, owned by the supervisor.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    attempt: u32,
    last_attempt_time: Option<Instant>,
}

/// Read-only view of the backoff state for `stats()`.
#[derive(Clone, Debug)]
pub struct BackoffSnapshot {
    pub attempt: u32,
    pub max_attempts: u32,
    pub should_retry: bool,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_attempt_time: None,
        }
    }

    /// Whether the retry budget allows another attempt.
    pub fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt < self.config.max_attempts
    }

    /// Delay before the next connect attempt: exponential in the attempt
    /// count, capped at `max_delay`, perturbed by jitter.
    pub fn next_delay(&self) -> Duration {
        let base_secs = (self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(self.attempt as i32))
        .min(self.config.max_delay.as_secs_f64());

        if self.config.jitter_fraction <= 0.0 {
            return Duration::from_secs_f64(base_secs);
        }

        let j = self.config.jitter_fraction;
        let offset = rand::thread_rng().gen_range(-j..=j);
        Duration::from_secs_f64((base_secs * (1.0 + offset)).max(0.0))
    }

    pub fn record_attempt(&mut self) {
        self.attempt += 1;
        self.last_attempt_time = Some(Instant::now());
    }

    /// Called on every successful entry into the connected state so a stable
    /// connection that later dies restarts from `initial_delay`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        BackoffSnapshot {
            attempt: self.attempt,
            max_attempts: self.config.max_attempts,
            should_retry: self.should_retry(),
        }
    }
}

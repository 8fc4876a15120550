use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::application::backoff::BackoffConfig;
use crate::domain::errors::ManagerError;

pub const DEFAULT_ENDPOINT: &str = "wss://api.hyperliquid.xyz/ws";

/// Configuration for the session manager
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// WebSocket endpoint of the venue. `http(s)://` URLs are rewritten to
    /// `ws(s)://` before connecting.
    pub endpoint: String,
    /// Period at which the supervisor polls socket and stream liveness.
    pub health_check_interval: Duration,
    /// The stream is declared dead when no frame arrives for this long.
    pub data_timeout: Duration,
    /// Idle span that triggers a warning log without declaring death.
    /// Defaults to `data_timeout / 2` when unset.
    pub warning_threshold: Option<Duration>,
    /// Bound on the WebSocket handshake.
    pub connect_deadline: Duration,
    /// Bound on each subscribe send.
    pub subscribe_deadline: Duration,
    /// Bound on session teardown.
    pub close_deadline: Duration,
    /// Cadence of venue-level ping frames.
    pub ping_interval: Duration,
    /// Reconnect delay policy.
    pub backoff: BackoffConfig,
    /// Log a health snapshot every this many delivered messages (0 disables).
    pub log_every_messages: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            health_check_interval: Duration::from_secs(5),
            data_timeout: Duration::from_secs(60),
            warning_threshold: None,
            connect_deadline: Duration::from_secs(30),
            subscribe_deadline: Duration::from_secs(15),
            close_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            log_every_messages: 1000,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or out of bounds.
    pub fn from_env() -> ManagerConfig {
        let mut config = ManagerConfig::default();

        if let Ok(endpoint) = std::env::var("HYPERFEED_ENDPOINT") {
            if endpoint.trim().is_empty() {
                tracing::warn!("HYPERFEED_ENDPOINT is empty, using default: {}", config.endpoint);
            } else {
                config.endpoint = endpoint;
            }
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_HEALTH_CHECK_INTERVAL_SECS") {
            if secs > 0 {
                config.health_check_interval = Duration::from_secs(secs);
            } else {
                tracing::warn!("HYPERFEED_HEALTH_CHECK_INTERVAL_SECS must be positive, using default");
            }
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_DATA_TIMEOUT_SECS") {
            if secs > 0 {
                config.data_timeout = Duration::from_secs(secs);
            } else {
                tracing::warn!("HYPERFEED_DATA_TIMEOUT_SECS must be positive, using default");
            }
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_WARNING_THRESHOLD_SECS") {
            config.warning_threshold = Some(Duration::from_secs(secs));
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_CONNECT_DEADLINE_SECS") {
            if secs > 0 {
                config.connect_deadline = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_SUBSCRIBE_DEADLINE_SECS") {
            if secs > 0 {
                config.subscribe_deadline = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_CLOSE_DEADLINE_SECS") {
            if secs > 0 {
                config.close_deadline = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_PING_INTERVAL_SECS") {
            if secs > 0 {
                config.ping_interval = Duration::from_secs(secs);
            }
        }

        if let Some(ms) = read_env::<u64>("HYPERFEED_BACKOFF_INITIAL_MS") {
            if ms > 0 {
                config.backoff.initial_delay = Duration::from_millis(ms);
            }
        }

        if let Some(secs) = read_env::<u64>("HYPERFEED_BACKOFF_MAX_SECS") {
            if secs > 0 {
                config.backoff.max_delay = Duration::from_secs(secs);
            }
        }

        if let Some(value) = read_env::<f64>("HYPERFEED_BACKOFF_MULTIPLIER") {
            if value >= 1.0 {
                config.backoff.multiplier = value;
            } else {
                tracing::warn!(
                    "HYPERFEED_BACKOFF_MULTIPLIER must be >= 1.0, got {}, using default: {}",
                    value,
                    config.backoff.multiplier
                );
            }
        }

        // 0 means retry forever
        if let Some(value) = read_env::<u32>("HYPERFEED_MAX_ATTEMPTS") {
            config.backoff.max_attempts = value;
        }

        if let Some(value) = read_env::<f64>("HYPERFEED_JITTER_FRACTION") {
            if (0.0..1.0).contains(&value) {
                config.backoff.jitter_fraction = value;
            } else {
                tracing::warn!(
                    "HYPERFEED_JITTER_FRACTION must be in [0.0, 1.0), got {}, using default: {}",
                    value,
                    config.backoff.jitter_fraction
                );
            }
        }

        if let Some(value) = read_env::<u64>("HYPERFEED_LOG_EVERY_MESSAGES") {
            config.log_every_messages = value;
        }

        config
    }

    /// The warning threshold in effect: the configured value, or half the
    /// data timeout.
    pub fn effective_warning_threshold(&self) -> Duration {
        self.warning_threshold.unwrap_or(self.data_timeout / 2)
    }

    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.health_check_interval.is_zero() {
            return Err(ManagerError::InvalidConfiguration(
                "health_check_interval must be positive".to_string(),
            ));
        }
        if self.data_timeout.is_zero() {
            return Err(ManagerError::InvalidConfiguration(
                "data_timeout must be positive".to_string(),
            ));
        }
        if self.effective_warning_threshold() >= self.data_timeout {
            return Err(ManagerError::InvalidConfiguration(format!(
                "warning_threshold ({:?}) must be less than data_timeout ({:?})",
                self.effective_warning_threshold(),
                self.data_timeout
            )));
        }
        if self.connect_deadline.is_zero()
            || self.subscribe_deadline.is_zero()
            || self.close_deadline.is_zero()
        {
            return Err(ManagerError::InvalidConfiguration(
                "transport deadlines must be positive".to_string(),
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(ManagerError::InvalidConfiguration(
                "ping_interval must be positive".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ManagerError::InvalidConfiguration(
                "backoff multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter_fraction) {
            return Err(ManagerError::InvalidConfiguration(
                "jitter_fraction must be in [0.0, 1.0)".to_string(),
            ));
        }
        if self.backoff.initial_delay > self.backoff.max_delay {
            return Err(ManagerError::InvalidConfiguration(
                "backoff initial_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and normalize the configured endpoint: `http://` becomes `ws://`
    /// and `https://` becomes `wss://`.
    pub fn normalized_endpoint(&self) -> Result<Url, ManagerError> {
        normalize_endpoint(&self.endpoint)
    }
}

pub fn normalize_endpoint(raw: &str) -> Result<Url, ManagerError> {
    let rewritten = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        raw.to_string()
    };

    let url = Url::parse(&rewritten).map_err(|e| ManagerError::InvalidEndpoint {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ManagerError::InvalidEndpoint {
            url: raw.to_string(),
            reason: format!("unsupported scheme: {}", other),
        }),
    }
}

fn read_env<T: FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Failed to parse {} '{}': {}, using default", name, raw, e);
            None
        }
    }
}

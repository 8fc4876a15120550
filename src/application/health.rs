use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tracks whether the stream is carrying data, independent of socket-level
/// health, plus cumulative counters that survive reconnects.
///
/// Any inbound frame counts as evidence of life; the monitor does not care
/// which channel delivered it. Callers whose business subscriptions are
/// naturally sparse should keep a high-frequency channel subscribed or the
/// idle timeout will fire.
#[derive(Debug)]
pub struct HealthMonitor {
    state: Mutex<HealthState>,
}

#[derive(Debug, Clone)]
struct HealthState {
    total_messages: u64,
    total_reconnects: u64,
    total_errors: u64,
    start_time: Instant,
    last_message_time: Instant,
}

/// Snapshot of the monitor for external observation.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub total_messages: u64,
    pub total_reconnects: u64,
    pub total_errors: u64,
    pub uptime_seconds: f64,
    pub idle_seconds: f64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(HealthState {
                total_messages: 0,
                total_reconnects: 0,
                total_errors: 0,
                start_time: now,
                last_message_time: now,
            }),
        }
    }

    /// Record one delivered frame. Returns the new message total so the
    /// caller can log a snapshot on a fixed cadence.
    pub async fn on_message(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.last_message_time = Instant::now();
        state.total_messages += 1;
        state.total_messages
    }

    pub async fn on_error(&self) {
        let mut state = self.state.lock().await;
        state.total_errors += 1;
    }

    pub async fn on_reconnect(&self) {
        let mut state = self.state.lock().await;
        state.total_reconnects += 1;
    }

    /// True while data has arrived within `timeout`.
    pub async fn is_alive(&self, timeout: Duration) -> bool {
        let state = self.state.lock().await;
        state.last_message_time.elapsed() < timeout
    }

    /// True once the stream has been idle for at least `threshold`; used to
    /// emit a warning before the hard timeout fires.
    pub async fn warning(&self, threshold: Duration) -> bool {
        let state = self.state.lock().await;
        state.last_message_time.elapsed() >= threshold
    }

    pub async fn idle(&self) -> Duration {
        let state = self.state.lock().await;
        state.last_message_time.elapsed()
    }

    /// Restart the idle window. Counters are preserved so observers see
    /// cumulative history across reconnects.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.last_message_time = Instant::now();
    }

    pub async fn report(&self) -> HealthReport {
        let state = self.state.lock().await;
        HealthReport {
            total_messages: state.total_messages,
            total_reconnects: state.total_reconnects,
            total_errors: state.total_errors,
            uptime_seconds: state.start_time.elapsed().as_secs_f64(),
            idle_seconds: state.last_message_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

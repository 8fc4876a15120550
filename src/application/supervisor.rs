use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::application::backoff::{BackoffPolicy, BackoffSnapshot};
use crate::application::health::{HealthMonitor, HealthReport};
use crate::config::ManagerConfig;
use crate::domain::connection::ConnectionState;
use crate::domain::errors::ManagerError;
use crate::domain::subscription::Subscription;
use crate::infrastructure::session::{MessageCallback, WsSession};

/// Callback invoked synchronously on every state transition. Must not block;
/// heavy work belongs on the caller's own queues.
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Read-only observation of the manager, safe to take at any time.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub state: ConnectionState,
    pub health: HealthReport,
    pub backoff: BackoffSnapshot,
    pub intended_subscriptions: usize,
}

/// Why a session cycle ended; drives the reconnect log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEndReason {
    ConnectTimedOut,
    ConnectFailed,
    SubscribeFailed,
    SocketDead,
    StreamStalled,
    StopRequested,
}

impl SessionEndReason {
    fn as_str(self) -> &'static str {
        match self {
            SessionEndReason::ConnectTimedOut => "connect-timeout",
            SessionEndReason::ConnectFailed => "connect-failed",
            SessionEndReason::SubscribeFailed => "subscribe-failed",
            SessionEndReason::SocketDead => "socket-dead",
            SessionEndReason::StreamStalled => "stream-stalled",
            SessionEndReason::StopRequested => "stop",
        }
    }
}

/// Owns the session lifecycle end to end: at most one live transport session,
/// the intended subscription set, the health monitor, and the backoff policy.
///
/// The supervisor task is the only writer of the connection state; observers
/// read it through [`SessionSupervisor::state`], [`SessionSupervisor::stats`]
/// or the watch channel from [`SessionSupervisor::subscribe_state`].
pub struct SessionSupervisor {
    config: ManagerConfig,
    endpoint: Url,
    intended: Vec<Subscription>,
    on_message: MessageCallback,
    on_state: Option<StateCallback>,
    health: Arc<HealthMonitor>,
    backoff: Mutex<BackoffPolicy>,
    state_tx: watch::Sender<ConnectionState>,
    stop_tx: watch::Sender<bool>,
}

impl SessionSupervisor {
    pub fn new(
        config: ManagerConfig,
        intended: Vec<Subscription>,
        on_message: MessageCallback,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let endpoint = config.normalized_endpoint()?;
        let backoff = BackoffPolicy::new(config.backoff.clone());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            endpoint,
            intended,
            on_message,
            on_state: None,
            health: Arc::new(HealthMonitor::new()),
            backoff: Mutex::new(backoff),
            state_tx,
            stop_tx,
        })
    }

    pub fn with_state_callback(mut self, callback: StateCallback) -> Self {
        self.on_state = Some(callback);
        self
    }

    /// Run the session until [`SessionSupervisor::stop`] is called or the
    /// retry budget runs out. Returns `Ok(())` on a clean stop and
    /// `Err(RetriesExhausted)` once the state has moved to `Failed`.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            // The connect and subscribe burst is raced against the stop
            // signal, so a stop issued mid-handshake does not wait out the
            // connect deadline. An abandoned half-built session shuts its
            // own frame pump down once the handle drops.
            let reason = tokio::select! {
                result = self.connect_and_subscribe() => match result {
                    Ok(mut session) => {
                        self.health.reset().await;
                        self.backoff.lock().await.reset();
                        self.set_state(ConnectionState::Connected);
                        info!(
                            endpoint = %self.endpoint,
                            subscriptions = self.intended.len(),
                            "session established"
                        );

                        session.start_ping(self.config.ping_interval);
                        let reason = self.monitor(&session, &mut stop_rx).await;
                        session.close(self.config.close_deadline).await;
                        reason
                    }
                    Err(reason) => reason,
                },
                _ = stop_rx.changed() => SessionEndReason::StopRequested,
            };

            if reason == SessionEndReason::StopRequested {
                self.set_state(ConnectionState::Disconnected);
                info!("session stopped");
                return Ok(());
            }

            self.set_state(ConnectionState::Reconnecting);
            self.health.on_reconnect().await;

            let (retry, delay, attempt) = {
                let mut backoff = self.backoff.lock().await;
                let delay = backoff.next_delay();
                backoff.record_attempt();
                (backoff.should_retry(), delay, backoff.attempt())
            };

            if !retry {
                self.set_state(ConnectionState::Failed);
                let report = self.health.report().await;
                error!(
                    attempts = attempt,
                    total_messages = report.total_messages,
                    total_reconnects = report.total_reconnects,
                    total_errors = report.total_errors,
                    uptime_seconds = report.uptime_seconds,
                    "retry budget exhausted, giving up"
                );
                return Err(ManagerError::RetriesExhausted { attempts: attempt });
            }

            warn!(
                reason = reason.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "session lost, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => {
                    self.set_state(ConnectionState::Disconnected);
                    info!("stop requested during backoff");
                    return Ok(());
                }
            }
        }
    }

    /// Request termination. `start` observes the flag at its next cancellable
    /// wait, including an in-flight connect or subscribe, and returns
    /// promptly.
    pub fn stop(&self) {
        // send_replace updates the flag even when no task is subscribed yet,
        // so a stop issued before start() still takes effect.
        self.stop_tx.send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch-based observation of state transitions, for callers who prefer
    /// awaiting changes over a callback.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            state: self.state(),
            health: self.health.report().await,
            backoff: self.backoff.lock().await.snapshot(),
            intended_subscriptions: self.intended.len(),
        }
    }

    /// Open a session and replay the intended subscription set. Any failure
    /// tears the whole session down; there is no partial-subscription state.
    async fn connect_and_subscribe(&self) -> Result<WsSession, SessionEndReason> {
        let mut session = WsSession::open(
            &self.endpoint,
            self.config.connect_deadline,
            self.health.clone(),
            self.on_message.clone(),
            self.config.log_every_messages,
        )
        .await
        .map_err(|e| {
            warn!(endpoint = %self.endpoint, "connect failed: {}", e);
            if e.is_timeout() {
                SessionEndReason::ConnectTimedOut
            } else {
                SessionEndReason::ConnectFailed
            }
        })?;

        for sub in &self.intended {
            if let Err(e) = session
                .subscribe(sub, self.config.subscribe_deadline)
                .await
            {
                warn!(channel = sub.channel(), "subscribe failed: {}", e);
                session.close(self.config.close_deadline).await;
                return Err(SessionEndReason::SubscribeFailed);
            }
        }

        // The socket may have died mid-burst while the sends were buffering.
        if !session.is_socket_alive() {
            warn!("socket died during subscription replay");
            session.close(self.config.close_deadline).await;
            return Err(SessionEndReason::SocketDead);
        }

        Ok(session)
    }

    /// Watch a connected session until it dies or a stop is requested.
    async fn monitor(
        &self,
        session: &WsSession,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> SessionEndReason {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return SessionEndReason::StopRequested,
                _ = tokio::time::sleep(self.config.health_check_interval) => {
                    if !session.is_socket_alive() {
                        return SessionEndReason::SocketDead;
                    }
                    if !self.health.is_alive(self.config.data_timeout).await {
                        return SessionEndReason::StreamStalled;
                    }
                    if self.health.warning(self.config.effective_warning_threshold()).await {
                        let idle = self.health.idle().await;
                        warn!(
                            idle_seconds = idle.as_secs_f64(),
                            "no data received recently"
                        );
                    }
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        debug_assert!(
            current.can_transition_to(next),
            "illegal transition {} -> {}",
            current.as_str(),
            next.as_str()
        );

        self.state_tx.send_replace(next);
        debug!(from = current.as_str(), to = next.as_str(), "state changed");

        if let Some(callback) = &self.on_state {
            if catch_unwind(AssertUnwindSafe(|| callback(next))).is_err() {
                error!("state callback panicked");
            }
        }
    }
}

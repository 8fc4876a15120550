use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::application::health::HealthMonitor;
use crate::domain::errors::TransportError;
use crate::domain::subscription::{Subscription, PING_FRAME};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Callback invoked with every inbound text frame, verbatim.
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Session-local identifier assigned when a subscribe frame is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct OutboundFrame {
    text: String,
    /// Resolved once the frame has actually been written to the socket.
    /// Fire-and-forget senders (the ping task) leave this unset.
    ack: Option<oneshot::Sender<Result<(), TransportError>>>,
}

/// One physical WebSocket connection, from handshake to teardown.
///
/// The socket is owned by a background frame pump; every call that touches it
/// goes through a command channel and runs under an explicit deadline, so a
/// half-open connection can stall a single operation but never the caller.
pub struct WsSession {
    outbound_tx: mpsc::Sender<OutboundFrame>,
    stop_tx: watch::Sender<bool>,
    ready: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    health: Arc<HealthMonitor>,
    pump_task: JoinHandle<()>,
    ping_task: Option<JoinHandle<()>>,
    active: HashMap<Subscription, SubscriptionId>,
    next_id: u64,
}

impl WsSession {
    /// Perform the WebSocket handshake within `deadline` and start the frame
    /// pump. Returns only once the socket is open and ready to send.
    pub async fn open(
        url: &Url,
        deadline: Duration,
        health: Arc<HealthMonitor>,
        on_message: MessageCallback,
        snapshot_every: u64,
    ) -> Result<Self, TransportError> {
        let (stream, _) = match timeout(deadline, connect_async(url.as_str())).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                health.on_error().await;
                return Err(TransportError::Handshake(e.to_string()));
            }
            Err(_) => {
                health.on_error().await;
                return Err(TransportError::Timeout { op: "open", deadline });
            }
        };

        debug!(endpoint = %url, "WebSocket handshake complete");

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ready = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));

        let pump = FramePump {
            outbound_rx,
            stop_rx,
            ready: ready.clone(),
            failed: failed.clone(),
            health: health.clone(),
            on_message,
            snapshot_every,
        };
        let pump_task = tokio::spawn(pump.run(stream));

        Ok(Self {
            outbound_tx,
            stop_tx,
            ready,
            failed,
            health,
            pump_task,
            ping_task: None,
            active: HashMap::new(),
            next_id: 0,
        })
    }

    /// Send one subscribe frame under `deadline`. A completed send is treated
    /// as a successful subscription; the venue's next data frame is the
    /// implicit confirmation.
    pub async fn subscribe(
        &mut self,
        sub: &Subscription,
        deadline: Duration,
    ) -> Result<SubscriptionId, TransportError> {
        let frame = sub
            .subscribe_frame()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send_text(frame, "subscribe", deadline).await?;

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.active.insert(sub.clone(), id);
        debug!(channel = sub.channel(), ?id, "subscribed");
        Ok(id)
    }

    /// Send one unsubscribe frame under `deadline` and drop the channel from
    /// the active map. Not used by the supervisor; exposed for administrative
    /// callers.
    pub async fn unsubscribe(
        &mut self,
        sub: &Subscription,
        deadline: Duration,
    ) -> Result<(), TransportError> {
        let frame = sub
            .unsubscribe_frame()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send_text(frame, "unsubscribe", deadline).await?;
        self.active.remove(sub);
        Ok(())
    }

    /// Launch the background ping producer. The wait is interruptible by the
    /// session's stop signal, so teardown never waits out a full interval.
    pub fn start_ping(&mut self, interval: Duration) {
        let outbound_tx = self.outbound_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        self.ping_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        let frame = OutboundFrame {
                            text: PING_FRAME.to_string(),
                            ack: None,
                        };
                        if outbound_tx.send(frame).await.is_err() {
                            break;
                        }
                        debug!("sent venue ping");
                    }
                }
            }
        }));
    }

    /// Tear the session down, returning within `deadline` even if the socket
    /// is wedged. Workers that fail to stop in time are abandoned.
    pub async fn close(mut self, deadline: Duration) {
        let _ = self.stop_tx.send(true);
        let give_up = Instant::now() + deadline;

        if timeout_at(give_up, &mut self.pump_task).await.is_err() {
            warn!("frame pump did not stop within {:?}, abandoning it", deadline);
            self.pump_task.abort();
        }
        if let Some(mut ping) = self.ping_task.take() {
            if timeout_at(give_up, &mut ping).await.is_err() {
                ping.abort();
            }
        }
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Composite liveness probe over the underlying connection. Any single
    /// false answer means the socket can no longer be trusted.
    pub fn is_socket_alive(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && !self.pump_task.is_finished()
            && !self.failed.load(Ordering::SeqCst)
            && !self.outbound_tx.is_closed()
    }

    /// Channels confirmed on this session, rebuilt from scratch on every
    /// reconnect.
    pub fn active_subscriptions(&self) -> &HashMap<Subscription, SubscriptionId> {
        &self.active
    }

    async fn send_text(
        &self,
        text: String,
        op: &'static str,
        deadline: Duration,
    ) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let frame = OutboundFrame {
            text,
            ack: Some(ack_tx),
        };

        let send_and_wait = async {
            self.outbound_tx
                .send(frame)
                .await
                .map_err(|_| TransportError::NotOpen)?;
            match ack_rx.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Closed),
            }
        };

        match timeout(deadline, send_and_wait).await {
            Ok(result) => result,
            Err(_) => {
                // Deadline expiry is the one failure the frame pump cannot
                // see, so it is counted here.
                self.health.on_error().await;
                Err(TransportError::Timeout { op, deadline })
            }
        }
    }
}

/// The task that owns the socket: pumps inbound frames into the health
/// monitor and the application callback, and writes outbound frames on
/// request.
struct FramePump {
    outbound_rx: mpsc::Receiver<OutboundFrame>,
    stop_rx: watch::Receiver<bool>,
    ready: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    health: Arc<HealthMonitor>,
    on_message: MessageCallback,
    snapshot_every: u64,
}

impl FramePump {
    async fn run(mut self, stream: WsStream) {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                _ = self.stop_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                cmd = self.outbound_rx.recv() => {
                    let Some(frame) = cmd else { break };
                    if !self.write_frame(&mut write, frame).await {
                        break;
                    }
                }
                inbound = read.next() => {
                    if !self.handle_inbound(&mut write, inbound).await {
                        break;
                    }
                }
            }
        }

        self.ready.store(false, Ordering::SeqCst);
    }

    /// Returns false when the pump must stop.
    async fn write_frame(&mut self, write: &mut WsSink, frame: OutboundFrame) -> bool {
        match write.send(Message::Text(frame.text)).await {
            Ok(()) => {
                if let Some(ack) = frame.ack {
                    let _ = ack.send(Ok(()));
                }
                true
            }
            Err(e) => {
                error!("WebSocket send failed: {}", e);
                self.failed.store(true, Ordering::SeqCst);
                self.health.on_error().await;
                if let Some(ack) = frame.ack {
                    let _ = ack.send(Err(TransportError::Send(e.to_string())));
                }
                false
            }
        }
    }

    /// Returns false when the pump must stop.
    async fn handle_inbound(
        &mut self,
        write: &mut WsSink,
        inbound: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> bool {
        match inbound {
            Some(Ok(Message::Text(text))) => {
                self.deliver(text).await;
                true
            }
            Some(Ok(Message::Ping(payload))) => {
                if let Err(e) = write.send(Message::Pong(payload)).await {
                    error!("failed to answer transport ping: {}", e);
                    self.failed.store(true, Ordering::SeqCst);
                    self.health.on_error().await;
                    return false;
                }
                true
            }
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "WebSocket closed by peer");
                self.failed.store(true, Ordering::SeqCst);
                self.health.on_error().await;
                false
            }
            Some(Ok(other)) => {
                debug!(?other, "ignoring non-text frame");
                true
            }
            Some(Err(e)) => {
                error!("WebSocket read error: {}", e);
                self.failed.store(true, Ordering::SeqCst);
                self.health.on_error().await;
                false
            }
            None => {
                info!("WebSocket stream ended");
                self.failed.store(true, Ordering::SeqCst);
                self.health.on_error().await;
                false
            }
        }
    }

    async fn deliver(&self, text: String) {
        let total = self.health.on_message().await;
        if self.snapshot_every > 0 && total % self.snapshot_every == 0 {
            let report = self.health.report().await;
            info!(
                total_messages = report.total_messages,
                total_reconnects = report.total_reconnects,
                total_errors = report.total_errors,
                uptime_seconds = report.uptime_seconds,
                idle_seconds = report.idle_seconds,
                "stream health snapshot"
            );
        }

        // A panicking callback must never take the frame pump down with it.
        let on_message = &self.on_message;
        if catch_unwind(AssertUnwindSafe(|| on_message(text))).is_err() {
            error!("message callback panicked; frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::AtomicU64;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn noop_callback() -> MessageCallback {
        Arc::new(|_frame: String| {})
    }

    /// Accepts one WebSocket connection, sends `frames` text frames, then
    /// holds the connection open without further traffic.
    async fn one_shot_server(frames: usize) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for i in 0..frames {
                let frame = format!(r#"{{"channel":"allMids","data":{{"seq":{}}}}}"#, i);
                if ws.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            // Keep the socket open; drain whatever the client sends.
            while let Some(Ok(_)) = ws.next().await {}
        });
        Url::parse(&format!("ws://{}", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_open_then_close_within_deadline() {
        let url = one_shot_server(0).await;
        let health = Arc::new(HealthMonitor::new());
        let session = WsSession::open(
            &url,
            Duration::from_secs(5),
            health,
            noop_callback(),
            0,
        )
        .await
        .unwrap();

        assert!(session.is_socket_alive());

        let started = std::time::Instant::now();
        session.close(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_open_times_out_against_a_mute_listener() {
        // TCP accept without a WebSocket handshake: the connect call can
        // never finish, only the deadline ends it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let health = Arc::new(HealthMonitor::new());
        let started = std::time::Instant::now();
        let result = WsSession::open(
            &url,
            Duration::from_millis(300),
            health,
            noop_callback(),
            0,
        )
        .await;

        assert!(matches!(
            result,
            Err(TransportError::Timeout { op: "open", .. })
        ));
        assert!(started.elapsed() < Duration::from_millis(1300));
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_callback_and_health() {
        let url = one_shot_server(3).await;
        let health = Arc::new(HealthMonitor::new());
        let delivered = Arc::new(AtomicU64::new(0));
        let delivered_in_cb = delivered.clone();
        let callback: MessageCallback = Arc::new(move |_frame| {
            delivered_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        let session = WsSession::open(&url, Duration::from_secs(5), health.clone(), callback, 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 3);
        assert_eq!(health.report().await.total_messages, 3);

        session.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_callback_panic_does_not_stop_the_pump() {
        let url = one_shot_server(4).await;
        let health = Arc::new(HealthMonitor::new());
        let callback: MessageCallback = Arc::new(|_frame| panic!("application bug"));

        let session = WsSession::open(&url, Duration::from_secs(5), health.clone(), callback, 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(session.is_socket_alive());
        assert_eq!(health.report().await.total_messages, 4);

        session.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_dead_peer_flips_the_liveness_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
        });

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let health = Arc::new(HealthMonitor::new());
        let session = WsSession::open(
            &url,
            Duration::from_secs(5),
            health.clone(),
            noop_callback(),
            0,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!session.is_socket_alive());
        // The dropped peer is an error notification at the transport
        // boundary, counted by the session itself.
        assert!(health.report().await.total_errors >= 1);

        session.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_subscribe_tracks_the_active_map() {
        let url = one_shot_server(0).await;
        let health = Arc::new(HealthMonitor::new());
        let mut session = WsSession::open(
            &url,
            Duration::from_secs(5),
            health,
            noop_callback(),
            0,
        )
        .await
        .unwrap();

        let sub = Subscription::AllMids;
        let id = session.subscribe(&sub, Duration::from_secs(2)).await.unwrap();
        assert_eq!(session.active_subscriptions().get(&sub), Some(&id));

        session.unsubscribe(&sub, Duration::from_secs(2)).await.unwrap();
        assert!(session.active_subscriptions().is_empty());

        session.close(Duration::from_secs(2)).await;
    }
}

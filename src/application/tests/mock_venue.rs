use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// How the venue treats each new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueBehavior {
    /// Accept the TCP connection but never answer the WebSocket upgrade.
    StallHandshake,
    /// Complete the handshake, then close the connection immediately.
    DropAfterHandshake,
    /// Complete the handshake and push data frames on a fixed cadence.
    Serve,
    /// Push this many frames, then keep the socket open without traffic.
    ServeThenStall(u64),
    /// Complete the handshake but never send data.
    Silent,
}

/// A scriptable stand-in for the venue's streaming endpoint, bound to an
/// ephemeral local port. The behavior can be switched between connections to
/// simulate outages and recoveries.
pub struct MockVenue {
    addr: SocketAddr,
    behavior: Arc<Mutex<VenueBehavior>>,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockVenue {
    pub async fn start(behavior: VenueBehavior, frame_interval: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let behavior = Arc::new(Mutex::new(behavior));
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let behavior_for_accept = Arc::clone(&behavior);
        let received_for_accept = Arc::clone(&received);
        let connections_for_accept = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                connections_for_accept.fetch_add(1, Ordering::SeqCst);
                let mode = *behavior_for_accept.lock().await;
                let received = Arc::clone(&received_for_accept);
                tokio::spawn(async move {
                    handle_connection(stream, mode, received, frame_interval).await;
                });
            }
        });

        Self {
            addr,
            behavior,
            received,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn set_behavior(&self, behavior: VenueBehavior) {
        *self.behavior.lock().await = behavior;
    }

    /// Text frames the venue has read from clients, across all connections.
    pub async fn received(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    stream: TcpStream,
    mode: VenueBehavior,
    received: Arc<Mutex<Vec<String>>>,
    frame_interval: Duration,
) {
    let frame_limit = match mode {
        VenueBehavior::StallHandshake => {
            // Hold the raw socket so the client's upgrade request hangs
            // until its own deadline fires.
            tokio::time::sleep(Duration::from_secs(600)).await;
            drop(stream);
            return;
        }
        VenueBehavior::DropAfterHandshake => {
            if let Ok(mut ws) = accept_async(stream).await {
                let _ = ws.close(None).await;
            }
            return;
        }
        VenueBehavior::Serve => None,
        VenueBehavior::ServeThenStall(limit) => Some(limit),
        VenueBehavior::Silent => Some(0),
    };

    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    let mut sent: u64 = 0;
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let more_to_send = frame_limit.map_or(true, |limit| sent < limit);
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => received.lock().await.push(text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            _ = ticker.tick(), if more_to_send => {
                let frame = format!(
                    r#"{{"channel":"allMids","data":{{"mids":{{"BTC":"97000.{}"}}}}}}"#,
                    sent
                );
                if write.send(Message::Text(frame)).await.is_err() {
                    break;
                }
                sent += 1;
            }
        }
    }
}

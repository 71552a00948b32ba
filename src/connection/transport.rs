//! Transport seam between the connection manager and the wire.
//!
//! A [`Transport`] produces one [`TransportLink`] per successful connect: a
//! pair of channels carrying raw JSON text frames. The production
//! implementation speaks WebSocket via tokio-tungstenite; tests use
//! [`MockTransport`] to script connect outcomes and drive both directions.

use crate::defaults;
use crate::error::{Result, StoryloomError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};

/// One live connection: raw outbound and inbound text frames.
///
/// Dropping the link tears the connection down; the transport tasks notice
/// the closed channels and shut the socket.
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Connection factory. Each call to `connect` opens a fresh link; links are
/// never reused across reconnects.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<TransportLink>;
}

/// WebSocket transport for the streaming protocol.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<TransportLink> {
        let (ws_stream, _) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| StoryloomError::ConnectionFailed {
                    message: e.to_string(),
                })?;
        debug!("websocket connected to {}", self.url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(defaults::TRANSPORT_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(defaults::TRANSPORT_BUFFER);

        // Writer: drain outbound frames into the socket; close on channel end.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(tungstenite::Message::Text(text.into())).await {
                    warn!("websocket send failed: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader: forward text frames; any close or error ends the inbound
        // channel, which the manager treats as connection loss.
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(tungstenite::Message::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(tungstenite::Message::Close(_)) => {
                        debug!("websocket closed by peer");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("websocket error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Remote end of one mock connection, held by the test.
pub struct MockRemote {
    /// Inject frames as if the service had sent them.
    pub to_client: mpsc::Sender<String>,
    /// Observe frames the client sent.
    pub from_client: mpsc::Receiver<String>,
}

impl MockRemote {
    /// Send one JSON value to the client.
    pub async fn send_json(&self, value: serde_json::Value) {
        let _ = self.to_client.send(value.to_string()).await;
    }

    /// Send one raw text frame to the client.
    pub async fn send_raw(&self, raw: &str) {
        let _ = self.to_client.send(raw.to_string()).await;
    }
}

/// Scripted transport for tests.
///
/// Connect outcomes follow the scripted failure queue (default: succeed).
/// Every successful connect emits a [`MockRemote`] on the handle returned by
/// [`MockTransport::new`], giving the test both directions of the new link.
pub struct MockTransport {
    failures: Mutex<VecDeque<()>>,
    remotes: mpsc::UnboundedSender<MockRemote>,
    connects: AtomicU32,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockRemote>) {
        let (remotes, remotes_rx) = mpsc::unbounded_channel();
        (
            Self {
                failures: Mutex::new(VecDeque::new()),
                remotes,
                connects: AtomicU32::new(0),
            },
            remotes_rx,
        )
    }

    /// Script the next `count` connect attempts to fail.
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            for _ in 0..count {
                failures.push_back(());
            }
        }
    }

    /// Total connect attempts observed so far.
    pub fn connect_attempts(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<TransportLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let scripted_failure = self
            .failures
            .lock()
            .map(|mut failures| failures.pop_front().is_some())
            .unwrap_or(false);
        if scripted_failure {
            return Err(StoryloomError::ConnectionFailed {
                message: "scripted connect failure".to_string(),
            });
        }

        let (out_tx, out_rx) = mpsc::channel::<String>(defaults::TRANSPORT_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(defaults::TRANSPORT_BUFFER);

        let _ = self.remotes.send(MockRemote {
            to_client: in_tx,
            from_client: out_rx,
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

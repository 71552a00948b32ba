//! Connection lifecycle: connect, heartbeat, reconnect with bounded retries.
//!
//! The manager exclusively owns the live link. Each reconnect builds a fresh
//! link from the transport; nothing is mutated across attempts. Other
//! components interact through a [`ConnectionHandle`]: they read status,
//! submit requests, or ask for a manual reconnect after the terminal
//! `Failed` state.

use crate::config::ConnectionTuning;
use crate::defaults;
use crate::error::{Result, StoryloomError};
use crate::protocol::{ClientRequest, FrameError, ServerFrame, parse_frame};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::transport::{Transport, TransportLink};

/// Connection lifecycle states.
///
/// `Failed` is terminal: the manager stops retrying and waits for an explicit
/// [`ConnectionHandle::reconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ConnectionStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Timing and retry parameters of the connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(defaults::HEARTBEAT_TIMEOUT_SECS),
            reconnect_delay: Duration::from_secs(defaults::RECONNECT_DELAY_SECS),
            max_reconnect_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl From<&ConnectionTuning> for ConnectionConfig {
    fn from(tuning: &ConnectionTuning) -> Self {
        Self {
            heartbeat_interval: tuning.heartbeat_interval(),
            heartbeat_timeout: tuning.heartbeat_timeout(),
            reconnect_delay: tuning.reconnect_delay(),
            max_reconnect_attempts: tuning.max_reconnect_attempts,
        }
    }
}

enum Control {
    Reconnect,
    Shutdown,
}

enum Exit {
    /// Link died; reconnection should follow.
    Lost(&'static str),
    /// Clean shutdown requested.
    Shutdown,
}

/// Cheap cloneable handle for talking to the running manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    status_rx: watch::Receiver<ConnectionStatus>,
    request_tx: mpsc::Sender<ClientRequest>,
    control_tx: mpsc::Sender<Control>,
}

impl ConnectionHandle {
    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel for status changes.
    pub fn status_stream(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status(), ConnectionStatus::Connected)
    }

    /// Send a request over the live connection.
    ///
    /// Fails with [`StoryloomError::NotConnected`] unless the connection is
    /// currently established; requests are never buffered across links.
    pub async fn send(&self, request: ClientRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(StoryloomError::NotConnected);
        }
        self.request_tx
            .send(request)
            .await
            .map_err(|_| StoryloomError::NotConnected)
    }

    /// Ask a `Failed` manager to start a fresh reconnect cycle.
    pub async fn reconnect(&self) -> Result<()> {
        self.control_tx
            .send(Control::Reconnect)
            .await
            .map_err(|_| StoryloomError::Other("connection manager terminated".to_string()))
    }

    /// Cleanly shut the connection down.
    pub async fn shutdown(&self) -> Result<()> {
        self.control_tx
            .send(Control::Shutdown)
            .await
            .map_err(|_| StoryloomError::Other("connection manager terminated".to_string()))
    }
}

/// Owns the persistent connection and its lifecycle.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    frame_tx: mpsc::UnboundedSender<ServerFrame>,
    request_rx: mpsc::Receiver<ClientRequest>,
    control_rx: mpsc::Receiver<Control>,
}

impl ConnectionManager {
    /// Build a manager plus its handle and the channel of validated inbound
    /// frames (heartbeat acknowledgments are consumed internally and never
    /// appear there).
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> (
        Self,
        ConnectionHandle,
        mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (request_tx, request_rx) = mpsc::channel(defaults::REQUEST_BUFFER);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        (
            Self {
                transport,
                config,
                status_tx,
                frame_tx,
                request_rx,
                control_rx,
            },
            ConnectionHandle {
                status_rx,
                request_tx,
                control_tx,
            },
            frame_rx,
        )
    }

    fn set_status(&self, status: ConnectionStatus) {
        debug!("connection status: {status}");
        self.status_tx.send_replace(status);
    }

    /// Drive the connection until shutdown. Run this on its own task.
    pub async fn run(mut self) {
        // Reconnect attempts since the last successful connect; 0 marks the
        // initial connect of a cycle.
        let mut attempt: u32 = 0;

        loop {
            // Requests queued against a previous link are stale by contract:
            // callers must check readiness, not assume buffering.
            while self.request_rx.try_recv().is_ok() {}

            if attempt == 0 {
                self.set_status(ConnectionStatus::Connecting);
            } else {
                self.set_status(ConnectionStatus::Reconnecting { attempt });
            }

            match self.transport.connect().await {
                Ok(link) => {
                    attempt = 0;
                    info!("connected to generation service");
                    self.set_status(ConnectionStatus::Connected);
                    match self.connected_loop(link).await {
                        Exit::Shutdown => {
                            self.set_status(ConnectionStatus::Disconnected);
                            return;
                        }
                        Exit::Lost(reason) => warn!("connection lost: {reason}"),
                    }
                }
                Err(e) => warn!("connect failed: {e}"),
            }

            if attempt >= self.config.max_reconnect_attempts {
                error!(
                    "giving up after {attempt} reconnect attempts; manual reconnect required"
                );
                self.set_status(ConnectionStatus::Failed);
                if !self.await_manual_restart().await {
                    self.set_status(ConnectionStatus::Disconnected);
                    return;
                }
                attempt = 0;
                continue;
            }
            attempt += 1;

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                control = self.control_rx.recv() => match control {
                    Some(Control::Reconnect) => attempt = 0,
                    Some(Control::Shutdown) | None => {
                        self.set_status(ConnectionStatus::Disconnected);
                        return;
                    }
                },
            }
        }
    }

    /// Block in `Failed` until a manual reconnect (true) or shutdown (false).
    async fn await_manual_restart(&mut self) -> bool {
        loop {
            match self.control_rx.recv().await {
                Some(Control::Reconnect) => return true,
                Some(Control::Shutdown) | None => return false,
            }
        }
    }

    /// Pump one established link until it dies or shutdown is requested.
    async fn connected_loop(&mut self, link: TransportLink) -> Exit {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; a probe right
        // after the handshake is noise, so skip it.
        heartbeat.tick().await;

        let mut pong_deadline: Option<Instant> = None;

        loop {
            let timeout_at =
                pong_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                raw = inbound.recv() => match raw {
                    Some(raw) => match parse_frame(&raw) {
                        Ok(ServerFrame::Pong) => {
                            debug!("heartbeat acknowledged");
                            pong_deadline = None;
                        }
                        Ok(frame) => {
                            if self.frame_tx.send(frame).is_err() {
                                return Exit::Shutdown;
                            }
                        }
                        Err(FrameError::UnknownType(label)) => {
                            warn!("dropping frame with unrecognized type {label:?}");
                        }
                        Err(FrameError::Malformed(detail)) => {
                            warn!("dropping malformed frame: {detail}");
                        }
                    },
                    None => return Exit::Lost("transport closed"),
                },

                request = self.request_rx.recv() => match request {
                    Some(request) => {
                        let raw = match request.to_json() {
                            Ok(raw) => raw,
                            Err(e) => {
                                warn!("failed to serialize request: {e}");
                                continue;
                            }
                        };
                        if outbound.send(raw).await.is_err() {
                            return Exit::Lost("send failed");
                        }
                    }
                    None => return Exit::Shutdown,
                },

                _ = heartbeat.tick() => {
                    debug!("sending heartbeat probe");
                    let ping = match ClientRequest::Ping.to_json() {
                        Ok(ping) => ping,
                        Err(_) => continue,
                    };
                    if outbound.send(ping).await.is_err() {
                        return Exit::Lost("heartbeat send failed");
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                    }
                },

                _ = tokio::time::sleep_until(timeout_at), if pong_deadline.is_some() => {
                    warn!("heartbeat timed out; force-closing connection");
                    return Exit::Lost("heartbeat timeout");
                },

                control = self.control_rx.recv() => match control {
                    Some(Control::Shutdown) | None => return Exit::Shutdown,
                    // Already connected; nothing to do.
                    Some(Control::Reconnect) => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::MockTransport;
    use serde_json::json;

    /// Spin up a manager over a mock transport with fast test timings.
    fn start_manager(
        transport: MockTransport,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ServerFrame>,
        tokio::task::JoinHandle<()>,
    ) {
        let config = ConnectionConfig::default();
        let (manager, handle, frames) = ConnectionManager::new(Arc::new(transport), config);
        let task = tokio::spawn(manager.run());
        (handle, frames, task)
    }

    async fn wait_for_status(handle: &ConnectionHandle, wanted: ConnectionStatus) {
        let mut status_rx = handle.status_stream();
        loop {
            if *status_rx.borrow() == wanted {
                return;
            }
            status_rx.changed().await.expect("manager terminated");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_transitions_to_connected() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, _frames, task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        assert!(handle.is_connected());
        assert!(remotes.recv().await.is_some());

        handle.shutdown().await.unwrap();
        wait_for_status(&handle, ConnectionStatus::Disconnected).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_typed_error() {
        let (transport, _remotes) = MockTransport::new();
        let config = ConnectionConfig::default();
        let (_manager, handle, _frames) = ConnectionManager::new(Arc::new(transport), config);

        // Manager not running: status is Disconnected.
        let err = handle
            .send(ClientRequest::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, StoryloomError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_flow_to_transport() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, _frames, _task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        let mut remote = remotes.recv().await.unwrap();

        handle
            .send(ClientRequest::Tts {
                text: "hello".to_string(),
                paragraph_number: 1,
            })
            .await
            .unwrap();

        let raw = remote.from_client.recv().await.unwrap();
        assert!(raw.contains(r#""action":"tts""#));
        assert!(raw.contains(r#""paragraph_number":1"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_forwarded_and_pong_consumed() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, mut frames, _task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        let remote = remotes.recv().await.unwrap();

        remote.send_json(json!({"type": "pong"})).await;
        remote
            .send_json(json!({"type": "status", "message": "working"}))
            .await;

        // The pong never surfaces; the status frame does.
        let frame = frames.recv().await.unwrap();
        assert_eq!(
            frame,
            ServerFrame::Status {
                message: Some("working".to_string()),
                paragraph_number: None,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, mut frames, _task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        let remote = remotes.recv().await.unwrap();

        remote.send_raw("not json").await;
        remote.send_json(json!({"type": "telemetry"})).await;
        remote.send_json(json!({"type": "complete"})).await;

        // Only the valid frame arrives; the connection survived the garbage.
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame, ServerFrame::Complete { message: None });
        assert!(handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_probe_sent_on_interval() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, _frames, _task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        let mut remote = remotes.recv().await.unwrap();

        // First probe fires one interval after connect.
        let raw = remote.from_client.recv().await.unwrap();
        assert_eq!(raw, r#"{"action":"ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_triggers_reconnect() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, _frames, _task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        let mut remote = remotes.recv().await.unwrap();

        // Swallow the probe and never acknowledge it. The stale link dies
        // and the manager reconnects on a fresh one.
        let _ = remote.from_client.recv().await.unwrap();
        assert!(remotes.recv().await.is_some());
        wait_for_status(&handle, ConnectionStatus::Connected).await;

        // The old link is gone for good.
        assert!(remote.from_client.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_alive() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, _frames, _task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        let mut remote = remotes.recv().await.unwrap();

        // Acknowledge two probes; the link must stay up well past the
        // timeout window.
        for _ in 0..2 {
            let raw = remote.from_client.recv().await.unwrap();
            assert_eq!(raw, r#"{"action":"ping"}"#);
            remote.send_json(json!({"type": "pong"})).await;
        }
        assert!(handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_bound_reaches_failed_with_no_sixth_attempt() {
        let (transport, _remotes) = MockTransport::new();
        // Initial connect plus every allowed reconnect attempt all fail.
        transport.fail_next(6);
        let attempts_probe = Arc::new(transport);
        let config = ConnectionConfig::default();
        let (manager, handle, _frames) =
            ConnectionManager::new(attempts_probe.clone(), config);
        let _task = tokio::spawn(manager.run());

        wait_for_status(&handle, ConnectionStatus::Failed).await;
        assert_eq!(attempts_probe.connect_attempts(), 6);

        // Time passing changes nothing: no silent retry past Failed.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts_probe.connect_attempts(), 6);
        assert_eq!(handle.status(), ConnectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resumes_after_failed() {
        let (transport, mut remotes) = MockTransport::new();
        transport.fail_next(6);
        let transport = Arc::new(transport);
        let config = ConnectionConfig::default();
        let (manager, handle, _frames) = ConnectionManager::new(transport.clone(), config);
        let _task = tokio::spawn(manager.run());

        wait_for_status(&handle, ConnectionStatus::Failed).await;

        handle.reconnect().await.unwrap();
        wait_for_status(&handle, ConnectionStatus::Connected).await;
        assert!(remotes.recv().await.is_some());
        assert_eq!(transport.connect_attempts(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_reconnects() {
        let (transport, mut remotes) = MockTransport::new();
        let (handle, _frames, _task) = start_manager(transport);

        wait_for_status(&handle, ConnectionStatus::Connected).await;
        let remote = remotes.recv().await.unwrap();

        // Remote hangs up; a fresh link replaces the dead one.
        drop(remote);
        assert!(remotes.recv().await.is_some());
        wait_for_status(&handle, ConnectionStatus::Connected).await;
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionStatus::Reconnecting { attempt: 3 }.to_string(),
            "reconnecting (attempt 3)"
        );
        assert_eq!(ConnectionStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_config_from_tuning() {
        let tuning = ConnectionTuning::default();
        let config = ConnectionConfig::from(&tuning);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 5);
    }
}

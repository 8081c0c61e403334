/// file: src/connection.rs
/// description: the single physical connection, its lifecycle state machine and heartbeat
use crate::{
    config::WebSocketConfig,
    error::{ConnectionFailure, Result, WorkflowStreamError},
    reconnect::CloseDisposition,
    transport::{Connector, TokenProvider, Transport, TransportMessage, with_token},
    types::{ClientFrame, ConnectionState},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// What the connection observed since the last call to [`Connection::next_signal`].
#[derive(Debug)]
pub enum ConnectionSignal {
    Opened,
    ConnectFailed(DropCause),
    Frame(String),
    /// A frame arrived but could not be decoded as text.
    Undecodable(String),
    /// The heartbeat window elapsed without inbound traffic; the owner should probe.
    HeartbeatDue,
    Dropped(DropCause),
}

/// Why a connection attempt failed or an open connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropCause {
    pub disposition: CloseDisposition,
    pub failure: ConnectionFailure,
}

impl DropCause {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            disposition: CloseDisposition::Retryable,
            failure: ConnectionFailure::new(message, None, false),
        }
    }

    pub fn from_close(code: Option<u16>, reason: &str) -> Self {
        let disposition = code
            .map(CloseDisposition::from_close_code)
            .unwrap_or(CloseDisposition::Retryable);
        let message = if reason.is_empty() {
            "connection closed by server"
        } else {
            reason
        };
        Self {
            disposition,
            failure: ConnectionFailure::new(message, code, false),
        }
    }

    pub fn from_error(error: &WorkflowStreamError) -> Self {
        let disposition = match error {
            WorkflowStreamError::AuthRejected { code, .. } => code
                .map(CloseDisposition::from_http_status)
                .unwrap_or(CloseDisposition::Terminal),
            WorkflowStreamError::ServerRejected { code, .. } => code
                .map(CloseDisposition::from_http_status)
                .unwrap_or(CloseDisposition::ServerRejected),
            WorkflowStreamError::ConnectionFailed(failure) if failure.terminal => {
                CloseDisposition::Terminal
            }
            _ => CloseDisposition::Retryable,
        };
        Self {
            disposition,
            failure: ConnectionFailure::from_error(error),
        }
    }

    fn heartbeat_timeout(grace: Duration) -> Self {
        Self::retryable(format!(
            "heartbeat not answered within {}ms",
            grace.as_millis()
        ))
    }
}

struct Heartbeat {
    interval: Duration,
    grace: Duration,
    last_activity: Instant,
    probe_sent: Option<Instant>,
}

impl Heartbeat {
    fn new(interval: Duration, grace: Duration) -> Self {
        Self {
            interval,
            grace,
            last_activity: Instant::now(),
            probe_sent: None,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.probe_sent = None;
    }

    fn deadline(&self) -> Option<Instant> {
        if self.interval.is_zero() {
            return None;
        }
        Some(match self.probe_sent {
            Some(sent) => sent + self.grace,
            None => self.last_activity + self.interval,
        })
    }
}

enum Wake {
    Message(Option<Result<TransportMessage>>),
    Deadline,
}

type Handshake = JoinHandle<Result<Box<dyn Transport>>>;

/// Owns the transport and the lifecycle state. Reconnection decisions are
/// made by the owner; the connection only reports what happened.
pub struct Connection {
    settings: WebSocketConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    handshake: Option<Handshake>,
    heartbeat: Heartbeat,
    connection_id: Option<Uuid>,
}

impl Connection {
    pub fn new(
        settings: WebSocketConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let heartbeat = Heartbeat::new(settings.heartbeat_interval, settings.heartbeat_grace);
        Self {
            settings,
            connector,
            tokens,
            state: ConnectionState::Closed,
            transport: None,
            handshake: None,
            heartbeat,
            connection_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection_id
    }

    /// Starts a handshake unless one is already running, the connection is
    /// open, or it has failed. Returns whether an attempt was started.
    pub fn open(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Failed => {
                return false;
            }
            ConnectionState::Closed | ConnectionState::Reconnecting => {}
        }

        let connector = self.connector.clone();
        let tokens = self.tokens.clone();
        let url = self.settings.url.clone();
        let param = self.settings.token_param.clone();
        let connect_timeout = self.settings.connect_timeout;

        debug!(url = %url, "Opening connection");
        self.handshake = Some(tokio::spawn(async move {
            let token = tokens
                .token()
                .await
                .map_err(|e| WorkflowStreamError::TokenUnavailable(e.to_string()))?;
            let target = with_token(&url, &param, token.as_deref());
            match timeout(connect_timeout, connector.connect(&target)).await {
                Ok(result) => result,
                Err(_) => Err(WorkflowStreamError::Timeout),
            }
        }));
        self.state = ConnectionState::Connecting;
        true
    }

    /// Writes one intent frame. Fails with `NotConnected` unless open.
    pub async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(WorkflowStreamError::NotConnected);
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or(WorkflowStreamError::NotConnected)?;
        let text = frame.to_json()?;
        trace!(frame = %text, "Sending frame");
        transport.send_text(text).await
    }

    /// Sends a heartbeat probe and starts the grace window.
    pub async fn probe(&mut self) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(WorkflowStreamError::NotConnected)?;
        transport.ping().await?;
        self.heartbeat.probe_sent = Some(Instant::now());
        trace!("Heartbeat probe sent");
        Ok(())
    }

    /// Graceful teardown: aborts a pending handshake and closes the transport.
    pub async fn close(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(mut transport) = self.transport.take()
            && let Err(e) = transport.close().await
        {
            debug!("Error while closing transport: {}", e);
        }
        if self.state != ConnectionState::Closed {
            info!(connection_id = ?self.connection_id, "Connection closed");
        }
        self.state = ConnectionState::Closed;
        self.connection_id = None;
    }

    /// Drops the transport without a closing handshake.
    pub fn discard(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        self.transport = None;
        self.connection_id = None;
    }

    pub fn mark_reconnecting(&mut self) {
        self.discard();
        self.state = ConnectionState::Reconnecting;
    }

    pub fn mark_failed(&mut self) {
        self.discard();
        self.state = ConnectionState::Failed;
    }

    /// Leaves `Failed` so that `open` is allowed again.
    pub fn reset(&mut self) {
        if self.state == ConnectionState::Failed {
            self.state = ConnectionState::Closed;
        }
    }

    /// Waits for the next lifecycle signal. Cancel-safe; pends forever while
    /// there is neither a handshake nor a transport.
    pub async fn next_signal(&mut self) -> ConnectionSignal {
        if let Some(handshake) = self.handshake.as_mut() {
            let joined = handshake.await;
            self.handshake = None;
            return match joined {
                Ok(Ok(transport)) => {
                    let id = Uuid::new_v4();
                    self.transport = Some(transport);
                    self.state = ConnectionState::Open;
                    self.connection_id = Some(id);
                    self.heartbeat.touch();
                    info!(connection_id = %id, "Connection open");
                    ConnectionSignal::Opened
                }
                Ok(Err(error)) => {
                    warn!("Connection attempt failed: {}", error);
                    self.state = ConnectionState::Closed;
                    ConnectionSignal::ConnectFailed(DropCause::from_error(&error))
                }
                Err(join_error) => {
                    self.state = ConnectionState::Closed;
                    ConnectionSignal::ConnectFailed(DropCause::retryable(join_error.to_string()))
                }
            };
        }

        loop {
            let Some(transport) = self.transport.as_mut() else {
                return std::future::pending().await;
            };
            let deadline = self.heartbeat.deadline();

            let wake = tokio::select! {
                message = transport.recv() => Wake::Message(message),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Deadline,
            };

            match wake {
                Wake::Message(Some(Ok(TransportMessage::Text(text)))) => {
                    self.heartbeat.touch();
                    return ConnectionSignal::Frame(text);
                }
                Wake::Message(Some(Ok(TransportMessage::Undecodable(detail)))) => {
                    self.heartbeat.touch();
                    return ConnectionSignal::Undecodable(detail);
                }
                Wake::Message(Some(Ok(TransportMessage::Pong))) => {
                    trace!("Heartbeat answered");
                    self.heartbeat.touch();
                }
                Wake::Message(Some(Ok(TransportMessage::Closed { code, reason }))) => {
                    info!(code = ?code, reason = %reason, "Server closed the connection");
                    return self.dropped(DropCause::from_close(code, &reason));
                }
                Wake::Message(Some(Err(error))) => {
                    warn!("Transport error: {}", error);
                    return self.dropped(DropCause::from_error(&error));
                }
                Wake::Message(None) => {
                    return self.dropped(DropCause::from_close(None, "stream ended"));
                }
                Wake::Deadline => {
                    if self.heartbeat.probe_sent.is_some() {
                        warn!(
                            grace_ms = self.settings.heartbeat_grace.as_millis() as u64,
                            "Heartbeat timed out"
                        );
                        return self.dropped(DropCause::heartbeat_timeout(self.settings.heartbeat_grace));
                    }
                    return ConnectionSignal::HeartbeatDue;
                }
            }
        }
    }

    fn dropped(&mut self, cause: DropCause) -> ConnectionSignal {
        self.discard();
        self.state = ConnectionState::Closed;
        ConnectionSignal::Dropped(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        StaticToken,
        memory::{self, ClientSignal, Refusal},
    };
    use url::Url;

    fn settings() -> WebSocketConfig {
        let mut settings = WebSocketConfig::new(Url::parse("ws://memory/ws").unwrap());
        settings.heartbeat_interval = Duration::from_secs(30);
        settings.heartbeat_grace = Duration::from_secs(10);
        settings
    }

    fn connection(connector: memory::MemoryConnector, token: StaticToken) -> Connection {
        Connection::new(settings(), Arc::new(connector), Arc::new(token))
    }

    #[tokio::test]
    async fn open_is_idempotent_and_reaches_open() {
        let (connector, mut server) = memory::channel();
        let mut conn = connection(connector, StaticToken::new("secret"));

        assert!(conn.open());
        assert!(!conn.open());
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert!(matches!(conn.next_signal().await, ConnectionSignal::Opened));
        assert!(conn.is_open());
        assert!(conn.connection_id().is_some());
        assert!(!conn.open());

        assert!(server.accept().await.is_some());
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(
            server.requested_urls()[0].as_str(),
            "ws://memory/ws?token=secret"
        );
    }

    #[tokio::test]
    async fn send_requires_open_connection() {
        let (connector, _server) = memory::channel();
        let mut conn = connection(connector, StaticToken::anonymous());

        let err = conn.send(&ClientFrame::subscribe("run-1")).await.unwrap_err();
        assert!(matches!(err, WorkflowStreamError::NotConnected));
    }

    #[tokio::test]
    async fn delivers_frames_and_reports_server_close() {
        let (connector, mut server) = memory::channel();
        let mut conn = connection(connector, StaticToken::anonymous());
        conn.open();
        conn.next_signal().await;
        let mut peer = server.accept().await.unwrap();

        conn.send(&ClientFrame::subscribe("run-1")).await.unwrap();
        assert_eq!(peer.next_frame().await, Some(ClientFrame::subscribe("run-1")));

        peer.send_text("hello");
        assert!(matches!(conn.next_signal().await, ConnectionSignal::Frame(text) if text == "hello"));

        peer.send_binary(b"binary hello".to_vec());
        assert!(matches!(conn.next_signal().await, ConnectionSignal::Frame(text) if text == "binary hello"));
        peer.send_binary(vec![0xff, 0xfe]);
        assert!(matches!(conn.next_signal().await, ConnectionSignal::Undecodable(_)));

        peer.close(4401, "unauthorized");
        match conn.next_signal().await {
            ConnectionSignal::Dropped(cause) => {
                assert_eq!(cause.disposition, CloseDisposition::Terminal);
                assert_eq!(cause.failure.close_code, Some(4401));
            }
            other => panic!("expected drop, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn handshake_rejection_is_classified() {
        let (connector, server) = memory::channel();
        server.refuse_next(Refusal::HttpStatus(401));
        let mut conn = connection(connector, StaticToken::anonymous());
        conn.open();

        match conn.next_signal().await {
            ConnectionSignal::ConnectFailed(cause) => {
                assert_eq!(cause.disposition, CloseDisposition::Terminal);
                assert_eq!(cause.failure.close_code, Some(401));
            }
            other => panic!("expected connect failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_probe_is_a_drop() {
        let (connector, mut server) = memory::channel();
        server.set_auto_pong(false);
        let mut conn = connection(connector, StaticToken::anonymous());
        conn.open();
        conn.next_signal().await;
        let mut peer = server.accept().await.unwrap();

        assert!(matches!(conn.next_signal().await, ConnectionSignal::HeartbeatDue));
        conn.probe().await.unwrap();
        assert_eq!(peer.recv().await, Some(ClientSignal::Ping));

        match conn.next_signal().await {
            ConnectionSignal::Dropped(cause) => {
                assert_eq!(cause.disposition, CloseDisposition::Retryable);
            }
            other => panic!("expected heartbeat drop, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn answered_probe_keeps_connection_alive() {
        let (connector, mut server) = memory::channel();
        let mut conn = connection(connector, StaticToken::anonymous());
        conn.open();
        conn.next_signal().await;
        let peer = server.accept().await.unwrap();

        assert!(matches!(conn.next_signal().await, ConnectionSignal::HeartbeatDue));
        conn.probe().await.unwrap();
        // the pong resets the window, so the next wake is another due probe
        assert!(matches!(conn.next_signal().await, ConnectionSignal::HeartbeatDue));
        assert!(conn.is_open());
        drop(peer);
    }

    #[tokio::test]
    async fn failed_connection_needs_reset_before_reopening() {
        let (connector, _server) = memory::channel();
        let mut conn = connection(connector, StaticToken::anonymous());
        conn.mark_failed();
        assert!(!conn.open());
        conn.reset();
        assert!(conn.open());
    }
}

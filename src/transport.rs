// file: src/transport.rs
// description: transport and auth collaborator seams plus the rustls-backed websocket implementation
// reference: https://docs.rs/tokio-tungstenite/latest/tokio_tungstenite/

use crate::error::{Result, WorkflowStreamError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector as TlsConnector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{Error as WsError, Message, client::IntoClientRequest},
};
use tracing::{debug, trace};
use url::Url;

pub mod memory;

/// What a transport hands back to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    /// Binary frame whose payload is not valid UTF-8; carries the decode error.
    Undecodable(String),
    Pong,
    Closed { code: Option<u16>, reason: String },
}

/// Binary frames carry the same JSON as text frames.
pub(crate) fn decode_binary(data: Vec<u8>) -> TransportMessage {
    match String::from_utf8(data) {
        Ok(text) => TransportMessage::Text(text),
        Err(e) => TransportMessage::Undecodable(e.utf8_error().to_string()),
    }
}

/// One established, message-delimited duplex channel to the server.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn ping(&mut self) -> Result<()>;

    /// Next inbound message; `None` once the stream has ended.
    /// Must be cancel-safe: it is raced against commands and timers.
    async fn recv(&mut self) -> Option<Result<TransportMessage>>;

    async fn close(&mut self) -> Result<()>;
}

/// Establishes transports. `url` already carries the auth token.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>>;
}

/// Supplies the auth token; called before every connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<Option<String>>;
}

/// Fixed token, or anonymous when `None`.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Appends the token as a query parameter, replacing any existing value.
pub fn with_token(url: &Url, param: &str, token: Option<&str>) -> Url {
    let Some(token) = token else {
        return url.clone();
    };
    let mut url = url.clone();
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(param, token);
    }
    url
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector using rustls with the ring provider and webpki roots.
#[derive(Clone)]
pub struct WebSocketConnector {
    tls: Arc<rustls::ClientConfig>,
}

impl WebSocketConnector {
    pub fn new() -> Result<Self> {
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
        .with_no_client_auth();

        Ok(Self { tls: Arc::new(tls) })
    }
}

fn map_handshake_error(error: WsError) -> WorkflowStreamError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            let code = Some(status.as_u16());
            let reason = status
                .canonical_reason()
                .unwrap_or("unexpected HTTP response")
                .to_string();
            match status.as_u16() {
                401 | 403 => WorkflowStreamError::AuthRejected { code, reason },
                _ => WorkflowStreamError::ServerRejected { code, reason },
            }
        }
        other => WorkflowStreamError::WebSocketError(other),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>> {
        let request = url.as_str().into_client_request()?;
        let connector = TlsConnector::Rustls(self.tls.clone());

        let (stream, response) = connect_async_tls_with_config(request, None, true, Some(connector))
            .await
            .map_err(map_handshake_error)?;

        debug!(
            host = url.host_str().unwrap_or_default(),
            status = %response.status(),
            "WebSocket upgrade complete"
        );
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream.send(Message::Ping(Default::default())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<TransportMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };

            match message {
                Message::Text(text) => {
                    return Some(Ok(TransportMessage::Text(text.as_str().to_owned())));
                }
                Message::Binary(data) => {
                    trace!("Received binary message of {} bytes", data.len());
                    return Some(Ok(decode_binary(data.to_vec())));
                }
                Message::Pong(_) => return Some(Ok(TransportMessage::Pong)),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(TransportMessage::Closed { code, reason }));
                }
                // tungstenite queues the pong itself
                Message::Ping(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_appended_as_query_parameter() {
        let url = Url::parse("wss://example.com/ws?client=ui").unwrap();
        let with = with_token(&url, "token", Some("abc"));
        assert_eq!(with.as_str(), "wss://example.com/ws?client=ui&token=abc");
    }

    #[test]
    fn existing_token_is_replaced() {
        let url = Url::parse("ws://localhost/ws?token=old").unwrap();
        let with = with_token(&url, "token", Some("new"));
        assert_eq!(with.as_str(), "ws://localhost/ws?token=new");
    }

    #[test]
    fn anonymous_leaves_url_untouched() {
        let url = Url::parse("ws://localhost/ws").unwrap();
        assert_eq!(with_token(&url, "token", None), url);
    }

    #[test]
    fn binary_frames_must_be_utf8() {
        assert_eq!(
            decode_binary(br#"{"type":"pong"}"#.to_vec()),
            TransportMessage::Text(r#"{"type":"pong"}"#.to_string())
        );
        assert!(matches!(
            decode_binary(vec![b'{', 0xc3, 0x28, b'}']),
            TransportMessage::Undecodable(_)
        ));
    }
}

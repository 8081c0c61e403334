//! In-memory [`Connector`]/[`Transport`] pair for driving the client without a
//! network: the test side plays the server through [`MemoryServer`] and one
//! [`MemoryPeer`] per accepted connection.

use super::{Connector, Transport, TransportMessage};
use crate::{
    error::{Result, WorkflowStreamError},
    types::ClientFrame,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::sync::mpsc;
use url::Url;

/// How the next connection attempt should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Unreachable,
    HttpStatus(u16),
}

/// What the client wrote to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    Text(String),
    Ping,
    Closed,
}

enum ServerToClient {
    Message(TransportMessage),
    Binary(Vec<u8>),
    Fail(String),
}

struct Shared {
    refusals: Mutex<VecDeque<Refusal>>,
    urls: Mutex<Vec<Url>>,
    attempts: AtomicUsize,
    auto_pong: AtomicBool,
}

pub fn channel() -> (MemoryConnector, MemoryServer) {
    let shared = Arc::new(Shared {
        refusals: Mutex::new(VecDeque::new()),
        urls: Mutex::new(Vec::new()),
        attempts: AtomicUsize::new(0),
        auto_pong: AtomicBool::new(true),
    });
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            shared: shared.clone(),
            accept_tx,
        },
        MemoryServer { shared, accept_rx },
    )
}

#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.shared
            .urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());

        let refusal = self
            .shared
            .refusals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match refusal {
            Some(Refusal::Unreachable) => {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "server unreachable").into());
            }
            Some(Refusal::HttpStatus(status @ (401 | 403))) => {
                return Err(WorkflowStreamError::AuthRejected {
                    code: Some(status),
                    reason: "credentials rejected".to_string(),
                });
            }
            Some(Refusal::HttpStatus(status)) => {
                return Err(WorkflowStreamError::ServerRejected {
                    code: Some(status),
                    reason: "upgrade refused".to_string(),
                });
            }
            None => {}
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.accept_tx
            .send(MemoryPeer {
                to_client,
                from_client,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "memory server dropped"))?;

        Ok(Box::new(MemoryTransport {
            inbound,
            outbound,
            shared: self.shared.clone(),
            pending_pongs: 0,
        }))
    }
}

pub struct MemoryServer {
    shared: Arc<Shared>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// Queues a failure for the next connection attempt.
    pub fn refuse_next(&self, refusal: Refusal) {
        self.shared
            .refusals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(refusal);
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn requested_urls(&self) -> Vec<Url> {
        self.shared
            .urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// When disabled, pings go unanswered.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.auto_pong.store(enabled, Ordering::SeqCst);
    }
}

/// Server end of one accepted connection. Dropping it ends the client's stream.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<ServerToClient>,
    from_client: mpsc::UnboundedReceiver<ClientSignal>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(ServerToClient::Message(TransportMessage::Text(text.into())))
            .is_ok()
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.to_client.send(ServerToClient::Binary(data.into())).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self
            .to_client
            .send(ServerToClient::Message(TransportMessage::Closed {
                code: Some(code),
                reason: reason.to_string(),
            }));
    }

    /// Simulates a transport error such as a reset socket.
    pub fn fail(&self, reason: &str) {
        let _ = self.to_client.send(ServerToClient::Fail(reason.to_string()));
    }

    pub async fn recv(&mut self) -> Option<ClientSignal> {
        self.from_client.recv().await
    }

    /// Next intent frame written by the client, skipping pings. `None` once
    /// the client closed or dropped the connection.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        loop {
            match self.from_client.recv().await? {
                ClientSignal::Text(text) => {
                    if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                        return Some(frame);
                    }
                }
                ClientSignal::Ping => continue,
                ClientSignal::Closed => return None,
            }
        }
    }

    /// Intent frames already written, without waiting.
    pub fn drain_frames(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(signal) = self.from_client.try_recv() {
            if let ClientSignal::Text(text) = signal
                && let Ok(frame) = serde_json::from_str::<ClientFrame>(&text)
            {
                frames.push(frame);
            }
        }
        frames
    }
}

pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<ServerToClient>,
    outbound: mpsc::UnboundedSender<ClientSignal>,
    shared: Arc<Shared>,
    pending_pongs: usize,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(ClientSignal::Text(text))
            .map_err(|_| WorkflowStreamError::ConnectionClosed)
    }

    async fn ping(&mut self) -> Result<()> {
        self.outbound
            .send(ClientSignal::Ping)
            .map_err(|_| WorkflowStreamError::ConnectionClosed)?;
        if self.shared.auto_pong.load(Ordering::SeqCst) {
            self.pending_pongs += 1;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<TransportMessage>> {
        if self.pending_pongs > 0 {
            self.pending_pongs -= 1;
            return Some(Ok(TransportMessage::Pong));
        }
        match self.inbound.recv().await? {
            ServerToClient::Message(message) => Some(Ok(message)),
            ServerToClient::Binary(data) => Some(Ok(super::decode_binary(data))),
            ServerToClient::Fail(reason) => Some(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                reason,
            )
            .into())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.outbound.send(ClientSignal::Closed);
        self.inbound.close();
        Ok(())
    }
}

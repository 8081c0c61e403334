#![doc = include_str!("../docs/rustdoc.md")]

/// Per-topic bounded event history.
pub mod buffer;
/// Command-line argument definitions.
pub mod cli;
/// Client facade, supervisor task and process-wide instance.
pub mod client;
/// Statistics snapshot published by the client.
pub mod client_state;
/// Runtime configuration model.
pub mod config;
/// Connection lifecycle and heartbeat.
pub mod connection;
/// Error types used across the crate.
pub mod error;
/// Lifecycle event bus between the client and presentation.
pub mod events;
/// Reactive per-topic feeds.
pub mod feed;
/// Terminal output formatters.
pub mod formatter;
/// Metrics and health status structures.
pub mod monitoring;
/// Backoff, retry ceilings and close-code classification.
pub mod reconnect;
/// Topic to listener multiplexing.
pub mod registry;
/// Inbound frame parsing, validation and routing.
pub mod router;
/// Tracing/logging initialization.
pub mod tracing_setup;
/// Transport and auth seams, WebSocket and in-memory implementations.
pub mod transport;
/// Workflow event model and wire frames.
pub mod types;
/// UI controller and presentation loop.
pub mod ui;

pub use client::{SubscriptionHandle, WorkflowClient, get_instance, get_or_init, reset_instance};
pub use client_state::ClientStats;
pub use config::Config;
/// Primary crate error type.
pub use error::{ConnectionFailure, WorkflowStreamError};
pub use feed::{FeedOptions, FeedState, WorkflowFeed};
pub use types::{ConnectionState, Phase, WorkflowEvent};

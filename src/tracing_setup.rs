// file: src/tracing_setup.rs
// description: log filter construction and subscriber installation; logs go to stderr so stdout stays event-only
// reference: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Handshake and frame chatter from the websocket stack stays at warn unless
/// `RUST_LOG` says otherwise.
const TRANSPORT_DIRECTIVES: &[&str] = &["tungstenite=warn", "tokio_tungstenite=warn", "rustls=warn"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub level: String,
    pub json: bool,
    pub ansi: bool,
}

impl LogOptions {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            json: false,
            ansi: true,
        }
    }

    /// Filter used when `RUST_LOG` is unset.
    pub fn default_directives(&self) -> String {
        let mut directives = vec![format!("rs_workflow_stream={}", self.level.to_lowercase())];
        directives.extend(TRANSPORT_DIRECTIVES.iter().map(|d| d.to_string()));
        directives.join(",")
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.default_directives()))
            .unwrap_or_else(|_| EnvFilter::new("rs_workflow_stream=info"))
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn setup_tracing(options: &LogOptions) -> Result<()> {
    let layer = if options.json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_ansi(options.ansi)
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(options.filter())
        .with(layer)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(())
}

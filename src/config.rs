/// file: src/config.rs
/// description: configuration for the connection, reconnection policy, history bounds and CLI output
use crate::{
    buffer::{DEFAULT_MAX_EVENTS, DEFAULT_RETAINED_IDLE_TOPICS},
    cli::Args,
};
use anyhow::{Result, bail};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub websocket: WebSocketConfig,
    pub reconnect: ReconnectConfig,
    pub buffer: BufferConfig,
    pub metrics: MetricsConfig,
    pub health: HealthConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: Url,
    /// Query parameter carrying the auth token.
    pub token_param: String,
    pub connect_timeout: Duration,
    /// Silence on the wire longer than this triggers a ping. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered before the connection counts as dropped.
    pub heartbeat_grace: Duration,
    /// Close the connection this long after the last listener leaves.
    pub idle_teardown: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay applied as +/- jitter.
    pub jitter: f64,
    /// `None` retries transient drops forever.
    pub max_attempts: Option<u32>,
    pub max_server_rejections: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub max_events: usize,
    /// Topics without listeners whose history is kept for a later
    /// subscriber, oldest released first. Zero releases history as soon as
    /// the last listener leaves.
    pub retained_idle_topics: usize,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: String,
    pub colored: bool,
    pub quiet: bool,
    pub csv_export: bool,
    /// Stop after this many events have been printed; zero means unlimited.
    pub max_printed: u64,
}

impl WebSocketConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            token_param: "token".to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(10),
            idle_teardown: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: None,
            max_server_rejections: 5,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            retained_idle_topics: DEFAULT_RETAINED_IDLE_TOPICS,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "table".to_string(),
            colored: true,
            quiet: false,
            csv_export: false,
            max_printed: 0,
        }
    }
}

impl Config {
    /// Library defaults for a server at `url`.
    pub fn for_url(url: Url) -> Self {
        Config {
            websocket: WebSocketConfig::new(url),
            reconnect: ReconnectConfig::default(),
            buffer: BufferConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
            output: OutputConfig::default(),
        }
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let url = Url::parse(&args.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("unsupported url scheme '{}', expected ws or wss", url.scheme());
        }
        if !(0.0..=1.0).contains(&args.jitter) {
            bail!("jitter must be between 0.0 and 1.0, got {}", args.jitter);
        }

        Ok(Config {
            websocket: WebSocketConfig {
                url,
                token_param: args.token_param.clone(),
                connect_timeout: Duration::from_secs(args.timeout),
                heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
                heartbeat_grace: Duration::from_secs(args.heartbeat_grace),
                idle_teardown: None,
            },
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(args.reconnect_base_ms),
                max_delay: Duration::from_millis(args.reconnect_max_ms),
                jitter: args.jitter,
                max_attempts: (args.max_reconnects > 0).then_some(args.max_reconnects),
                max_server_rejections: args.max_server_rejections,
            },
            buffer: BufferConfig {
                max_events: args.history,
                retained_idle_topics: args.retained_idle_runs,
            },
            metrics: MetricsConfig {
                enabled: args.metrics,
                port: args.metrics_port,
            },
            health: HealthConfig {
                check_interval: Duration::from_secs(args.health_check_interval),
            },
            output: OutputConfig {
                format: args.format.clone(),
                colored: !args.no_color,
                quiet: args.quiet,
                csv_export: args.csv_export,
                max_printed: args.max_events,
            },
        })
    }
}

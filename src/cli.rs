use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "rs-workflow-stream",
    about = "tail real-time workflow run events over a multiplexed websocket connection",
    version
)]
pub struct Args {
    /// Workflow run id to follow (repeat for several runs)
    #[arg(short, long = "run", required = true)]
    pub runs: Vec<String>,

    /// WebSocket endpoint URL
    #[arg(short, long, default_value = "ws://localhost:8000/ws/workflows")]
    pub url: String,

    /// Auth token attached to the connection
    #[arg(long, env = "WORKFLOW_STREAM_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Query parameter used to carry the auth token
    #[arg(long, default_value = "token")]
    pub token_param: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Enable metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Metrics server port
    #[arg(long, default_value = "9090")]
    pub metrics_port: u16,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    pub timeout: u64,

    /// Seconds of silence before a heartbeat ping is sent (0 disables)
    #[arg(long, default_value = "30")]
    pub heartbeat_interval: u64,

    /// Seconds to wait for a heartbeat reply before reconnecting
    #[arg(long, default_value = "10")]
    pub heartbeat_grace: u64,

    /// Initial reconnection delay in milliseconds
    #[arg(long, default_value = "1000")]
    pub reconnect_base_ms: u64,

    /// Maximum reconnection delay in milliseconds
    #[arg(long, default_value = "30000")]
    pub reconnect_max_ms: u64,

    /// Jitter fraction applied to reconnection delays (0.0 - 1.0)
    #[arg(long, default_value = "0.2")]
    pub jitter: f64,

    /// Maximum number of reconnection attempts (0 for unlimited)
    #[arg(long, default_value = "0")]
    pub max_reconnects: u32,

    /// Server rejections tolerated before giving up
    #[arg(long, default_value = "5")]
    pub max_server_rejections: u32,

    /// Events of history kept per run
    #[arg(long, default_value = "1000")]
    pub history: usize,

    /// Runs without listeners whose history is kept for a later subscriber
    #[arg(long, default_value = "16")]
    pub retained_idle_runs: usize,

    /// Health check interval in seconds
    #[arg(long, default_value = "30")]
    pub health_check_interval: u64,

    /// Output format: table, csv, json, minimal
    #[arg(long, default_value = "table")]
    pub format: String,

    /// Disable colored output (useful for piping to files)
    #[arg(long)]
    pub no_color: bool,

    /// Enable CSV export to stderr (for easy redirection)
    #[arg(long)]
    pub csv_export: bool,

    /// Quiet mode - events only, no banners or status lines
    #[arg(long)]
    pub quiet: bool,

    /// Stop after this many events have been printed (0 for unlimited)
    #[arg(long, default_value = "0")]
    pub max_events: u64,
}

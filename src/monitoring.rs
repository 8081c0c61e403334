use crate::{client_state::ClientStats, error::WorkflowStreamError};
use anyhow::Result;
use metrics::{Counter, Gauge, counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::LazyLock, time::Duration};
use tracing::{error, info};

// Global metrics
pub static FRAMES_RECEIVED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("workflow_stream_frames_received_total"));
pub static EVENTS_ROUTED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("workflow_stream_events_routed_total"));
pub static RECONNECT_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("workflow_stream_reconnects_total"));
pub static CONNECTED_GAUGE: LazyLock<Gauge> =
    LazyLock::new(|| gauge!("workflow_stream_connected"));
pub static ACTIVE_TOPICS_GAUGE: LazyLock<Gauge> =
    LazyLock::new(|| gauge!("workflow_stream_active_topics"));
pub static ACTIVE_LISTENERS_GAUGE: LazyLock<Gauge> =
    LazyLock::new(|| gauge!("workflow_stream_active_listeners"));

/// Discarded frames, labelled by rejection reason.
pub fn record_discarded_frame(reason: &'static str) {
    counter!("workflow_stream_frames_discarded_total", "reason" => reason).increment(1);
}

pub async fn setup_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "rs-workflow-stream")
        .add_global_label("version", env!("CARGO_PKG_VERSION"));

    match builder.install() {
        Ok(_) => {
            info!(
                "Prometheus metrics server started on http://{}/metrics",
                addr
            );

            FRAMES_RECEIVED_COUNTER.absolute(0);
            EVENTS_ROUTED_COUNTER.absolute(0);
            RECONNECT_COUNTER.absolute(0);
            CONNECTED_GAUGE.set(0.0);
            ACTIVE_TOPICS_GAUGE.set(0.0);
            ACTIVE_LISTENERS_GAUGE.set(0.0);

            Ok(())
        }
        Err(e) => {
            error!("Failed to start metrics server: {}", e);
            Err(WorkflowStreamError::MetricsError(e.to_string()).into())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub connection_state: String,
    pub connection_id: Option<String>,
    pub active_topics: usize,
    pub active_listeners: usize,
    pub frames_received: u64,
    pub events_routed: u64,
    pub discarded_frames: u64,
    pub reconnect_attempt: u32,
    pub last_failure: Option<String>,
    pub uptime: chrono::Duration,
}

impl HealthStatus {
    pub fn from_stats(stats: &ClientStats, uptime: Duration) -> Self {
        Self {
            is_healthy: stats.is_connected(),
            connection_state: stats.connection_state.to_string(),
            connection_id: stats.connection_id.clone(),
            active_topics: stats.topic_count,
            active_listeners: stats.subscription_count,
            frames_received: stats.frames_received,
            events_routed: stats.events_routed,
            discarded_frames: stats.discarded_frames(),
            reconnect_attempt: stats.reconnect_attempt,
            last_failure: stats.last_failure.as_ref().map(ToString::to_string),
            uptime: chrono::Duration::from_std(uptime).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.is_healthy { "healthy" } else { "unhealthy" },
            "connection_state": self.connection_state,
            "connection_id": self.connection_id,
            "active_topics": self.active_topics,
            "active_listeners": self.active_listeners,
            "frames_received": self.frames_received,
            "events_routed": self.events_routed,
            "discarded_frames": self.discarded_frames,
            "reconnect_attempt": self.reconnect_attempt,
            "last_failure": self.last_failure,
            "uptime_seconds": self.uptime.num_seconds(),
            "timestamp": chrono::Utc::now()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionState;

    #[test]
    fn open_connection_reports_healthy() {
        let stats = ClientStats {
            connection_state: ConnectionState::Open,
            subscription_count: 3,
            topic_count: 2,
            malformed_frames: 1,
            rejected_frames: 2,
            ..ClientStats::default()
        };
        let health = HealthStatus::from_stats(&stats, Duration::from_secs(90));

        assert!(health.is_healthy);
        assert_eq!(health.discarded_frames, 3);
        let json = health.to_json();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connection_state"], "open");
        assert_eq!(json["uptime_seconds"], 90);
    }

    #[test]
    fn reconnecting_is_unhealthy() {
        let stats = ClientStats {
            connection_state: ConnectionState::Reconnecting,
            reconnect_attempt: 4,
            ..ClientStats::default()
        };
        let json = HealthStatus::from_stats(&stats, Duration::ZERO).to_json();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["reconnect_attempt"], 4);
    }
}

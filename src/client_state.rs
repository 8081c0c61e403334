/// file: src/client_state.rs
/// description: point-in-time statistics published by the client supervisor
use crate::{
    error::ConnectionFailure,
    router::RouterStats,
    types::ConnectionState,
};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub connection_state: ConnectionState,
    /// Registered listeners across every topic.
    pub subscription_count: usize,
    /// Topics with at least one listener.
    pub topic_count: usize,
    pub connection_id: Option<String>,
    pub reconnect_attempt: u32,
    pub frames_received: u64,
    pub events_routed: u64,
    pub malformed_frames: u64,
    pub rejected_frames: u64,
    pub unroutable_frames: u64,
    pub invalid_timestamps: u64,
    pub last_failure: Option<ConnectionFailure>,
}

impl ClientStats {
    pub(crate) fn record_router(&mut self, router: RouterStats) {
        self.frames_received = router.frames;
        self.events_routed = router.routed;
        self.malformed_frames = router.malformed;
        self.rejected_frames = router.invalid;
        self.unroutable_frames = router.unroutable;
        self.invalid_timestamps = router.invalid_timestamps;
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Open
    }

    pub fn discarded_frames(&self) -> u64 {
        self.malformed_frames + self.rejected_frames
    }
}

pub type StatsSender = watch::Sender<ClientStats>;
pub type StatsReceiver = watch::Receiver<ClientStats>;

pub fn create_stats_channel() -> (StatsSender, StatsReceiver) {
    watch::channel(ClientStats::default())
}

/// file: src/types.rs
/// description: workflow event model, connection state and the JSON frames exchanged with the server
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Logical stream identifier; a workflow run id.
pub type Topic = String;

/// Lifecycle of the single physical connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    #[default]
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// `Connecting` or `Open`: a call to open would be a no-op.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    End,
    Fail,
}

impl Phase {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Phase::Start),
            "end" => Some(Phase::End),
            "fail" => Some(Phase::Fail),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::End => "end",
            Phase::Fail => "fail",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    #[serde(default)]
    pub message: String,
}

/// One validated node transition of a workflow run. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub phase: Phase,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl WorkflowEvent {
    pub fn new(run_id: impl Into<String>, node_name: impl Into<String>, phase: Phase) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Utc::now(),
            node_name: node_name.into(),
            phase,
            metrics: Map::new(),
            issues: Vec::new(),
            data: Map::new(),
        }
    }

    /// Get timestamp as Local DateTime
    pub fn datetime_local(&self) -> DateTime<Local> {
        self.timestamp.with_timezone(&Local)
    }

    pub fn is_failure(&self) -> bool {
        self.phase == Phase::Fail
    }

    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Error)
            .count()
    }
}

/// Outbound intent frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
}

impl ClientFrame {
    pub fn subscribe(topic: &str) -> Self {
        ClientFrame::Subscribe {
            topic: topic.to_string(),
        }
    }

    pub fn unsubscribe(topic: &str) -> Self {
        ClientFrame::Unsubscribe {
            topic: topic.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            ClientFrame::Subscribe { topic } | ClientFrame::Unsubscribe { topic } => topic,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Control traffic the server may interleave with events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerControl {
    Subscribed {
        topic: Topic,
    },
    Unsubscribed {
        topic: Topic,
    },
    Pong,
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        topic: Option<Topic>,
    },
}

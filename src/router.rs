/// file: src/router.rs
/// description: parses raw inbound frames into validated workflow events and routes them by run id
use crate::{
    registry::SubscriptionRegistry,
    types::{Issue, Phase, ServerControl, Topic, WorkflowEvent},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Frames larger than this are discarded without being parsed.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Event {
        event: WorkflowEvent,
        /// The frame's timestamp was missing or unparsable; receive time was used.
        timestamp_fallback: bool,
    },
    Control(ServerControl),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Oversized(usize),
    Malformed(String),
    MissingField(&'static str),
    InvalidField { field: &'static str, detail: String },
}

impl RejectReason {
    /// Short label used for metrics and lifecycle events.
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::Oversized(_) => "oversized",
            RejectReason::Malformed(_) => "malformed",
            RejectReason::MissingField(_) | RejectReason::InvalidField { .. } => "invalid",
        }
    }

    fn is_malformed(&self) -> bool {
        matches!(self, RejectReason::Oversized(_) | RejectReason::Malformed(_))
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Oversized(len) => write!(f, "frame too large ({len} bytes)"),
            RejectReason::Malformed(detail) => write!(f, "unparsable frame: {detail}"),
            RejectReason::MissingField(field) => write!(f, "missing required field '{field}'"),
            RejectReason::InvalidField { field, detail } => {
                write!(f, "invalid field '{field}': {detail}")
            }
        }
    }
}

/// Parses one text frame. Never panics; every failure becomes [`FrameOutcome::Rejected`].
pub fn parse_frame(text: &str) -> FrameOutcome {
    if text.len() > MAX_FRAME_BYTES {
        return FrameOutcome::Rejected(RejectReason::Oversized(text.len()));
    }

    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(e) => return FrameOutcome::Rejected(RejectReason::Malformed(e.to_string())),
    };

    let Value::Object(object) = value else {
        return FrameOutcome::Rejected(RejectReason::Malformed(
            "frame is not a JSON object".to_string(),
        ));
    };

    if !object.contains_key("run_id") && object.contains_key("type") {
        return match serde_json::from_value::<ServerControl>(Value::Object(object)) {
            Ok(control) => FrameOutcome::Control(control),
            Err(e) => FrameOutcome::Rejected(RejectReason::InvalidField {
                field: "type",
                detail: e.to_string(),
            }),
        };
    }

    match validate_event(object) {
        Ok((event, timestamp_fallback)) => FrameOutcome::Event {
            event,
            timestamp_fallback,
        },
        Err(reason) => FrameOutcome::Rejected(reason),
    }
}

fn required_str(
    object: &mut Map<String, Value>,
    field: &'static str,
) -> Result<String, RejectReason> {
    match object.remove(field) {
        None | Some(Value::Null) => Err(RejectReason::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(RejectReason::InvalidField {
            field,
            detail: "empty string".to_string(),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(RejectReason::InvalidField {
            field,
            detail: format!("expected string, got {}", json_type(&other)),
        }),
    }
}

fn optional_object(object: &mut Map<String, Value>, field: &str) -> Map<String, Value> {
    match object.remove(field) {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            debug!(field, kind = json_type(&other), "Ignoring non-object field");
            Map::new()
        }
    }
}

fn validate_event(mut object: Map<String, Value>) -> Result<(WorkflowEvent, bool), RejectReason> {
    let run_id = required_str(&mut object, "run_id")?;
    let node_name = required_str(&mut object, "node_name")?;
    let raw_phase = required_str(&mut object, "phase")?;
    let phase = Phase::parse(&raw_phase).ok_or_else(|| RejectReason::InvalidField {
        field: "phase",
        detail: format!("unknown phase '{raw_phase}'"),
    })?;

    let parsed_timestamp = match object.remove("timestamp") {
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        _ => None,
    };
    let timestamp_fallback = parsed_timestamp.is_none();
    let timestamp = parsed_timestamp.unwrap_or_else(Utc::now);

    let issues = match object.remove("issues") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<Issue>(item).ok())
            .collect(),
        _ => Vec::new(),
    };

    let event = WorkflowEvent {
        run_id,
        timestamp,
        node_name,
        phase,
        metrics: optional_object(&mut object, "metrics"),
        issues,
        data: optional_object(&mut object, "data"),
    };
    Ok((event, timestamp_fallback))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Diagnostic counters; discarded frames are never attributed to a topic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub frames: u64,
    pub routed: u64,
    pub control: u64,
    pub malformed: u64,
    pub invalid: u64,
    pub unroutable: u64,
    pub invalid_timestamps: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Delivered { topic: Topic, listeners: usize },
    /// Valid event for a topic nobody is listening to.
    Unroutable { topic: Topic },
    Control(ServerControl),
    Discarded(RejectReason),
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Parses `text` and fans the event out to the listeners of its run id only.
    pub fn route(&mut self, text: &str, registry: &mut SubscriptionRegistry) -> RouteOutcome {
        self.stats.frames += 1;

        match parse_frame(text) {
            FrameOutcome::Event {
                event,
                timestamp_fallback,
            } => {
                if timestamp_fallback {
                    self.stats.invalid_timestamps += 1;
                    trace!(run_id = %event.run_id, "Event timestamp missing or invalid, using receive time");
                }
                let topic = event.run_id.clone();
                let listeners = registry.dispatch(Arc::new(event));
                if listeners == 0 {
                    self.stats.unroutable += 1;
                    debug!(topic = %topic, "No listeners for event, dropping");
                    RouteOutcome::Unroutable { topic }
                } else {
                    self.stats.routed += 1;
                    RouteOutcome::Delivered { topic, listeners }
                }
            }
            FrameOutcome::Control(control) => {
                self.stats.control += 1;
                match &control {
                    ServerControl::Error { message, topic } => {
                        warn!(topic = ?topic, "Server reported error: {}", message);
                    }
                    other => debug!("Control frame: {:?}", other),
                }
                RouteOutcome::Control(control)
            }
            FrameOutcome::Rejected(reason) => self.discard(reason, text),
        }
    }

    /// Counts a frame that never decoded to text as malformed.
    pub fn reject_undecodable(&mut self, detail: &str) -> RouteOutcome {
        self.stats.frames += 1;
        self.discard(
            RejectReason::Malformed(format!("frame is not valid UTF-8: {detail}")),
            "<binary>",
        )
    }

    fn discard(&mut self, reason: RejectReason, text: &str) -> RouteOutcome {
        if reason.is_malformed() {
            self.stats.malformed += 1;
        } else {
            self.stats.invalid += 1;
        }
        warn!(
            reason = reason.label(),
            "Discarding frame: {}. Message: {}",
            reason,
            preview(text)
        );
        RouteOutcome::Discarded(reason)
    }
}

//! Recording event types
//!
//! Events arrive from the recorder in the rrweb wire shape
//! `{"type": <u8>, "timestamp": <ms>, "data": {...}}`. The payload stays opaque
//! `serde_json::Value`; only `type`, `data.source`, `data.type` and `data.id`
//! are ever inspected, through [`RecordingEvent::kind`] and
//! [`RecordingEvent::mouse_interaction`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Recorder node id (rrweb mirror id)
pub type NodeId = u64;

/// Top-level event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EventType {
    DomContentLoaded = 0,
    Load = 1,
    FullSnapshot = 2,
    IncrementalSnapshot = 3,
    Meta = 4,
    Custom = 5,
    Plugin = 6,
}

impl TryFrom<u8> for EventType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::DomContentLoaded,
            1 => Self::Load,
            2 => Self::FullSnapshot,
            3 => Self::IncrementalSnapshot,
            4 => Self::Meta,
            5 => Self::Custom,
            6 => Self::Plugin,
            other => return Err(format!("unknown recording event type {other}")),
        })
    }
}

impl From<EventType> for u8 {
    fn from(value: EventType) -> u8 {
        value as u8
    }
}

/// Source of an incremental snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncrementalSource {
    Mutation,
    MouseMove,
    MouseInteraction,
    Scroll,
    ViewportResize,
    Input,
    TouchMove,
    MediaInteraction,
    StyleSheetRule,
    CanvasMutation,
    Font,
    Log,
    Drag,
    StyleDeclaration,
    Selection,
    AdoptedStyleSheet,
    CustomElement,
}

impl IncrementalSource {
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::Mutation,
            1 => Self::MouseMove,
            2 => Self::MouseInteraction,
            3 => Self::Scroll,
            4 => Self::ViewportResize,
            5 => Self::Input,
            6 => Self::TouchMove,
            7 => Self::MediaInteraction,
            8 => Self::StyleSheetRule,
            9 => Self::CanvasMutation,
            10 => Self::Font,
            11 => Self::Log,
            12 => Self::Drag,
            13 => Self::StyleDeclaration,
            14 => Self::Selection,
            15 => Self::AdoptedStyleSheet,
            16 => Self::CustomElement,
            _ => return None,
        })
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    /// Sources that count as a visible page change for click detection
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Mutation
                | Self::StyleSheetRule
                | Self::StyleDeclaration
                | Self::AdoptedStyleSheet
                | Self::CanvasMutation
                | Self::Input
                | Self::MediaInteraction
        )
    }
}

/// Mouse interaction kind of a `MouseInteraction` incremental event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseInteraction {
    MouseUp,
    MouseDown,
    Click,
    ContextMenu,
    DblClick,
    Focus,
    Blur,
    TouchStart,
    TouchMoveDeparted,
    TouchEnd,
    TouchCancel,
}

impl MouseInteraction {
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::MouseUp,
            1 => Self::MouseDown,
            2 => Self::Click,
            3 => Self::ContextMenu,
            4 => Self::DblClick,
            5 => Self::Focus,
            6 => Self::Blur,
            7 => Self::TouchStart,
            8 => Self::TouchMoveDeparted,
            9 => Self::TouchEnd,
            10 => Self::TouchCancel,
            _ => return None,
        })
    }
}

/// Classified view of a recording event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind<'a> {
    DomContentLoaded,
    Load,
    FullSnapshot,
    /// `None` when the recorder sent a source this crate does not know
    IncrementalSnapshot(Option<IncrementalSource>),
    Meta,
    Custom { tag: Option<&'a str> },
    Plugin,
}

/// A single event produced by the recorder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Milliseconds since UNIX epoch
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: u64,

    #[serde(default)]
    pub data: Value,
}

impl RecordingEvent {
    pub fn new(event_type: EventType, timestamp: u64, data: Value) -> Self {
        Self {
            event_type,
            timestamp,
            data,
        }
    }

    /// Incremental snapshot from `source` with extra payload fields
    pub fn incremental(source: IncrementalSource, timestamp: u64, mut data: Value) -> Self {
        if let Value::Object(map) = &mut data {
            map.insert("source".to_string(), json!(source.code()));
        } else {
            data = json!({ "source": source.code() });
        }
        Self::new(EventType::IncrementalSnapshot, timestamp, data)
    }

    /// Custom event `{tag, payload}`
    pub fn custom(tag: &str, timestamp: u64, payload: Value) -> Self {
        Self::new(
            EventType::Custom,
            timestamp,
            json!({ "tag": tag, "payload": payload }),
        )
    }

    /// Custom event wrapping a breadcrumb
    pub fn breadcrumb(breadcrumb: &Breadcrumb) -> Self {
        let payload = serde_json::to_value(breadcrumb).unwrap_or(Value::Null);
        Self::custom("breadcrumb", breadcrumb.timestamp_ms(), payload)
    }

    /// Custom event wrapping a performance span
    pub fn performance_span(span: &PerformanceSpan) -> Self {
        let payload = serde_json::to_value(span).unwrap_or(Value::Null);
        Self::custom(
            "performanceSpan",
            (span.start_timestamp * 1000.0) as u64,
            payload,
        )
    }

    pub fn kind(&self) -> EventKind<'_> {
        match self.event_type {
            EventType::DomContentLoaded => EventKind::DomContentLoaded,
            EventType::Load => EventKind::Load,
            EventType::FullSnapshot => EventKind::FullSnapshot,
            EventType::IncrementalSnapshot => EventKind::IncrementalSnapshot(
                self.data
                    .get("source")
                    .and_then(Value::as_u64)
                    .and_then(IncrementalSource::from_code),
            ),
            EventType::Meta => EventKind::Meta,
            EventType::Custom => EventKind::Custom {
                tag: self.data.get("tag").and_then(Value::as_str),
            },
            EventType::Plugin => EventKind::Plugin,
        }
    }

    /// `(interaction, node id)` for mouse interaction incremental events
    pub fn mouse_interaction(&self) -> Option<(MouseInteraction, NodeId)> {
        if self.kind() != EventKind::IncrementalSnapshot(Some(IncrementalSource::MouseInteraction))
        {
            return None;
        }
        let interaction = self
            .data
            .get("type")
            .and_then(Value::as_u64)
            .and_then(MouseInteraction::from_code)?;
        let id = self.data.get("id").and_then(Value::as_u64)?;
        Some((interaction, id))
    }

    /// Serialized JSON; falls back to `"{}"` if the payload cannot be encoded
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize recording event: {e}");
            "{}".to_string()
        })
    }
}

/// Accepts integer or float timestamps, in seconds or milliseconds
fn deserialize_timestamp_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    timestamp_to_ms(raw)
        .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {raw}")))
}

/// Latest accepted timestamp, 9999-12-31T23:59:59.999Z
pub const MAX_TIMESTAMP_MS: u64 = 253_402_300_799_999;

/// Normalize a timestamp that may be in seconds to milliseconds
///
/// Returns `None` for negative, non-finite or far-future values.
pub fn timestamp_to_ms(timestamp: f64) -> Option<u64> {
    if !timestamp.is_finite() || timestamp < 0.0 {
        return None;
    }
    let ms = if timestamp > 9_999_999_999.0 {
        timestamp
    } else {
        timestamp * 1000.0
    };
    if ms > MAX_TIMESTAMP_MS as f64 {
        return None;
    }
    Some(ms as u64)
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::DomContentLoaded => "dom_content_loaded",
            EventType::Load => "load",
            EventType::FullSnapshot => "full_snapshot",
            EventType::IncrementalSnapshot => "incremental_snapshot",
            EventType::Meta => "meta",
            EventType::Custom => "custom",
            EventType::Plugin => "plugin",
        };
        write!(f, "{name}")
    }
}

/// A breadcrumb as stored inside custom recording events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Breadcrumb {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    pub category: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Seconds since UNIX epoch
    pub timestamp: f64,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Breadcrumb {
    pub fn new(category: impl Into<String>, timestamp: f64) -> Self {
        Self {
            kind: None,
            category: category.into(),
            message: None,
            timestamp,
            data: Map::new(),
        }
    }

    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn timestamp_ms(&self) -> u64 {
        (self.timestamp * 1000.0) as u64
    }
}

/// A span shown on the replay timeline (navigation, etc.)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSpan {
    pub op: String,
    pub description: String,
    /// Seconds since UNIX epoch
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

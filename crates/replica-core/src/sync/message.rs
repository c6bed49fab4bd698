//! Change-feed message types
//!
//! Messages follow the shape-log layout: change messages carry the row key,
//! the row value and an operation header; control messages carry only a
//! control header.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::{Row, RowKey};

/// Row-level operation carried by a change message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Stream-level control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Control {
    /// Initial backfill is complete
    UpToDate,
    /// The server lost our position; local data must be refetched from scratch
    MustRefetch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeHeaders {
    pub operation: Operation,
    /// Position in the log, used to resume after reconnecting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Row,
    pub headers: ChangeHeaders,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlHeaders {
    pub control: Control,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub headers: ControlHeaders,
}

/// Any message on a change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShapeMessage {
    Change(ChangeMessage),
    Control(ControlMessage),
}

impl ShapeMessage {
    pub fn insert(value: Row) -> Self {
        Self::change(Operation::Insert, value)
    }

    pub fn update(value: Row) -> Self {
        Self::change(Operation::Update, value)
    }

    pub fn delete(value: Row) -> Self {
        Self::change(Operation::Delete, value)
    }

    pub fn change(operation: Operation, value: Row) -> Self {
        ShapeMessage::Change(ChangeMessage {
            key: None,
            value,
            headers: ChangeHeaders {
                operation,
                offset: None,
                extra: Map::new(),
            },
        })
    }

    pub fn up_to_date() -> Self {
        Self::control(Control::UpToDate)
    }

    pub fn must_refetch() -> Self {
        Self::control(Control::MustRefetch)
    }

    fn control(control: Control) -> Self {
        ShapeMessage::Control(ControlMessage {
            headers: ControlHeaders { control },
        })
    }

    /// Attach a log key, e.g. `"public"."spaces"/"abc"`
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        if let ShapeMessage::Change(change) = &mut self {
            change.key = Some(key.into());
        }
        self
    }

    pub fn offset(&self) -> Option<&str> {
        match self {
            ShapeMessage::Change(change) => change.headers.offset.as_deref(),
            ShapeMessage::Control(_) => None,
        }
    }

    /// Decode a frame holding either one message or an array of messages
    pub fn decode_batch(text: &str) -> Result<Vec<ShapeMessage>, serde_json::Error> {
        match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
            single => Ok(vec![serde_json::from_value(single)?]),
        }
    }
}

impl ChangeMessage {
    pub fn operation(&self) -> Operation {
        self.headers.operation
    }

    /// Row identity from the primary-key columns of the value, falling back to
    /// the quoted segments of the message key
    pub fn row_key(&self, primary_key: &[String]) -> Option<RowKey> {
        if let Some(key) = RowKey::from_row(primary_key, &self.value) {
            return Some(key);
        }

        let segments = key_segments(self.key.as_deref()?);
        // First segment names the relation
        let values = segments.get(1..)?;
        if values.len() != primary_key.len() || values.is_empty() {
            return None;
        }
        Some(RowKey::new(
            primary_key
                .iter()
                .cloned()
                .zip(values.iter().map(|v| Value::String(v.clone())))
                .collect(),
        ))
    }
}

/// Split `"public"."items"/"a"/"b"` into `["public.items", "a", "b"]`,
/// honouring quotes and `""` escapes
fn key_segments(key: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = key.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            '/' if !in_quotes => segments.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    segments.push(current);
    segments
}

//! Event rows as loaded for one aggregated directive.
//!
//! Events are read-only here. The database layer decodes each selected column
//! into an [`EventValue`]; the table formatter and X-ARF mapping read them by
//! IntelMQ field name (`source.ip`, `time.source`, `extra`, ...).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::error::CoreError;

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// A time-zone aware timestamp (`timestamptz` columns).
    Timestamp(DateTime<FixedOffset>),
    /// Already-decoded JSON (e.g. the `extra` column).
    Json(serde_json::Value),
}

impl EventValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Json(serde_json::Value::String(s)) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for EventValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for EventValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for EventValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<DateTime<FixedOffset>> for EventValue {
    fn from(ts: DateTime<FixedOffset>) -> Self {
        Self::Timestamp(ts)
    }
}

impl From<serde_json::Value> for EventValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            other => Self::Json(other),
        }
    }
}

/// One row of the `events` table, restricted to the requested columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Event {
    fields: BTreeMap<String, EventValue>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, returning `self` for chained construction.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: EventValue) {
        self.fields.insert(field.into(), value);
    }

    /// Look up a field. Missing fields and SQL `NULL` both yield `None`.
    pub fn get(&self, field: &str) -> Option<&EventValue> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &EventValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, EventValue)> for Event {
    fn from_iter<I: IntoIterator<Item = (String, EventValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Columns of the `events` table that table formats may read, sorted.
pub const EVENT_COLUMNS: &[&str] = &[
    "classification.identifier",
    "classification.taxonomy",
    "classification.type",
    "comment",
    "destination.abuse_contact",
    "destination.asn",
    "destination.fqdn",
    "destination.geolocation.cc",
    "destination.ip",
    "destination.port",
    "destination.reverse_dns",
    "destination.url",
    "event_description.text",
    "extra",
    "feed.name",
    "feed.provider",
    "malware.hash.md5",
    "malware.hash.sha1",
    "malware.name",
    "malware.version",
    "protocol.application",
    "protocol.transport",
    "raw",
    "source.abuse_contact",
    "source.asn",
    "source.fqdn",
    "source.geolocation.cc",
    "source.geolocation.city",
    "source.ip",
    "source.network",
    "source.port",
    "source.reverse_dns",
    "source.url",
    "time.observation",
    "time.source",
];

pub fn is_event_column(name: &str) -> bool {
    EVENT_COLUMNS.binary_search(&name).is_ok()
}

/// Characters allowed in event column identifiers. These are the characters
/// IntelMQ uses for field names in the events table.
fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Quote an event column name for use in SQL.
///
/// Column names such as `source.asn` contain dots, so they are always
/// double-quoted. Anything outside `[A-Za-z0-9_.]` is rejected rather than
/// escaped.
pub fn escape_sql_identifier(ident: &str) -> Result<String, CoreError> {
    let invalid: String = ident.chars().filter(|c| !is_identifier_char(*c)).collect();
    if ident.is_empty() || !invalid.is_empty() {
        return Err(CoreError::InvalidIdentifier {
            ident: ident.to_string(),
            invalid,
        });
    }
    Ok(format!("\"{ident}\""))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

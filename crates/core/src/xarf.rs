//! X-ARF report schemas.
//!
//! An [`XarfSchema`] maps X-ARF keys to event fields, optionally through a
//! date formatter, and adds fixed values shared by every report of that
//! schema. The machine-readable part is rendered as YAML with `_` in keys
//! replaced by `-`.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::event::{Event, EventValue};

/// How a mapped event field is converted before it goes into the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormatter {
    #[default]
    Plain,
    /// RFC 3339 date in UTC.
    Rfc3339,
    /// RFC 2822 date.
    Rfc2822,
}

/// Source of one X-ARF key: an event field name, or a field plus formatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldMapping {
    Field(String),
    Formatted {
        field: String,
        #[serde(default)]
        formatter: FieldFormatter,
    },
}

impl FieldMapping {
    pub fn field(&self) -> &str {
        match self {
            Self::Field(field) | Self::Formatted { field, .. } => field,
        }
    }

    fn formatter(&self) -> FieldFormatter {
        match self {
            Self::Field(_) => FieldFormatter::Plain,
            Self::Formatted { formatter, .. } => *formatter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XarfSchema {
    /// Values that are the same for every report of this schema
    /// (`schema_url`, `category`, `report_type`, ...).
    pub static_fields: BTreeMap<String, Value>,
    pub event_mapping: BTreeMap<String, FieldMapping>,
}

impl XarfSchema {
    /// Event columns needed to fill the mapping.
    pub fn event_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .event_mapping
            .values()
            .map(|m| m.field().to_string())
            .collect();
        columns.sort();
        columns.dedup();
        columns
    }

    /// Report parameters for one event: the static fields plus every mapped
    /// field that is set in the event.
    pub fn params(&self, event: &Event) -> Result<BTreeMap<String, Value>, CoreError> {
        let mut params = self.static_fields.clone();
        for (key, mapping) in &self.event_mapping {
            if let Some(value) = event.get(mapping.field()) {
                params.insert(key.clone(), format_value(value, mapping.formatter())?);
            }
        }
        Ok(params)
    }
}

fn format_value(value: &EventValue, formatter: FieldFormatter) -> Result<Value, CoreError> {
    if formatter == FieldFormatter::Plain {
        return Ok(match value {
            EventValue::Null => Value::Null,
            EventValue::Bool(b) => Value::Bool(*b),
            EventValue::Integer(i) => Value::from(*i),
            EventValue::Float(x) => Value::from(*x),
            EventValue::Text(s) => Value::String(s.clone()),
            EventValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            EventValue::Json(v) => v.clone(),
        });
    }

    let ts: DateTime<FixedOffset> = match value {
        EventValue::Timestamp(ts) => *ts,
        EventValue::Text(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|_| CoreError::InvalidTimestamp(s.clone()))?,
        other => return Err(CoreError::InvalidTimestamp(other.to_string())),
    };
    Ok(Value::String(match formatter {
        FieldFormatter::Rfc2822 => ts.to_rfc2822(),
        _ => ts.with_timezone(&Utc).to_rfc3339(),
    }))
}

/// Render report parameters as the YAML document of an X-ARF mail.
pub fn to_yaml(params: &BTreeMap<String, Value>) -> Result<String, serde_yaml::Error> {
    let dashed: BTreeMap<String, &Value> = params
        .iter()
        .map(|(k, v)| (k.replace('_', "-"), v))
        .collect();
    serde_yaml::to_string(&dashed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

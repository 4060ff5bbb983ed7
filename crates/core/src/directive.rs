//! Aggregated notification directives.
//!
//! A [`Directive`] is materialized fresh for every run from the pending rows
//! of the `directives` table. All rows merged into one `Directive` share the
//! recipient, template, notification format, event data format and
//! aggregation identifier; only the event and directive ids are collected.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

/// Aggregation key whose value, when present, is the observation time of the
/// events in the group.
pub const OBSERVATION_TIME_KEY: &str = "time.observation";

/// A group of pending directives that will result in one notification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub recipient_address: String,
    pub template_name: String,
    pub notification_format: String,
    pub event_data_format: String,
    /// Additional key/value pairs the directives were aggregated by, e.g.
    /// `source.asn`.
    pub aggregate_identifier: BTreeMap<String, String>,
    pub event_ids: Vec<DbId>,
    pub directive_ids: Vec<DbId>,
    /// Insertion time of the newest directive in the group.
    pub inserted_at: Timestamp,
    #[serde(rename = "notification_interval_secs", with = "interval_secs")]
    pub notification_interval: Duration,
    /// When the last similar notification was sent, if ever.
    pub last_sent: Option<Timestamp>,
}

impl Directive {
    /// Look up an item in the aggregation identifier.
    pub fn aggregation_item(&self, key: &str) -> Option<&str> {
        self.aggregate_identifier.get(key).map(String::as_str)
    }

    /// Whether more than the notification interval has passed since the last
    /// similar notification. A group that was never sent counts as exceeded.
    pub fn interval_exceeded(&self, now: Timestamp) -> bool {
        match self.last_sent {
            None => true,
            Some(last_sent) => last_sent + self.notification_interval < now,
        }
    }

    pub fn age_of_newest_directive(&self, now: Timestamp) -> Duration {
        now - self.inserted_at
    }

    /// Age of the events, derived from the `time.observation` aggregation
    /// item. Only available when the directives were aggregated by that
    /// field; `Ok(None)` otherwise.
    pub fn age_of_observation(&self, now: Timestamp) -> Result<Option<Duration>, CoreError> {
        self.aggregation_item(OBSERVATION_TIME_KEY)
            .map(|raw| parse_observation_timestamp(raw).map(|t| now - t))
            .transpose()
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}/{}) directives {:?}",
            self.recipient_address,
            self.template_name,
            self.notification_format,
            self.event_data_format,
            self.directive_ids
        )
    }
}

/// Parse a timestamp that an IntelMQ event stored as a string, in the
/// `isoformat()` shape with an explicit `+00:00` offset and optional
/// fractional seconds.
pub fn parse_observation_timestamp(raw: &str) -> Result<Timestamp, CoreError> {
    let naive = raw
        .strip_suffix("+00:00")
        .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .ok_or_else(|| CoreError::InvalidTimestamp(raw.to_string()))?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

mod interval_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::seconds)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

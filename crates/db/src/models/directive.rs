//! Rows of the pending-directive query.

use std::collections::BTreeMap;

use chrono::Duration;
use mailgen_core::directive::Directive;
use mailgen_core::types::{DbId, Timestamp};
use sqlx::types::Json;
use sqlx::FromRow;

/// One aggregated group of pending directives.
#[derive(Debug, Clone, FromRow)]
pub struct PendingDirectiveRow {
    pub recipient_address: String,
    pub template_name: String,
    pub notification_format: String,
    pub event_data_format: String,
    pub aggregate_identifier: Json<BTreeMap<String, serde_json::Value>>,
    pub event_ids: Vec<DbId>,
    pub directive_ids: Vec<DbId>,
    pub inserted_at: Timestamp,
    pub notification_interval_secs: Option<i64>,
    pub last_sent: Option<Timestamp>,
}

impl From<PendingDirectiveRow> for Directive {
    fn from(row: PendingDirectiveRow) -> Self {
        // Aggregation values are compared as strings by scripts and
        // templates; non-string JSON keeps its JSON spelling.
        let aggregate_identifier = row
            .aggregate_identifier
            .0
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect();

        Directive {
            recipient_address: row.recipient_address,
            template_name: row.template_name,
            notification_format: row.notification_format,
            event_data_format: row.event_data_format,
            aggregate_identifier,
            event_ids: row.event_ids,
            directive_ids: row.directive_ids,
            inserted_at: row.inserted_at,
            notification_interval: Duration::seconds(row.notification_interval_secs.unwrap_or(0)),
            last_sent: row.last_sent,
        }
    }
}

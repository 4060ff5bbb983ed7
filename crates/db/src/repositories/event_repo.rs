//! Repository for the `events` table.
//!
//! Events are loaded with a caller-chosen column list. Every column is read
//! in its output form together with its PostgreSQL type name and decoded
//! into an [`EventValue`], which keeps the loader independent of the exact
//! column set an installation's `events` table has.

use chrono::DateTime;
use mailgen_core::error::CoreError;
use mailgen_core::event::{escape_sql_identifier, Event, EventValue};
use mailgen_core::store::StoreError;
use mailgen_core::types::DbId;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

/// Text layout of `timestamptz` values in a session using `TIME ZONE 'UTC'`.
const PG_TIMESTAMPTZ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// Build the select for `columns`. Column `n` is exposed as `v{n}` (text)
/// and `t{n}` (type name).
///
/// Values go through `format('%s', ...)`, which uses the type's output
/// function. A cast to `text` would differ for `inet`, where it always
/// appends the netmask (`192.0.2.1/32`).
pub fn events_query(columns: &[String]) -> Result<String, CoreError> {
    let select = columns
        .iter()
        .enumerate()
        .map(|(n, col)| {
            let ident = escape_sql_identifier(col)?;
            Ok(format!(
                "CASE WHEN {ident} IS NULL THEN NULL ELSE format('%s', {ident}) END AS v{n}, \
                 pg_typeof({ident})::text AS t{n}"
            ))
        })
        .collect::<Result<Vec<_>, CoreError>>()?;

    let select = if select.is_empty() {
        "id".to_string()
    } else {
        select.join(", ")
    };
    Ok(format!(
        "SELECT {select} FROM events WHERE id = ANY ($1) ORDER BY id"
    ))
}

/// Decode one column from its text form according to its type name.
pub fn decode_value(column: &str, type_name: &str, raw: Option<String>) -> Result<EventValue, StoreError> {
    let Some(raw) = raw else {
        return Ok(EventValue::Null);
    };
    let bad = |message: String| StoreError::Decode {
        column: column.to_string(),
        message,
    };
    let value = match type_name {
        "smallint" | "integer" | "bigint" => {
            EventValue::Integer(raw.parse().map_err(|e| bad(format!("{e}: {raw:?}")))?)
        }
        "real" | "double precision" | "numeric" => {
            EventValue::Float(raw.parse().map_err(|e| bad(format!("{e}: {raw:?}")))?)
        }
        "boolean" => EventValue::Bool(raw == "t" || raw == "true"),
        "timestamp with time zone" => EventValue::Timestamp(
            DateTime::parse_from_str(&raw, PG_TIMESTAMPTZ_FORMAT)
                .map_err(|e| bad(format!("{e}: {raw:?}")))?,
        ),
        // JSON stays text; consumers decode it when they need it.
        _ => EventValue::Text(raw),
    };
    Ok(value)
}

fn decode_row(row: &PgRow, columns: &[String]) -> Result<Event, StoreError> {
    let mut event = Event::new();
    for (n, column) in columns.iter().enumerate() {
        let raw: Option<String> = row.try_get(n * 2).map_err(StoreError::backend)?;
        let type_name: String = row.try_get(n * 2 + 1).map_err(StoreError::backend)?;
        event.insert(column.clone(), decode_value(column, &type_name, raw)?);
    }
    Ok(event)
}

/// Read access to events.
pub struct EventRepo;

impl EventRepo {
    /// Load the events with the given ids, restricted to `columns`, ordered
    /// by id.
    pub async fn load(
        conn: &mut PgConnection,
        event_ids: &[DbId],
        columns: &[String],
    ) -> Result<Vec<Event>, StoreError> {
        let query = events_query(columns)?;
        let rows = sqlx::query(&query)
            .bind(event_ids)
            .fetch_all(conn)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(|row| decode_row(row, columns)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

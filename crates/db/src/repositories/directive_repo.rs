//! Repository for the `directives` and `sent` tables.

use mailgen_core::store::DirectiveFilter;
use mailgen_core::types::{DbId, Timestamp};
use sqlx::PgConnection;

use crate::models::directive::PendingDirectiveRow;

/// Groups all unsent e-mail directives that can be locked right now.
///
/// The inner select takes the row locks (`FOR UPDATE NOWAIT`) so that two
/// concurrent runs never process the same directive. `{join}` and
/// `{filter}` are replaced by [`pending_query`].
const PENDING_QUERY: &str = "\
   SELECT d.recipient_address,
          d.template_name,
          d.notification_format,
          d.event_data_format,
          d.aggregate_identifier,
          array_agg(d.events_id ORDER BY d.id) AS event_ids,
          array_agg(d.id ORDER BY d.id) AS directive_ids,
          max(d.inserted_at) AS inserted_at,
          EXTRACT(EPOCH FROM max(d.notification_interval))::bigint
              AS notification_interval_secs,
          (SELECT s.sent_at
             FROM directives AS d2
             JOIN sent AS s ON d2.sent_id = s.id
            WHERE d2.recipient_address = d.recipient_address
              AND d2.template_name = d.template_name
              AND d2.notification_format = d.notification_format
              AND d2.event_data_format = d.event_data_format
              AND d2.aggregate_identifier = d.aggregate_identifier
         ORDER BY d2.inserted_at DESC
            LIMIT 1) AS last_sent
     FROM (SELECT directives.id, directives.events_id,
                  directives.recipient_address, directives.template_name,
                  directives.notification_format, directives.event_data_format,
                  directives.notification_interval,
                  directives.aggregate_identifier, directives.inserted_at
             FROM directives
             {join}
            WHERE directives.sent_id IS NULL
              AND directives.medium = 'email'
              AND directives.endpoint = 'source'
              {filter}
              FOR UPDATE NOWAIT) AS d
 GROUP BY d.recipient_address, d.template_name, d.notification_format,
          d.event_data_format, d.aggregate_identifier
 ORDER BY min(d.id)";

/// Build the pending-directive query for an optional extra predicate.
pub fn pending_query(filter: Option<&DirectiveFilter>) -> String {
    let (join, predicate) = match filter {
        Some(f) => {
            let join = if f.references_events() {
                "JOIN events ON directives.events_id = events.id"
            } else {
                ""
            };
            (join, format!("AND ({})", f.as_sql()))
        }
        None => ("", String::new()),
    };
    PENDING_QUERY
        .replace("{join}", join)
        .replace("{filter}", &predicate)
}

/// Queries over directives and sent records.
pub struct DirectiveRepo;

impl DirectiveRepo {
    /// Lock and aggregate the pending directives.
    ///
    /// Returns `Ok(None)` when another transaction holds a lock on any of
    /// the rows.
    pub async fn fetch_pending(
        conn: &mut PgConnection,
        filter: Option<&DirectiveFilter>,
    ) -> Result<Option<Vec<PendingDirectiveRow>>, sqlx::Error> {
        let query = pending_query(filter);
        match sqlx::query_as::<_, PendingDirectiveRow>(&query)
            .fetch_all(conn)
            .await
        {
            Ok(rows) => Ok(Some(rows)),
            Err(e) if crate::is_lock_not_available(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert one `sent` row and point the directives at it, in a single
    /// statement. Returns the new `sent` id.
    pub async fn mark_sent(
        conn: &mut PgConnection,
        directive_ids: &[DbId],
        ticket: &str,
        sent_at: Timestamp,
    ) -> Result<DbId, sqlx::Error> {
        sqlx::query_scalar(
            "WITH sent_row AS ( \
                 INSERT INTO sent (intelmq_ticket, sent_at) \
                 VALUES ($1, $2) \
                 RETURNING id \
             ), \
             updated AS ( \
                 UPDATE directives \
                    SET sent_id = (SELECT id FROM sent_row) \
                  WHERE id = ANY ($3) \
             ) \
             SELECT id FROM sent_row",
        )
        .bind(ticket)
        .bind(sent_at)
        .bind(directive_ids)
        .fetch_one(conn)
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

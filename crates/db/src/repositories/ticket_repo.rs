//! Repository for the ticket sequence (`intelmq_ticket_seq`, `ticket_day`).

use chrono::NaiveDate;
use mailgen_core::store::StoreError;
use mailgen_core::ticket::{check_ticket_day, SequenceAction, Ticket};
use sqlx::PgConnection;

use crate::models::ticket::{TicketDrawRow, TicketSequenceRow};

const DRAW_QUERY: &str = "\
    SELECT to_char(now(), 'YYYYMMDD') AS today, \
           (SELECT to_char(initialized_for_day, 'YYYYMMDD') FROM ticket_day) AS initialized_for, \
           nextval('intelmq_ticket_seq') AS sequence";

fn parse_day(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|e| StoreError::Decode {
        column: "ticket_day.initialized_for_day".to_string(),
        message: format!("{e}: {raw:?}"),
    })
}

fn missing_marker() -> StoreError {
    StoreError::Decode {
        column: "ticket_day.initialized_for_day".to_string(),
        message: "ticket_day has no row".to_string(),
    }
}

/// Ticket allocation.
pub struct TicketRepo;

impl TicketRepo {
    /// Draw a new ticket. When the day marker lies before today, the
    /// sequence is restarted and the marker moved before the number is
    /// drawn again. A marker after today is a fatal clock-skew error.
    pub async fn new_ticket(conn: &mut PgConnection) -> Result<Ticket, StoreError> {
        let mut draw = Self::draw(conn).await?;
        let today = parse_day(&draw.today)?;
        let initialized_for = parse_day(draw.initialized_for.as_deref().ok_or_else(missing_marker)?)?;

        if check_ticket_day(today, initialized_for)? == SequenceAction::Reset {
            tracing::debug!(%today, "New day, resetting the ticket sequence");
            sqlx::query("ALTER SEQUENCE intelmq_ticket_seq RESTART")
                .execute(&mut *conn)
                .await
                .map_err(StoreError::backend)?;
            sqlx::query("UPDATE ticket_day SET initialized_for_day = $1")
                .bind(today)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::backend)?;
            draw = Self::draw(conn).await?;
        }

        let ticket = Ticket::new(parse_day(&draw.today)?, draw.sequence);
        tracing::debug!(%ticket, "New ticket number");
        Ok(ticket)
    }

    /// The most recently drawn ticket, or `None` if the sequence has not
    /// been used since it was last restarted.
    pub async fn last_ticket(conn: &mut PgConnection) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query_as::<_, TicketSequenceRow>(
            "SELECT (SELECT to_char(initialized_for_day, 'YYYYMMDD') FROM ticket_day) \
                        AS initialized_for, \
                    last_value, is_called \
               FROM intelmq_ticket_seq",
        )
        .fetch_one(conn)
        .await
        .map_err(StoreError::backend)?;

        if !row.is_called {
            return Ok(None);
        }
        let day = parse_day(row.initialized_for.as_deref().ok_or_else(missing_marker)?)?;
        Ok(Some(Ticket::new(day, row.last_value)))
    }

    async fn draw(conn: &mut PgConnection) -> Result<TicketDrawRow, StoreError> {
        sqlx::query_as::<_, TicketDrawRow>(DRAW_QUERY)
            .fetch_one(conn)
            .await
            .map_err(StoreError::backend)
    }
}

//! Rows read while drawing ticket numbers.

use sqlx::FromRow;

/// Today's date, the day marker and the next sequence value, read in one
/// statement.
#[derive(Debug, Clone, FromRow)]
pub struct TicketDrawRow {
    pub today: String,
    pub initialized_for: Option<String>,
    pub sequence: i64,
}

/// State of the ticket sequence without advancing it.
#[derive(Debug, Clone, FromRow)]
pub struct TicketSequenceRow {
    pub initialized_for: Option<String>,
    pub last_value: i64,
    pub is_called: bool,
}

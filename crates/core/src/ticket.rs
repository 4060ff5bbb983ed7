//! Day-scoped ticket numbers.
//!
//! A ticket has the form `YYYYMMDD-XXXXXXXX`: the day the sequence was last
//! reset and an 8-digit, zero-padded sequence number. The sequence restarts
//! every day. A day marker that lies in the future means the sequence may
//! already have handed out numbers for a day that has not started yet, so
//! drawing must stop instead of risking reuse.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const DAY_FORMAT: &str = "%Y%m%d";

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error(
        "initialized_for_day='{}' is in the future from now ({}). \
         Stopping to avoid reusing ticket numbers",
        .initialized_for.format(DAY_FORMAT),
        .today.format(DAY_FORMAT)
    )]
    ClockSkew {
        initialized_for: NaiveDate,
        today: NaiveDate,
    },

    #[error("Malformed ticket {0:?}")]
    Malformed(String),
}

/// A unique ticket identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticket {
    day: NaiveDate,
    raw: String,
}

impl Ticket {
    /// Build the ticket for `sequence` on `day`. Only the last eight digits
    /// of the sequence number are used.
    pub fn new(day: NaiveDate, sequence: i64) -> Self {
        let digits = format!("{sequence:08}");
        let tail = &digits[digits.len() - 8..];
        Self {
            day,
            raw: format!("{}-{tail}", day.format(DAY_FORMAT)),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, TicketError> {
        let malformed = || TicketError::Malformed(raw.to_string());
        let (day, seq) = raw.split_once('-').ok_or_else(malformed)?;
        let eight_digits = |s: &str| s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit());
        if !eight_digits(day) || !eight_digits(seq) {
            return Err(malformed());
        }
        let day = NaiveDate::parse_from_str(day, DAY_FORMAT).map_err(|_| malformed())?;
        Ok(Self {
            day,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Ticket {
    type Error = TicketError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Ticket> for String {
    fn from(ticket: Ticket) -> Self {
        ticket.raw
    }
}

/// What to do with the sequence before drawing the next number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceAction {
    /// The marker matches today; draw from the running sequence.
    Continue,
    /// A new day has started; restart the sequence and move the marker.
    Reset,
}

/// Compare the day marker with today's date.
pub fn check_ticket_day(
    today: NaiveDate,
    initialized_for: NaiveDate,
) -> Result<SequenceAction, TicketError> {
    if initialized_for > today {
        return Err(TicketError::ClockSkew {
            initialized_for,
            today,
        });
    }
    if initialized_for < today {
        Ok(SequenceAction::Reset)
    } else {
        Ok(SequenceAction::Continue)
    }
}

/// In-memory ticket sequencer following the same reset rule as the database
/// sequence. Used by stores that do not keep state in PostgreSQL.
#[derive(Debug, Clone)]
pub struct TicketSequencer {
    initialized_for: NaiveDate,
    last_value: i64,
}

impl TicketSequencer {
    pub fn new(initialized_for: NaiveDate) -> Self {
        Self {
            initialized_for,
            last_value: 0,
        }
    }

    pub fn draw(&mut self, today: NaiveDate) -> Result<Ticket, TicketError> {
        if check_ticket_day(today, self.initialized_for)? == SequenceAction::Reset {
            self.initialized_for = today;
            self.last_value = 0;
        }
        self.last_value += 1;
        Ok(Ticket::new(self.initialized_for, self.last_value))
    }

    /// The most recently drawn ticket (sequence value 0 if none was drawn).
    pub fn last(&self) -> Ticket {
        Ticket::new(self.initialized_for, self.last_value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

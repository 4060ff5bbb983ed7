//! The persistence seam of the pipeline.
//!
//! [`NotificationStore`] is everything the orchestrator and scripts need from
//! the database: locked retrieval of pending directives, event loading,
//! ticket allocation, marking directives as sent and savepoints. All calls
//! run inside one transaction owned by the store; committing or rolling it
//! back is up to the owner of the concrete store.

use async_trait::async_trait;

use crate::directive::Directive;
use crate::error::CoreError;
use crate::event::Event;
use crate::ticket::{Ticket, TicketError};
use crate::types::{DbId, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Cannot decode column {column:?}: {message}")]
    Decode { column: String, message: String },
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    /// Errors after which no further directive may be processed in this run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Ticket(TicketError::ClockSkew { .. }))
    }
}

/// Additional SQL predicate narrowing the pending directives, e.g.
/// `directives.template_name = 'x'` or `events."source.asn" = 64496`.
///
/// The predicate is inserted into the query verbatim. It comes from the
/// operator's command line, never from event data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveFilter(String);

impl DirectiveFilter {
    pub fn new(predicate: impl Into<String>) -> Self {
        Self(predicate.into())
    }

    pub fn as_sql(&self) -> &str {
        &self.0
    }

    /// Whether the predicate refers to event columns, which requires joining
    /// the events table.
    pub fn references_events(&self) -> bool {
        self.0.contains("events.")
    }
}

/// Result of [`NotificationStore::fetch_pending`].
#[derive(Debug, Clone, PartialEq)]
pub enum PendingDirectives {
    /// Another instance holds the lock on the pending rows. Not an error:
    /// the run ends without doing anything.
    Locked,
    Ready(Vec<Directive>),
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Lock and aggregate all directives that have not been sent yet.
    async fn fetch_pending(
        &mut self,
        filter: Option<&DirectiveFilter>,
    ) -> Result<PendingDirectives, StoreError>;

    /// Load the given events, restricted to `columns`.
    async fn load_events(
        &mut self,
        event_ids: &[DbId],
        columns: &[String],
    ) -> Result<Vec<Event>, StoreError>;

    /// Draw a fresh ticket, resetting the sequence on a new day.
    async fn new_ticket(&mut self) -> Result<Ticket, StoreError>;

    /// The ticket most recently handed out, if the sequence was ever used.
    async fn last_ticket(&mut self) -> Result<Option<Ticket>, StoreError>;

    /// Record one sent notification and link the directives to it. Returns
    /// the id of the new `sent` row.
    async fn mark_sent(
        &mut self,
        directive_ids: &[DbId],
        ticket: &Ticket,
        sent_at: Timestamp,
    ) -> Result<DbId, StoreError>;

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

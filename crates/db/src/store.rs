//! Transaction-scoped PostgreSQL store.

use async_trait::async_trait;
use mailgen_core::directive::Directive;
use mailgen_core::event::Event;
use mailgen_core::store::{DirectiveFilter, NotificationStore, PendingDirectives, StoreError};
use mailgen_core::ticket::Ticket;
use mailgen_core::types::{DbId, Timestamp};
use sqlx::{Postgres, Transaction};

use crate::repositories::{DirectiveRepo, EventRepo, TicketRepo};
use crate::DbPool;

/// A [`NotificationStore`] running every call inside one transaction.
///
/// The transaction is rolled back when the store is dropped without
/// [`PgStore::commit`], so every exit path ends the transaction.
pub struct PgStore {
    tx: Transaction<'static, Postgres>,
}

impl PgStore {
    /// Begin the run's transaction. The session time zone is set to UTC so
    /// dates and timestamps read as text are unambiguous.
    pub async fn begin(pool: &DbPool) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TIME ZONE 'UTC'").execute(&mut *tx).await?;
        Ok(Self { tx })
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }

    async fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }
}

/// Savepoint names are interpolated into SQL, so only plain identifiers are
/// accepted.
fn savepoint_ident(name: &str) -> Result<&str, StoreError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::Core(mailgen_core::error::CoreError::Validation(
            format!("invalid savepoint name {name:?}"),
        )))
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn fetch_pending(
        &mut self,
        filter: Option<&DirectiveFilter>,
    ) -> Result<PendingDirectives, StoreError> {
        let rows = DirectiveRepo::fetch_pending(&mut self.tx, filter)
            .await
            .map_err(StoreError::backend)?;
        Ok(match rows {
            None => {
                tracing::info!(
                    "Could not get db lock for pending notifications. \
                     Probably another instance is running"
                );
                PendingDirectives::Locked
            }
            Some(rows) => PendingDirectives::Ready(rows.into_iter().map(Directive::from).collect()),
        })
    }

    async fn load_events(
        &mut self,
        event_ids: &[DbId],
        columns: &[String],
    ) -> Result<Vec<Event>, StoreError> {
        EventRepo::load(&mut self.tx, event_ids, columns).await
    }

    async fn new_ticket(&mut self) -> Result<Ticket, StoreError> {
        TicketRepo::new_ticket(&mut self.tx).await
    }

    async fn last_ticket(&mut self) -> Result<Option<Ticket>, StoreError> {
        TicketRepo::last_ticket(&mut self.tx).await
    }

    async fn mark_sent(
        &mut self,
        directive_ids: &[DbId],
        ticket: &Ticket,
        sent_at: Timestamp,
    ) -> Result<DbId, StoreError> {
        tracing::debug!(?directive_ids, %ticket, "Marking directives as sent");
        DirectiveRepo::mark_sent(&mut self.tx, directive_ids, ticket.as_str(), sent_at)
            .await
            .map_err(StoreError::backend)
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let sql = format!("SAVEPOINT {}", savepoint_ident(name)?);
        self.execute(&sql).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", savepoint_ident(name)?);
        self.execute(&sql).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let sql = format!("RELEASE SAVEPOINT {}", savepoint_ident(name)?);
        self.execute(&sql).await
    }
}

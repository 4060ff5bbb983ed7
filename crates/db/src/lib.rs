//! PostgreSQL persistence for the notification pipeline.
//!
//! [`store::PgStore`] implements [`mailgen_core::store::NotificationStore`]
//! on top of one transaction. The queries themselves live in the
//! repositories, which take a `&mut PgConnection` so they can run inside
//! that transaction.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

pub mod models;
pub mod repositories;
pub mod store;

pub use store::PgStore;

pub type DbPool = sqlx::PgPool;

/// SQLSTATE raised when `FOR UPDATE NOWAIT` cannot lock a row.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Create a connection pool.
///
/// A run needs a single connection; the pool only exists so the connection
/// is released on every exit path.
pub async fn create_pool(options: PgConnectOptions) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
}

/// Verify the database answers queries.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the bundled migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Whether `err` is PostgreSQL refusing a row lock held by someone else.
pub fn is_lock_not_available(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE)
}

//! Scalar types shared by every layer.

/// Ids of event, directive and sent rows (PostgreSQL BIGSERIAL).
pub type DbId = i64;

/// Point in time in UTC: insertion, sending and mail dates.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

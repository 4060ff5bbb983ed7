//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async query methods
//! that accept `&mut PgConnection` as the first argument, so callers decide
//! which transaction they run in.

pub mod directive_repo;
pub mod event_repo;
pub mod ticket_repo;

pub use directive_repo::DirectiveRepo;
pub use event_repo::EventRepo;
pub use ticket_repo::TicketRepo;

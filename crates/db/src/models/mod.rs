//! Row types read from the database.

pub mod directive;
pub mod ticket;

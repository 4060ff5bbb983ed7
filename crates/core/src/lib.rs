//! Domain types for the notification pipeline.
//!
//! This crate is pure: no database and no network access. It provides
//!
//! - [`directive::Directive`]: an aggregated group of pending directives.
//! - [`event::Event`]: a read-only event row with typed values.
//! - [`ticket::Ticket`]: day-scoped ticket numbers and the reset rule.
//! - [`tableformat::TableFormat`]: column specs and CSV rendering.
//! - [`template::Template`]: subject/body templates and the file store.
//! - [`store::NotificationStore`]: the seam implemented by the database layer.
//! - [`scripting`]: subprocess management shared by plugins and signing.

pub mod directive;
pub mod error;
pub mod event;
pub mod scripting;
pub mod store;
pub mod tableformat;
pub mod template;
pub mod ticket;
pub mod types;
#[cfg(feature = "xarf")]
pub mod xarf;

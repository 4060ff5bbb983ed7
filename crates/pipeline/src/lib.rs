//! The notification pipeline.
//!
//! - [`script`]: the [`script::Script`] trait and the ordered registry that
//!   dispatches a directive to the first script with a result.
//! - [`process_script`]: plugins that run as executables speaking JSON.
//! - [`context`]: what scripts may do while handling one directive.
//! - [`orchestrator`]: savepoint-scoped processing of pending directives.
//! - [`operator`]: interactive batch confirmation.

pub mod context;
pub mod error;
pub mod notification;
pub mod operator;
pub mod orchestrator;
pub mod process_script;
pub mod script;

pub use context::{CsvOptions, NotificationContext, NotificationSettings};
pub use error::{PipelineError, ScriptLoadError};
pub use notification::Notification;
pub use orchestrator::{Orchestrator, RunOutcome, RunSummary};
pub use script::{Script, ScriptOutcome, ScriptRegistry};

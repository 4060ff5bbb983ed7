use std::path::PathBuf;

use mailgen_core::error::CoreError;
use mailgen_core::scripting::executor::ScriptError;
use mailgen_core::store::StoreError;
use mailgen_core::tableformat::TableFormatError;
use mailgen_core::template::TemplateError;
use mailgen_mail::{MailError, SignError};

/// Errors raised while turning one directive into notifications and sending
/// them.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The directive itself cannot be processed.
    #[error("Invalid directive: {0}")]
    InvalidDirective(String),

    /// The template named by a directive or script is missing or unreadable.
    #[error("Invalid template {name:?}: {source}")]
    InvalidTemplate {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    TableFormat(#[from] TableFormatError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("Script {name:?} failed: {source}")]
    Script {
        name: String,
        #[source]
        source: ScriptError,
    },

    #[error("Script {name:?} answered with an invalid response: {message}")]
    ScriptProtocol { name: String, message: String },

    #[error("Cannot generate emails for directive {0}")]
    NoScriptResult(String),

    #[cfg(feature = "xarf")]
    #[error("Cannot render X-ARF report: {0}")]
    Xarf(#[from] serde_yaml::Error),

    #[error("Operator prompt failed: {0}")]
    Prompt(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the error is about the directive rather than about the
    /// environment. Invalid templates count as invalid directives.
    pub fn is_invalid_directive(&self) -> bool {
        matches!(
            self,
            Self::InvalidDirective(_) | Self::InvalidTemplate { .. }
        )
    }

    /// Errors that must end the run once the current savepoint has been
    /// rolled back.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Errors found while loading the plugin scripts. Any of them stops the
/// program before a single directive is processed.
#[derive(Debug, thiserror::Error)]
pub enum ScriptLoadError {
    #[error("Cannot read script directory {dir:?}: {source}")]
    ReadDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{count} error(s) found while loading scripts from {dir:?}, see log for details")]
    Invalid { dir: PathBuf, count: usize },

    #[error("Could not load any scripts from {0:?}")]
    Empty(PathBuf),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

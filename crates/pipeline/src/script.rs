//! Notification scripts and their ordered dispatch.
//!
//! Scripts are tried in file name order. The first one that produces a
//! result decides what happens with the directive. A script that fails is
//! logged and skipped, unless the failure is fatal for the whole run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::NotificationContext;
use crate::error::{PipelineError, ScriptLoadError};
use crate::notification::Notification;
use crate::process_script::ProcessScript;

/// What a script decided for a directive.
#[derive(Debug)]
pub enum ScriptOutcome {
    /// The script does not handle this directive; try the next one.
    NoResult,
    /// The script handles the directive, but not yet (e.g. the notification
    /// interval has not passed).
    Postponed,
    Notify(Vec<Notification>),
}

impl ScriptOutcome {
    /// Whether the outcome ends dispatch. An empty notification list does
    /// not count as a result.
    pub fn is_result(&self) -> bool {
        match self {
            Self::NoResult => false,
            Self::Postponed => true,
            Self::Notify(notifications) => !notifications.is_empty(),
        }
    }
}

#[async_trait]
pub trait Script: Send + Sync {
    /// Name used in log messages.
    fn name(&self) -> &str;

    async fn create_notifications(
        &self,
        ctx: &mut NotificationContext<'_>,
    ) -> Result<ScriptOutcome, PipelineError>;
}

/// Whether `file_name` follows the plugin naming convention: at least two
/// leading digits, e.g. `10shadowserver` or `99-fallback`.
pub fn is_script_name(file_name: &str) -> bool {
    let mut bytes = file_name.bytes();
    matches!(
        (bytes.next(), bytes.next()),
        (Some(a), Some(b)) if a.is_ascii_digit() && b.is_ascii_digit()
    )
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The ordered list of scripts used for every directive of a run.
pub struct ScriptRegistry {
    scripts: Vec<Box<dyn Script>>,
}

impl ScriptRegistry {
    pub fn from_scripts(scripts: Vec<Box<dyn Script>>) -> Self {
        Self { scripts }
    }

    /// Load every plugin executable in `dir`, sorted by file name.
    ///
    /// All files are checked before failing, so that one run of the program
    /// reports every broken plugin at once.
    pub async fn load(dir: &Path, timeout: Option<Duration>) -> Result<Self, ScriptLoadError> {
        let read_err = |source| ScriptLoadError::ReadDir {
            dir: dir.to_path_buf(),
            source,
        };
        let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
        let mut paths: Vec<(String, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_script_name(&name) {
                paths.push((name, entry.path()));
            }
        }
        paths.sort();

        let mut scripts: Vec<Box<dyn Script>> = Vec::with_capacity(paths.len());
        let mut errors = 0;
        for (name, path) in paths {
            tracing::debug!(script = %name, "Loading script");
            match ProcessScript::load(name.clone(), path, timeout).await {
                Ok(script) => scripts.push(Box::new(script)),
                Err(e) => {
                    errors += 1;
                    tracing::error!(script = %name, error = %e, "Cannot load script");
                }
            }
        }

        if errors > 0 {
            return Err(ScriptLoadError::Invalid {
                dir: dir.to_path_buf(),
                count: errors,
            });
        }
        if scripts.is_empty() {
            return Err(ScriptLoadError::Empty(dir.to_path_buf()));
        }
        Ok(Self { scripts })
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.iter().map(|s| s.name())
    }

    /// Run the scripts in order until one produces a result.
    pub async fn dispatch(
        &self,
        ctx: &mut NotificationContext<'_>,
    ) -> Result<ScriptOutcome, PipelineError> {
        for script in &self.scripts {
            tracing::debug!(script = script.name(), "Calling script");
            match script.create_notifications(ctx).await {
                Ok(outcome) if outcome.is_result() => return Ok(outcome),
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        script = script.name(),
                        error = %e,
                        "Error while running script"
                    );
                }
            }
        }
        Err(PipelineError::NoScriptResult(ctx.directive().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

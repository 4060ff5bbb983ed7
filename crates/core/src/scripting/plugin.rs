//! Executor for plugin executables.
//!
//! Runs the plugin directly (not through a shell) after checking that the
//! file exists and is executable.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::executor::{ScriptError, ScriptExecutor, ScriptInput, ScriptOutput};
use super::subprocess;

/// Whether the file mode carries any execute bit.
pub fn is_executable(mode: u32) -> bool {
    mode & 0o111 != 0
}

/// Executor for plugin executables.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginExecutor;

impl ScriptExecutor for PluginExecutor {
    async fn execute(&self, path: &Path, input: ScriptInput) -> Result<ScriptOutput, ScriptError> {
        let display = path.display().to_string();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| ScriptError::NotFound(display.clone()))?;

        let mode = metadata.permissions().mode();
        if !metadata.is_file() || !is_executable(mode) {
            return Err(ScriptError::PermissionDenied(format!(
                "{display} is not an executable file (mode {mode:#o})"
            )));
        }

        let mut cmd = tokio::process::Command::new(path);
        subprocess::run_command(&mut cmd, input).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

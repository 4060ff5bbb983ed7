//! Script execution interface and shared types.
//!
//! Defines [`ScriptExecutor`], along with [`ScriptInput`], [`ScriptOutput`],
//! and [`ScriptError`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input passed to a child process.
#[derive(Debug, Clone, Default)]
pub struct ScriptInput {
    /// Extra command line arguments.
    pub args: Vec<String>,
    /// Bytes piped to the process's stdin.
    pub stdin: Vec<u8>,
    /// Additional environment variables set for the child process.
    pub env_vars: Vec<(String, String)>,
    /// Working directory for the child process (uses current dir if `None`).
    pub working_directory: Option<String>,
    /// Maximum wall-clock time before the process is killed. `None` waits
    /// for as long as the process runs.
    pub timeout: Option<Duration>,
}

impl ScriptInput {
    /// Input carrying a JSON document on stdin.
    pub fn json(data: &Value) -> Self {
        Self {
            // Serializing a `Value` cannot fail.
            stdin: serde_json::to_vec(data).unwrap_or_default(),
            ..Self::default()
        }
    }

    /// Input carrying raw bytes on stdin.
    pub fn bytes(stdin: impl Into<Vec<u8>>) -> Self {
        Self {
            stdin: stdin.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured output from a script execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptOutput {
    /// Complete stdout captured from the process.
    pub stdout: String,
    /// Complete stderr captured from the process.
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Stdout parsed as JSON, or `None` if stdout is not valid JSON.
    pub parsed_output: Option<Value>,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`ScriptError::ExecutionFailed`].
    pub fn check_success(self) -> Result<Self, ScriptError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ScriptError::ExecutionFailed {
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Errors that can occur during script execution.
#[derive(Debug)]
pub enum ScriptError {
    /// The script file was not found at the specified path.
    NotFound(String),
    /// The script file exists but lacks execute permissions.
    PermissionDenied(String),
    /// The script exceeded its configured timeout and was killed.
    Timeout {
        /// Elapsed wall-clock time before the process was killed.
        elapsed_ms: u64,
    },
    /// The script ran but exited with a non-zero exit code.
    ExecutionFailed {
        /// Process exit code.
        exit_code: i32,
        /// Captured stderr output.
        stderr: String,
    },
    /// An I/O error occurred while spawning or communicating with the process.
    IoError(std::io::Error),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "Script not found: {path}"),
            Self::PermissionDenied(path) => write!(f, "Permission denied: {path}"),
            Self::Timeout { elapsed_ms } => {
                write!(f, "Script timed out after {elapsed_ms}ms")
            }
            Self::ExecutionFailed { exit_code, stderr } => {
                write!(f, "Script failed with exit code {exit_code}: {stderr}")
            }
            Self::IoError(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}

/// Runs an executable with structured input.
pub trait ScriptExecutor: Send + Sync {
    /// Execute the program at `path` with the given `input`.
    fn execute(
        &self,
        path: &Path,
        input: ScriptInput,
    ) -> impl std::future::Future<Output = Result<ScriptOutput, ScriptError>> + Send;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

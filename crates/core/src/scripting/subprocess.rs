//! Shared subprocess management utilities.
//!
//! Provides [`run_command`]: spawn, feed stdin, capture stdout/stderr and
//! enforce an optional timeout. Callers build the [`tokio::process::Command`]
//! (program, fixed arguments) and delegate the I/O here.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::executor::{ScriptError, ScriptInput, ScriptOutput};

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Output exceeding this limit is truncated to prevent memory exhaustion
/// from extremely verbose scripts.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Spawn `cmd` as a child process, pipe `input.stdin` to it, capture
/// stdout/stderr, and enforce the timeout if one is configured.
///
/// Arguments, environment variables and working directory from
/// [`ScriptInput`] are applied here.
pub async fn run_command(
    cmd: &mut Command,
    input: ScriptInput,
) -> Result<ScriptOutput, ScriptError> {
    // `kill_on_drop(true)` ensures the child is killed when dropped (e.g. on timeout).
    cmd.args(&input.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &input.env_vars {
        cmd.env(key, value);
    }

    if let Some(dir) = &input.working_directory {
        cmd.current_dir(dir);
    }

    let start = Instant::now();

    let mut child = cmd.spawn().map_err(ScriptError::IoError)?;

    // Take stdout/stderr handles and read them in spawned tasks so a large
    // stdin write cannot deadlock against a full output pipe.
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
    let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

    if let Some(mut stdin) = child.stdin.take() {
        // Best-effort write; if the process closes stdin early, ignore the error.
        let _ = stdin.write_all(&input.stdin).await;
        drop(stdin);
    }

    let wait_result = match input.timeout {
        Some(timeout) => tokio::time::timeout(timeout, child.wait()).await,
        None => Ok(child.wait().await),
    };

    match wait_result {
        Ok(Ok(status)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let stdout_bytes = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
            let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
            let exit_code = status.code().unwrap_or(-1);
            let parsed_output = serde_json::from_str(stdout.trim()).ok();

            Ok(ScriptOutput {
                stdout,
                stderr,
                exit_code,
                duration_ms,
                parsed_output,
            })
        }
        Ok(Err(e)) => Err(ScriptError::IoError(e)),
        Err(_elapsed) => {
            // `child` is dropped here, which kills the process.
            Err(ScriptError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scripting::test_helpers::default_input;

    fn bash(script: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn echoes_stdin_and_parses_json() {
        let output = run_command(&mut bash("cat"), default_input())
            .await
            .expect("execute");
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.parsed_output.expect("json")["key"], "value");
    }

    #[tokio::test]
    async fn passes_arguments_and_env() {
        let mut input = ScriptInput::bytes(Vec::new()).with_args(["first"]);
        input.env_vars.push(("MY_VAR".into(), "hello".into()));
        // With `bash -c`, the first extra argument becomes `$0`.
        let output = run_command(&mut bash("echo \"$0 $MY_VAR\""), input)
            .await
            .expect("execute");
        assert_eq!(output.stdout.trim(), "first hello");
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let output = run_command(&mut bash("echo oops >&2; exit 42"), default_input())
            .await
            .expect("execute");
        assert_eq!(output.exit_code, 42);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let input = ScriptInput::default().with_timeout(Duration::from_millis(200));
        let result = run_command(&mut bash("sleep 60"), input).await;
        assert!(matches!(result, Err(ScriptError::Timeout { .. })));
    }

    #[tokio::test]
    async fn large_stdin_does_not_block() {
        let payload = vec![b'x'; 1024 * 1024];
        let output = run_command(&mut bash("cat"), ScriptInput::bytes(payload))
            .await
            .expect("execute");
        assert_eq!(output.stdout.len(), 1024 * 1024);
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let mut cmd = Command::new("/nonexistent/program");
        let result = run_command(&mut cmd, ScriptInput::default()).await;
        assert!(matches!(result, Err(ScriptError::IoError(_))));
    }
}

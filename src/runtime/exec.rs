//! Child process execution with captured output.

use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as ProcessCommand;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::CommandResult;
use crate::error::{Result, SandboxError};

/// Bytes kept per stream for a backend's own control commands.
const CONTROL_OUTPUT_LIMIT: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;

/// Output of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    /// Full byte length of stdout when only a prefix was kept.
    pub stdout_truncated_from: Option<usize>,
    pub stderr_truncated_from: Option<usize>,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn into_result(self) -> CommandResult {
        let success = self.succeeded();
        let error = if success {
            None
        } else if let Some(sig) = self.signal {
            Some(format!("terminated by signal {}", sig))
        } else {
            Some(format!("exited with status {}", self.exit_code.unwrap_or(-1)))
        };
        let mut result = CommandResult {
            success,
            stdout: with_note(self.stdout, self.stdout_truncated_from),
            stderr: with_note(self.stderr, self.stderr_truncated_from),
            exit_code: self.exit_code,
            duration_ms: self.duration_ms,
            error,
            ..Default::default()
        };
        if self.stdout_truncated_from.is_some() || self.stderr_truncated_from.is_some() {
            result
                .metadata
                .insert("output_truncated".to_string(), serde_json::Value::Bool(true));
        }
        result
    }
}

fn with_note(text: String, truncated_from: Option<usize>) -> String {
    match truncated_from {
        Some(total) => format!("{}\n... [output truncated: original length {} bytes]", text, total),
        None => text,
    }
}

/// Spawn a backend control command (availability, removal, stats) and wait for it.
pub async fn run_captured(
    cmd: ProcessCommand,
    stdin: Option<Vec<u8>>,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    run_captured_with_limit(cmd, stdin, CONTROL_OUTPUT_LIMIT, cancel).await
}

/// Spawn `cmd`, optionally feed `stdin`, and wait for it to exit.
///
/// At most `max_output` bytes of each stream are kept; the rest is read and
/// counted so the child never blocks on a full pipe. The child is killed if
/// `cancel` fires first.
pub async fn run_captured_with_limit(
    mut cmd: ProcessCommand,
    stdin: Option<Vec<u8>>,
    max_output: usize,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::BackendExecutionFailed(format!("spawn: {}", e)))?;
    debug!(pid = ?child.id(), "Child spawned");

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = pipe.write_all(&input).await;
                let _ = pipe.shutdown().await;
            });
        }
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let collect = async {
        let (out, err, status) = tokio::join!(
            read_capped(stdout, max_output),
            read_capped(stderr, max_output),
            child.wait(),
        );
        Ok::<_, std::io::Error>((out?, err?, status?))
    };

    let (out, err, status) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
        collected = collect => collected
            .map_err(|e| SandboxError::BackendExecutionFailed(format!("wait: {}", e)))?,
    };

    Ok(ProcessOutput {
        stdout_truncated_from: out.truncated_from(),
        stderr_truncated_from: err.truncated_from(),
        stdout: String::from_utf8_lossy(&out.kept).into_owned(),
        stderr: String::from_utf8_lossy(&err.kept).into_owned(),
        exit_code: status.code(),
        signal: exit_signal(&status),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

#[derive(Default)]
struct Captured {
    kept: Vec<u8>,
    total: usize,
}

impl Captured {
    fn truncated_from(&self) -> Option<usize> {
        (self.total > self.kept.len()).then_some(self.total)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
) -> std::io::Result<Captured> {
    let mut captured = Captured::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(captured);
        }
        captured.total += n;
        let room = limit.saturating_sub(captured.kept.len());
        captured.kept.extend_from_slice(&chunk[..n.min(room)]);
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_status() {
        let mut cmd = ProcessCommand::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let output = run_captured(cmd, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));

        let result = output.into_result();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("exited with status 3"));
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let cmd = ProcessCommand::new("cat");
        let output = run_captured(cmd, Some(b"hello".to_vec()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.succeeded());
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_output_beyond_limit_is_counted_not_kept() {
        let mut cmd = ProcessCommand::new("sh");
        cmd.arg("-c").arg("head -c 100000 /dev/zero | tr '\\0' x; echo done >&2");
        let output = run_captured_with_limit(cmd, None, 10, &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.succeeded());
        assert_eq!(output.stdout, "xxxxxxxxxx");
        assert_eq!(output.stdout_truncated_from, Some(100_000));
        assert_eq!(output.stderr, "done\n");
        assert_eq!(output.stderr_truncated_from, None);

        let result = output.into_result();
        assert!(result
            .stdout
            .ends_with("[output truncated: original length 100000 bytes]"));
        assert_eq!(result.stderr, "done\n");
        assert_eq!(result.metadata["output_truncated"], true);
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let mut cmd = ProcessCommand::new("sleep");
        cmd.arg("30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result = run_captured(cmd, None, &cancel).await;
        assert!(matches!(result, Err(SandboxError::Cancelled)));
        assert!(started.elapsed().as_secs() < 10);
    }
}

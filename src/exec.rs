//! Subprocess executor contract and the tokio-backed default.
//!
//! Checkpoint verification and assault stages run external commands through
//! this seam. The outcome carries everything the caller needs to record a
//! result without re-deriving it: exit code, kill disposition, truncation,
//! and the captured output.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// A command to execute.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// `None` disables the deadline.
    pub timeout: Option<Duration>,
    /// Cap on captured combined output.
    pub max_output_bytes: usize,
}

impl CommandSpec {
    pub fn new(binary: &str, args: Vec<String>) -> Self {
        Self {
            binary: binary.to_string(),
            args,
            cwd: None,
            timeout: None,
            max_output_bytes: 256 * 1024,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Render as a shell-style line for logs.
    pub fn display_line(&self) -> String {
        let mut line = self.binary.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Outcome of a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub success: bool,
    pub duration: Duration,
    pub killed: bool,
    pub kill_reason: Option<String>,
    pub truncated: bool,
    pub error: Option<String>,
    output: String,
}

impl CommandOutcome {
    /// Combined stdout + stderr, already capped.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Fabricate an outcome without running anything. Used by in-process
    /// executor substitutes.
    pub fn synthetic(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code,
            success: exit_code == 0,
            duration: Duration::from_millis(1),
            killed: false,
            kill_reason: None,
            truncated: false,
            error: if exit_code == 0 {
                None
            } else {
                Some(format!("exit code {exit_code}"))
            },
            output: output.to_string(),
        }
    }

    fn spawn_error(error: String) -> Self {
        Self {
            exit_code: -1,
            success: false,
            duration: Duration::ZERO,
            killed: false,
            kill_reason: None,
            truncated: false,
            error: Some(error),
            output: String::new(),
        }
    }
}

/// The executor seam.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, spec: CommandSpec) -> CommandOutcome;
}

/// Default executor backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

#[async_trait]
impl CommandExecutor for TokioExecutor {
    async fn execute(&self, spec: CommandSpec) -> CommandOutcome {
        let start = Instant::now();

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutcome::spawn_error(format!(
                    "failed to spawn {}: {e}",
                    spec.binary
                ));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = spec.max_output_bytes;
        let out_task = tokio::spawn(read_capped(stdout, cap));
        let err_task = tokio::spawn(read_capped(stderr, cap));

        let mut killed = false;
        let mut kill_reason = None;
        let status = match spec.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    killed = true;
                    kill_reason = Some(format!("timeout after {}s", deadline.as_secs()));
                    let _ = child.start_kill();
                    child.wait().await
                }
            },
            None => child.wait().await,
        };

        let (mut output, out_truncated) = out_task.await.unwrap_or_default();
        let (err_output, err_truncated) = err_task.await.unwrap_or_default();
        if !err_output.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&err_output);
        }
        let mut truncated = out_truncated || err_truncated;
        if output.len() > cap {
            let mut end = cap;
            while end > 0 && !output.is_char_boundary(end) {
                end -= 1;
            }
            output.truncate(end);
            truncated = true;
        }

        match status {
            Ok(status) => {
                let exit_code = status.code().unwrap_or(-1);
                CommandOutcome {
                    exit_code,
                    success: status.success() && !killed,
                    duration: start.elapsed(),
                    killed,
                    kill_reason,
                    truncated,
                    error: if status.success() && !killed {
                        None
                    } else if killed {
                        Some("killed".to_string())
                    } else {
                        Some(format!("exit code {exit_code}"))
                    },
                    output,
                }
            }
            Err(e) => CommandOutcome {
                exit_code: -1,
                success: false,
                duration: start.elapsed(),
                killed,
                kill_reason,
                truncated,
                error: Some(format!("wait failed: {e}")),
                output,
            },
        }
    }
}

/// Read a pipe to EOF, retaining at most `cap` bytes.
async fn read_capped(
    pipe: Option<impl AsyncReadExt + Unpin>,
    cap: usize,
) -> (String, bool) {
    let Some(mut pipe) = pipe else {
        return (String::new(), false);
    };
    let mut retained: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0_u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if retained.len() < cap {
                    let take = (cap - retained.len()).min(n);
                    retained.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    // Keep draining so the child never blocks on a full pipe.
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&retained).into_owned(), truncated)
}

//! The `run_command` tool: shell execution with timeout and abort.

use std::{path::PathBuf, time::Duration};

use {
    async_trait::async_trait,
    tokio::process::{Child, Command},
    tracing::{debug, warn},
};

use {
    crate::registry::{CommandRequest, Tool, ToolCtx},
    hearth_common::ToolError,
};

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard cap on caller-supplied timeouts.
const MAX_TIMEOUT_SECS: u64 = 1800;
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Shell command execution inside the session workspace.
pub struct RunCommandTool;

/// Send SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            #[allow(unsafe_code)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill child process");
    }
    let _ = child.wait().await;
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the session workspace. Returns stdout, \
         stderr, and the exit code. Commands judged dangerous require \
         operator approval before they run."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 1800)"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory, relative to the workspace root"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_workspace(&self) -> bool {
        true
    }

    fn command_request(&self, args: &serde_json::Value) -> Option<CommandRequest> {
        let command = args.get("command")?.as_str()?.to_string();
        let cwd = args
            .get("cwd")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();
        Some(CommandRequest { command, cwd })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'command' parameter"))?;

        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(|secs| Duration::from_secs(secs.min(MAX_TIMEOUT_SECS)))
            .unwrap_or(DEFAULT_TIMEOUT);

        // Working directory resolves through the path guard, so `cwd`
        // cannot wander outside the workspace.
        let working_dir: PathBuf = match args.get("cwd").and_then(|v| v.as_str()) {
            Some(dir) if !dir.is_empty() => ctx.path_guard.resolve(dir)?,
            _ => ctx.path_guard.resolve(".")?,
        };

        debug!(command, cwd = %working_dir.display(), timeout_secs = timeout.as_secs(), "run_command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::external(format!("failed to start command: {e}")))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let read_streams = async {
            use tokio::io::AsyncReadExt;
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            (stdout, stderr)
        };

        tokio::select! {
            (stdout, stderr, status) = async {
                let (stdout, stderr) = read_streams.await;
                let status = child.wait().await;
                (stdout, stderr, status)
            } => {
                let status = status
                    .map_err(|e| ToolError::external(format!("failed to reap command: {e}")))?;
                let exit_code = status.code().unwrap_or(-1);
                debug!(exit_code, stdout_len = stdout.len(), "run_command done");
                Ok(serde_json::json!({
                    "stdout": String::from_utf8_lossy(&stdout),
                    "stderr": String::from_utf8_lossy(&stderr),
                    "exit_code": exit_code,
                }))
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(command, "command timed out");
                terminate(&mut child).await;
                Err(ToolError::external(format!(
                    "command timed out after {}s", timeout.as_secs()
                )))
            },
            () = ctx.abort.cancelled() => {
                debug!(command, "command aborted");
                terminate(&mut child).await;
                Err(ToolError::user("command aborted"))
            },
        }
    }
}

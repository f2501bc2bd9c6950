//! The `run_code` tool: capability-restricted script execution.
//!
//! Two dialects. The scripting dialect runs in-process on a fresh rhai
//! engine populated with a captured console, a guarded `fs` facade, path
//! helpers, and URL-encoding helpers — no module loader, timers, network,
//! or process access exists in that scope. The subprocess dialect spawns
//! the platform Python interpreter with the workspace as its working
//! directory.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::Serialize,
    tracing::{debug, warn},
};

use {
    crate::registry::{Tool, ToolCtx},
    hearth_common::ToolError,
    hearth_guard::PathGuard,
};

/// Wall-clock limit for the in-process dialect.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Wall-clock limit for the subprocess dialect.
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);
/// Operation budget for the rhai engine (cheap infinite-loop backstop in
/// addition to the wall clock).
const MAX_SCRIPT_OPERATIONS: u64 = 5_000_000;

/// Result shape shared by both dialects.
#[derive(Debug, Clone, Serialize)]
pub struct CodeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Scripting dialect ───────────────────────────────────────────────────────

/// Run a script on a fresh, capability-scoped engine. Blocking; callers
/// wrap in `spawn_blocking`.
fn run_script(code: &str, guard: &PathGuard, timeout: Duration) -> CodeResult {
    let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let expired = Arc::new(AtomicBool::new(false));

    let mut engine = rhai::Engine::new();
    // No module loader: `import` has nothing to resolve against.
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.set_max_operations(MAX_SCRIPT_OPERATIONS);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);

    // Wall clock enforced from inside the interpreter loop.
    let deadline = std::time::Instant::now() + timeout;
    let expired_flag = Arc::clone(&expired);
    engine.on_progress(move |_ops| {
        if std::time::Instant::now() > deadline {
            expired_flag.store(true, Ordering::SeqCst);
            Some(rhai::Dynamic::from("timeout"))
        } else {
            None
        }
    });

    // Console capture.
    let print_logs = Arc::clone(&logs);
    engine.on_print(move |text| {
        if let Ok(mut sink) = print_logs.lock() {
            sink.push(text.to_string());
        }
    });
    let debug_logs = Arc::clone(&logs);
    engine.on_debug(move |text, _src, _pos| {
        if let Ok(mut sink) = debug_logs.lock() {
            sink.push(text.to_string());
        }
    });

    // Guarded fs facade. Every path resolves through the same guard the
    // file tools use.
    let read_guard = guard.clone();
    engine.register_fn("fs_read", move |path: &str| -> Result<String, Box<rhai::EvalAltResult>> {
        let resolved = read_guard
            .resolve(path)
            .map_err(|e| e.to_string())?;
        std::fs::read_to_string(resolved).map_err(|e| e.to_string().into())
    });
    let write_guard = guard.clone();
    engine.register_fn(
        "fs_write",
        move |path: &str, content: &str| -> Result<(), Box<rhai::EvalAltResult>> {
            let resolved = write_guard
                .resolve(path)
                .map_err(|e| e.to_string())?;
            if let Some(parent) = resolved.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            std::fs::write(resolved, content).map_err(|e| e.to_string().into())
        },
    );
    let list_guard = guard.clone();
    engine.register_fn(
        "fs_list",
        move |path: &str| -> Result<rhai::Array, Box<rhai::EvalAltResult>> {
            let resolved = list_guard
                .resolve(path)
                .map_err(|e| e.to_string())?;
            let entries = std::fs::read_dir(resolved).map_err(|e| e.to_string())?;
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            Ok(names.into_iter().map(rhai::Dynamic::from).collect())
        },
    );

    // Path and URL helpers.
    engine.register_fn("path_join", |a: &str, b: &str| {
        std::path::Path::new(a).join(b).to_string_lossy().to_string()
    });
    engine.register_fn("path_basename", |p: &str| {
        std::path::Path::new(p)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });
    engine.register_fn("path_dirname", |p: &str| {
        std::path::Path::new(p)
            .parent()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });
    engine.register_fn("url_encode", |s: &str| crate::web::encode_query(s));

    let outcome = engine.eval::<rhai::Dynamic>(code);
    let logs = logs.lock().map(|l| l.clone()).unwrap_or_default();

    match outcome {
        Ok(value) => {
            let output = if value.is_unit() {
                None
            } else {
                Some(value.to_string())
            };
            CodeResult {
                success: true,
                output,
                logs,
                error: None,
            }
        },
        Err(e) => {
            let error = if expired.load(Ordering::SeqCst) {
                format!("script timed out after {}s", timeout.as_secs())
            } else {
                e.to_string()
            };
            CodeResult {
                success: false,
                output: None,
                logs,
                error: Some(error),
            }
        },
    }
}

// ── Subprocess dialect ──────────────────────────────────────────────────────

/// Platform interpreter binary.
fn interpreter() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

async fn run_subprocess(
    code: &str,
    guard: &PathGuard,
    timeout: Duration,
    abort: &tokio_util::sync::CancellationToken,
) -> Result<CodeResult, ToolError> {
    let workspace = guard.resolve(".")?;

    let mut child = tokio::process::Command::new(interpreter())
        .arg("-c")
        .arg(code)
        .current_dir(&workspace)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| ToolError::external(format!("failed to start {}: {e}", interpreter())))?;

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
                .map_err(|e| ToolError::external(format!("failed to reap interpreter: {e}")))?;
            let exit_code = status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&stdout).to_string();
            let stderr = String::from_utf8_lossy(&stderr).to_string();
            debug!(exit_code, "subprocess dialect done");
            Ok(CodeResult {
                success: exit_code == 0,
                output: (!stdout.is_empty()).then_some(stdout),
                logs: Vec::new(),
                error: (exit_code != 0).then(|| {
                    if stderr.is_empty() {
                        format!("exit code {exit_code}")
                    } else {
                        stderr
                    }
                }),
            })
        },
        _ = tokio::time::sleep(timeout) => {
            warn!("subprocess dialect timed out");
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ToolError::external(format!(
                "code timed out after {}s", timeout.as_secs()
            )))
        },
        () = abort.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ToolError::user("code execution aborted"))
        },
    }
}

// ── Tool ────────────────────────────────────────────────────────────────────

pub struct RunCodeTool;

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Execute a code snippet. language='script' runs a sandboxed rhai \
         script in-process with fs_read/fs_write/fs_list, path helpers, and \
         print logging (no network or process access). language='python' \
         runs the system Python interpreter in the workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The code to execute"
                },
                "language": {
                    "type": "string",
                    "enum": ["script", "python"],
                    "description": "Dialect to run (default: script)"
                }
            },
            "required": ["code"]
        })
    }

    fn requires_workspace(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError> {
        let code = args
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'code' parameter"))?
            .to_string();
        let language = args
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("script");

        let result = match language {
            "script" => {
                let guard = (*ctx.path_guard).clone();
                // The engine's progress hook enforces the deadline from
                // inside; the outer timeout covers a hook that never runs
                // (e.g. a blocking native call).
                let handle =
                    tokio::task::spawn_blocking(move || run_script(&code, &guard, SCRIPT_TIMEOUT));
                tokio::time::timeout(SCRIPT_TIMEOUT + Duration::from_secs(1), handle)
                    .await
                    .map_err(|_| ToolError::external("script timed out"))?
                    .map_err(|e| ToolError::internal(format!("script task failed: {e}")))?
            },
            "python" => run_subprocess(&code, &ctx.path_guard, SUBPROCESS_TIMEOUT, &ctx.abort).await?,
            other => {
                return Err(ToolError::user(format!(
                    "unknown language '{other}' (expected script or python)"
                )));
            },
        };

        serde_json::to_value(&result).map_err(|e| ToolError::internal(e.to_string()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        hearth_approval::ChatContext,
        std::sync::Arc as StdArc,
    };

    fn guard(dir: &tempfile::TempDir) -> PathGuard {
        PathGuard::new(Some(dir.path().to_path_buf()))
    }

    fn ctx(dir: &tempfile::TempDir) -> ToolCtx {
        ToolCtx::new(
            "s1",
            "chat1",
            ChatContext::Private,
            StdArc::new(guard(dir)),
        )
    }

    // ── Scripting dialect ───────────────────────────────────────────────

    #[test]
    fn script_returns_last_expression() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_script("let x = 40; x + 2", &guard(&dir), SCRIPT_TIMEOUT);
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("42"));
    }

    #[test]
    fn script_captures_print_logs() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_script(
            r#"print("first"); print("second"); ()"#,
            &guard(&dir),
            SCRIPT_TIMEOUT,
        );
        assert!(result.success);
        assert_eq!(result.logs, vec!["first", "second"]);
        assert_eq!(result.output, None);
    }

    #[test]
    fn script_error_reported_not_thrown() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_script("this is not rhai", &guard(&dir), SCRIPT_TIMEOUT);
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[test]
    fn script_fs_facade_confined_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "inside").unwrap();

        let result = run_script(r#"fs_read("data.txt")"#, &guard(&dir), SCRIPT_TIMEOUT);
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("inside"));

        let result = run_script(
            r#"fs_read("../../etc/passwd")"#,
            &guard(&dir),
            SCRIPT_TIMEOUT,
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("outside the working directory"));
    }

    #[test]
    fn script_fs_write_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_script(
            r#"fs_write("out/note.txt", "hello"); fs_list("out")"#,
            &guard(&dir),
            SCRIPT_TIMEOUT,
        );
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output.as_deref(), Some(r#"["note.txt"]"#));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/note.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn script_path_and_url_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_script(
            r#"path_basename(path_join("a/b", "c.txt")) + " " + url_encode("x y")"#,
            &guard(&dir),
            SCRIPT_TIMEOUT,
        );
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("c.txt x+y"));
    }

    #[test]
    fn script_infinite_loop_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let start = std::time::Instant::now();
        let result = run_script(
            "loop { }",
            &guard(&dir),
            Duration::from_millis(200),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn script_has_no_ambient_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        // No module loader, no process handle, no timers.
        for code in [
            r#"import "os""#,
            r#"spawn("ls")"#,
            r#"set_timeout(|| 1, 100)"#,
        ] {
            let result = run_script(code, &guard(&dir), SCRIPT_TIMEOUT);
            assert!(!result.success, "expected failure for: {code}");
        }
    }

    // ── Subprocess dialect ──────────────────────────────────────────────

    #[tokio::test]
    async fn python_stdout_success() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        let out = RunCodeTool
            .execute(
                serde_json::json!({"code": "print(6 * 7)", "language": "python"}),
                &c,
            )
            .await
            .unwrap();
        assert_eq!(out["success"], true);
        assert_eq!(out["output"].as_str().unwrap().trim(), "42");
    }

    #[tokio::test]
    async fn python_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        let out = RunCodeTool
            .execute(
                serde_json::json!({"code": "import sys; sys.exit(2)", "language": "python"}),
                &c,
            )
            .await
            .unwrap();
        assert_eq!(out["success"], false);
    }

    #[tokio::test]
    async fn python_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        let out = RunCodeTool
            .execute(
                serde_json::json!({"code": "import os; print(os.getcwd())", "language": "python"}),
                &c,
            )
            .await
            .unwrap();
        let cwd = out["output"].as_str().unwrap().trim().to_string();
        assert_eq!(
            std::fs::canonicalize(cwd).unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_language_is_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunCodeTool
            .execute(
                serde_json::json!({"code": "1", "language": "cobol"}),
                &ctx(&dir),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "user");
    }
}

//! Script execution.
//!
//! Spawns the job script as a child process with captured stdout/stderr and a
//! hard wall-clock limit. The child gets its own process group so a timeout
//! kill takes the whole tree with it. Every failure mode maps to an
//! [`ExecutionOutcome`]; nothing here surfaces to the worker's outer loop.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{info, warn};

use taskmill_core::{ExecutionStatus, ScriptRoot};

/// Result of one script execution attempt.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub output: String,
    pub exit_code: Option<i32>,
}

impl ExecutionOutcome {
    fn error(message: String) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: message,
            exit_code: None,
        }
    }
}

/// Executes job scripts inside the sandbox root.
pub struct ScriptExecutor {
    root: ScriptRoot,
    timeout: Duration,
    output_cap: usize,
}

impl ScriptExecutor {
    pub fn new(root: ScriptRoot, timeout: Duration, output_cap: usize) -> Self {
        Self {
            root,
            timeout,
            output_cap,
        }
    }

    /// Run a script and capture its combined output.
    pub async fn execute(&self, script_path: &str) -> ExecutionOutcome {
        let path = match self.root.resolve(script_path) {
            Ok(path) => path,
            Err(error) => {
                warn!(script = script_path, %error, "rejected script path");
                return ExecutionOutcome::error(format!("invalid script path: {script_path}"));
            }
        };
        if !path.is_file() {
            return ExecutionOutcome::error(format!("script not found: {script_path}"));
        }

        let mut command = command_for(&path);
        command
            .current_dir(self.root.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Scripts get a minimal environment: exit code and captured output
        // are their only channels, nothing should leak in from the worker.
        command.env_clear();
        for key in ["PATH", "HOME", "LANG", "TZ"] {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                return ExecutionOutcome::error(format!("failed to spawn {script_path}: {error}"))
            }
        };
        let pid = child.id();

        // Drain both pipes concurrently so a chatty script never blocks on a
        // full pipe while we wait for it to exit.
        let cap = self.output_cap / 2;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            match stdout {
                Some(pipe) => read_capped(pipe, cap).await,
                None => String::new(),
            }
        });
        let stderr_task = tokio::spawn(async move {
            match stderr {
                Some(pipe) => read_capped(pipe, cap).await,
                None => String::new(),
            }
        });

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(exit)) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let mut output = format!("STDOUT:\n{stdout}\n\nSTDERR:\n{stderr}");
                if exit.success() {
                    info!(script = script_path, "script completed");
                    ExecutionOutcome {
                        status: ExecutionStatus::Success,
                        output,
                        exit_code: exit.code(),
                    }
                } else {
                    let code = exit.code();
                    output.push_str(&format!("\n\nExit Code: {}", describe_exit(code)));
                    warn!(script = script_path, exit_code = ?code, "script failed");
                    ExecutionOutcome {
                        status: ExecutionStatus::Failure,
                        output,
                        exit_code: code,
                    }
                }
            }
            Ok(Err(error)) => {
                let _ = child.kill().await;
                ExecutionOutcome::error(format!("failed waiting for {script_path}: {error}"))
            }
            Err(_elapsed) => {
                warn!(script = script_path, timeout = ?self.timeout, "script timed out, killing");
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.kill().await;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let output = format!(
                    "Execution timed out after {} seconds\n\nSTDOUT:\n{stdout}\n\nSTDERR:\n{stderr}",
                    self.timeout.as_secs()
                );
                ExecutionOutcome {
                    status: ExecutionStatus::Timeout,
                    output,
                    exit_code: None,
                }
            }
        }
    }
}

/// Pick the interpreter by extension; anything unrecognized is executed
/// directly and must carry its own shebang and exec bit.
fn command_for(path: &Path) -> Command {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => {
            let mut command = Command::new("python3");
            command.arg(path);
            command
        }
        Some("sh") => {
            let mut command = Command::new("sh");
            command.arg(path);
            command
        }
        _ => Command::new(path),
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // The child was spawned as its own group leader, so its pgid is its pid.
    unsafe {
        libc::killpg(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Read a pipe to EOF, keeping at most `cap` bytes and draining the rest.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = n.min(cap - kept.len());
                    kept.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n[output truncated]");
    }
    text
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn script_root(test: &str, scripts: &[(&str, &str)]) -> ScriptRoot {
        let dir = std::env::temp_dir().join(format!("taskmill-exec-{}-{test}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        for (name, body) in scripts {
            fs::write(dir.join(name), body).unwrap();
        }
        ScriptRoot::new(dir)
    }

    fn executor(root: ScriptRoot) -> ScriptExecutor {
        ScriptExecutor::new(root, Duration::from_secs(5), 64 * 1024)
    }

    #[tokio::test]
    async fn successful_script_captures_stdout() {
        let root = script_root("ok", &[("hello.sh", "echo hello from taskmill\n")]);
        let outcome = executor(root).execute("hello.sh").await;
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.output.contains("hello from taskmill"));
    }

    #[tokio::test]
    async fn failing_script_reports_exit_code() {
        let root = script_root(
            "fail",
            &[("fail.sh", "echo oops >&2\nexit 3\n")],
        );
        let outcome = executor(root).execute("fail.sh").await;
        assert_eq!(outcome.status, ExecutionStatus::Failure);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.output.contains("oops"));
        assert!(outcome.output.contains("Exit Code: 3"));
    }

    #[tokio::test]
    async fn hung_script_is_killed_at_the_deadline() {
        let root = script_root("hang", &[("hang.sh", "echo started\nsleep 30\n")]);
        let executor = ScriptExecutor::new(root, Duration::from_millis(300), 64 * 1024);
        let started = std::time::Instant::now();
        let outcome = executor.execute("hang.sh").await;
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(outcome.output.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_script_is_an_error_not_a_panic() {
        let root = script_root("missing", &[]);
        let outcome = executor(root).execute("ghost.sh").await;
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(outcome.output.contains("script not found"));
    }

    #[tokio::test]
    async fn escaping_path_is_rejected() {
        let root = script_root("escape", &[]);
        let outcome = executor(root).execute("../../etc/passwd").await;
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(outcome.output.contains("invalid script path"));
    }

    #[tokio::test]
    async fn long_output_is_truncated_at_the_cap() {
        let root = script_root(
            "big",
            &[("big.sh", "head -c 100000 /dev/zero | tr '\\0' 'a'\n")],
        );
        let executor = ScriptExecutor::new(root, Duration::from_secs(5), 4096);
        let outcome = executor.execute("big.sh").await;
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert!(outcome.output.len() < 8192);
        assert!(outcome.output.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn scripts_run_with_the_root_as_working_directory() {
        let root = script_root("cwd", &[("cwd.sh", "pwd\n")]);
        let expected: PathBuf = root.path().to_path_buf();
        let outcome = executor(root).execute("cwd.sh").await;
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert!(outcome.output.contains(expected.to_str().unwrap()));
    }
}

//! Process sandbox: run snippets as local child processes with a wall-clock limit

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::CodeRunner;
use super::policy::SandboxConfig;
use super::result::{ExecutionResult, ExecutionStage};
use crate::language::Language;

/// How long to wait for pipe readers after the child has exited
const DRAIN_GRACE: Duration = Duration::from_secs(1);

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Files created for one run, removed on every exit path
struct Artifacts {
    paths: Vec<PathBuf>,
}

impl Artifacts {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    async fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Sandbox: removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Sandbox: failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for Artifacts {
    // Reached when the run future is dropped mid-flight
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

enum ProcessOutcome {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

/// Runs snippets with the local interpreter and compiler
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Check whether the toolchain for `language` is on PATH
    pub async fn is_available(&self, language: Language) -> bool {
        Command::new(self.config.toolchain_binary(language))
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run `code` once and report what happened.
    ///
    /// Never returns an error: infrastructure trouble is reported as an
    /// internal failure on the result. Temp files are removed before returning.
    pub async fn execute(&self, language: Language, code: &str) -> ExecutionResult {
        let start = Instant::now();
        let mut artifacts = Artifacts::new();

        let mut result = self.execute_inner(language, code, &mut artifacts).await;
        artifacts.cleanup().await;

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Sandbox: {} run finished (succeeded={}, stage={:?}, exit={:?}, {}ms)",
            language, result.succeeded, result.stage, result.exit_code, result.duration_ms
        );
        result
    }

    async fn execute_inner(
        &self,
        language: Language,
        code: &str,
        artifacts: &mut Artifacts,
    ) -> ExecutionResult {
        let limits = &self.config.limits;
        let work_dir = self.config.work_dir();

        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            return ExecutionResult::internal(
                ExecutionStage::Setup,
                format!("failed to create work dir {}: {}", work_dir.display(), e),
            );
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let source = work_dir.join(format!("mender-{}.{}", token, language.file_extension()));
        artifacts.track(source.clone());

        debug!(
            "Sandbox: writing {} snippet ({} bytes) to {}",
            language,
            code.len(),
            source.display()
        );
        if let Err(e) = tokio::fs::write(&source, code).await {
            return ExecutionResult::internal(
                ExecutionStage::Setup,
                format!("failed to write source file: {}", e),
            );
        }

        let mut runnable = source.clone();
        let binary = work_dir.join(format!("mender-{}", token));
        if let Some(compile_cmd) = self.config.compile_command_for(language, &source, &binary) {
            artifacts.track(binary.clone());
            let limit = Duration::from_secs(limits.compile_timeout_secs);
            match self.spawn_bounded(&compile_cmd, &work_dir, limit).await {
                Ok(ProcessOutcome::Exited { status, .. }) if status.success() => {
                    runnable = binary;
                }
                Ok(ProcessOutcome::Exited { status, stderr, .. }) => {
                    debug!("Sandbox: compile failed (exit={:?})", status.code());
                    return ExecutionResult::compile_failure(stderr, status.code());
                }
                Ok(ProcessOutcome::TimedOut) => {
                    warn!(
                        "Sandbox: compile timed out after {}s",
                        limits.compile_timeout_secs
                    );
                    return ExecutionResult::timed_out(ExecutionStage::Compile);
                }
                Err(e) => {
                    warn!("Sandbox: compiler could not run: {:#}", e);
                    return ExecutionResult::internal(ExecutionStage::Compile, format!("{:#}", e));
                }
            }
        }

        let run_cmd = self.config.run_command_for(language, &runnable);
        let limit = Duration::from_secs(limits.timeout_secs);
        match self.spawn_bounded(&run_cmd, &work_dir, limit).await {
            Ok(ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
            }) => {
                if status.success() {
                    ExecutionResult::success(stdout, stderr)
                } else {
                    ExecutionResult::runtime_failure(stdout, stderr, status.code())
                }
            }
            Ok(ProcessOutcome::TimedOut) => {
                warn!(
                    "Sandbox: execution timed out after {}s, process killed",
                    limits.timeout_secs
                );
                ExecutionResult::timed_out(ExecutionStage::Run)
            }
            Err(e) => {
                warn!("Sandbox: program could not run: {:#}", e);
                ExecutionResult::internal(ExecutionStage::Run, format!("{:#}", e))
            }
        }
    }

    /// Spawn `argv`, capture its output and kill it if `limit` elapses
    async fn spawn_bounded(
        &self,
        argv: &[String],
        work_dir: &Path,
        limit: Duration,
    ) -> Result<ProcessOutcome> {
        let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start '{}'", program))?;

        let max = self.config.limits.max_output_bytes;
        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;
        let stdout_task = tokio::spawn(read_capped(stdout, max));
        let stderr_task = tokio::spawn(read_capped(stderr, max));

        match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => {
                let status = status.with_context(|| format!("failed to wait for '{}'", program))?;
                Ok(ProcessOutcome::Exited {
                    status,
                    stdout: collect(stdout_task).await,
                    stderr: collect(stderr_task).await,
                })
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Sandbox: failed to kill '{}': {}", program, e);
                }
                stdout_task.abort();
                stderr_task.abort();
                Ok(ProcessOutcome::TimedOut)
            }
        }
    }
}

#[async_trait]
impl CodeRunner for ProcessSandbox {
    async fn run(&self, language: Language, code: &str) -> ExecutionResult {
        self.execute(language, code).await
    }
}

/// Wait briefly for a reader; a grandchild holding the pipe open must not stall us
async fn collect(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("Sandbox: output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            debug!("Sandbox: output still open after exit, giving up on it");
            String::new()
        }
    }
}

/// Read a stream to the end, keeping at most `max` bytes
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> String {
    let mut kept = Vec::new();
    let mut chunk = vec![0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("Sandbox: read error on child pipe: {}", e);
                break;
            }
        }
    }

    if truncated {
        kept.truncate(char_boundary(&kept));
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// Length of `bytes` without a multibyte character cut off at the end
fn char_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::result::FailureReason;

    fn sandbox_in(dir: &Path) -> ProcessSandbox {
        let mut config = SandboxConfig::default();
        config.work_dir = Some(dir.to_path_buf());
        ProcessSandbox::new(config)
    }

    fn is_empty_dir(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_truncation_keeps_whole_characters() {
        // "é" is two bytes; a 3-byte cap lands inside the second one
        let text = read_capped("éé".as_bytes(), 3).await;
        assert_eq!(text, format!("é{}", TRUNCATION_MARKER));
        assert!(!text.contains('\u{FFFD}'));

        let text = read_capped("abcdef".as_bytes(), 4).await;
        assert_eq!(text, format!("abcd{}", TRUNCATION_MARKER));

        let text = read_capped("héllo".as_bytes(), 64).await;
        assert_eq!(text, "héllo");
    }

    async fn ready(sandbox: &ProcessSandbox, language: Language) -> bool {
        let available = sandbox.is_available(language).await;
        if !available {
            eprintln!("skipping: {} toolchain not installed", language);
        }
        available
    }

    #[tokio::test]
    async fn test_python_success() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());
        if !ready(&sandbox, Language::Python).await {
            return;
        }

        let result = sandbox.execute(Language::Python, "print(5 + 3)").await;
        assert!(result.succeeded, "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), "8");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.failure_reason.is_none());
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_python_syntax_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());
        if !ready(&sandbox, Language::Python).await {
            return;
        }

        let result = sandbox
            .execute(Language::Python, "result = calculate_sum(5, 3\nprint(result)")
            .await;
        assert!(!result.succeeded);
        assert_eq!(result.stage, ExecutionStage::Run);
        assert!(result.failure_reason.is_none());
        assert!(result.stderr.contains("SyntaxError"));
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_python_runtime_error_keeps_partial_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());
        if !ready(&sandbox, Language::Python).await {
            return;
        }

        let result = sandbox
            .execute(Language::Python, "print('before')\nprint(1 / 0)")
            .await;
        assert!(!result.succeeded);
        assert_eq!(result.stdout.trim(), "before");
        assert!(result.stderr.contains("ZeroDivisionError"));
        assert_ne!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.work_dir = Some(dir.path().to_path_buf());
        config.limits.timeout_secs = 1;
        let sandbox = ProcessSandbox::new(config);
        if !ready(&sandbox, Language::Python).await {
            return;
        }

        // the pid goes outside the work dir so the cleanup check still holds
        let pid_dir = tempfile::tempdir().unwrap();
        let pid_file = pid_dir.path().join("child.pid");
        let code = format!(
            "with open(r'{}', 'w') as f:\n    f.write(str(__import__('os').getpid()))\nprint('spin')\nwhile True:\n    pass\n",
            pid_file.display()
        );

        let result = sandbox.execute(Language::Python, &code).await;
        assert!(!result.succeeded);
        assert_eq!(result.failure_reason, Some(FailureReason::TimedOut));
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
        assert!(result.duration_ms < 5000);
        assert!(is_empty_dir(dir.path()));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        if Path::new("/proc/self").exists() {
            assert!(
                !Path::new(&format!("/proc/{}", pid)).exists(),
                "child {} still alive after timeout",
                pid
            );
        }
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.work_dir = Some(dir.path().to_path_buf());
        config.limits.max_output_bytes = 100;
        let sandbox = ProcessSandbox::new(config);
        if !ready(&sandbox, Language::Python).await {
            return;
        }

        let result = sandbox.execute(Language::Python, "print('x' * 10000)").await;
        assert!(result.succeeded);
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(result.stdout.len(), 100 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_repeat_runs_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());
        if !ready(&sandbox, Language::Python).await {
            return;
        }

        let code = "for i in range(3):\n    print(i)";
        let first = sandbox.execute(Language::Python, code).await;
        let second = sandbox.execute(Language::Python, code).await;
        assert_eq!(first.succeeded, second.succeeded);
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.stderr, second.stderr);
    }

    #[tokio::test]
    async fn test_cpp_success() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());
        if !ready(&sandbox, Language::Cpp).await {
            return;
        }

        let code = "#include <iostream>\nint main() { std::cout << 5 + 3 << std::endl; return 0; }\n";
        let result = sandbox.execute(Language::Cpp, code).await;
        assert!(result.succeeded, "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), "8");
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_cpp_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());
        if !ready(&sandbox, Language::Cpp).await {
            return;
        }

        let code = "#include <iostream>\nint main() {\n    int x = 1\n    return x;\n}\n";
        let result = sandbox.execute(Language::Cpp, code).await;
        assert!(!result.succeeded);
        assert!(result.is_compile_failure());
        assert_eq!(result.stage, ExecutionStage::Compile);
        assert!(result.stderr.contains("error"));
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_internal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.work_dir = Some(dir.path().to_path_buf());
        config.toolchain.python = "mender-no-such-interpreter".to_string();
        let sandbox = ProcessSandbox::new(config);

        let result = sandbox.execute(Language::Python, "print(1)").await;
        assert!(!result.succeeded);
        assert!(matches!(result.failure_reason, Some(FailureReason::Internal(_))));
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_read_capped_small_input() {
        let text = read_capped(&b"hello"[..], 100).await;
        assert_eq!(text, "hello");
    }
}

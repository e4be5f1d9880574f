//! Test runner invocation.
//!
//! Runs the mapped test as a separate process under a wall-clock timeout and
//! classifies the result into a [`TrialOutcome`]. Failures to launch or
//! crashes are outcomes, never errors, so every trial yields a value.

use super::TrialOutcome;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Output that means the mutant (or the tree) did not build or parse.
const BUILD_FAILURE_MARKERS: &[&str] = &[
    "error[E",
    "could not compile",
    "SyntaxError",
    "IndentationError",
    "syntax error",
];

/// Output that means a test ran and failed.
const FAILURE_MARKERS: &[&str] = &[
    "FAILED",
    "FAIL",
    "panicked",
    "AssertionError",
    "assert",
    "Error:",
    "failed",
];

/// How long to keep draining pipes after the runner exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// The test bound to one trial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestTarget {
    /// Test file, relative to the project root
    pub test_file: PathBuf,
    /// Source file under test, relative to the project root
    pub source_file: PathBuf,
}

impl TestTarget {
    pub fn new(test_file: impl Into<PathBuf>, source_file: impl Into<PathBuf>) -> Self {
        Self {
            test_file: test_file.into(),
            source_file: source_file.into(),
        }
    }

    /// Test file stem, e.g. `test_clamp` for `tests/test_clamp.py`
    pub fn test_name(&self) -> String {
        self.test_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Identity of the target inside mutation signatures.
    pub fn key(&self) -> String {
        self.test_file.to_string_lossy().replace('\\', "/")
    }
}

/// What one runner invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: TrialOutcome,
    pub duration: Duration,
    /// Bounded excerpt of combined stdout and stderr
    pub output: String,
    pub killing_test: Option<String>,
}

impl Execution {
    fn errored(message: String, started: Instant) -> Self {
        Self {
            outcome: TrialOutcome::Errored,
            duration: started.elapsed(),
            output: message,
            killing_test: None,
        }
    }
}

/// Runs one test target. Implementations must not panic on runner failure.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, target: &TestTarget, timeout: Duration) -> Execution;
}

/// Spawns the configured runner command for each trial.
pub struct CommandExecutor {
    template: Vec<String>,
    working_dir: PathBuf,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(template: Vec<String>, working_dir: impl Into<PathBuf>, max_output_bytes: usize) -> Self {
        Self {
            template,
            working_dir: working_dir.into(),
            max_output_bytes,
        }
    }

    /// Substitute `{test_file}`, `{test_name}` and `{source_file}`.
    pub fn render(&self, target: &TestTarget) -> Vec<String> {
        let test_file = target.key();
        let test_name = target.test_name();
        let source_file = target.source_file.to_string_lossy().replace('\\', "/");

        self.template
            .iter()
            .map(|arg| {
                arg.replace("{test_file}", &test_file)
                    .replace("{test_name}", &test_name)
                    .replace("{source_file}", &source_file)
            })
            .collect()
    }
}

#[async_trait]
impl TestExecutor for CommandExecutor {
    async fn execute(&self, target: &TestTarget, timeout: Duration) -> Execution {
        let started = Instant::now();
        let argv = self.render(target);
        let Some((program, args)) = argv.split_first() else {
            return Execution::errored("empty test command".to_string(), started);
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to launch test runner '{}': {}", program, e);
                return Execution::errored(format!("failed to launch '{}': {}", program, e), started);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(drain(stdout, self.max_output_bytes));
        let stderr_task = tokio::spawn(drain(stderr, self.max_output_bytes));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                kill_tree(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Execution::errored(format!("failed to wait for runner: {}", e), started);
            }
            Err(_) => {
                tracing::debug!("Test {} timed out after {:?}", target.key(), timeout);
                kill_tree(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Execution {
                    outcome: TrialOutcome::TimedOut,
                    duration: started.elapsed(),
                    output: String::new(),
                    killing_test: None,
                };
            }
        };

        // Background children may still hold the pipes open
        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr)
        );

        let outcome = classify(status.success(), &combined);
        let killing_test = match outcome {
            TrialOutcome::Killed => extract_failing_test(&combined),
            _ => None,
        };

        Execution {
            outcome,
            duration: started.elapsed(),
            output: truncate_output(combined.trim(), self.max_output_bytes),
            killing_test,
        }
    }
}

/// Read `pipe` to the end, keeping only its first and last `limit` bytes.
///
/// Failure markers usually sit at the end of a runner's output, so the tail
/// is kept as well as the head.
async fn drain<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> Vec<u8> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };

    let mut head = Vec::new();
    let mut tail: VecDeque<u8> = VecDeque::new();
    let mut omitted = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut bytes = &chunk[..n];
        if head.len() < limit {
            let take = bytes.len().min(limit - head.len());
            head.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        tail.extend(bytes);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
            omitted += excess;
        }
    }

    if omitted > 0 {
        head.extend_from_slice(format!("\n...({} bytes omitted)...\n", omitted).as_bytes());
    }
    head.extend(tail);
    head
}

async fn collect(task: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

/// Kill the runner and everything it spawned.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!("killpg({}) failed: {}", pid, e);
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!("Failed to kill runner: {}", e);
    }
}

/// Map exit status and output to an outcome.
///
/// A zero exit survives. A non-zero exit kills only when the output shows a
/// test failure; build breakage and unrecognised crashes are errored.
pub fn classify(success: bool, output: &str) -> TrialOutcome {
    if success {
        return TrialOutcome::Survived;
    }
    if BUILD_FAILURE_MARKERS.iter().any(|m| output.contains(m)) {
        return TrialOutcome::Errored;
    }
    if FAILURE_MARKERS.iter().any(|m| output.contains(m)) {
        TrialOutcome::Killed
    } else {
        TrialOutcome::Errored
    }
}

/// Extract the name of the first failing test from runner output.
///
/// Understands cargo (`test x ... FAILED`, `---- x stdout ----`) and pytest
/// (`FAILED path::name - reason`) summaries.
pub fn extract_failing_test(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("test ") && trimmed.ends_with("FAILED") {
            if let Some(name) = trimmed.split_whitespace().nth(1) {
                return Some(name.to_string());
            }
        }

        if let Some(rest) = trimmed.strip_prefix("---- ") {
            if let Some(name) = rest.strip_suffix(" stdout ----") {
                return Some(name.to_string());
            }
        }

        if let Some(rest) = trimmed.strip_prefix("FAILED ") {
            let name = rest.split(" - ").next().unwrap_or(rest).trim();
            if name.contains("::") {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Cut `output` to at most `max_bytes`, on a char boundary.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut end = max_bytes;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &output[..end])
}

use std::env;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::accumulator::{OutputAccumulator, Utf8ChunkDecoder, DEFAULT_MAX_OUTPUT_CHARS};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const DRAIN_GRACE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
    SpawnFailed,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exited => "exited",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::SpawnFailed => "spawn_failed",
        }
    }
}

/// Raw result of one subprocess run, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or never ran.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub termination: Termination,
    pub duration_ms: u64,
}

impl ProcessOutcome {
    fn spawn_failure(message: String, duration_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_code: None,
            signal: None,
            stdout_truncated: false,
            stderr_truncated: false,
            termination: Termination::SpawnFailed,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokerLimits {
    pub max_output_chars: usize,
    pub keep_partial_stdout_on_timeout: bool,
}

impl Default for InvokerLimits {
    fn default() -> Self {
        Self {
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            keep_partial_stdout_on_timeout: false,
        }
    }
}

enum Completion {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker {
    limits: InvokerLimits,
}

impl ProcessInvoker {
    pub fn new(limits: InvokerLimits) -> Self {
        Self { limits }
    }

    /// Runs `command` with discrete argv entries and resolves exactly once.
    ///
    /// A `timeout_ms` of `None` or `Some(0)` disables the deadline. Spawn
    /// errors are folded into the outcome instead of being returned.
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        timeout_ms: Option<u64>,
        cancel: Option<CancellationToken>,
    ) -> ProcessOutcome {
        let started = Instant::now();
        let program = resolve_command_name(command);
        let mut cmd = Command::new(&program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!("failed spawning {program}: {err}");
                return ProcessOutcome::spawn_failure(
                    format!("failed to spawn {program}: {err}"),
                    elapsed_ms(started),
                );
            }
        };
        debug!(
            "spawned {program} (pid={:?}, argc={})",
            child.id(),
            args.len()
        );

        let max_chars = self.limits.max_output_chars;
        let stdout_sink = Arc::new(Mutex::new(OutputAccumulator::new(max_chars)));
        let stderr_sink = Arc::new(Mutex::new(OutputAccumulator::new(max_chars)));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain_stream(pipe, stdout_sink.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain_stream(pipe, stderr_sink.clone())));

        let deadline = timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis);
        let completion = {
            let timer = async {
                match deadline {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let cancelled = async {
                match cancel.as_ref() {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                status = child.wait() => Completion::Exited(status),
                _ = timer => Completion::TimedOut,
                _ = cancelled => Completion::Cancelled,
            }
        };

        let (termination, status) = match completion {
            Completion::Exited(status) => (Termination::Exited, status),
            Completion::TimedOut => {
                warn!(
                    "{program} exceeded {}ms, killing",
                    deadline.unwrap_or_default().as_millis()
                );
                (Termination::TimedOut, kill_and_reap(&mut child).await)
            }
            Completion::Cancelled => {
                debug!("{program} cancelled by caller, killing");
                (Termination::Cancelled, kill_and_reap(&mut child).await)
            }
        };

        let stdout_cut_short = !join_drain(stdout_task).await;
        let stderr_cut_short = !join_drain(stderr_task).await;
        let (mut stdout_text, stdout_truncated) = take_sink(&stdout_sink).into_parts();
        let (mut stderr_text, stderr_truncated) = take_sink(&stderr_sink).into_parts();

        let (exit_code, signal) = match &status {
            Ok(status) => (status.code(), exit_signal(status)),
            Err(err) => {
                append_line(&mut stderr_text, &format!("failed waiting for {program}: {err}"));
                (None, None)
            }
        };

        if termination == Termination::TimedOut {
            let message = format!(
                "{program} timed out after {}ms",
                deadline.unwrap_or_default().as_millis()
            );
            if self.limits.keep_partial_stdout_on_timeout {
                append_line(&mut stderr_text, &message);
            } else {
                stdout_text.clear();
                stderr_text = message;
            }
        }

        if stdout_cut_short {
            warn!("{program} exited but its stdout pipe stayed open, keeping what was read");
            append_line(&mut stderr_text, "[stdout drain cut short after exit]");
        }
        if stderr_cut_short {
            append_line(&mut stderr_text, "[stderr drain cut short after exit]");
        }
        if stdout_truncated {
            warn!("{program} stdout exceeded {max_chars} characters");
            append_line(
                &mut stderr_text,
                &format!("[stdout truncated at {max_chars} characters]"),
            );
        }
        if stderr_truncated {
            append_line(
                &mut stderr_text,
                &format!("[stderr truncated at {max_chars} characters]"),
            );
        }

        ProcessOutcome {
            stdout: stdout_text,
            stderr: stderr_text,
            exit_code: if termination == Termination::TimedOut {
                None
            } else {
                exit_code
            },
            signal,
            stdout_truncated,
            stderr_truncated,
            termination,
            duration_ms: elapsed_ms(started),
        }
    }
}

/// Platform executable name for a bare command: `.cmd` shims on Windows.
pub fn resolve_command_name(command: &str) -> String {
    let trimmed = command.trim();
    if cfg!(windows) {
        let has_ext = PathBuf::from(trimmed).extension().is_some();
        if !has_ext {
            return format!("{trimmed}.cmd");
        }
    }
    trimmed.to_owned()
}

/// Looks `bin` up on PATH the way the OS loader would.
pub fn resolve_executable_path(bin: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(bin);
    if candidate.is_absolute() || bin.contains('/') || bin.contains('\\') {
        return candidate.is_file().then_some(candidate);
    }
    let path_env = env::var_os("PATH")?;
    env::split_paths(&path_env)
        .map(|directory| directory.join(bin))
        .find(|candidate| candidate.is_file())
}

async fn drain_stream<R>(mut pipe: R, sink: Arc<Mutex<OutputAccumulator>>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8ChunkDecoder::default();
    let mut buf = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // keep reading past the budget so the child never blocks on a full pipe
                let mut acc = lock_sink(&sink);
                if !acc.truncated() {
                    acc.append(&decoder.decode(&buf[..n]));
                }
            }
            Err(err) => {
                debug!("stream read ended with error: {err}");
                break;
            }
        }
    }
    let mut acc = lock_sink(&sink);
    if !acc.truncated() {
        acc.append(&decoder.finish());
    }
}

/// Waits for a drain task to hit EOF. Returns false when the grace period
/// expired and the task was aborted; the sink keeps everything read so far.
async fn join_drain(task: Option<JoinHandle<()>>) -> bool {
    let Some(mut task) = task else {
        return true;
    };
    match tokio::time::timeout(Duration::from_millis(DRAIN_GRACE_MS), &mut task).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!("output drain task failed: {err}");
            true
        }
        Err(_) => {
            // a grandchild still holds the pipe open
            task.abort();
            let _ = task.await;
            false
        }
    }
}

fn lock_sink(sink: &Mutex<OutputAccumulator>) -> std::sync::MutexGuard<'_, OutputAccumulator> {
    sink.lock().unwrap_or_else(|err| err.into_inner())
}

fn take_sink(sink: &Mutex<OutputAccumulator>) -> OutputAccumulator {
    let mut acc = lock_sink(sink);
    let max_chars = acc.max_chars();
    std::mem::replace(&mut *acc, OutputAccumulator::new(max_chars))
}

async fn kill_and_reap(child: &mut tokio::process::Child) -> std::io::Result<ExitStatus> {
    if let Err(err) = child.start_kill() {
        debug!("kill after exit race: {err}");
    }
    child.wait().await
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn append_line(target: &mut String, line: &str) {
    if !target.is_empty() && !target.ends_with('\n') {
        target.push('\n');
    }
    target.push_str(line);
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use tokio_util::sync::CancellationToken;

    use super::{InvokerLimits, ProcessInvoker, Termination};

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_owned(), script.to_owned()]
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let invoker = ProcessInvoker::default();
        let outcome = invoker
            .run("sh", &sh("printf out; printf err >&2; exit 3"), Some(5_000), None)
            .await;
        assert_eq!(outcome.stdout, "out");
        assert_eq!(outcome.stderr, "err");
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.termination, Termination::Exited);
        assert!(!outcome.stdout_truncated);
        assert!(!outcome.stderr_truncated);
    }

    #[tokio::test]
    async fn args_are_passed_verbatim_without_a_shell() {
        let invoker = ProcessInvoker::default();
        let args = vec![
            "-c".to_owned(),
            "printf '%s|' \"$@\"".to_owned(),
            "argv0".to_owned(),
            "a b".to_owned(),
            "$(echo injected)".to_owned(),
            "{\"k\":\"v\"}".to_owned(),
        ];
        let outcome = invoker.run("sh", &args, None, None).await;
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "a b|$(echo injected)|{\"k\":\"v\"}|");
    }

    #[tokio::test]
    async fn spawn_failure_resolves_with_error_text() {
        let invoker = ProcessInvoker::default();
        let outcome = invoker
            .run("openclaw-bridge-missing-binary-xyz", &[], Some(1_000), None)
            .await;
        assert_eq!(outcome.termination, Termination::SpawnFailed);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.stdout.is_empty());
        assert!(outcome
            .stderr
            .contains("failed to spawn openclaw-bridge-missing-binary-xyz"));
    }

    #[tokio::test]
    async fn timeout_kills_process_and_drops_partial_stdout() {
        let invoker = ProcessInvoker::default();
        let started = Instant::now();
        let outcome = invoker
            .run("sh", &sh("printf partial; exec sleep 30"), Some(200), None)
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.signal, Some(9));
        assert!(outcome.stdout.is_empty());
        assert_eq!(outcome.stderr, "sh timed out after 200ms");
    }

    #[tokio::test]
    async fn timeout_can_keep_partial_stdout_when_configured() {
        let invoker = ProcessInvoker::new(InvokerLimits {
            keep_partial_stdout_on_timeout: true,
            ..InvokerLimits::default()
        });
        let outcome = invoker
            .run("sh", &sh("printf partial; exec sleep 30"), Some(300), None)
            .await;
        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.stdout, "partial");
        assert!(outcome.stderr.ends_with("sh timed out after 300ms"));
    }

    #[tokio::test]
    async fn zero_timeout_disables_deadline() {
        let invoker = ProcessInvoker::default();
        let outcome = invoker
            .run("sh", &sh("sleep 0.2; printf done"), Some(0), None)
            .await;
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.stdout, "done");
    }

    #[tokio::test]
    async fn cancellation_kills_running_process() {
        let invoker = ProcessInvoker::default();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let outcome = invoker
            .run("sh", &sh("exec sleep 30"), Some(20_000), Some(token))
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.signal, Some(9));
    }

    #[tokio::test]
    async fn cancellation_after_completion_has_no_effect() {
        let invoker = ProcessInvoker::default();
        let token = CancellationToken::new();
        let outcome = invoker
            .run("sh", &sh("printf ok"), Some(5_000), Some(token.clone()))
            .await;
        token.cancel();
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "ok");
    }

    #[tokio::test]
    async fn oversized_stdout_is_truncated_and_reported_on_stderr() {
        let invoker = ProcessInvoker::new(InvokerLimits {
            max_output_chars: 1_000,
            keep_partial_stdout_on_timeout: false,
        });
        let outcome = invoker
            .run(
                "sh",
                &sh("i=0; while [ $i -lt 200 ]; do printf '0123456789'; i=$((i+1)); done"),
                Some(10_000),
                None,
            )
            .await;
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout_truncated);
        assert_eq!(outcome.stdout.chars().count(), 1_000);
        assert!(outcome
            .stderr
            .contains("[stdout truncated at 1000 characters]"));
    }

    #[tokio::test]
    async fn large_output_does_not_block_on_pipe_buffer() {
        let invoker = ProcessInvoker::default();
        let outcome = invoker
            .run(
                "sh",
                &sh("head -c 300000 /dev/zero | tr '\\0' 'a'; printf tail >&2"),
                Some(10_000),
                None,
            )
            .await;
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.len(), 300_000);
        assert_eq!(outcome.stderr, "tail");
    }

    #[tokio::test]
    async fn oversized_stderr_gets_its_own_truncation_marker() {
        let invoker = ProcessInvoker::new(InvokerLimits {
            max_output_chars: 1_000,
            keep_partial_stdout_on_timeout: false,
        });
        let outcome = invoker
            .run(
                "sh",
                &sh("head -c 2000 /dev/zero | tr '\\0' e >&2"),
                Some(10_000),
                None,
            )
            .await;
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stderr_truncated);
        assert!(!outcome.stdout_truncated);
        assert!(outcome.stderr.starts_with(&"e".repeat(1_000)));
        assert!(outcome
            .stderr
            .ends_with("\n[stderr truncated at 1000 characters]"));
    }

    #[tokio::test]
    async fn output_survives_when_background_process_holds_the_pipe() {
        let invoker = ProcessInvoker::default();
        let started = Instant::now();
        let outcome = invoker
            .run("sh", &sh("printf '{\"a\":1}'; sleep 3 &"), Some(10_000), None)
            .await;
        assert!(started.elapsed() < Duration::from_millis(2_500));
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "{\"a\":1}");
        assert!(outcome
            .stderr
            .contains("[stdout drain cut short after exit]"));
    }

    #[tokio::test]
    async fn dropping_the_run_future_kills_the_child() {
        let marker = std::env::temp_dir().join(format!(
            "openclaw-bridge-drop-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let script = format!("sleep 1; touch '{}'", marker.display());
        let invoker = ProcessInvoker::default();
        let args = sh(&script);
        let dropped =
            tokio::time::timeout(Duration::from_millis(200), invoker.run("sh", &args, None, None))
                .await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_millis(1_800)).await;
        assert!(!marker.exists(), "child outlived the dropped call");
    }
}

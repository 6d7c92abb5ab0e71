use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskforge_core::{FailureClass, FailureCode, FailureReason};

use super::{ExecutionRequest, Watched, watch};
use crate::registry::ProcessCommand;

/// sysexits codes that mean "the input or setup is wrong", not "try again".
const NON_RETRIABLE_EXIT_CODES: [i32; 4] = [64, 65, 66, 78];

const DEFAULT_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;
const STDERR_TAIL: usize = 2 * 1024;

/// Runs each attempt in a child process.
///
/// Input is written to stdin as JSON and the JSON result is read from stdout.
/// Timeouts and cancellations kill the child and reap it.
#[derive(Debug)]
pub struct ProcessExecutor {
    output_limit: usize,
    killed: AtomicU64,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            output_limit: DEFAULT_OUTPUT_LIMIT,
            killed: AtomicU64::new(0),
        }
    }

    /// Cap on bytes read from stdout and stderr.
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    /// Children terminated because of a timeout or cancellation.
    pub fn killed(&self) -> u64 {
        self.killed.load(Ordering::Relaxed)
    }

    pub(super) async fn run(
        &self,
        command: &ProcessCommand,
        request: &ExecutionRequest,
    ) -> Result<Value, FailureReason> {
        let input = serde_json::to_vec(&request.input).map_err(|e| {
            FailureReason::new(FailureCode::Application, format!("input is not serializable: {e}"))
                .with_class(FailureClass::NonRetriable)
        })?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            let code = match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => FailureCode::Spawn,
                _ => FailureCode::ResourceExhausted,
            };
            FailureReason::new(code, format!("failed to spawn `{}`: {e}", command.program))
        })?;
        let pid = child.id();
        debug!(job_id = %request.job_id, attempt = request.attempt, pid, program = %command.program, "spawned child process");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // A child that exits without reading stdin closes the pipe early.
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "child closed stdin before reading input");
                }
            });
        }
        let stdout = child.stdout.take().map(|out| read_capped(out, self.output_limit));
        let stderr = child.stderr.take().map(|err| read_capped(err, self.output_limit));

        let watched = {
            let wait = child.wait();
            tokio::pin!(wait);
            watch(&mut wait, request.timeout, &request.cancel).await
        };

        let status = match watched {
            Watched::Completed(Ok(status)) => status,
            Watched::Completed(Err(e)) => {
                return Err(FailureReason::new(
                    FailureCode::ResourceExhausted,
                    format!("failed to wait on child process: {e}"),
                ));
            }
            Watched::Interrupted(interrupt) => {
                if let Err(e) = child.kill().await {
                    warn!(job_id = %request.job_id, pid, error = %e, "failed to kill child process");
                } else {
                    self.killed.fetch_add(1, Ordering::Relaxed);
                    info!(job_id = %request.job_id, attempt = request.attempt, pid, "terminated child process");
                }
                return Err(interrupt.reason());
            }
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        // Checked before the exit status: an oversized child usually dies of SIGPIPE.
        if stdout.truncated {
            warn!(
                job_id = %request.job_id,
                attempt = request.attempt,
                limit = self.output_limit,
                ?status,
                "child output exceeded limit"
            );
            return Err(FailureReason::new(
                FailureCode::OutputLimit,
                format!("stdout exceeded the {} byte limit", self.output_limit),
            ));
        }

        if status.success() {
            parse_output(&stdout.bytes)
        } else {
            Err(exit_failure(status, &stderr.bytes))
        }
    }
}

/// Child output, cut at the executor's limit.
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read up to `limit` bytes. The pipe is closed as soon as the limit is
/// passed, so a child that keeps writing gets EPIPE instead of blocking.
fn read_capped<R>(reader: R, limit: usize) -> JoinHandle<Captured>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut bytes = Vec::new();
        if let Err(e) = reader.take(limit as u64 + 1).read_to_end(&mut bytes).await {
            debug!(error = %e, "failed reading child output");
        }
        let truncated = bytes.len() > limit;
        bytes.truncate(limit);
        Captured { bytes, truncated }
    })
}

async fn collect(reader: Option<JoinHandle<Captured>>) -> Captured {
    let empty = || Captured {
        bytes: Vec::new(),
        truncated: false,
    };
    match reader {
        Some(handle) => handle.await.unwrap_or_else(|_| empty()),
        None => empty(),
    }
}

fn parse_output(stdout: &[u8]) -> Result<Value, FailureReason> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(stdout).map_err(|e| {
        FailureReason::new(
            FailureCode::Deserialization,
            format!("child output is not valid JSON: {e}"),
        )
    })
}

fn exit_failure(status: ExitStatus, stderr: &[u8]) -> FailureReason {
    let tail = stderr_tail(stderr);
    match status.code() {
        Some(code) => {
            let message = if tail.is_empty() {
                format!("exited with status {code}")
            } else {
                format!("exited with status {code}: {tail}")
            };
            let reason = FailureReason::new(FailureCode::Application, message);
            if NON_RETRIABLE_EXIT_CODES.contains(&code) {
                reason.with_class(FailureClass::NonRetriable)
            } else {
                reason
            }
        }
        None => FailureReason::new(FailureCode::Application, format!("terminated by signal ({status})")),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let mut start = text.len().saturating_sub(STDERR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;
    use taskforge_core::{JobId, StrategyKind, TaskRef};

    use super::*;

    fn request(timeout: Option<Duration>) -> ExecutionRequest {
        ExecutionRequest::new(
            JobId::new(),
            1,
            StrategyKind::Process,
            TaskRef::new("proc"),
            json!({"greeting": "hello"}),
        )
        .with_timeout(timeout)
    }

    #[tokio::test]
    async fn echoes_json_through_stdin_and_stdout() {
        let executor = ProcessExecutor::new();
        let payload = executor
            .run(&ProcessCommand::shell("cat"), &request(None))
            .await
            .unwrap();
        assert_eq!(payload, json!({"greeting": "hello"}));
    }

    #[tokio::test]
    async fn malformed_output_is_deserialization_failure() {
        let executor = ProcessExecutor::new();
        let err = executor
            .run(&ProcessCommand::shell("echo 'not json'"), &request(None))
            .await
            .unwrap_err();
        assert_eq!(err.code, FailureCode::Deserialization);
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn exit_code_picks_failure_class() {
        let executor = ProcessExecutor::new();
        let transient = executor
            .run(&ProcessCommand::shell("echo flaky >&2; exit 1"), &request(None))
            .await
            .unwrap_err();
        assert_eq!(transient.code, FailureCode::Application);
        assert!(transient.is_retriable());
        assert!(transient.message.contains("flaky"));

        let usage = executor
            .run(&ProcessCommand::shell("exit 64"), &request(None))
            .await
            .unwrap_err();
        assert!(!usage.is_retriable());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let executor = ProcessExecutor::new();
        let err = executor
            .run(&ProcessCommand::new("/nonexistent/taskforge-worker"), &request(None))
            .await
            .unwrap_err();
        assert_eq!(err.code, FailureCode::Spawn);
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let executor = ProcessExecutor::new();
        let started = Instant::now();
        let err = executor
            .run(
                &ProcessCommand::shell("exec sleep 5"),
                &request(Some(Duration::from_millis(100))),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, FailureCode::Timeout);
        assert!(err.is_retriable());
        assert_eq!(executor.killed(), 1);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn env_and_args_reach_child() {
        let executor = ProcessExecutor::new();
        let command = ProcessCommand::shell("printf '{\"who\":\"%s\",\"arg\":\"%s\"}' \"$WHO\" \"$0\"")
            .arg("first")
            .env("WHO", "taskforge");
        let payload = executor.run(&command, &request(None)).await.unwrap();
        assert_eq!(payload, json!({"who": "taskforge", "arg": "first"}));
    }

    #[tokio::test]
    async fn oversized_output_is_non_retriable() {
        let executor = ProcessExecutor::new().with_output_limit(64);
        let started = Instant::now();
        let err = executor
            .run(&ProcessCommand::shell("exec yes"), &request(Some(Duration::from_secs(5))))
            .await
            .unwrap_err();

        assert_eq!(err.code, FailureCode::OutputLimit);
        assert!(!err.is_retriable());
        assert!(err.message.contains("64 byte"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn output_at_the_limit_is_accepted() {
        let executor = ProcessExecutor::new().with_output_limit(7);
        let payload = executor
            .run(&ProcessCommand::shell("printf '\"abcde\"'"), &request(None))
            .await
            .unwrap();
        assert_eq!(payload, json!("abcde"));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL + 10) + "END";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.ends_with("END"));
        assert_eq!(tail.len(), STDERR_TAIL);
    }
}

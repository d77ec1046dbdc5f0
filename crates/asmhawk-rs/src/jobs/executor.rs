use std::{
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;

/// Captured output of a successful tool run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("tool output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    /// Non-zero exit or process fault; whatever was captured is kept.
    #[error("{message}")]
    Failed {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// `"1.27s"`
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}

/// Runs one tool invocation inside an execution target.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    /// Display form of the invocation, recorded on the job.
    fn describe(&self, container: &str, argv: &[String]) -> String;

    async fn run(
        &self,
        container: &str,
        argv: &[String],
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// `<binary> exec <container> argv...`
    Container(String),
    /// argv runs directly on this host; the container name is ignored.
    Host,
}

impl Runtime {
    pub fn from_config(value: &str) -> Self {
        match value.trim() {
            "" | "none" | "host" => Self::Host,
            bin => Self::Container(bin.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Spawns tools as child processes with an argument list, never a shell line.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    runtime: Runtime,
    limits: ExecutionLimits,
}

enum CaptureError {
    TooLarge,
    Io(std::io::Error),
}

enum Outcome {
    Finished(Result<(ExitStatus, Vec<u8>, Vec<u8>), CaptureError>),
    TimedOut,
    Cancelled,
}

impl ProcessExecutor {
    pub fn new(runtime: Runtime, limits: ExecutionLimits) -> Self {
        Self { runtime, limits }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            Runtime::from_config(&cfg.container_runtime),
            ExecutionLimits {
                timeout: cfg.scan_timeout(),
                max_output_bytes: cfg.max_output_bytes,
            },
        )
    }

    fn invocation(&self, container: &str, argv: &[String]) -> Option<(String, Vec<String>)> {
        match &self.runtime {
            Runtime::Container(bin) => {
                let mut args = Vec::with_capacity(argv.len() + 2);
                args.push("exec".to_string());
                args.push(container.to_string());
                args.extend(argv.iter().cloned());
                Some((bin.clone(), args))
            }
            Runtime::Host => {
                let (program, rest) = argv.split_first()?;
                Some((program.clone(), rest.to_vec()))
            }
        }
    }
}

async fn read_capped<R: AsyncRead + Unpin>(reader: R, limit: usize) -> Result<Vec<u8>, CaptureError> {
    let mut buf = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(CaptureError::Io)?;
    if buf.len() > limit {
        return Err(CaptureError::TooLarge);
    }
    Ok(buf)
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill tool process");
    }
}

#[async_trait::async_trait]
impl JobExecutor for ProcessExecutor {
    fn describe(&self, container: &str, argv: &[String]) -> String {
        match self.invocation(container, argv) {
            Some((program, args)) if args.is_empty() => program,
            Some((program, args)) => format!("{program} {}", args.join(" ")),
            None => String::new(),
        }
    }

    async fn run(
        &self,
        container: &str,
        argv: &[String],
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        let (program, args) = self
            .invocation(container, argv)
            .ok_or_else(|| ExecutionError::failed("empty command"))?;

        info!(command = %program, ?args, container, "audit: launching external tool");
        let started = Instant::now();
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::failed(format!("failed to spawn {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::failed("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::failed("stderr not captured"))?;
        let limit = self.limits.max_output_bytes;

        let outcome = {
            let capture = async {
                let (out, err) =
                    tokio::try_join!(read_capped(stdout, limit), read_capped(stderr, limit))?;
                let status = child.wait().await.map_err(CaptureError::Io)?;
                Ok::<_, CaptureError>((status, out, err))
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                res = tokio::time::timeout(self.limits.timeout, capture) => match res {
                    Ok(captured) => Outcome::Finished(captured),
                    Err(_) => Outcome::TimedOut,
                },
            }
        };

        match outcome {
            Outcome::Cancelled => {
                kill(&mut child).await;
                Err(ExecutionError::Cancelled)
            }
            Outcome::TimedOut => {
                kill(&mut child).await;
                Err(ExecutionError::Timeout(self.limits.timeout))
            }
            Outcome::Finished(Err(CaptureError::TooLarge)) => {
                kill(&mut child).await;
                Err(ExecutionError::OutputTooLarge { limit })
            }
            Outcome::Finished(Err(CaptureError::Io(e))) => {
                kill(&mut child).await;
                Err(ExecutionError::failed(format!("failed to read tool output: {e}")))
            }
            Outcome::Finished(Ok((status, out, err))) => {
                let stdout = String::from_utf8_lossy(&out).into_owned();
                let stderr = String::from_utf8_lossy(&err).into_owned();
                if !status.success() {
                    return Err(ExecutionError::Failed {
                        message: format!("command failed with {status}"),
                        stdout,
                        stderr,
                    });
                }
                Ok(ExecutionReport {
                    stdout,
                    stderr,
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

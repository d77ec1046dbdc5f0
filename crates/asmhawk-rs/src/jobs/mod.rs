use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    db::{self, scans::Completion},
    models::ToolType,
    parser::{output_lines, parse_line},
};

mod executor;
mod orchestrator;

pub use executor::{
    format_elapsed, ExecutionError, ExecutionLimits, ExecutionReport, JobExecutor, ProcessExecutor,
    Runtime,
};
pub use orchestrator::ScanOrchestrator;

/// A job handed from `submit` to the worker pool.
#[derive(Debug, Clone)]
pub struct QueuedScan {
    pub id: Uuid,
    pub tool: ToolType,
    pub container: String,
    pub argv: Vec<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub struct JobRunnerState {
    pub running: usize,
}

/// Cancellation handles of jobs that are queued or running.
pub(crate) type Inflight = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

#[derive(Debug)]
pub struct RateLimiter {
    limit_per_minute: usize,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: usize) -> Self {
        Self {
            limit_per_minute,
            requests: VecDeque::new(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if self.requests.len() >= self.limit_per_minute {
            return false;
        }
        self.requests.push_back(now);
        true
    }

    /// Gives back the most recent slot, for requests rejected after `allow`.
    pub fn refund(&mut self) {
        self.requests.pop_back();
    }
}

pub(crate) struct WorkerContext {
    pub pool: SqlitePool,
    pub executor: Arc<dyn JobExecutor>,
    pub inflight: Inflight,
    pub permits: Arc<Semaphore>,
    pub runner_state: Arc<Mutex<JobRunnerState>>,
}

/// Pulls queued scans and runs each on its own task, at most
/// `permits` at a time. Waiting for a permit stops intake, so the channel
/// capacity bounds how many jobs can sit in the queue.
pub(crate) async fn worker_loop(ctx: Arc<WorkerContext>, mut rx: mpsc::Receiver<QueuedScan>) {
    while let Some(job) = rx.recv().await {
        let permit = match ctx.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let id = job.id;
            run_scan(&ctx, job).await;
            ctx.inflight.lock().await.remove(&id);
            drop(permit);
        });
    }
    info!("scan queue closed, worker loop exiting");
}

/// The asynchronous execution step: claim, execute, record.
async fn run_scan(ctx: &WorkerContext, job: QueuedScan) {
    if job.cancel.is_cancelled() {
        return;
    }

    let command = ctx.executor.describe(&job.container, &job.argv);
    match db::scans::mark_running(&ctx.pool, job.id, &command, Utc::now()).await {
        Ok(true) => {}
        Ok(false) => {
            info!(scan_id = %job.id, "scan no longer pending, skipping");
            return;
        }
        Err(e) => {
            error!(error = %e, scan_id = %job.id, "failed status update");
            return;
        }
    }

    {
        let mut lock = ctx.runner_state.lock().await;
        lock.running += 1;
    }
    db::audit::record(
        &ctx.pool,
        "launch_tool",
        "system",
        format!("scan_id={} command={command}", job.id),
    )
    .await;
    info!(scan_id = %job.id, tool = %job.tool, %command, "scan started");

    let started = Instant::now();
    let result = ctx
        .executor
        .run(&job.container, &job.argv, job.cancel.clone())
        .await;

    match result {
        Ok(report) => record_success(ctx, &job, report).await,
        Err(ExecutionError::Cancelled) => {
            info!(scan_id = %job.id, "scan cancelled, process stopped");
        }
        Err(e) => record_failure(ctx, &job, e, format_elapsed(started.elapsed())).await,
    }

    decrement_running(&ctx.runner_state).await;
}

async fn record_success(ctx: &WorkerContext, job: &QueuedScan, report: ExecutionReport) {
    let execution_time = format_elapsed(report.elapsed);
    let rows: Vec<_> = output_lines(&report.stdout).map(parse_line).collect();
    let row_count = rows.len();
    let completion = Completion {
        stderr: (!report.stderr.is_empty()).then_some(report.stderr),
        stdout: report.stdout,
        execution_time,
    };

    match db::scans::complete_with_results(
        &ctx.pool,
        job.id,
        &completion,
        &job.tool.result_type(),
        rows,
    )
    .await
    {
        Ok(true) => info!(
            scan_id = %job.id,
            results = row_count,
            elapsed = %completion.execution_time,
            "scan completed"
        ),
        Ok(false) => info!(scan_id = %job.id, "scan left RUNNING before completion, results discarded"),
        Err(e) => {
            error!(error = %e, scan_id = %job.id, "failed to store scan results");
            let message = format!("result ingestion failed: {e}");
            if let Err(e) = db::scans::mark_failed(
                &ctx.pool,
                job.id,
                Some(&completion.stdout),
                &message,
                &completion.execution_time,
            )
            .await
            {
                error!(error = %e, scan_id = %job.id, "failed status update");
            }
        }
    }
}

async fn record_failure(ctx: &WorkerContext, job: &QueuedScan, err: ExecutionError, execution_time: String) {
    error!(error = %err, scan_id = %job.id, tool = %job.tool, "scan failed");

    let (stdout, stderr) = match &err {
        ExecutionError::Failed { stdout, stderr, message } => {
            let stderr = if stderr.trim().is_empty() {
                message.clone()
            } else {
                format!("{message}\n{stderr}")
            };
            ((!stdout.is_empty()).then_some(stdout.as_str()), stderr)
        }
        other => (None, other.to_string()),
    };

    match db::scans::mark_failed(&ctx.pool, job.id, stdout, &stderr, &execution_time).await {
        Ok(true) => {}
        Ok(false) => warn!(scan_id = %job.id, "scan left RUNNING before failure was recorded"),
        Err(e) => error!(error = %e, scan_id = %job.id, "failed status update"),
    }
}

async fn decrement_running(runner_state: &Arc<Mutex<JobRunnerState>>) {
    let mut lock = runner_state.lock().await;
    lock.running = lock.running.saturating_sub(1);
}

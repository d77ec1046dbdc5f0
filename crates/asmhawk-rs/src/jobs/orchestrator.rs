use std::{collections::HashMap, sync::Arc};

use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{worker_loop, Inflight, JobExecutor, JobRunnerState, QueuedScan, WorkerContext};
use crate::{
    config::AppConfig,
    db,
    error::{ScanError, ServiceResult},
    models::{Page, PageMeta, ScanDetail, ScanFilter, ScanJob, ScanListItem, ScanStatus, ToolType},
    security::{in_scope, validate_target},
    tools::ToolRegistry,
};

const DEFAULT_TAKE: i64 = 20;
const MAX_TAKE: i64 = 100;

/// Owns the scan job lifecycle. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct ScanOrchestrator {
    pool: SqlitePool,
    registry: Arc<ToolRegistry>,
    queue: mpsc::Sender<QueuedScan>,
    inflight: Inflight,
    runner_state: Arc<Mutex<JobRunnerState>>,
    scope_allowlist: Arc<Vec<String>>,
}

impl ScanOrchestrator {
    /// Builds the orchestrator and spawns its worker pool.
    pub fn start(
        pool: SqlitePool,
        registry: Arc<ToolRegistry>,
        executor: Arc<dyn JobExecutor>,
        cfg: &AppConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let inflight: Inflight = Arc::new(Mutex::new(HashMap::new()));
        let runner_state = Arc::new(Mutex::new(JobRunnerState::default()));

        let ctx = Arc::new(WorkerContext {
            pool: pool.clone(),
            executor,
            inflight: inflight.clone(),
            permits: Arc::new(Semaphore::new(cfg.max_concurrent_scans.max(1))),
            runner_state: runner_state.clone(),
        });
        tokio::spawn(worker_loop(ctx, rx));

        Self {
            pool,
            registry,
            queue: tx,
            inflight,
            runner_state,
            scope_allowlist: Arc::new(cfg.scope_allowlist.clone()),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn running(&self) -> usize {
        self.runner_state.lock().await.running
    }

    /// Validates and records a `PENDING` job, then hands it to the worker
    /// pool. Returns without waiting for execution to begin.
    pub async fn submit(&self, asset_id: Uuid, tool: ToolType, actor: &str) -> ServiceResult<ScanJob> {
        let asset = db::assets::find(&self.pool, asset_id)
            .await?
            .ok_or(ScanError::AssetNotFound(asset_id))?;
        let recipe = self.registry.resolve(tool)?;

        let covered = in_scope(&asset.domain, &self.scope_allowlist)
            || asset
                .ip_address
                .as_deref()
                .is_some_and(|ip| in_scope(ip, &self.scope_allowlist));
        if !covered {
            return Err(ScanError::OutOfScope(asset.domain));
        }
        validate_target(&asset.domain)?;

        // Reserve the queue slot first so a full queue leaves no orphan job row.
        let slot = self.queue.try_reserve().map_err(|e| {
            warn!(error = %e, "scan queue rejected submission");
            ScanError::QueueFull
        })?;

        let job = db::scans::insert_pending(&self.pool, asset.id, tool).await?;
        if let Err(e) = db::assets::touch_last_seen(&self.pool, asset.id).await {
            warn!(error = %e, asset_id = %asset.id, "failed to refresh asset last_seen_at");
        }

        let cancel = CancellationToken::new();
        self.inflight.lock().await.insert(job.id, cancel.clone());
        slot.send(QueuedScan {
            id: job.id,
            tool,
            container: recipe.container.clone(),
            argv: recipe.argv(&asset.domain),
            cancel,
        });

        db::audit::record(
            &self.pool,
            "submit_scan",
            actor,
            format!("scan_id={} asset={} tool={tool}", job.id, asset.domain),
        )
        .await;
        info!(scan_id = %job.id, asset_id = %asset.id, %tool, "scan queued");
        Ok(job)
    }

    /// Marks the job `CANCELLED` and stops its process if one is running.
    pub async fn cancel(&self, id: Uuid, actor: &str) -> ServiceResult<ScanJob> {
        let job = db::scans::find(&self.pool, id)
            .await?
            .ok_or(ScanError::JobNotFound(id))?;
        if !job.status.can_transition_to(ScanStatus::Cancelled) {
            return Err(ScanError::InvalidTransition {
                from: job.status,
                to: ScanStatus::Cancelled,
            });
        }

        let Some(cancelled) = db::scans::mark_cancelled(&self.pool, id).await? else {
            // Finished or vanished between the read and the write.
            let from = db::scans::status_of(&self.pool, id)
                .await?
                .ok_or(ScanError::JobNotFound(id))?;
            return Err(ScanError::InvalidTransition {
                from,
                to: ScanStatus::Cancelled,
            });
        };

        if let Some(token) = self.inflight.lock().await.remove(&id) {
            token.cancel();
        }
        db::audit::record(&self.pool, "cancel_scan", actor, format!("scan_id={id}")).await;
        info!(scan_id = %id, from = %job.status, "scan cancelled");
        Ok(cancelled)
    }

    /// Deletes the job and its result rows, stopping any running process.
    pub async fn delete(&self, id: Uuid, actor: &str) -> ServiceResult<()> {
        if db::scans::find(&self.pool, id).await?.is_none() {
            return Err(ScanError::JobNotFound(id));
        }
        if let Some(token) = self.inflight.lock().await.remove(&id) {
            token.cancel();
        }
        if !db::scans::delete(&self.pool, id).await? {
            return Err(ScanError::JobNotFound(id));
        }
        db::audit::record(&self.pool, "delete_scan", actor, format!("scan_id={id}")).await;
        info!(scan_id = %id, "scan deleted");
        Ok(())
    }

    /// Deletes an asset together with its scans, stopping any of them still
    /// queued or running.
    pub async fn delete_asset(&self, asset_id: Uuid, actor: &str) -> ServiceResult<()> {
        let asset = db::assets::find(&self.pool, asset_id)
            .await?
            .ok_or(ScanError::AssetNotFound(asset_id))?;

        let live: Vec<Uuid> = db::scans::list_for_asset(&self.pool, asset_id)
            .await?
            .into_iter()
            .filter(|row| !row.scan.status.is_terminal())
            .map(|row| row.scan.id)
            .collect();
        {
            let mut inflight = self.inflight.lock().await;
            for id in &live {
                if let Some(token) = inflight.remove(id) {
                    token.cancel();
                }
            }
        }

        if !db::assets::delete(&self.pool, asset_id).await? {
            return Err(ScanError::AssetNotFound(asset_id));
        }
        db::audit::record(
            &self.pool,
            "delete_asset",
            actor,
            format!("asset_id={asset_id} domain={} stopped_scans={}", asset.domain, live.len()),
        )
        .await;
        info!(%asset_id, stopped = live.len(), "asset deleted");
        Ok(())
    }

    pub async fn list(&self, filter: &ScanFilter) -> ServiceResult<Page<ScanListItem>> {
        let skip = filter.skip.unwrap_or(0).max(0);
        let take = filter.take.unwrap_or(DEFAULT_TAKE).clamp(1, MAX_TAKE);
        let (rows, total) = db::scans::list(&self.pool, filter, skip, take).await?;
        Ok(Page {
            data: rows.into_iter().map(ScanListItem::from).collect(),
            meta: PageMeta { total, skip, take },
        })
    }

    pub async fn list_for_asset(&self, asset_id: Uuid) -> ServiceResult<Vec<ScanListItem>> {
        if db::assets::find(&self.pool, asset_id).await?.is_none() {
            return Err(ScanError::AssetNotFound(asset_id));
        }
        let rows = db::scans::list_for_asset(&self.pool, asset_id).await?;
        Ok(rows.into_iter().map(ScanListItem::from).collect())
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<ScanDetail> {
        let scan = db::scans::find(&self.pool, id)
            .await?
            .ok_or(ScanError::JobNotFound(id))?;
        let asset = db::assets::find(&self.pool, scan.asset_id)
            .await?
            .ok_or(ScanError::AssetNotFound(scan.asset_id))?;
        let scan_results = db::scans::results_for(&self.pool, id).await?;
        Ok(ScanDetail {
            scan,
            asset,
            scan_results,
        })
    }

    /// Settles jobs left behind by a previous process: `RUNNING` ones are
    /// failed (their process is gone), `PENDING` ones are queued again.
    ///
    /// Never waits on the queue. Jobs that do not fit are handed to a
    /// background task that feeds them in as slots free up; they stay
    /// `PENDING` (and cancellable) until then.
    pub async fn recover_interrupted(&self) -> ServiceResult<RecoveryReport> {
        let failed = db::scans::fail_running(&self.pool, "interrupted by service restart").await?;

        let mut report = RecoveryReport {
            failed,
            ..Default::default()
        };
        let mut backlog = Vec::new();
        for (id, tool, domain) in db::scans::pending_targets(&self.pool).await? {
            let recipe = match self.registry.resolve(tool) {
                Ok(recipe) => recipe,
                Err(e) => {
                    warn!(scan_id = %id, error = %e, "cancelling queued scan for unavailable tool");
                    db::scans::mark_cancelled(&self.pool, id).await?;
                    report.cancelled += 1;
                    continue;
                }
            };
            let cancel = CancellationToken::new();
            self.inflight.lock().await.insert(id, cancel.clone());
            let queued = QueuedScan {
                id,
                tool,
                container: recipe.container.clone(),
                argv: recipe.argv(&domain),
                cancel,
            };

            if !backlog.is_empty() {
                backlog.push(queued);
                continue;
            }
            match self.queue.try_reserve() {
                Ok(slot) => {
                    slot.send(queued);
                    report.requeued += 1;
                }
                Err(_) => backlog.push(queued),
            }
        }

        report.deferred = backlog.len();
        if !backlog.is_empty() {
            warn!(
                deferred = backlog.len(),
                "scan queue full during recovery, feeding the rest in the background"
            );
            let queue = self.queue.clone();
            tokio::spawn(async move {
                for queued in backlog {
                    let id = queued.id;
                    if queue.send(queued).await.is_err() {
                        warn!(scan_id = %id, "scan queue closed during recovery");
                        break;
                    }
                }
            });
        }

        if report != RecoveryReport::default() {
            info!(
                failed = report.failed,
                requeued = report.requeued,
                deferred = report.deferred,
                cancelled = report.cancelled,
                "recovered scans from previous run"
            );
        }
        Ok(report)
    }
}

/// Outcome of [`ScanOrchestrator::recover_interrupted`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `RUNNING` jobs written `FAILED`.
    pub failed: u64,
    /// `PENDING` jobs placed straight back on the queue.
    pub requeued: usize,
    /// `PENDING` jobs waiting for a queue slot.
    pub deferred: usize,
    /// `PENDING` jobs whose tool is no longer registered.
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        db::memory_pool,
        jobs::{ExecutionError, ExecutionReport},
        models::{Asset, NewAsset},
    };

    type Script = Box<dyn Fn() -> Result<ExecutionReport, ExecutionError> + Send + Sync>;

    /// Executor double: signals when a run starts, optionally blocks until
    /// released or cancelled, then returns the scripted outcome.
    struct ScriptedExecutor {
        script: Script,
        started: Arc<Notify>,
        runs: Arc<AtomicUsize>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedExecutor {
        fn new(script: Script) -> Self {
            Self {
                script,
                started: Arc::new(Notify::new()),
                runs: Arc::new(AtomicUsize::new(0)),
                gate: None,
            }
        }

        fn gated(script: Script) -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let mut exec = Self::new(script);
            exec.gate = Some(gate.clone());
            (exec, gate)
        }
    }

    #[async_trait::async_trait]
    impl JobExecutor for ScriptedExecutor {
        fn describe(&self, container: &str, argv: &[String]) -> String {
            format!("docker exec {container} {}", argv.join(" "))
        }

        async fn run(
            &self,
            _container: &str,
            _argv: &[String],
            cancel: CancellationToken,
        ) -> Result<ExecutionReport, ExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                tokio::select! {
                    permit = gate.acquire() => drop(permit),
                    _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                }
            }
            (self.script)()
        }
    }

    fn succeed(stdout: &'static str) -> Script {
        Box::new(move || {
            Ok(ExecutionReport {
                stdout: stdout.to_string(),
                stderr: String::new(),
                elapsed: Duration::from_millis(1234),
            })
        })
    }

    fn config() -> AppConfig {
        AppConfig::default()
    }

    async fn setup(executor: ScriptedExecutor, cfg: &AppConfig) -> (ScanOrchestrator, Arc<Notify>, SqlitePool) {
        let pool = memory_pool().await;
        let started = executor.started.clone();
        let orchestrator = ScanOrchestrator::start(
            pool.clone(),
            Arc::new(ToolRegistry::from_config(cfg)),
            Arc::new(executor),
            cfg,
        );
        (orchestrator, started, pool)
    }

    async fn seed_asset(pool: &SqlitePool, domain: &str) -> Asset {
        db::assets::insert(
            pool,
            NewAsset {
                domain: domain.to_string(),
                ip_address: None,
                ip_owner: None,
                asset_type: None,
                metadata: None,
            },
        )
        .await
        .unwrap()
    }

    async fn wait_for_terminal(orchestrator: &ScanOrchestrator, id: Uuid) -> ScanDetail {
        for _ in 0..200 {
            let detail = orchestrator.get(id).await.unwrap();
            if detail.scan.status.is_terminal() {
                return detail;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scan {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn subfinder_scan_runs_to_completion() {
        let (exec, gate) = ScriptedExecutor::gated(succeed("api.example.com\nwww.example.com\n"));
        let (orchestrator, started, pool) = setup(exec, &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator
            .submit(asset.id, ToolType::Subfinder, "analyst")
            .await
            .unwrap();
        assert_eq!(job.status, ScanStatus::Pending);
        assert_eq!(job.asset_id, asset.id);

        started.notified().await;
        let running = orchestrator.get(job.id).await.unwrap();
        assert_eq!(running.scan.status, ScanStatus::Running);
        assert_eq!(
            running.scan.command.as_deref(),
            Some("docker exec asm-hawk-subfinder subfinder -d example.com -silent")
        );
        assert!(running.scan.started_at.is_some());

        gate.add_permits(1);
        let done = wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(done.scan.status, ScanStatus::Completed);
        assert_eq!(done.scan.execution_time.as_deref(), Some("1.23s"));
        assert_eq!(done.scan.stderr, None);
        assert!(done.scan.completed_at.is_some());
        assert_eq!(done.scan_results.len(), 2);
        assert_eq!(done.scan_results[0].data.0, json!({"value": "api.example.com"}));
        assert_eq!(done.scan_results[1].data.0, json!({"value": "www.example.com"}));
        assert!(done.scan_results.iter().all(|r| r.result_type == "subfinder"));
        assert_eq!(done.asset.domain, "example.com");
    }

    #[tokio::test]
    async fn json_lines_are_stored_decoded() {
        let exec = ScriptedExecutor::new(succeed(
            "{\"url\":\"https://example.com\",\"status_code\":200}\n\n   \nnot json\n",
        ));
        let (orchestrator, _, pool) = setup(exec, &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Httpx, "analyst").await.unwrap();
        let done = wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(done.scan_results.len(), 2);
        assert_eq!(done.scan_results[0].data.0["status_code"], 200);
        assert_eq!(done.scan_results[0].result_type, "httpx");
        assert_eq!(done.scan_results[1].data.0, json!({"value": "not json"}));
    }

    #[tokio::test]
    async fn empty_output_completes_without_rows() {
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("  \n")), &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Dnsx, "analyst").await.unwrap();
        let done = wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(done.scan.status, ScanStatus::Completed);
        assert!(done.scan_results.is_empty());
    }

    #[tokio::test]
    async fn missing_asset_creates_no_job() {
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("")), &config()).await;

        let missing = Uuid::new_v4();
        let err = orchestrator
            .submit(missing, ToolType::Subfinder, "analyst")
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::AssetNotFound(id) if id == missing));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scans")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn disabled_tool_is_rejected() {
        let mut cfg = config();
        cfg.disabled_tools = vec![ToolType::Nuclei];
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("")), &cfg).await;
        let asset = seed_asset(&pool, "example.com").await;

        let err = orchestrator
            .submit(asset.id, ToolType::Nuclei, "analyst")
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn out_of_scope_targets_are_refused() {
        let mut cfg = config();
        cfg.scope_allowlist = vec!["example.com".to_string()];
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("")), &cfg).await;
        let inside = seed_asset(&pool, "api.example.com").await;
        let outside = seed_asset(&pool, "example.org").await;

        assert!(orchestrator.submit(inside.id, ToolType::Httpx, "a").await.is_ok());
        assert!(matches!(
            orchestrator.submit(outside.id, ToolType::Httpx, "a").await,
            Err(ScanError::OutOfScope(_))
        ));
    }

    #[tokio::test]
    async fn timeout_fails_the_job_without_rows() {
        let exec = ScriptedExecutor::new(Box::new(|| {
            Err(ExecutionError::Timeout(Duration::from_secs(300)))
        }));
        let (orchestrator, _, pool) = setup(exec, &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Katana, "analyst").await.unwrap();
        let done = wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(done.scan.status, ScanStatus::Failed);
        assert!(done.scan.stderr.as_deref().unwrap().contains("timed out"));
        assert!(done.scan.execution_time.is_some());
        assert!(done.scan.completed_at.is_some());
        assert!(done.scan_results.is_empty());
    }

    #[tokio::test]
    async fn failed_exit_keeps_captured_output() {
        let exec = ScriptedExecutor::new(Box::new(|| {
            Err(ExecutionError::Failed {
                message: "command failed with exit status: 1".to_string(),
                stdout: "partial\n".to_string(),
                stderr: "no such container".to_string(),
            })
        }));
        let (orchestrator, _, pool) = setup(exec, &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Ffuf, "analyst").await.unwrap();
        let done = wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(done.scan.status, ScanStatus::Failed);
        let stderr = done.scan.stderr.unwrap();
        assert!(stderr.contains("exit status: 1"));
        assert!(stderr.contains("no such container"));
        assert_eq!(done.scan.stdout.as_deref(), Some("partial\n"));
        assert!(done.scan_results.is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_running_scan_stops_it() {
        let (exec, _gate) = ScriptedExecutor::gated(succeed("never stored\n"));
        let (orchestrator, started, pool) = setup(exec, &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Gospider, "analyst").await.unwrap();
        started.notified().await;

        let cancelled = orchestrator.cancel(job.id, "analyst").await.unwrap();
        assert_eq!(cancelled.status, ScanStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let detail = orchestrator.get(job.id).await.unwrap();
        assert_eq!(detail.scan.status, ScanStatus::Cancelled);
        assert!(detail.scan_results.is_empty());
        assert_eq!(orchestrator.running().await, 0);
    }

    #[tokio::test]
    async fn terminal_scans_cannot_be_cancelled() {
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("a\n")), &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Subfinder, "analyst").await.unwrap();
        wait_for_terminal(&orchestrator, job.id).await;

        let err = orchestrator.cancel(job.id, "analyst").await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::InvalidTransition {
                from: ScanStatus::Completed,
                to: ScanStatus::Cancelled
            }
        ));
        assert_eq!(
            orchestrator.get(job.id).await.unwrap().scan.status,
            ScanStatus::Completed
        );

        assert!(matches!(
            orchestrator.cancel(Uuid::new_v4(), "analyst").await,
            Err(ScanError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_cascades_and_reports_missing() {
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("a\nb\n")), &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Assetfinder, "admin").await.unwrap();
        wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(db::scans::count_results(&pool, job.id).await.unwrap(), 2);

        orchestrator.delete(job.id, "admin").await.unwrap();
        assert_eq!(db::scans::count_results(&pool, job.id).await.unwrap(), 0);
        assert!(matches!(
            orchestrator.get(job.id).await,
            Err(ScanError::JobNotFound(_))
        ));
        assert!(matches!(
            orchestrator.delete(job.id, "admin").await,
            Err(ScanError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_an_asset_stops_its_running_scans() {
        let (exec, _gate) = ScriptedExecutor::gated(succeed("late\n"));
        let (orchestrator, started, pool) = setup(exec, &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Katana, "admin").await.unwrap();
        started.notified().await;

        orchestrator.delete_asset(asset.id, "admin").await.unwrap();
        assert!(db::assets::find(&pool, asset.id).await.unwrap().is_none());
        assert!(db::scans::find(&pool, job.id).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.running().await, 0);
        assert!(matches!(
            orchestrator.delete_asset(asset.id, "admin").await,
            Err(ScanError::AssetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_rejects_without_creating_a_job() {
        let mut cfg = config();
        cfg.queue_capacity = 1;
        cfg.max_concurrent_scans = 1;
        let (exec, _gate) = ScriptedExecutor::gated(succeed(""));
        let (orchestrator, _, pool) = setup(exec, &cfg).await;
        let asset = seed_asset(&pool, "example.com").await;

        let mut accepted = 0;
        let mut rejected = false;
        for _ in 0..5 {
            match orchestrator.submit(asset.id, ToolType::Subfinder, "analyst").await {
                Ok(_) => accepted += 1,
                Err(ScanError::QueueFull) => {
                    rejected = true;
                    break;
                }
                Err(other) => panic!("unexpected {other}"),
            }
        }
        assert!(rejected);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scans")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, accepted);
    }

    #[tokio::test]
    async fn list_pages_newest_first_with_counts() {
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("x\ny\nz\n")), &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let first = orchestrator.submit(asset.id, ToolType::Subfinder, "a").await.unwrap();
        wait_for_terminal(&orchestrator, first.id).await;
        let second = orchestrator.submit(asset.id, ToolType::Dnsx, "a").await.unwrap();
        wait_for_terminal(&orchestrator, second.id).await;

        let page = orchestrator.list(&ScanFilter::default()).await.unwrap();
        assert_eq!(page.meta.total, 2);
        assert_eq!((page.meta.skip, page.meta.take), (0, 20));
        assert_eq!(page.data[0].scan.id, second.id);
        assert_eq!(page.data[1].result_count, 3);
        assert_eq!(page.data[1].asset.domain, "example.com");

        let page = orchestrator
            .list(&ScanFilter {
                tool_type: Some(ToolType::Dnsx),
                take: Some(1000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.meta.total, 1);
        assert_eq!(page.meta.take, 100);

        assert_eq!(orchestrator.list_for_asset(asset.id).await.unwrap().len(), 2);
        assert!(matches!(
            orchestrator.list_for_asset(Uuid::new_v4()).await,
            Err(ScanError::AssetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn submit_refreshes_asset_last_seen() {
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("")), &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        orchestrator.submit(asset.id, ToolType::Subfinder, "a").await.unwrap();
        let refreshed = db::assets::find(&pool, asset.id).await.unwrap().unwrap();
        assert!(refreshed.last_seen_at >= asset.last_seen_at);
    }

    #[tokio::test]
    async fn recovery_fails_running_and_requeues_pending() {
        let (orchestrator, _, pool) = setup(ScriptedExecutor::new(succeed("r\n")), &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let stale = db::scans::insert_pending(&pool, asset.id, ToolType::Katana).await.unwrap();
        db::scans::mark_running(&pool, stale.id, "cmd", Utc::now()).await.unwrap();
        let queued = db::scans::insert_pending(&pool, asset.id, ToolType::Subfinder).await.unwrap();

        let report = orchestrator.recover_interrupted().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                failed: 1,
                requeued: 1,
                deferred: 0,
                cancelled: 0,
            }
        );

        let stale = orchestrator.get(stale.id).await.unwrap();
        assert_eq!(stale.scan.status, ScanStatus::Failed);
        assert!(stale.scan.execution_time.is_some());
        let done = wait_for_terminal(&orchestrator, queued.id).await;
        assert_eq!(done.scan.status, ScanStatus::Completed);
        assert_eq!(done.scan_results.len(), 1);
    }

    #[tokio::test]
    async fn recovery_does_not_wait_for_a_full_queue() {
        let mut cfg = config();
        cfg.queue_capacity = 2;
        cfg.max_concurrent_scans = 1;
        let (exec, gate) = ScriptedExecutor::gated(succeed("r\n"));
        let (orchestrator, _, pool) = setup(exec, &cfg).await;
        let asset = seed_asset(&pool, "example.com").await;

        let mut ids = Vec::new();
        for _ in 0..6 {
            let job = db::scans::insert_pending(&pool, asset.id, ToolType::Dnsx).await.unwrap();
            ids.push(job.id);
        }

        let report = tokio::time::timeout(Duration::from_secs(2), orchestrator.recover_interrupted())
            .await
            .expect("recovery blocked on the queue")
            .unwrap();
        assert_eq!(report.requeued + report.deferred, 6);
        assert!(report.deferred > 0);

        gate.add_permits(1);
        for id in ids {
            let done = wait_for_terminal(&orchestrator, id).await;
            assert_eq!(done.scan.status, ScanStatus::Completed);
        }
    }

    #[tokio::test]
    async fn cancelling_a_queued_scan_keeps_it_from_running() {
        let mut cfg = config();
        cfg.max_concurrent_scans = 1;
        let (exec, gate) = ScriptedExecutor::gated(succeed("x\n"));
        let runs = exec.runs.clone();
        let (orchestrator, started, pool) = setup(exec, &cfg).await;
        let asset = seed_asset(&pool, "example.com").await;

        let first = orchestrator.submit(asset.id, ToolType::Subfinder, "a").await.unwrap();
        started.notified().await;
        let second = orchestrator.submit(asset.id, ToolType::Httpx, "a").await.unwrap();

        let cancelled = orchestrator.cancel(second.id, "a").await.unwrap();
        assert_eq!(cancelled.status, ScanStatus::Cancelled);

        gate.add_permits(1);
        let first = wait_for_terminal(&orchestrator, first.id).await;
        assert_eq!(first.scan.status, ScanStatus::Completed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = orchestrator.get(second.id).await.unwrap();
        assert_eq!(second.scan.status, ScanStatus::Cancelled);
        assert!(second.scan.started_at.is_none());
        assert!(second.scan.command.is_none());
        assert!(second.scan_results.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_ingestion_rolls_back_and_fails_the_scan() {
        let (exec, gate) = ScriptedExecutor::gated(succeed("a.example.com\nb.example.com\n"));
        let (orchestrator, started, pool) = setup(exec, &config()).await;
        let asset = seed_asset(&pool, "example.com").await;

        let job = orchestrator.submit(asset.id, ToolType::Subfinder, "a").await.unwrap();
        started.notified().await;
        sqlx::query(
            "CREATE TRIGGER reject_rows BEFORE INSERT ON scan_results \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        gate.add_permits(1);
        let done = wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(done.scan.status, ScanStatus::Failed);
        let stderr = done.scan.stderr.unwrap();
        assert!(stderr.starts_with("result ingestion failed"), "{stderr}");
        assert_eq!(done.scan.stdout.as_deref(), Some("a.example.com\nb.example.com\n"));
        assert!(done.scan.execution_time.is_some());
        assert!(done.scan_results.is_empty());
        assert_eq!(db::scans::count_results(&pool, job.id).await.unwrap(), 0);
    }
}

//! Stream orchestrator
//!
//! [`StreamOrchestrator`] owns the worker processes, one per stream record.
//! It keeps the registry in memory (display order preserved) and writes it
//! through [`RegistryStore`] on every mutation.
//!
//! Operations on one stream id are serialized by a per-id lock. Each new
//! operation first cancels the token of the one in flight, so a stop issued
//! while a start is still in its confirmation window wins. Reconciliation
//! only uses `try_lock` and leaves busy streams alone.

use crate::capacity::{self, CapacityGate, CapacitySnapshot};
use crate::config_ext::StreamSettings;
use crate::diagnostics::{
    self, DiagnosisContext, DiagnosisResult, diagnose, diagnose_signal, normalize_exit_code,
};
use crate::error::{Result, StreamError};
use crate::model::{
    self, StoredStream, StreamConfig, StreamPatch, StreamRecord, StreamStatus, derive_stream_id,
};
use crate::store::RegistryStore;
use crate::worker::{StderrTail, WorkerExit, WorkerHandle, WorkerParams, spawn_worker};
use chrono::{DateTime, Utc};
use pmoicecast::{IcecastController, IcecastError};
use pmoutils::{OsAdapter, PollOutcome, PollPolicy, poll_until};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wait after a forced kill before giving up on the worker.
const FORCE_KILL_GRACE: Duration = Duration::from_secs(2);

/// Source of creation timestamps (hence of stream ids).
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
enum WorkerKind {
    /// Spawned by this process
    Owned(Arc<WorkerHandle>),
    /// Found alive at startup; only its pid is known
    Adopted { pid: u32 },
}

#[derive(Debug, Clone)]
struct ActiveWorker {
    generation: u64,
    kind: WorkerKind,
    ctx: DiagnosisContext,
}

/// Per-id coordination state.
#[derive(Default)]
struct StreamSlot {
    op: Arc<Mutex<()>>,
    token: StdMutex<CancellationToken>,
    worker: StdMutex<Option<ActiveWorker>>,
    generation: AtomicU64,
    last_tail: StdMutex<Option<StderrTail>>,
}

impl StreamSlot {
    fn install(&self, kind: WorkerKind, ctx: DiagnosisContext) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let WorkerKind::Owned(handle) = &kind {
            *lock(&self.last_tail) = Some(handle.tail().clone());
        }
        *lock(&self.worker) = Some(ActiveWorker {
            generation,
            kind,
            ctx,
        });
        generation
    }

    fn current(&self) -> Option<ActiveWorker> {
        lock(&self.worker).clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|w| w.generation == generation)
    }

    fn take(&self) -> Option<ActiveWorker> {
        lock(&self.worker).take()
    }

    fn clear(&self, generation: u64) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|w| w.generation == generation) {
            *worker = None;
        }
    }

    fn tail(&self) -> Vec<String> {
        lock(&self.last_tail)
            .as_ref()
            .map(StderrTail::lines)
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Summary returned by [`StreamOrchestrator::get_stats`].
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub total: usize,
    pub running: usize,
    pub errors: usize,
    pub stopped: usize,
    pub streams: Vec<StreamRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum BulkOutcome {
    Ok,
    Skipped,
    Failed,
}

/// Outcome of one stream inside a bulk operation.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct BulkItem {
    pub id: String,
    pub name: String,
    pub outcome: BulkOutcome,
    pub status: StreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Per-stream results of a bulk operation, in registry order.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<BulkItem>,
}

impl BulkReport {
    fn push(&mut self, item: BulkItem) {
        match item.outcome {
            BulkOutcome::Ok => self.succeeded += 1,
            BulkOutcome::Skipped => self.skipped += 1,
            BulkOutcome::Failed => self.failed += 1,
        }
        self.results.push(item);
    }

    fn push_result(&mut self, record: &StreamRecord, result: Result<StreamRecord>) {
        let item = match result {
            Ok(updated) => BulkItem {
                id: updated.id.clone(),
                name: updated.name.clone(),
                outcome: BulkOutcome::Ok,
                status: updated.status,
                error: None,
                code: None,
            },
            Err(e) => BulkItem {
                id: record.id.clone(),
                name: record.name.clone(),
                outcome: BulkOutcome::Failed,
                status: record.status,
                error: Some(e.to_string()),
                code: Some(e.code().to_string()),
            },
        };
        self.push(item);
    }

    fn push_skipped(&mut self, record: &StreamRecord) {
        self.push(BulkItem {
            id: record.id.clone(),
            name: record.name.clone(),
            outcome: BulkOutcome::Skipped,
            status: record.status,
            error: None,
            code: None,
        });
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Result of [`StreamOrchestrator::update_stream`].
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub old_id: String,
    pub stream: StreamRecord,
}

impl UpdateOutcome {
    pub fn id_changed(&self) -> bool {
        self.old_id != self.stream.id
    }
}

pub struct StreamOrchestrator {
    settings: StreamSettings,
    controller: Arc<IcecastController>,
    os: Arc<dyn OsAdapter>,
    gate: CapacityGate,
    store: RegistryStore,
    registry: Mutex<Vec<StreamRecord>>,
    slots: StdMutex<HashMap<String, Arc<StreamSlot>>>,
    clock: Clock,
    this: Weak<StreamOrchestrator>,
}

impl StreamOrchestrator {
    /// Loads the registry and recovers the streams that were running.
    pub async fn open(
        settings: StreamSettings,
        controller: Arc<IcecastController>,
        os: Arc<dyn OsAdapter>,
    ) -> Result<Arc<Self>> {
        Self::open_with_clock(settings, controller, os, Arc::new(Utc::now)).await
    }

    pub async fn open_with_clock(
        settings: StreamSettings,
        controller: Arc<IcecastController>,
        os: Arc<dyn OsAdapter>,
        clock: Clock,
    ) -> Result<Arc<Self>> {
        let store = RegistryStore::new(&settings.registry_path);
        let records: Vec<StreamRecord> = store
            .load()
            .await?
            .into_iter()
            .map(StreamRecord::from)
            .collect();
        info!(
            path = %store.path().display(),
            count = records.len(),
            "Stream registry loaded"
        );

        let orchestrator = Arc::new_cyclic(|this| Self {
            gate: CapacityGate::new(controller.clone()),
            settings,
            controller,
            os,
            store,
            registry: Mutex::new(records),
            slots: StdMutex::new(HashMap::new()),
            clock,
            this: this.clone(),
        });
        orchestrator.recover().await?;
        Ok(orchestrator)
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn controller(&self) -> &Arc<IcecastController> {
        &self.controller
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn list(&self) -> Vec<StreamRecord> {
        self.registry.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Result<StreamRecord> {
        self.registry
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StreamError::NotFound(id.to_string()))
    }

    pub async fn get_stats(&self) -> StreamStats {
        let streams = self.list().await;
        let count = |status| streams.iter().filter(|r| r.status == status).count();
        StreamStats {
            total: streams.len(),
            running: count(StreamStatus::Running),
            errors: count(StreamStatus::Error),
            stopped: count(StreamStatus::Stopped),
            streams,
        }
    }

    /// Last stderr lines of the current or most recent worker.
    pub async fn worker_log(&self, id: &str) -> Result<Vec<String>> {
        self.get(id).await?;
        let slot = lock(&self.slots).get(id).cloned();
        Ok(slot.map(|s| s.tail()).unwrap_or_default())
    }

    pub async fn active_count(&self) -> u32 {
        count_active(&self.registry.lock().await)
    }

    pub async fn capacity_snapshot(&self) -> CapacitySnapshot {
        let active = self.active_count().await;
        self.gate.snapshot(active).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Creates a stream and starts its worker.
    ///
    /// Resolves once the worker survived the confirmation window (`running`)
    /// or exited inside it (`error`, diagnosed).
    pub async fn start_stream(&self, config: StreamConfig) -> Result<StreamRecord> {
        config.validate()?;
        self.require_installed().await?;

        let created_at = (self.clock)();
        let id = derive_stream_id(&config.name, created_at);
        let (slot, _guard, token) = self.begin(&id).await;
        if token.is_cancelled() {
            return Err(StreamError::Cancelled { id, operation: "start" });
        }

        let limit = self.gate.limit().await;
        {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry.iter().find(|r| r.id == id) {
                return Err(StreamError::DuplicateStreamId {
                    id,
                    status: existing.status,
                });
            }
            capacity::admit(limit, count_active(&registry))?;

            let mut record = StreamRecord::new(id.clone(), &config, created_at);
            record.status = StreamStatus::Starting;
            registry.push(record);
            if let Err(e) = self.persist(&registry).await {
                registry.pop();
                return Err(e);
            }
        }
        info!(stream_id = %id, device = %config.device_id, bitrate = config.bitrate, "Starting stream");

        self.launch_locked(&slot, &id, &token, "start").await
    }

    /// Stops a stream. Stopping a stopped stream is a no-op.
    pub async fn stop_stream(&self, id: &str) -> Result<StreamRecord> {
        self.get(id).await?;
        let (slot, _guard, _token) = self.begin(id).await;
        self.stop_locked(id, &slot).await
    }

    /// Stops then starts a stream with its persisted configuration.
    ///
    /// On a stopped or failed stream this is a plain start.
    pub async fn restart_stream(&self, id: &str) -> Result<StreamRecord> {
        self.get(id).await?;
        let (slot, _guard, token) = self.begin(id).await;
        // An idle record is admitted before anything about it changes.
        let record = self.get(id).await?;
        if slot.current().is_some() || record.pid.is_some() {
            self.stop_locked(id, &slot).await?;
            if token.is_cancelled() {
                return Err(StreamError::Cancelled {
                    id: id.to_string(),
                    operation: "restart",
                });
            }
        }
        self.require_installed().await?;
        self.admit_existing(id).await?;
        info!(stream_id = %id, "Restarting stream");
        self.launch_locked(&slot, id, &token, "restart").await
    }

    /// Changes a stopped or failed stream.
    ///
    /// A new name or device gives the stream a new id, hence a new
    /// mountpoint; the worker log of the old id is not carried over.
    pub async fn update_stream(&self, id: &str, patch: StreamPatch) -> Result<UpdateOutcome> {
        if patch.is_empty() {
            return Err(StreamError::Validation("nothing to update".to_string()));
        }
        if let Some(name) = &patch.name {
            model::validate_name(name)?;
        }
        if let Some(device_id) = &patch.device_id {
            model::validate_device(device_id)?;
        }
        if let Some(bitrate) = patch.bitrate {
            model::validate_bitrate(bitrate)?;
        }

        self.get(id).await?;
        let (_slot, _guard, _token) = self.begin(id).await;

        let mut registry = self.registry.lock().await;
        let index = registry
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StreamError::NotFound(id.to_string()))?;
        let previous = registry[index].clone();
        if !matches!(previous.status, StreamStatus::Stopped | StreamStatus::Error) {
            return Err(StreamError::Busy {
                id: id.to_string(),
                status: previous.status,
            });
        }

        let name = patch
            .name
            .as_deref()
            .map(str::trim)
            .unwrap_or(&previous.name)
            .to_string();
        let device_id = patch
            .device_id
            .as_deref()
            .map(str::trim)
            .unwrap_or(&previous.device_id)
            .to_string();

        let mut updated = previous.clone();
        if name != previous.name || device_id != previous.device_id {
            let created_at = (self.clock)();
            let new_id = derive_stream_id(&name, created_at);
            if let Some(existing) = registry.iter().find(|r| r.id == new_id && r.id != id) {
                return Err(StreamError::DuplicateStreamId {
                    id: new_id,
                    status: existing.status,
                });
            }
            updated.id = new_id;
            updated.created_at = created_at;
        }
        updated.name = name;
        updated.device_id = device_id;
        if let Some(bitrate) = patch.bitrate {
            updated.bitrate = bitrate;
        }

        registry[index] = updated.clone();
        if let Err(e) = self.persist(&registry).await {
            registry[index] = previous;
            return Err(e);
        }
        drop(registry);

        if updated.id != id {
            lock(&self.slots).remove(id);
            info!(old_id = %id, stream_id = %updated.id, "Stream renamed");
        } else {
            info!(stream_id = %id, "Stream updated");
        }

        Ok(UpdateOutcome {
            old_id: id.to_string(),
            stream: updated,
        })
    }

    /// Stops the worker if any, then removes the stream for good.
    pub async fn delete_stream(&self, id: &str) -> Result<StreamRecord> {
        self.get(id).await?;
        let (slot, _guard, _token) = self.begin(id).await;
        self.stop_locked(id, &slot).await?;

        let removed = {
            let mut registry = self.registry.lock().await;
            let index = registry
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| StreamError::NotFound(id.to_string()))?;
            let removed = registry.remove(index);
            if let Err(e) = self.persist(&registry).await {
                registry.insert(index, removed);
                return Err(e);
            }
            removed
        };
        lock(&self.slots).remove(id);
        info!(stream_id = %id, "Stream deleted");
        Ok(removed)
    }

    /// Stops every starting or running stream, concurrently.
    ///
    /// Stopped and failed streams are reported as skipped.
    pub async fn stop_all_streams(&self) -> BulkReport {
        let records = self.list().await;
        let mut tasks = JoinSet::new();
        let mut outcomes: HashMap<String, Result<StreamRecord>> = HashMap::new();

        for record in &records {
            if !matches!(
                record.status,
                StreamStatus::Starting | StreamStatus::Running | StreamStatus::Stopping
            ) {
                continue;
            }
            let Some(this) = self.this.upgrade() else {
                break;
            };
            let id = record.id.clone();
            tasks.spawn(async move {
                let result = this.stop_stream(&id).await;
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    outcomes.insert(id, result);
                }
                Err(e) => error!(error = %e, "Stop task failed"),
            }
        }

        let mut report = BulkReport::default();
        for record in &records {
            match outcomes.remove(&record.id) {
                Some(result) => report.push_result(record, result),
                None if record.status.is_active() || record.status == StreamStatus::Stopping => {
                    report.push(BulkItem {
                        id: record.id.clone(),
                        name: record.name.clone(),
                        outcome: BulkOutcome::Failed,
                        status: record.status,
                        error: Some("stop task did not complete".to_string()),
                        code: None,
                    });
                }
                None => report.push_skipped(record),
            }
        }
        info!(
            stopped = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Stop all streams"
        );
        report
    }

    /// Starts every stopped or failed stream, in registry order.
    pub async fn start_all_stopped_streams(&self) -> BulkReport {
        let records = self.list().await;
        let mut report = BulkReport::default();
        for record in &records {
            if matches!(record.status, StreamStatus::Stopped | StreamStatus::Error) {
                let result = self.restart_stream(&record.id).await;
                report.push_result(record, result);
            } else {
                report.push_skipped(record);
            }
        }
        info!(
            started = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Start all stopped streams"
        );
        report
    }

    /// Persists a new display order.
    ///
    /// Listed ids come first, in the given order; the others keep their
    /// relative order after them. Unknown ids are ignored.
    pub async fn reorder(&self, ids: &[String]) -> Result<Vec<StreamRecord>> {
        let mut registry = self.registry.lock().await;
        let previous = registry.clone();

        let mut seen = HashSet::new();
        let mut ordered = Vec::with_capacity(registry.len());
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if let Some(record) = previous.iter().find(|r| &r.id == id) {
                ordered.push(record.clone());
            }
        }
        ordered.extend(
            previous
                .iter()
                .filter(|r| !seen.contains(r.id.as_str()))
                .cloned(),
        );

        *registry = ordered;
        if let Err(e) = self.persist(&registry).await {
            *registry = previous;
            return Err(e);
        }
        Ok(registry.clone())
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    /// Demotes running records whose worker is gone.
    ///
    /// Streams with an operation in flight are skipped. Returns the ids that
    /// were demoted.
    pub async fn reconcile(&self) -> Vec<String> {
        let records = self.list().await;
        let mut demoted = Vec::new();

        for listed in records
            .iter()
            .filter(|r| r.status == StreamStatus::Running)
        {
            let slot = self.slot(&listed.id);
            let Ok(_guard) = slot.op.try_lock() else {
                debug!(stream_id = %listed.id, "Reconcile skipped, operation in flight");
                continue;
            };
            // The listing may predate an operation that completed since.
            let record = match self.get(&listed.id).await {
                Ok(record) if record.status == StreamStatus::Running => record,
                _ => continue,
            };
            let record = &record;

            let worker = slot.current();
            let (alive, exit, ctx) = match &worker {
                Some(ActiveWorker {
                    kind: WorkerKind::Owned(handle),
                    ctx,
                    ..
                }) => {
                    let exit = handle.try_exit();
                    (exit.is_none(), exit, ctx.clone())
                }
                Some(ActiveWorker {
                    kind: WorkerKind::Adopted { pid },
                    ctx,
                    ..
                }) => (self.os.is_process_alive(*pid).await, None, ctx.clone()),
                None => (false, None, context_for(record, None)),
            };
            if alive {
                continue;
            }

            if let Some(worker) = &worker {
                slot.clear(worker.generation);
            }
            let diagnosis = match exit {
                Some(exit) => diagnose_exit(exit, &slot.tail().join("\n"), &ctx),
                None => diagnostics::diagnose_lost_worker(&ctx),
            };
            warn!(stream_id = %record.id, reason = %diagnosis.title, "Worker gone, stream demoted");
            self.record_failure(&record.id, diagnosis).await;
            demoted.push(record.id.clone());
        }
        demoted
    }

    /// Reconciles every `reconcile_interval` until `shutdown` fires.
    pub async fn run_supervision(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.reconcile_interval);
        info!(interval = ?self.settings.reconcile_interval, "Stream supervision started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }
        info!("Stream supervision stopped");
    }

    /// Stops every worker; the records stay `stopped` for the next run.
    pub async fn shutdown(&self) -> BulkReport {
        info!("Stopping all stream workers");
        self.stop_all_streams().await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn slot(&self, id: &str) -> Arc<StreamSlot> {
        lock(&self.slots)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Cancels the operation in flight on `id`, then waits for its lock.
    async fn begin(&self, id: &str) -> (Arc<StreamSlot>, OwnedMutexGuard<()>, CancellationToken) {
        let slot = self.slot(id);
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *lock(&slot.token), token.clone());
        previous.cancel();
        let guard = slot.op.clone().lock_owned().await;
        (slot, guard, token)
    }

    async fn require_installed(&self) -> Result<()> {
        let installation = self.controller.installation().await;
        if installation.installed {
            Ok(())
        } else {
            Err(IcecastError::InstallationNotFound {
                searched: installation.searched,
            }
            .into())
        }
    }

    /// Admits an existing record and marks it `starting`.
    async fn admit_existing(&self, id: &str) -> Result<()> {
        let limit = self.gate.limit().await;
        let mut registry = self.registry.lock().await;
        let active = registry
            .iter()
            .filter(|r| r.id != id && r.status.is_active())
            .count() as u32;
        capacity::admit(limit, active)?;
        let record = registry
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StreamError::NotFound(id.to_string()))?;
        record.status = StreamStatus::Starting;
        self.persist(&registry).await
    }

    /// Spawns the worker of a `starting` record and waits for the
    /// confirmation window. Requires the slot lock.
    async fn launch_locked(
        &self,
        slot: &Arc<StreamSlot>,
        id: &str,
        token: &CancellationToken,
        operation: &'static str,
    ) -> Result<StreamRecord> {
        let record = self.get(id).await?;

        let target = match self.controller.connection_target().await {
            Ok(target) => target,
            Err(e) => {
                let diagnosis = diagnostics::diagnose_config_failure(&e.to_string());
                self.record_failure(id, diagnosis).await;
                return Err(e.into());
            }
        };
        let mut ctx = context_for(&record, Some(target.port));
        ctx.host = Some(target.host.clone());
        let params = WorkerParams {
            device: record.device_id.clone(),
            bitrate: record.bitrate,
            host: target.host.clone(),
            port: target.port,
            mount: record.id.clone(),
            password: target.source_password.clone(),
            name: record.name.clone(),
        };

        let program = &self.settings.worker.program;
        let args = self.settings.worker.render(&params);
        let handle = match spawn_worker(program, &args, self.settings.stderr_tail_lines) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                let diagnosis = diagnostics::diagnose_spawn_failure(program, &e);
                error!(stream_id = %id, program = %program, error = %e, "Failed to spawn worker");
                self.record_failure(id, diagnosis.clone()).await;
                return Err(StreamError::ProcessSpawnFailure {
                    id: id.to_string(),
                    reason: e.to_string(),
                    diagnosis: Box::new(diagnosis),
                });
            }
        };

        let pid = handle.pid();
        let generation = slot.install(WorkerKind::Owned(handle.clone()), ctx.clone());
        // The pid is runtime state only; the registry file does not carry it.
        if let Some(r) = self.registry.lock().await.iter_mut().find(|r| r.id == id) {
            r.pid = Some(pid);
        }
        debug!(stream_id = %id, pid, "Worker spawned, waiting for confirmation");

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(stream_id = %id, pid, "Start superseded, killing worker");
                handle.force_kill();
                let _ = handle.wait_timeout(FORCE_KILL_GRACE).await;
                slot.clear(generation);
                self.update_record(id, StreamRecord::mark_stopped).await?;
                return Err(StreamError::Cancelled { id: id.to_string(), operation });
            }
            exit = handle.wait() => {
                slot.clear(generation);
                let stderr = handle.tail().text();
                let diagnosis = diagnose_exit(exit, &stderr, &ctx);
                warn!(
                    stream_id = %id,
                    pid,
                    code = ?exit.code,
                    reason = %diagnosis.title,
                    "Worker exited during confirmation"
                );
                self.record_failure(id, diagnosis.clone()).await;
                return Err(StreamError::ProcessCrashed {
                    id: id.to_string(),
                    exit_code: exit.code.map(normalize_exit_code),
                    stderr,
                    diagnosis: Box::new(diagnosis),
                });
            }
            _ = tokio::time::sleep(self.settings.confirm_window) => {}
        }

        let started_at = Utc::now();
        let confirmed = self
            .update_record(id, |r| {
                r.status = StreamStatus::Running;
                r.pid = Some(pid);
                r.started_at = Some(started_at);
                r.last_error = None;
                r.diagnosis = None;
                r.clone()
            })
            .await;
        let record = match confirmed {
            Ok(record) => record,
            Err(e) => {
                self.abandon_worker(id, slot, &handle, generation, &e).await;
                return Err(e);
            }
        };
        info!(stream_id = %id, pid, "Stream running");

        self.watch_worker(id.to_string(), slot.clone(), handle, generation, ctx);
        Ok(record)
    }

    /// Kills a worker whose state could not be persisted and marks it failed.
    async fn abandon_worker(
        &self,
        id: &str,
        slot: &StreamSlot,
        handle: &WorkerHandle,
        generation: u64,
        cause: &StreamError,
    ) {
        error!(stream_id = %id, pid = handle.pid(), error = %cause, "Cannot persist the stream, killing its worker");
        handle.force_kill();
        let _ = handle.wait_timeout(FORCE_KILL_GRACE).await;
        slot.clear(generation);
        self.record_failure(id, diagnostics::diagnose_registry_failure(&cause.to_string()))
            .await;
    }

    /// Marks the stream failed when its worker exits on its own.
    fn watch_worker(
        &self,
        id: String,
        slot: Arc<StreamSlot>,
        handle: Arc<WorkerHandle>,
        generation: u64,
        ctx: DiagnosisContext,
    ) {
        let this = self.this.clone();
        tokio::spawn(async move {
            let exit = handle.wait().await;
            let _guard = slot.op.lock().await;
            if !slot.is_current(generation) {
                return;
            }
            slot.clear(generation);
            let Some(this) = this.upgrade() else {
                return;
            };
            let diagnosis = diagnose_exit(exit, &handle.tail().text(), &ctx);
            warn!(
                stream_id = %id,
                pid = handle.pid(),
                code = ?exit.code,
                reason = %diagnosis.title,
                "Worker crashed"
            );
            this.record_failure(&id, diagnosis).await;
        });
    }

    /// Terminates the worker of `id` and marks the record `stopped`.
    /// Requires the slot lock.
    async fn stop_locked(&self, id: &str, slot: &Arc<StreamSlot>) -> Result<StreamRecord> {
        let record = self.get(id).await?;
        let worker = slot.take();
        let target = worker
            .map(|w| w.kind)
            .or_else(|| record.pid.map(|pid| WorkerKind::Adopted { pid }));

        let Some(target) = target else {
            if record.status == StreamStatus::Stopped {
                return Ok(record);
            }
            return self
                .update_record(id, |r| {
                    r.mark_stopped();
                    r.clone()
                })
                .await;
        };

        self.update_record(id, |r| r.status = StreamStatus::Stopping)
            .await?;
        info!(stream_id = %id, "Stopping stream");

        let outcome = match &target {
            WorkerKind::Owned(handle) => self.terminate_owned(id, handle).await,
            WorkerKind::Adopted { pid } => self.terminate_pid(id, *pid).await,
        };

        match outcome {
            Ok(()) => {
                let record = self
                    .update_record(id, |r| {
                        r.mark_stopped();
                        r.clone()
                    })
                    .await?;
                info!(stream_id = %id, "Stream stopped");
                Ok(record)
            }
            Err(e) => {
                let ctx = context_for(&record, None);
                let mut diagnosis = diagnostics::diagnose_lost_worker(&ctx);
                diagnosis.title = "The worker did not stop".to_string();
                diagnosis.detail = Some(e.to_string());
                self.record_failure(id, diagnosis).await;
                Err(e)
            }
        }
    }

    async fn terminate_owned(&self, id: &str, handle: &WorkerHandle) -> Result<()> {
        if handle.try_exit().is_some() {
            return Ok(());
        }
        let pid = handle.pid();
        match self.os.kill_process(pid).await {
            Ok(true) => debug!(stream_id = %id, pid, "Termination requested"),
            Ok(false) => debug!(stream_id = %id, pid, "Worker already gone"),
            Err(e) => warn!(stream_id = %id, pid, error = %e, "Termination request failed"),
        }
        if handle.wait_timeout(self.settings.stop_timeout).await.is_some() {
            return Ok(());
        }

        warn!(stream_id = %id, pid, "Worker ignored termination, killing it");
        handle.force_kill();
        if handle.wait_timeout(FORCE_KILL_GRACE).await.is_some() {
            return Ok(());
        }
        Err(StreamError::VerificationTimeout {
            id: id.to_string(),
            timeout: self.settings.stop_timeout + FORCE_KILL_GRACE,
        })
    }

    async fn terminate_pid(&self, id: &str, pid: u32) -> Result<()> {
        match self.os.kill_process(pid).await {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => warn!(stream_id = %id, pid, error = %e, "Termination request failed"),
        }

        let policy = PollPolicy::new(self.settings.poll_interval, self.settings.stop_timeout);
        let never = CancellationToken::new();
        let outcome = poll_until(policy, &never, || async {
            (!self.os.is_process_alive(pid).await).then_some(())
        })
        .await;

        match outcome {
            PollOutcome::Ready(()) => Ok(()),
            PollOutcome::TimedOut | PollOutcome::Cancelled => Err(StreamError::VerificationTimeout {
                id: id.to_string(),
                timeout: self.settings.stop_timeout,
            }),
        }
    }

    /// Adopts the workers that survived a control plane restart.
    async fn recover(&self) -> Result<()> {
        let program = Path::new(&self.settings.worker.program)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.settings.worker.program.clone());

        let mut registry = self.registry.lock().await;
        if registry.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        let mut processes = None;
        for record in registry.iter_mut() {
            match record.status {
                StreamStatus::Running | StreamStatus::Starting => {
                    if processes.is_none() {
                        processes = Some(self.os.list_processes_by_name(&program).await);
                    }
                    let mount = record.mount();
                    let survivor = processes.as_deref().and_then(|list| {
                        list.iter()
                            .find(|p| p.cmd.iter().any(|arg| arg.ends_with(&mount)))
                    });

                    let ctx = context_for(record, None);
                    match survivor {
                        Some(process) => {
                            let started_at = Utc::now()
                                - chrono::Duration::seconds(process.run_time_secs as i64);
                            record.status = StreamStatus::Running;
                            record.pid = Some(process.pid);
                            record.started_at = Some(started_at);
                            self.slot(&record.id)
                                .install(WorkerKind::Adopted { pid: process.pid }, ctx);
                            info!(stream_id = %record.id, pid = process.pid, "Worker adopted");
                        }
                        None => {
                            record.mark_error(diagnostics::diagnose_lost_worker(&ctx));
                            warn!(stream_id = %record.id, "Worker did not survive the restart");
                        }
                    }
                    changed = true;
                }
                StreamStatus::Stopping => {
                    record.mark_stopped();
                    changed = true;
                }
                StreamStatus::Stopped | StreamStatus::Error => {}
            }
        }

        if changed {
            self.persist(&registry).await?;
        }
        Ok(())
    }

    async fn update_record<T>(&self, id: &str, f: impl FnOnce(&mut StreamRecord) -> T) -> Result<T> {
        let mut registry = self.registry.lock().await;
        let record = registry
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StreamError::NotFound(id.to_string()))?;
        let out = f(record);
        self.persist(&registry).await?;
        Ok(out)
    }

    async fn record_failure(&self, id: &str, diagnosis: DiagnosisResult) {
        if let Err(e) = self.update_record(id, |r| r.mark_error(diagnosis)).await {
            error!(stream_id = %id, error = %e, "Failed to record stream failure");
        }
    }

    async fn persist(&self, registry: &[StreamRecord]) -> Result<()> {
        let stored: Vec<StoredStream> = registry.iter().map(StoredStream::from).collect();
        self.store.save(&stored).await
    }
}

fn count_active(registry: &[StreamRecord]) -> u32 {
    registry.iter().filter(|r| r.status.is_active()).count() as u32
}

fn context_for(record: &StreamRecord, port: Option<u16>) -> DiagnosisContext {
    DiagnosisContext {
        icecast_port: port,
        port,
        host: None,
        device_id: Some(record.device_id.clone()),
        mount: Some(record.id.clone()),
    }
}

fn diagnose_exit(exit: WorkerExit, stderr: &str, ctx: &DiagnosisContext) -> DiagnosisResult {
    match (exit.code, exit.signal) {
        (None, Some(signal)) => diagnose_signal(signal, stderr, ctx),
        (code, _) => diagnose(code, stderr, ctx),
    }
}

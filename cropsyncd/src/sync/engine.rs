use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::backoff::Backoff;
use super::conflict::{ConflictError, ConflictResolver, detect_conflict};
use super::events::{EventBus, SyncEvent};
use super::network::NetworkMonitor;
use super::queue::{FailureOutcome, OperationKind, OperationQueue, PendingOperation, QueueError};
use super::state::{SyncPhase, SyncStateMachine};
use super::store::{LAST_SYNC_TIME_KEY, QueueStore};
use super::{format_millis, now_millis, parse_rfc3339_millis};

#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub kind: OperationKind,
    pub table: &'a str,
    pub payload: &'a Value,
    pub force_overwrite: bool,
}

impl<'a> ExecutionRequest<'a> {
    fn for_operation(op: &'a PendingOperation) -> Self {
        Self {
            kind: op.kind,
            table: &op.table,
            payload: &op.payload,
            force_overwrite: op.force_overwrite,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Applied,
    /// The remote version check failed. `remote` is the current remote
    /// record, or `None` if it has been deleted.
    Conflict { remote: Option<Value> },
    Failed {
        message: String,
        retry_after: Option<Duration>,
    },
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionOutcome;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("device is offline")]
    Offline,
    #[error("a sync run is already in progress")]
    SyncInProgress,
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),
    #[error("operation queue persistence failed: {0}")]
    Persistence(#[from] QueueError),
    #[error("conflict resolution was not persisted: {0}")]
    Resolution(#[source] QueueError),
}

impl From<ConflictError> for SyncError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::NotFound(id) => Self::ConflictNotFound(id),
            ConflictError::Queue(err) => Self::Resolution(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub active: bool,
    pub pending_count: usize,
    pub last_sync_at: Option<String>,
    pub errors: Vec<String>,
    pub pending_conflicts: usize,
    pub phase: SyncPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub retried: usize,
    pub evicted: usize,
    pub held_back: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Passive,
    Forced,
}

#[derive(Debug, Default)]
struct EngineState {
    machine: SyncStateMachine,
    errors: Vec<String>,
    last_sync_at: Option<i64>,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    queue: Arc<OperationQueue>,
    resolver: Arc<ConflictResolver>,
    executor: Arc<dyn RemoteExecutor>,
    network: NetworkMonitor,
    store: Arc<dyn QueueStore>,
    events: EventBus,
    backoff: Backoff,
    in_progress: AtomicBool,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<OperationQueue>,
        resolver: Arc<ConflictResolver>,
        executor: Arc<dyn RemoteExecutor>,
        network: NetworkMonitor,
        store: Arc<dyn QueueStore>,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            resolver,
            executor,
            network,
            store,
            events,
            backoff: Backoff::default(),
            in_progress: AtomicBool::new(false),
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn restore_last_sync(&self) {
        let stored = match self.store.get(LAST_SYNC_TIME_KEY).await {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!("failed to read last sync time: {err}");
                return;
            }
        };
        let parsed = stored
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(parse_rfc3339_millis);
        if let Some(at) = parsed {
            self.lock_state().last_sync_at = Some(at);
        }
    }

    /// Background entry point. Returns `None` without touching anything when
    /// offline or when another run holds the engine.
    pub async fn run_once(&self) -> Option<RunSummary> {
        if !self.network.is_online() {
            tracing::debug!("offline, skipping sync run");
            return None;
        }
        let Some(guard) = self.try_begin() else {
            tracing::debug!("sync run already in progress");
            return None;
        };
        Some(self.run(RunMode::Passive, guard).await)
    }

    pub async fn force_sync(&self) -> Result<RunSummary, SyncError> {
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }
        let guard = self.try_begin().ok_or(SyncError::SyncInProgress)?;
        Ok(self.run(RunMode::Forced, guard).await)
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn on_offline(&self) {
        let changed = {
            let mut state = self.lock_state();
            let before = state.machine.phase();
            state.machine.went_offline();
            before != state.machine.phase()
        };
        if changed {
            self.publish_status();
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status_with_active(self.is_running())
    }

    pub fn publish_status(&self) {
        self.events.publish(SyncEvent::SyncChanged(self.status()));
    }

    fn status_with_active(&self, active: bool) -> SyncStatus {
        let state = self.lock_state();
        SyncStatus {
            active,
            pending_count: self.queue.len(),
            last_sync_at: state.last_sync_at.and_then(format_millis),
            errors: state.errors.clone(),
            pending_conflicts: self.resolver.len(),
            phase: state.machine.phase(),
        }
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(&self.in_progress))
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(&self, mode: RunMode, guard: RunGuard<'_>) -> RunSummary {
        let mut summary = RunSummary::default();
        let now = now_millis();

        // Entities whose earlier operation is parked, backing off or failed
        // in this run. Later operations on them wait for the next run.
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        let mut candidates = Vec::new();
        for op in self.queue.snapshot().await {
            let key = op.entity_key();
            let waiting = op.is_parked() || (mode == RunMode::Passive && !op.is_due(now));
            if waiting {
                if let Some(key) = key {
                    blocked.insert(key);
                }
                continue;
            }
            if key.as_ref().is_some_and(|key| blocked.contains(key)) {
                summary.held_back += 1;
                continue;
            }
            candidates.push(op);
        }
        if candidates.is_empty() {
            tracing::debug!(held_back = summary.held_back, "nothing to sync");
            return summary;
        }

        self.lock_state().machine.begin();
        self.publish_status();
        tracing::info!(candidates = candidates.len(), mode = ?mode, "sync run started");

        let mut errors = Vec::new();
        for op in &candidates {
            if !self.network.is_online() {
                tracing::info!("went offline, stopping sync run");
                summary.interrupted = true;
                self.lock_state().machine.went_offline();
                break;
            }
            let key = op.entity_key();
            if key.as_ref().is_some_and(|key| blocked.contains(key)) {
                summary.held_back += 1;
                continue;
            }

            summary.attempted += 1;
            let outcome = self.executor.execute(ExecutionRequest::for_operation(op)).await;
            let settled = match outcome {
                ExecutionOutcome::Applied => {
                    tracing::debug!(id = %op.id, kind = ?op.kind, table = %op.table, "operation applied");
                    self.queue.remove(&op.id).await;
                    summary.applied += 1;
                    true
                }
                ExecutionOutcome::Conflict { remote } => {
                    self.handle_conflict(op, remote, &mut summary).await
                }
                ExecutionOutcome::Failed {
                    message,
                    retry_after,
                } => {
                    self.handle_failure(op, &message, retry_after, &mut summary, &mut errors)
                        .await;
                    false
                }
            };
            if !settled && let Some(key) = key {
                blocked.insert(key);
            }
        }

        if let Err(err) = self.queue.persist().await {
            tracing::warn!("failed to persist operation queue after sync run: {err}");
        }
        let finished_at = now_millis();
        if !summary.interrupted {
            self.save_last_sync(finished_at).await;
        }
        {
            let mut state = self.lock_state();
            if !summary.interrupted {
                state.last_sync_at = Some(finished_at);
            }
            state.errors = errors;
            state.machine.complete(summary.evicted);
        }
        drop(guard);

        tracing::info!(
            attempted = summary.attempted,
            applied = summary.applied,
            conflicts = summary.conflicts,
            retried = summary.retried,
            evicted = summary.evicted,
            held_back = summary.held_back,
            interrupted = summary.interrupted,
            "sync run finished"
        );
        self.events
            .publish(SyncEvent::SyncChanged(self.status_with_active(false)));
        summary
    }

    async fn handle_conflict(
        &self,
        op: &PendingOperation,
        remote: Option<Value>,
        summary: &mut RunSummary,
    ) -> bool {
        match detect_conflict(op, remote, now_millis()) {
            Some(record) => {
                self.queue.park(&op.id, &record.id).await;
                self.resolver.register(record).await;
                summary.conflicts += 1;
                false
            }
            None => {
                tracing::debug!(id = %op.id, "record already deleted remotely");
                self.queue.remove(&op.id).await;
                summary.applied += 1;
                true
            }
        }
    }

    async fn handle_failure(
        &self,
        op: &PendingOperation,
        message: &str,
        retry_after: Option<Duration>,
        summary: &mut RunSummary,
        errors: &mut Vec<String>,
    ) {
        let now = now_millis();
        let attempt = op.retry_count.saturating_add(1);
        let retry_at = match retry_after {
            Some(delay) => Some(now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))),
            None => self.backoff.retry_at(now, attempt),
        };
        match self.queue.record_failure(&op.id, retry_at).await {
            Some(FailureOutcome::Retry { retry_count }) => {
                tracing::warn!(
                    id = %op.id,
                    retry_count,
                    max_retries = op.max_retries,
                    "operation failed, will retry: {message}"
                );
                summary.retried += 1;
            }
            Some(FailureOutcome::Exhausted { retry_count }) => {
                tracing::warn!(id = %op.id, retry_count, "operation evicted: {message}");
                errors.push(format!(
                    "operation {} failed after {} retries",
                    op.id, retry_count
                ));
                summary.evicted += 1;
            }
            None => {
                tracing::debug!(id = %op.id, "failed operation was removed during the run");
            }
        }
    }

    async fn save_last_sync(&self, at: i64) {
        let Some(formatted) = format_millis(at) else {
            return;
        };
        if let Err(err) = self.store.set(LAST_SYNC_TIME_KEY, formatted.as_bytes()).await {
            tracing::warn!("failed to persist last sync time: {err}");
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

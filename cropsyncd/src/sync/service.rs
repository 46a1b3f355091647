use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::conflict::{
    ConflictRecord, ConflictResolver, MergePolicy, Resolution, ResolutionStrategy,
    ResolveAllReport,
};
use super::engine::{RemoteExecutor, RunSummary, SyncEngine, SyncError, SyncStatus};
use super::events::{EventBus, SyncEvent};
use super::network::{NetworkMonitor, OfflineStatus};
use super::queue::{DEFAULT_MAX_RETRIES, OperationDraft, OperationId, OperationQueue};
use super::store::QueueStore;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub default_max_retries: u32,
    /// Passive runs skip an operation until its backoff delay has passed;
    /// `force_sync` ignores the delay, as does `Backoff::immediate()`.
    pub backoff: Backoff,
    pub merge_policy: MergePolicy,
    /// Periodic background run so backed-off operations are retried.
    pub sync_interval: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
            merge_policy: MergePolicy::default(),
            sync_interval: Some(Duration::from_secs(60)),
            event_capacity: 64,
        }
    }
}

#[derive(Clone)]
struct Shared {
    queue: Arc<OperationQueue>,
    resolver: Arc<ConflictResolver>,
    engine: Arc<SyncEngine>,
    network: NetworkMonitor,
    events: EventBus,
    wake: Arc<Notify>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct OfflineSync {
    shared: Shared,
    sync_interval: Option<Duration>,
    worker: Mutex<Option<Worker>>,
}

impl OfflineSync {
    pub async fn init(
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn RemoteExecutor>,
        network: NetworkMonitor,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let queue = Arc::new(OperationQueue::open(store.clone(), options.default_max_retries).await?);
        let resolver = Arc::new(ConflictResolver::new(queue.clone(), options.merge_policy));
        let events = EventBus::new(options.event_capacity);
        let engine = SyncEngine::new(
            queue.clone(),
            resolver.clone(),
            executor,
            network.clone(),
            store,
            events.clone(),
        )
        .with_backoff(options.backoff);
        engine.restore_last_sync().await;

        Ok(Self {
            shared: Shared {
                queue,
                resolver,
                engine: Arc::new(engine),
                network,
                events,
                wake: Arc::new(Notify::new()),
            },
            sync_interval: options.sync_interval,
            worker: Mutex::new(None),
        })
    }

    /// Spawns the background task. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            return;
        }
        // The task reads nothing at startup, so a change made before its
        // first poll is still seen by `changed()`.
        let watches = Watches {
            network: self.shared.network.subscribe(),
            pending: self.shared.queue.subscribe(),
            conflicts: self.shared.resolver.subscribe(),
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(
            self.shared.clone(),
            watches,
            self.sync_interval,
            cancel.clone(),
        ));
        *worker = Some(Worker { cancel, handle });
        tracing::info!(
            pending = self.shared.queue.len(),
            online = self.shared.network.is_online(),
            "offline sync started"
        );
        if self.shared.network.is_online() && !self.shared.queue.is_empty() {
            self.shared.wake.notify_one();
        }
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(err) = worker.handle.await {
                tracing::warn!("sync task ended abnormally: {err}");
            }
        }
        self.shared.queue.persist().await?;
        tracing::info!(pending = self.shared.queue.len(), "offline sync stopped");
        Ok(())
    }

    pub async fn queue_operation(&self, draft: OperationDraft) -> OperationId {
        let id = self.shared.queue.enqueue(draft).await;
        if self.shared.network.is_online() {
            self.shared.wake.notify_one();
        }
        id
    }

    pub async fn force_sync(&self) -> Result<RunSummary, SyncError> {
        self.shared.engine.force_sync().await
    }

    pub async fn run_once(&self) -> Option<RunSummary> {
        self.shared.engine.run_once().await
    }

    pub async fn clear_pending_operations(&self) -> usize {
        let removed = self.shared.queue.clear().await;
        tracing::info!(removed, "pending operations cleared");
        removed
    }

    pub fn offline_status(&self) -> OfflineStatus {
        self.shared.network.current_status()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.shared.engine.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub async fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.shared.resolver.list().await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution, SyncError> {
        let resolution = self.shared.resolver.resolve(conflict_id, strategy).await?;
        if self.shared.network.is_online() && !self.shared.queue.is_empty() {
            self.shared.wake.notify_one();
        }
        Ok(resolution)
    }

    pub async fn resolve_all_conflicts(&self, strategy: ResolutionStrategy) -> ResolveAllReport {
        let report = self.shared.resolver.resolve_all(strategy).await;
        if self.shared.network.is_online() && !self.shared.queue.is_empty() {
            self.shared.wake.notify_one();
        }
        report
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.shared.queue
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Watches {
    network: watch::Receiver<OfflineStatus>,
    pending: watch::Receiver<usize>,
    conflicts: watch::Receiver<usize>,
}

async fn drive(
    shared: Shared,
    watches: Watches,
    sync_interval: Option<Duration>,
    cancel: CancellationToken,
) {
    let Watches {
        network: mut network_rx,
        pending: mut pending_rx,
        conflicts: mut conflicts_rx,
    } = watches;
    let mut ticker = sync_interval.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = network_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = network_rx.borrow_and_update().clone();
                shared.events.publish(SyncEvent::OfflineChanged(status.clone()));
                // Flaps collapse into one read, so every online value counts.
                if !status.online {
                    shared.engine.on_offline();
                } else if !shared.queue.is_empty() {
                    tracing::info!(pending = shared.queue.len(), "online, syncing");
                    shared.engine.run_once().await;
                }
            }
            changed = pending_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                pending_rx.borrow_and_update();
                shared.engine.publish_status();
            }
            changed = conflicts_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                conflicts_rx.borrow_and_update();
                shared
                    .events
                    .publish(SyncEvent::ConflictsChanged(shared.resolver.list().await));
            }
            _ = shared.wake.notified() => {
                shared.engine.run_once().await;
            }
            _ = next_tick(&mut ticker) => {
                if shared.network.is_online() && !shared.queue.is_empty() {
                    shared.engine.run_once().await;
                }
            }
        }
    }
    tracing::debug!("sync task exiting");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

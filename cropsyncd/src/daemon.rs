use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cropsync_core::{ApiError, RecordClient};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::sync::backoff::Backoff;
use crate::sync::events::SyncEvent;
use crate::sync::format_millis;
use crate::sync::network::{NetworkMonitor, OfflineStatus};
use crate::sync::queue::{DEFAULT_MAX_RETRIES, OperationQueue, PendingOperation};
use crate::sync::remote::HttpExecutor;
use crate::sync::service::{OfflineSync, SyncOptions};
use crate::sync::store::{LAST_SYNC_TIME_KEY, QueueStore, SqliteQueueStore, default_db_path};

const DEFAULT_REMOTE_URL: &str = "https://api.cropsync.app";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
const DEFAULT_RETRY_BASE_MS: u64 = 2_000;
const DEFAULT_RETRY_MAX_MS: u64 = 300_000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub remote_url: String,
    pub token: Option<String>,
    pub sync_interval: Duration,
    pub probe_interval: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let default_db = default_db_path()
            .unwrap_or_else(|_| home.join(".local/share/cropsync/queue.db"));
        Ok(Self::from_lookup(
            |name| std::env::var(name).ok(),
            &home,
            default_db,
        ))
    }

    pub fn from_lookup<F>(lookup: F, home: &Path, default_db: PathBuf) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("CROPSYNC_DB_PATH")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or(default_db);
        let remote_url = lookup("CROPSYNC_REMOTE_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REMOTE_URL.to_string());
        let token = lookup("CROPSYNC_TOKEN").filter(|value| !value.trim().is_empty());
        let read = |name: &str, default: u64| read_u64(lookup(name), default);

        Self {
            db_path,
            remote_url,
            token,
            sync_interval: Duration::from_secs(read(
                "CROPSYNC_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            probe_interval: Duration::from_secs(read(
                "CROPSYNC_PROBE_INTERVAL_SECS",
                DEFAULT_PROBE_INTERVAL_SECS,
            )),
            max_retries: u32::try_from(read(
                "CROPSYNC_MAX_RETRIES",
                u64::from(DEFAULT_MAX_RETRIES),
            ))
            .unwrap_or(u32::MAX),
            retry_base: Duration::from_millis(read("CROPSYNC_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)),
            retry_max: Duration::from_millis(read("CROPSYNC_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS)),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            default_max_retries: self.max_retries,
            backoff: Backoff::new(self.retry_base, self.retry_max.max(self.retry_base), true),
            sync_interval: Some(self.sync_interval),
            ..SyncOptions::default()
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: RecordClient,
    network: NetworkMonitor,
    sync: Arc<OfflineSync>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let token = config
            .token
            .clone()
            .context("CROPSYNC_TOKEN is not set")?;
        let client = RecordClient::with_base_url(&config.remote_url, token)
            .with_context(|| format!("invalid remote url {}", config.remote_url))?;
        let store = SqliteQueueStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open queue database at {:?}", config.db_path))?;
        // Offline until the first probe proves otherwise.
        let network = NetworkMonitor::new(OfflineStatus::offline());
        let sync = OfflineSync::init(
            Arc::new(store),
            Arc::new(HttpExecutor::new(client.clone())),
            network.clone(),
            config.sync_options(),
        )
        .await
        .context("failed to initialize offline sync")?;

        Ok(Self {
            config,
            client,
            network,
            sync: Arc::new(sync),
        })
    }

    pub fn sync(&self) -> &Arc<OfflineSync> {
        &self.sync
    }

    pub async fn probe_once(&self) -> OfflineStatus {
        let status = status_from_probe(&self.client.ping().await);
        self.network.set_status(status.clone());
        status
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            db = %self.config.db_path.display(),
            remote = %self.config.remote_url,
            pending = self.sync.queue().len(),
            "cropsyncd started"
        );
        self.sync.start();
        let cancel = CancellationToken::new();

        let probe_client = self.client.clone();
        let probe_network = self.network.clone();
        let probe_interval = self.config.probe_interval;
        let probe_cancel = cancel.clone();
        let probe_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_interval);
            loop {
                tokio::select! {
                    _ = probe_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = status_from_probe(&probe_client.ping().await);
                        probe_network.set_status(status);
                    }
                }
            }
        });

        let mut events = self.sync.subscribe();
        let events_cancel = cancel.clone();
        let events_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = events_cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => log_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event log fell behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        tracing::info!("shutdown requested");
        cancel.cancel();
        for handle in [probe_handle, events_handle] {
            if let Err(err) = handle.await {
                tracing::warn!("background task ended abnormally: {err}");
            }
        }
        self.sync
            .shutdown()
            .await
            .context("failed to flush the operation queue")?;
        Ok(())
    }
}

/// Opens the queue without starting any sync, for the offline CLI modes.
pub async fn open_queue(config: &DaemonConfig) -> anyhow::Result<(Arc<SqliteQueueStore>, OperationQueue)> {
    let store = Arc::new(
        SqliteQueueStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open queue database at {:?}", config.db_path))?,
    );
    let queue = OperationQueue::open(store.clone(), config.max_retries)
        .await
        .context("failed to load pending operations")?;
    Ok((store, queue))
}

pub async fn status_report(config: &DaemonConfig) -> anyhow::Result<String> {
    let (store, queue) = open_queue(config).await?;
    let last_sync = store
        .get(LAST_SYNC_TIME_KEY)
        .await
        .context("failed to read last sync time")?
        .and_then(|bytes| String::from_utf8(bytes).ok());
    let ops = queue.snapshot().await;

    let mut lines = vec![
        format!("queue: {}", config.db_path.display()),
        format!("pending operations: {}", ops.len()),
        format!("last sync: {}", last_sync.as_deref().unwrap_or("never")),
    ];
    lines.extend(ops.iter().map(describe_operation));
    Ok(lines.join("\n"))
}

pub async fn clear_queue(config: &DaemonConfig) -> anyhow::Result<usize> {
    let (_, queue) = open_queue(config).await?;
    let removed = queue.clear().await;
    queue
        .persist()
        .await
        .context("failed to persist the cleared queue")?;
    Ok(removed)
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;

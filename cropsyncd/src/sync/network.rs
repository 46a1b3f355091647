use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub online: bool,
    pub link_type: Option<String>,
}

impl OfflineStatus {
    pub fn online(link_type: Option<&str>) -> Self {
        Self {
            online: true,
            link_type: link_type.map(str::to_string),
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            link_type: None,
        }
    }
}

/// Connectivity as reported by the platform. The core only reads it;
/// platform glue publishes transitions through [`NetworkMonitor::set_status`].
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<OfflineStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: OfflineStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current_status(&self) -> OfflineStatus {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    pub fn subscribe(&self) -> watch::Receiver<OfflineStatus> {
        self.tx.subscribe()
    }

    pub fn set_status(&self, status: OfflineStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::info!(
                online = status.online,
                link_type = status.link_type.as_deref().unwrap_or("unknown"),
                "network status changed"
            );
            *current = status;
            true
        })
    }
}

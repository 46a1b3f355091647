pub mod daemon;
pub mod sync;

pub use sync::conflict::{ConflictKind, ConflictRecord, MergePolicy, Resolution, ResolutionStrategy};
pub use sync::engine::{ExecutionOutcome, ExecutionRequest, RemoteExecutor, SyncError, SyncStatus};
pub use sync::events::SyncEvent;
pub use sync::network::{NetworkMonitor, OfflineStatus};
pub use sync::queue::{OperationDraft, OperationKind, PendingOperation};
pub use sync::service::{OfflineSync, SyncOptions};
pub use sync::store::{MemoryQueueStore, QueueStore, SqliteQueueStore};

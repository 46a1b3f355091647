use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, watch};

use super::now_millis;
use super::store::{PENDING_OPERATIONS_KEY, QueueStore, StoreError};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub type OperationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub table: String,
    pub payload: Value,
    pub enqueued_at: i64,
    #[serde(default)]
    pub seq: u64,
    pub owner_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_at: Option<i64>,
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default)]
    pub conflict_id: Option<String>,
}

impl PendingOperation {
    pub fn entity_key(&self) -> Option<(String, String)> {
        let id = match self.payload.get("id")? {
            Value::String(id) if !id.is_empty() => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };
        Some((self.table.clone(), id))
    }

    pub fn is_terminal(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.retry_at.is_none_or(|at| at <= now_ms)
    }

    pub fn is_parked(&self) -> bool {
        self.conflict_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub kind: OperationKind,
    pub table: String,
    pub payload: Value,
    pub owner_id: String,
    pub max_retries: Option<u32>,
    pub force_overwrite: bool,
}

impl OperationDraft {
    pub fn new(
        kind: OperationKind,
        table: impl Into<String>,
        payload: Value,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            table: table.into(),
            payload,
            owner_id: owner_id.into(),
            max_retries: None,
            force_overwrite: false,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn force_overwrite(mut self) -> Self {
        self.force_overwrite = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { retry_count: u32 },
    Exhausted { retry_count: u32 },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct QueueState {
    ops: Vec<PendingOperation>,
    next_seq: u64,
    last_enqueued_at: i64,
}

impl QueueState {
    fn position(&self, id: &str) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }

    fn build(&mut self, draft: OperationDraft, default_max_retries: u32) -> PendingOperation {
        // Keep enqueue timestamps monotonic even if the wall clock steps back.
        let enqueued_at = now_millis().max(self.last_enqueued_at);
        self.last_enqueued_at = enqueued_at;
        let seq = self.next_seq;
        self.next_seq += 1;
        PendingOperation {
            id: uuid::Uuid::now_v7().to_string(),
            kind: draft.kind,
            table: draft.table,
            payload: draft.payload,
            enqueued_at,
            seq,
            owner_id: draft.owner_id,
            retry_count: 0,
            max_retries: draft.max_retries.unwrap_or(default_max_retries).max(1),
            retry_at: None,
            force_overwrite: draft.force_overwrite,
            conflict_id: None,
        }
    }
}

pub struct OperationQueue {
    store: Arc<dyn QueueStore>,
    state: Mutex<QueueState>,
    pending: watch::Sender<usize>,
    default_max_retries: u32,
}

impl OperationQueue {
    /// Loads the persisted queue. A blob that no longer decodes is logged and
    /// replaced by an empty queue.
    pub async fn open(
        store: Arc<dyn QueueStore>,
        default_max_retries: u32,
    ) -> Result<Self, QueueError> {
        let mut ops = match store.get(PENDING_OPERATIONS_KEY).await? {
            Some(bytes) => match serde_json::from_slice::<Vec<PendingOperation>>(&bytes) {
                Ok(ops) => ops,
                Err(err) => {
                    tracing::warn!("discarding undecodable pending operation list: {err}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        sort_ops(&mut ops);
        // Open conflicts do not outlive the process. Parked operations are
        // released so the next run detects their conflict again.
        let released = ops
            .iter_mut()
            .filter_map(|op| op.conflict_id.take())
            .count();
        if released > 0 {
            tracing::info!(released, "released operations parked behind a previous session's conflicts");
        }
        let next_seq = ops.iter().map(|op| op.seq + 1).max().unwrap_or(0);
        let last_enqueued_at = ops.iter().map(|op| op.enqueued_at).max().unwrap_or(0);
        tracing::info!(pending = ops.len(), "operation queue loaded");

        let (pending, _) = watch::channel(ops.len());
        Ok(Self {
            store,
            state: Mutex::new(QueueState {
                ops,
                next_seq,
                last_enqueued_at,
            }),
            pending,
            default_max_retries,
        })
    }

    pub async fn enqueue(&self, draft: OperationDraft) -> OperationId {
        let mut state = self.state.lock().await;
        let op = state.build(draft, self.default_max_retries);
        let id = op.id.clone();
        tracing::debug!(id = %id, kind = ?op.kind, table = %op.table, "operation enqueued");
        state.ops.push(op);
        self.persist_or_warn(&state).await;
        self.pending.send_replace(state.ops.len());
        id
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return false;
        };
        state.ops.remove(index);
        self.persist_or_warn(&state).await;
        self.pending.send_replace(state.ops.len());
        true
    }

    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.ops.len();
        state.ops.clear();
        self.persist_or_warn(&state).await;
        self.pending.send_replace(0);
        removed
    }

    pub async fn snapshot(&self) -> Vec<PendingOperation> {
        self.state.lock().await.ops.clone()
    }

    pub async fn get(&self, id: &str) -> Option<PendingOperation> {
        let state = self.state.lock().await;
        state.position(id).map(|index| state.ops[index].clone())
    }

    pub fn len(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    /// Counts one failed attempt, evicting the operation once its budget is
    /// spent. `None` if the operation is no longer queued.
    pub async fn record_failure(&self, id: &str, retry_at: Option<i64>) -> Option<FailureOutcome> {
        let mut state = self.state.lock().await;
        let index = state.position(id)?;
        let op = &mut state.ops[index];
        op.retry_count = op.retry_count.saturating_add(1).min(op.max_retries);
        let outcome = if op.is_terminal() {
            let retry_count = op.retry_count;
            state.ops.remove(index);
            FailureOutcome::Exhausted { retry_count }
        } else {
            op.retry_at = retry_at;
            FailureOutcome::Retry {
                retry_count: op.retry_count,
            }
        };
        self.persist_or_warn(&state).await;
        self.pending.send_replace(state.ops.len());
        Some(outcome)
    }

    pub async fn park(&self, id: &str, conflict_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return false;
        };
        state.ops[index].conflict_id = Some(conflict_id.to_string());
        self.persist_or_warn(&state).await;
        self.pending.send_replace(state.ops.len());
        true
    }

    /// Swaps `remove_id` for an optional follow-up. The follow-up takes over
    /// the removed operation's place in line, or goes to the tail if nothing
    /// was removed. Unlike the other mutations this one is strict: if the
    /// store rejects the write the in-memory queue is rolled back.
    pub async fn replace(
        &self,
        remove_id: &str,
        follow_up: Option<OperationDraft>,
    ) -> Result<Option<OperationId>, QueueError> {
        let mut state = self.state.lock().await;
        let saved_ops = state.ops.clone();
        let saved_seq = state.next_seq;
        let saved_enqueued_at = state.last_enqueued_at;

        let removed = state
            .position(remove_id)
            .map(|index| (index, state.ops.remove(index)));
        let new_id = follow_up.map(|mut draft| {
            if draft.max_retries.is_none() {
                draft.max_retries = removed.as_ref().map(|(_, op)| op.max_retries);
            }
            let mut op = state.build(draft, self.default_max_retries);
            let id = op.id.clone();
            match &removed {
                Some((index, original)) => {
                    op.enqueued_at = original.enqueued_at;
                    op.seq = original.seq;
                    state.ops.insert(*index, op);
                }
                None => state.ops.push(op),
            }
            id
        });

        if let Err(err) = self.persist_locked(&state).await {
            state.ops = saved_ops;
            state.next_seq = saved_seq;
            state.last_enqueued_at = saved_enqueued_at;
            return Err(err);
        }
        self.pending.send_replace(state.ops.len());
        Ok(new_id)
    }

    pub async fn persist(&self) -> Result<(), QueueError> {
        let state = self.state.lock().await;
        self.persist_locked(&state).await
    }

    async fn persist_locked(&self, state: &QueueState) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(&state.ops)?;
        self.store.set(PENDING_OPERATIONS_KEY, &bytes).await?;
        Ok(())
    }

    async fn persist_or_warn(&self, state: &QueueState) {
        if let Err(err) = self.persist_locked(state).await {
            tracing::warn!(
                pending = state.ops.len(),
                "failed to persist operation queue, keeping in-memory state: {err}"
            );
        }
    }
}

fn sort_ops(ops: &mut [PendingOperation]) {
    ops.sort_by_key(|op| (op.enqueued_at, op.seq));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::MemoryQueueStore;
    use serde_json::json;

    async fn make_queue() -> (Arc<MemoryQueueStore>, OperationQueue) {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = OperationQueue::open(store.clone(), DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        (store, queue)
    }

    fn draft(table: &str, id: i64) -> OperationDraft {
        OperationDraft::new(OperationKind::Create, table, json!({"id": id}), "farmer-1")
    }

    #[tokio::test]
    async fn snapshot_preserves_enqueue_order() {
        let (_, queue) = make_queue().await;
        let mut ids = Vec::new();
        for n in 0..20 {
            ids.push(queue.enqueue(draft("goals", n)).await);
        }

        let snapshot = queue.snapshot().await;
        let snapshot_ids: Vec<_> = snapshot.iter().map(|op| op.id.clone()).collect();
        assert_eq!(snapshot_ids, ids);
        assert!(
            snapshot
                .windows(2)
                .all(|pair| pair[0].enqueued_at <= pair[1].enqueued_at)
        );
        assert_eq!(queue.len(), 20);
    }

    #[tokio::test]
    async fn enqueue_assigns_defaults() {
        let (_, queue) = make_queue().await;
        let id = queue.enqueue(draft("plots", 1)).await;
        let op = queue.get(&id).await.unwrap();
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(op.owner_id, "farmer-1");
        assert!(!op.force_overwrite);
        assert_eq!(op.entity_key(), Some(("plots".into(), "1".into())));
    }

    #[tokio::test]
    async fn zero_retry_budget_is_raised_to_one() {
        let (_, queue) = make_queue().await;
        let id = queue.enqueue(draft("plots", 1).max_retries(0)).await;
        assert_eq!(queue.get(&id).await.unwrap().max_retries, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_, queue) = make_queue().await;
        let id = queue.enqueue(draft("goals", 1)).await;
        assert!(queue.remove(&id).await);
        assert!(!queue.remove(&id).await);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn queue_is_reloaded_from_store() {
        let (store, queue) = make_queue().await;
        let first = queue.enqueue(draft("goals", 1)).await;
        let second = queue.enqueue(draft("goals", 2)).await;
        drop(queue);

        let reopened = OperationQueue::open(store, DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        let ids: Vec<_> = reopened
            .snapshot()
            .await
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![first, second]);

        let third = reopened.enqueue(draft("goals", 3)).await;
        let last = reopened.snapshot().await.pop().unwrap();
        assert_eq!(last.id, third);
        assert_eq!(last.seq, 2);
    }

    #[tokio::test]
    async fn corrupt_blob_loads_as_empty_queue() {
        let store = Arc::new(MemoryQueueStore::new());
        store.set(PENDING_OPERATIONS_KEY, b"{not json").await.unwrap();
        let queue = OperationQueue::open(store, DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn reload_releases_parked_operations() {
        let (store, queue) = make_queue().await;
        let id = queue.enqueue(draft("goals", 1)).await;
        assert!(queue.park(&id, "c-1").await);
        assert!(queue.get(&id).await.unwrap().is_parked());
        drop(queue);

        let reopened = OperationQueue::open(store, DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        assert!(!reopened.get(&id).await.unwrap().is_parked());
    }

    #[tokio::test]
    async fn enqueue_succeeds_when_store_rejects_writes() {
        let (store, queue) = make_queue().await;
        store.set_fail_writes(true);
        let id = queue.enqueue(draft("goals", 1)).await;
        assert!(queue.get(&id).await.is_some());
        assert_eq!(store.get(PENDING_OPERATIONS_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn record_failure_evicts_at_budget() {
        let (_, queue) = make_queue().await;
        let id = queue.enqueue(draft("goals", 1).max_retries(2)).await;

        assert_eq!(
            queue.record_failure(&id, Some(5)).await,
            Some(FailureOutcome::Retry { retry_count: 1 })
        );
        assert_eq!(queue.get(&id).await.unwrap().retry_at, Some(5));
        assert_eq!(
            queue.record_failure(&id, None).await,
            Some(FailureOutcome::Exhausted { retry_count: 2 })
        );
        assert!(queue.get(&id).await.is_none());
        assert_eq!(queue.record_failure(&id, None).await, None);
    }

    #[tokio::test]
    async fn replace_rolls_back_when_store_fails() {
        let (store, queue) = make_queue().await;
        let id = queue.enqueue(draft("goals", 1).max_retries(5)).await;
        store.set_fail_writes(true);

        let follow_up = draft("goals", 1).force_overwrite();
        assert!(queue.replace(&id, Some(follow_up.clone())).await.is_err());
        let ids: Vec<_> = queue.snapshot().await.into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![id.clone()]);

        store.set_fail_writes(false);
        let new_id = queue.replace(&id, Some(follow_up)).await.unwrap().unwrap();
        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, new_id);
        assert!(snapshot[0].force_overwrite);
        assert_eq!(snapshot[0].max_retries, 5);
    }

    #[tokio::test]
    async fn replace_keeps_queue_position() {
        let (store, queue) = make_queue().await;
        let first = queue.enqueue(draft("goals", 1)).await;
        let second = queue.enqueue(draft("goals", 1)).await;
        let original = queue.get(&first).await.unwrap();

        let replay = queue
            .replace(&first, Some(draft("goals", 1).force_overwrite()))
            .await
            .unwrap()
            .unwrap();
        let snapshot = queue.snapshot().await;
        let ids: Vec<_> = snapshot.iter().map(|op| op.id.clone()).collect();
        assert_eq!(ids, vec![replay.clone(), second.clone()]);
        assert_eq!(snapshot[0].enqueued_at, original.enqueued_at);
        assert_eq!(snapshot[0].seq, original.seq);
        drop(queue);

        let reopened = OperationQueue::open(store, DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        let ids: Vec<_> = reopened
            .snapshot()
            .await
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![replay, second]);
    }

    #[tokio::test]
    async fn replace_of_missing_operation_appends() {
        let (_, queue) = make_queue().await;
        let existing = queue.enqueue(draft("goals", 1)).await;
        let replay = queue
            .replace("gone", Some(draft("goals", 2)))
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<_> = queue.snapshot().await.into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![existing, replay]);
    }

    #[tokio::test]
    async fn mutations_notify_subscribers() {
        let (_, queue) = make_queue().await;
        let mut rx = queue.subscribe();
        queue.enqueue(draft("goals", 1)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        queue.clear().await;
        assert_eq!(*rx.borrow_and_update(), 0);
    }
}

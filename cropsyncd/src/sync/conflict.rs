use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, watch};

use super::parse_rfc3339_millis;
use super::queue::{OperationDraft, OperationKind, OperationQueue, PendingOperation, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    CreateCreate,
    UpdateUpdate,
    UpdateDelete,
    DeleteUpdate,
}

impl ConflictKind {
    /// `remote` is the record as the server currently holds it; `None` means
    /// the server deleted it. Returns `None` when both sides deleted, which
    /// is convergence rather than conflict.
    pub fn classify(local: OperationKind, remote: Option<&Value>) -> Option<Self> {
        match (local, remote.is_some()) {
            (OperationKind::Create, true) => Some(Self::CreateCreate),
            (OperationKind::Update, true) => Some(Self::UpdateUpdate),
            (OperationKind::Create | OperationKind::Update, false) => Some(Self::UpdateDelete),
            (OperationKind::Delete, true) => Some(Self::DeleteUpdate),
            (OperationKind::Delete, false) => None,
        }
    }

    fn local_replay_kind(self) -> OperationKind {
        match self {
            Self::CreateCreate | Self::UpdateUpdate => OperationKind::Update,
            Self::UpdateDelete => OperationKind::Create,
            Self::DeleteUpdate => OperationKind::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub operation_id: String,
    pub table: String,
    pub local_kind: OperationKind,
    pub local_payload: Value,
    pub remote_payload: Option<Value>,
    pub conflict_kind: ConflictKind,
    pub detected_at: i64,
    pub owner_id: String,
}

pub fn detect_conflict(
    op: &PendingOperation,
    remote: Option<Value>,
    detected_at: i64,
) -> Option<ConflictRecord> {
    let conflict_kind = ConflictKind::classify(op.kind, remote.as_ref())?;
    Some(ConflictRecord {
        id: uuid::Uuid::now_v7().to_string(),
        operation_id: op.id.clone(),
        table: op.table.clone(),
        local_kind: op.kind,
        local_payload: op.payload.clone(),
        remote_payload: remote,
        conflict_kind,
        detected_at,
        owner_id: op.owner_id.clone(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    UseLocal,
    UseRemote,
    Merge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Payload(Value),
    Tombstone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    Local,
    #[default]
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    pub timestamp_field: String,
    pub field_timestamps_field: Option<String>,
    pub tie_break: TieBreak,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            timestamp_field: "updatedAt".to_string(),
            field_timestamps_field: Some("fieldUpdatedAt".to_string()),
            tie_break: TieBreak::Remote,
        }
    }
}

impl MergePolicy {
    fn record_timestamp(&self, record: &Map<String, Value>) -> Option<i64> {
        record.get(&self.timestamp_field).and_then(parse_timestamp)
    }

    fn field_timestamps<'a>(&self, record: &'a Map<String, Value>) -> Option<&'a Map<String, Value>> {
        let key = self.field_timestamps_field.as_ref()?;
        record.get(key)?.as_object()
    }

    fn is_meta_field(&self, key: &str) -> bool {
        key == self.timestamp_field || self.field_timestamps_field.as_deref() == Some(key)
    }
}

pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => parse_rfc3339_millis(text),
        _ => None,
    }
}

struct SideTimes<'a> {
    record: Option<i64>,
    fields: Option<&'a Map<String, Value>>,
}

impl SideTimes<'_> {
    fn has_any(&self) -> bool {
        self.record.is_some() || self.fields.is_some_and(|fields| !fields.is_empty())
    }

    fn for_field(&self, key: &str) -> Option<i64> {
        self.fields
            .and_then(|fields| fields.get(key))
            .and_then(parse_timestamp)
            .or(self.record)
    }
}

/// Field-level merge of two object payloads, favoring the side that modified
/// each field last. Returns `None` when either payload is not an object or a
/// side carries no modification times at all.
pub fn merge_payloads(local: &Value, remote: &Value, policy: &MergePolicy) -> Option<Value> {
    let local = local.as_object()?;
    let remote = remote.as_object()?;
    let local_times = SideTimes {
        record: policy.record_timestamp(local),
        fields: policy.field_timestamps(local),
    };
    let remote_times = SideTimes {
        record: policy.record_timestamp(remote),
        fields: policy.field_timestamps(remote),
    };
    if !local_times.has_any() || !remote_times.has_any() {
        return None;
    }

    let mut merged = remote.clone();
    let mut merged_field_times = Map::new();
    if let Some(fields) = remote_times.fields {
        merged_field_times.extend(fields.clone());
    }

    for (key, local_value) in local {
        if policy.is_meta_field(key) {
            continue;
        }
        let Some(remote_value) = remote.get(key) else {
            merged.insert(key.clone(), local_value.clone());
            copy_field_time(&mut merged_field_times, local_times.fields, key);
            continue;
        };
        if local_value == remote_value {
            continue;
        }
        let local_wins = match (local_times.for_field(key), remote_times.for_field(key)) {
            (Some(l), Some(r)) => match l.cmp(&r) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => policy.tie_break == TieBreak::Local,
            },
            _ => policy.tie_break == TieBreak::Local,
        };
        if local_wins {
            merged.insert(key.clone(), local_value.clone());
            copy_field_time(&mut merged_field_times, local_times.fields, key);
        }
    }

    if let (Some(l), Some(r)) = (local_times.record, remote_times.record)
        && l > r
        && let Some(stamp) = local.get(&policy.timestamp_field)
    {
        merged.insert(policy.timestamp_field.clone(), stamp.clone());
    } else if !merged.contains_key(&policy.timestamp_field)
        && let Some(stamp) = local.get(&policy.timestamp_field)
    {
        merged.insert(policy.timestamp_field.clone(), stamp.clone());
    }
    if let Some(key) = &policy.field_timestamps_field
        && !merged_field_times.is_empty()
    {
        merged.insert(key.clone(), Value::Object(merged_field_times));
    }

    Some(Value::Object(merged))
}

fn copy_field_time(target: &mut Map<String, Value>, source: Option<&Map<String, Value>>, key: &str) {
    if let Some(stamp) = source.and_then(|fields| fields.get(key)) {
        target.insert(key.to_string(), stamp.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub resolution: Resolution,
    pub follow_up: Option<OperationDraft>,
}

pub fn plan_resolution(
    record: &ConflictRecord,
    strategy: ResolutionStrategy,
    policy: &MergePolicy,
) -> ResolutionPlan {
    match strategy {
        ResolutionStrategy::UseRemote => use_remote(record),
        ResolutionStrategy::UseLocal => {
            let kind = record.conflict_kind.local_replay_kind();
            let resolution = if kind == OperationKind::Delete {
                Resolution::Tombstone
            } else {
                Resolution::Payload(record.local_payload.clone())
            };
            ResolutionPlan {
                resolution,
                follow_up: Some(follow_up(record, kind, record.local_payload.clone())),
            }
        }
        ResolutionStrategy::Merge => {
            let mergeable = matches!(
                record.conflict_kind,
                ConflictKind::CreateCreate | ConflictKind::UpdateUpdate
            );
            let merged = record
                .remote_payload
                .as_ref()
                .filter(|_| mergeable)
                .and_then(|remote| merge_payloads(&record.local_payload, remote, policy));
            match merged {
                Some(merged) => ResolutionPlan {
                    resolution: Resolution::Payload(merged.clone()),
                    follow_up: Some(follow_up(record, OperationKind::Update, merged)),
                },
                None => {
                    tracing::debug!(
                        conflict = %record.id,
                        "merge has no usable timestamps, keeping remote"
                    );
                    use_remote(record)
                }
            }
        }
    }
}

fn use_remote(record: &ConflictRecord) -> ResolutionPlan {
    ResolutionPlan {
        resolution: record
            .remote_payload
            .clone()
            .map_or(Resolution::Tombstone, Resolution::Payload),
        follow_up: None,
    }
}

fn follow_up(record: &ConflictRecord, kind: OperationKind, payload: Value) -> OperationDraft {
    OperationDraft::new(kind, record.table.clone(), payload, record.owner_id.clone())
        .force_overwrite()
}

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("conflict not found: {0}")]
    NotFound(String),
    #[error("failed to persist resolution: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Default)]
pub struct ResolveAllReport {
    pub resolved: Vec<(String, Resolution)>,
    pub failed: Vec<(String, ConflictError)>,
}

pub struct ConflictResolver {
    queue: Arc<OperationQueue>,
    policy: MergePolicy,
    open: Mutex<Vec<ConflictRecord>>,
    count: watch::Sender<usize>,
}

impl ConflictResolver {
    pub fn new(queue: Arc<OperationQueue>, policy: MergePolicy) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            queue,
            policy,
            open: Mutex::new(Vec::new()),
            count,
        }
    }

    pub async fn register(&self, record: ConflictRecord) {
        let mut open = self.open.lock().await;
        tracing::info!(
            conflict = %record.id,
            operation = %record.operation_id,
            table = %record.table,
            kind = ?record.conflict_kind,
            "conflict detected"
        );
        open.push(record);
        self.count.send_replace(open.len());
    }

    pub async fn list(&self) -> Vec<ConflictRecord> {
        let mut open = self.open.lock().await.clone();
        open.sort_by_key(|record| record.detected_at);
        open
    }

    pub async fn get(&self, id: &str) -> Option<ConflictRecord> {
        let open = self.open.lock().await;
        open.iter().find(|record| record.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    pub async fn resolve(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution, ConflictError> {
        let mut open = self.open.lock().await;
        let index = open
            .iter()
            .position(|record| record.id == id)
            .ok_or_else(|| ConflictError::NotFound(id.to_string()))?;
        let record = &open[index];
        let plan = plan_resolution(record, strategy, &self.policy);
        let new_operation = self
            .queue
            .replace(&record.operation_id, plan.follow_up)
            .await?;
        tracing::info!(
            conflict = %record.id,
            strategy = ?strategy,
            follow_up = new_operation.as_deref().unwrap_or("none"),
            "conflict resolved"
        );
        open.remove(index);
        self.count.send_replace(open.len());
        Ok(plan.resolution)
    }

    /// Applies one strategy to every open conflict in detection order. Each
    /// conflict is resolved on its own; a failure does not stop the rest.
    pub async fn resolve_all(&self, strategy: ResolutionStrategy) -> ResolveAllReport {
        let mut report = ResolveAllReport::default();
        for record in self.list().await {
            match self.resolve(&record.id, strategy).await {
                Ok(resolution) => report.resolved.push((record.id, resolution)),
                Err(err) => {
                    tracing::warn!(conflict = %record.id, "failed to resolve conflict: {err}");
                    report.failed.push((record.id, err));
                }
            }
        }
        report
    }
}

use std::time::Duration;

use async_trait::async_trait;
use cropsync_core::{ApplyOutcome, Mutation, RecordClient, RecordRequest};

use super::engine::{ExecutionOutcome, ExecutionRequest, RemoteExecutor};
use super::queue::OperationKind;

#[derive(Clone)]
pub struct HttpExecutor {
    client: RecordClient,
}

impl HttpExecutor {
    pub fn new(client: RecordClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionOutcome {
        let mutation = match request.kind {
            OperationKind::Create => Mutation::Create,
            OperationKind::Update => Mutation::Update,
            OperationKind::Delete => Mutation::Delete,
        };
        let result = self
            .client
            .apply(&RecordRequest {
                mutation,
                table: request.table,
                payload: request.payload,
                overwrite: request.force_overwrite,
            })
            .await;
        match result {
            Ok(ApplyOutcome::Applied) => ExecutionOutcome::Applied,
            Ok(ApplyOutcome::Conflict(record)) => ExecutionOutcome::Conflict {
                remote: record.current,
            },
            Err(err) => {
                if !err.is_retryable() {
                    tracing::warn!(
                        table = request.table,
                        class = ?err.classification(),
                        "remote rejected operation: {err}"
                    );
                }
                ExecutionOutcome::Failed {
                    message: err.to_string(),
                    retry_after: err.retry_after_secs().map(Duration::from_secs),
                }
            }
        }
    }
}

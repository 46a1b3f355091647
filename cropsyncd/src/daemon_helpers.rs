/// Only a failed connection means offline. Any HTTP answer, even an error,
/// proves the remote is reachable.
fn status_from_probe(result: &Result<(), ApiError>) -> OfflineStatus {
    match result {
        Ok(()) => OfflineStatus::online(None),
        Err(ApiError::Request(err)) => {
            tracing::debug!("connectivity probe failed: {err}");
            OfflineStatus::offline()
        }
        Err(err) => {
            tracing::warn!(class = ?err.classification(), "remote answered probe with an error: {err}");
            OfflineStatus::online(None)
        }
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::OfflineChanged(status) => {
            tracing::info!(online = status.online, "connectivity changed");
        }
        SyncEvent::SyncChanged(status) => {
            if status.errors.is_empty() {
                tracing::debug!(
                    active = status.active,
                    pending = status.pending_count,
                    conflicts = status.pending_conflicts,
                    phase = ?status.phase,
                    "sync status"
                );
            } else {
                for error in &status.errors {
                    tracing::warn!(phase = ?status.phase, "{error}");
                }
            }
        }
        SyncEvent::ConflictsChanged(conflicts) => {
            tracing::info!(open = conflicts.len(), "conflicts awaiting resolution");
        }
    }
}

fn describe_operation(op: &PendingOperation) -> String {
    let mut line = format!(
        "  {} {:?} {} retries {}/{}",
        op.id, op.kind, op.table, op.retry_count, op.max_retries
    );
    if let Some(conflict) = &op.conflict_id {
        line.push_str(&format!(" parked behind conflict {conflict}"));
    } else if let Some(at) = op.retry_at.and_then(format_millis) {
        line.push_str(&format!(" next attempt {at}"));
    }
    if op.force_overwrite {
        line.push_str(" overwrite");
    }
    line
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

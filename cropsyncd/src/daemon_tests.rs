use super::*;
use crate::sync::queue::{OperationDraft, OperationKind};
use serde_json::json;
use std::collections::HashMap;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(db_path: PathBuf, remote_url: &str) -> DaemonConfig {
    let vars = HashMap::from([
        ("CROPSYNC_REMOTE_URL", remote_url.to_string()),
        ("CROPSYNC_TOKEN", "test-token".to_string()),
    ]);
    DaemonConfig::from_lookup(
        |name| vars.get(name).cloned(),
        Path::new("/tmp/home-user"),
        db_path,
    )
}

#[test]
fn expands_tilde_to_home() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/cropsync/queue.db", &home),
        PathBuf::from("/tmp/home-user/cropsync/queue.db")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/var/q.db", &home), PathBuf::from("/var/q.db"));
}

#[test]
fn numeric_settings_fall_back_on_bad_values() {
    assert_eq!(read_u64(None, 42), 42);
    assert_eq!(read_u64(Some("0".into()), 42), 42);
    assert_eq!(read_u64(Some("ten".into()), 42), 42);
    assert_eq!(read_u64(Some(" 7 ".into()), 42), 7);
}

#[test]
fn config_defaults_without_environment() {
    let config = DaemonConfig::from_lookup(
        |_| None,
        Path::new("/tmp/home-user"),
        PathBuf::from("/data/cropsync/queue.db"),
    );
    assert_eq!(config.db_path, PathBuf::from("/data/cropsync/queue.db"));
    assert_eq!(config.remote_url, DEFAULT_REMOTE_URL);
    assert_eq!(config.token, None);
    assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    assert_eq!(config.sync_interval, Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS));
}

#[test]
fn config_reads_overrides() {
    let vars = HashMap::from([
        ("CROPSYNC_DB_PATH", "~/farm/queue.db".to_string()),
        ("CROPSYNC_MAX_RETRIES", "5".to_string()),
        ("CROPSYNC_RETRY_BASE_MS", "500".to_string()),
        ("CROPSYNC_RETRY_MAX_MS", "100".to_string()),
        ("CROPSYNC_TOKEN", "  ".to_string()),
    ]);
    let config = DaemonConfig::from_lookup(
        |name| vars.get(name).cloned(),
        Path::new("/tmp/home-user"),
        PathBuf::from("/unused"),
    );
    assert_eq!(config.db_path, PathBuf::from("/tmp/home-user/farm/queue.db"));
    assert_eq!(config.token, None);

    let options = config.sync_options();
    assert_eq!(options.default_max_retries, 5);
    // The cap is raised to the base rather than inverting the range.
    assert_eq!(
        options.backoff,
        Backoff::new(Duration::from_millis(500), Duration::from_millis(500), true)
    );
}

#[test]
fn describes_parked_operation() {
    let op = PendingOperation {
        id: "op-1".into(),
        kind: OperationKind::Update,
        table: "goals".into(),
        payload: json!({"id": 1}),
        enqueued_at: 0,
        seq: 0,
        owner_id: "farmer-1".into(),
        retry_count: 1,
        max_retries: 3,
        retry_at: None,
        force_overwrite: true,
        conflict_id: Some("c-9".into()),
    };
    assert_eq!(
        describe_operation(&op),
        "  op-1 Update goals retries 1/3 parked behind conflict c-9 overwrite"
    );
}

#[tokio::test]
async fn probe_treats_http_errors_as_reachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let client = RecordClient::with_base_url(&server.uri(), "test-token").unwrap();

    assert!(status_from_probe(&client.ping().await).online);
}

#[tokio::test]
async fn probe_treats_refused_connection_as_offline() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);
    let client = RecordClient::with_base_url(&uri, "test-token").unwrap();

    assert!(!status_from_probe(&client.ping().await).online);
}

#[tokio::test]
async fn bootstrap_requires_token() {
    let dir = tempdir().unwrap();
    let mut config = config_for(dir.path().join("queue.db"), "http://127.0.0.1:1");
    config.token = None;
    let err = DaemonRuntime::bootstrap(config).await.err().unwrap();
    assert!(err.to_string().contains("CROPSYNC_TOKEN"));
}

#[tokio::test]
async fn probe_brings_daemon_online_and_drains_queue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/tables/goals/records"))
        .and(query_param("overwrite", "false"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let config = config_for(dir.path().join("queue.db"), &server.uri());
    let runtime = DaemonRuntime::bootstrap(config.clone()).await.unwrap();
    runtime
        .sync()
        .queue_operation(OperationDraft::new(
            OperationKind::Create,
            "goals",
            json!({"id": "g-1", "name": "New harrow"}),
            "farmer-1",
        ))
        .await;
    assert!(!runtime.sync().offline_status().online);

    assert!(runtime.probe_once().await.online);
    let summary = runtime.sync().force_sync().await.unwrap();
    assert_eq!(summary.applied, 1);
    runtime.sync().shutdown().await.unwrap();

    let report = status_report(&config).await.unwrap();
    assert!(report.contains("pending operations: 0"));
    assert!(!report.contains("last sync: never"));
}

#[tokio::test]
async fn clear_drops_persisted_operations() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path().join("queue.db"), "http://127.0.0.1:1");
    {
        let (_, queue) = open_queue(&config).await.unwrap();
        queue
            .enqueue(OperationDraft::new(
                OperationKind::Delete,
                "plots",
                json!({"id": "p-1"}),
                "farmer-1",
            ))
            .await;
    }
    let report = status_report(&config).await.unwrap();
    assert!(report.contains("pending operations: 1"));
    assert!(report.contains("Delete plots"));

    assert_eq!(clear_queue(&config).await.unwrap(), 1);
    let report = status_report(&config).await.unwrap();
    assert!(report.contains("pending operations: 0"));
}

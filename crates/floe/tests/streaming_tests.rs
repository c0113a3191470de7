//! End-to-end streaming scenarios against the in-memory coordinator and
//! object store: exactly-once claims across replicas, insert-failure
//! retries, retry exhaustion, ordered watermarks, commit fail-point
//! recovery, and lifecycle (drop / re-create).

use std::sync::Arc;

use floe::metadata::encode_node_name;
use floe::{
    EngineConfig, EngineContext, FailPoints, FileRecord, FileState, MemoryQueueLog, QueueEngine,
    QueueError, SettingChange, StaticViewCatalog, TableId, OBJECT_STORAGE_QUEUE_FAIL_COMMIT,
};
use floe_common::keeper::CreateMode;
use floe_common::{MemoryKeeper, MetaStore, ObjectStorageProvider, ObjectStorageRef, StorageType};

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

fn storage() -> ObjectStorageRef {
    Arc::new(ObjectStorageProvider::memory(StorageType::S3))
}

async fn put_files(storage: &ObjectStorageRef, names: &[&str], rows_per_file: usize) {
    for name in names {
        let mut body = String::new();
        for i in 0..rows_per_file {
            body.push_str(&format!("{{\"id\":{i}}}\n"));
        }
        storage.put(name, body.into_bytes()).await.unwrap();
    }
}

struct EngineOptions<'a> {
    keeper_path: &'a str,
    replica: &'a str,
    mode: &'a str,
    extra_settings: Vec<SettingChange>,
    views: Arc<StaticViewCatalog>,
    fail_points: Option<Arc<FailPoints>>,
    queue_log: Option<Arc<MemoryQueueLog>>,
}

async fn make_engine(
    server: &Arc<MemoryKeeper>,
    storage: &ObjectStorageRef,
    options: EngineOptions<'_>,
) -> QueueEngine {
    let mut settings = vec![
        SettingChange::new("mode", options.mode),
        SettingChange::new("keeper_path", options.keeper_path),
    ];
    settings.extend(options.extra_settings);

    let mut context = EngineContext::new(
        server.client(),
        options.replica,
        options.views as Arc<dyn floe::ViewCatalog>,
    );
    if let Some(fail_points) = options.fail_points {
        context.fail_points = fail_points;
    }
    if let Some(log) = options.queue_log {
        context.queue_log = Some(log as Arc<dyn floe::QueueLogSink>);
        context.enable_s3queue_log = true;
    }

    let config = EngineConfig {
        engine_name: "S3Queue".to_string(),
        table_id: TableId::new("db", "events"),
        path: "data/".to_string(),
        format: "ndjson".to_string(),
        columns: vec!["id".to_string()],
        settings,
        is_attach: false,
    };

    QueueEngine::create(config, context, Arc::clone(storage))
        .await
        .unwrap()
}

async fn processed_record(
    server: &Arc<MemoryKeeper>,
    zk_path: &str,
    file: &str,
) -> Option<FileRecord> {
    let client = server.client();
    let node = format!("{zk_path}/processed/{}", encode_node_name(file));
    client
        .get(&node)
        .await
        .unwrap()
        .map(|(bytes, _)| FileRecord::from_bytes(&bytes).unwrap())
}

#[tokio::test]
async fn test_unordered_happy_path_two_replicas_hash_ring() {
    init_tracing();
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();

    let files: Vec<String> = (0..10).map(|i| format!("data/file-{i:02}.ndjson")).collect();
    let names: Vec<&str> = files.iter().map(String::as_str).collect();
    put_files(&storage, &names, 2).await;

    let views1 = Arc::new(StaticViewCatalog::new(1));
    let views2 = Arc::new(StaticViewCatalog::new(1));
    let engine1 = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/happy",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![
                SettingChange::new("processing_threads_num", "4"),
                SettingChange::new("enable_hash_ring_filtering", "1"),
            ],
            views: views1.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;
    let engine2 = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/happy",
            replica: "r2",
            mode: "unordered",
            extra_settings: vec![
                SettingChange::new("processing_threads_num", "4"),
                SettingChange::new("enable_hash_ring_filtering", "1"),
            ],
            views: views2.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    // Pre-register r2 so r1's hash ring sees both replicas from the start.
    let client = server.client();
    client
        .create(
            &format!("{}/registrations/r2", engine2.zk_path()),
            b"r2",
            CreateMode::Ephemeral,
        )
        .await
        .unwrap();

    engine1.stream_once().await.unwrap();
    engine2.stream_once().await.unwrap();

    // Union of processed records is exactly the ten paths, each committed
    // by exactly one replica.
    let mut by_replica = (0usize, 0usize);
    for file in &files {
        let record = processed_record(&server, engine1.zk_path(), file)
            .await
            .unwrap_or_else(|| panic!("{file} not processed"));
        assert_eq!(record.state, FileState::Processed);
        match record.processing_replica.as_deref() {
            Some("r1") => by_replica.0 += 1,
            Some("r2") => by_replica.1 += 1,
            other => panic!("unexpected replica {other:?}"),
        }
    }
    assert_eq!(by_replica.0 + by_replica.1, 10);
    assert!(by_replica.0 >= 1, "r1 processed nothing");
    assert!(by_replica.1 >= 1, "r2 processed nothing");

    // Rows landed in each replica's insert pipeline, 2 per file.
    let total_rows = views1.insert_pipeline().row_count() + views2.insert_pipeline().row_count();
    assert_eq!(total_rows, 20);
}

#[tokio::test]
async fn test_insert_failure_marks_retries_then_succeeds() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    let files = ["data/a.ndjson", "data/b.ndjson", "data/c.ndjson"];
    put_files(&storage, &files, 1).await;

    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/retry",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![SettingChange::new("loading_retries", "5")],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    // All three files enter the cycle; the downstream insert throws on the
    // last block, so the whole cycle commits with insert_succeeded=false.
    views.insert_pipeline().fail_at_call(3);
    let err = engine.stream_once().await.unwrap_err();
    assert!(matches!(err, QueueError::Insert { .. }), "got {err}");

    // Nothing is Processed; every in-flight file got retry counter 1.
    let client = server.client();
    let processed = client
        .list(&format!("{}/processed", engine.zk_path()))
        .await
        .unwrap();
    assert!(processed.is_empty(), "unexpected processed: {processed:?}");
    for file in &files {
        let node = format!(
            "{}/failed/{}.retriable",
            engine.zk_path(),
            encode_node_name(file)
        );
        let (bytes, _) = client.get(&node).await.unwrap().expect("retriable record");
        let record = FileRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record.retries, 1);
    }

    // Next cycle succeeds; all three end Processed with retry counter 1.
    assert!(engine.stream_once().await.unwrap());
    for file in &files {
        let record = processed_record(&server, engine.zk_path(), file)
            .await
            .expect("processed record");
        assert_eq!(record.retries, 1);
    }
    let retriable = client
        .list(&format!("{}/failed", engine.zk_path()))
        .await
        .unwrap();
    assert!(retriable.is_empty(), "retriable leftovers: {retriable:?}");
}

#[tokio::test]
async fn test_retry_exhaustion_moves_file_to_failed() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    storage
        .put("data/broken.ndjson", b"this is not json\n".to_vec())
        .await
        .unwrap();

    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/exhaust",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![SettingChange::new("loading_retries", "2")],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    // Three cycles: retries 1, 2, then terminal failure with counter 2.
    for _ in 0..3 {
        engine.stream_once().await.unwrap();
    }

    let client = server.client();
    let node = format!(
        "{}/failed/{}",
        engine.zk_path(),
        encode_node_name("data/broken.ndjson")
    );
    let (bytes, _) = client.get(&node).await.unwrap().expect("terminal record");
    let record = FileRecord::from_bytes(&bytes).unwrap();
    assert_eq!(record.state, FileState::Failed);
    assert_eq!(record.retries, 2);
    assert!(record.last_exception.unwrap().contains("parse"));

    // The retriable record is gone and the file is never offered again.
    assert!(client
        .get(&format!("{node}.retriable"))
        .await
        .unwrap()
        .is_none());
    assert!(!engine.stream_once().await.unwrap());
}

#[tokio::test]
async fn test_ordered_watermark_survives_failed_cycle() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(
        &storage,
        &["data/a.ndjson", "data/b.ndjson", "data/c.ndjson"],
        1,
    )
    .await;

    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/ordered",
            replica: "r1",
            mode: "ordered",
            extra_settings: vec![SettingChange::new(
                "max_processed_files_before_commit",
                "2",
            )],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    // First commit covers a and b; the insert for c fails before the
    // second commit, modelling a crash mid-stream.
    views.insert_pipeline().fail_at_call(3);
    let err = engine.stream_once().await.unwrap_err();
    assert!(matches!(err, QueueError::Insert { .. }));

    let client = server.client();
    let watermark_node = format!("{}/buckets/0/path", engine.zk_path());
    let (bytes, _) = client.get(&watermark_node).await.unwrap().unwrap();
    assert_eq!(&bytes[..], b"data/b.ndjson");

    // Recovery offers only c; the watermark then advances to it.
    assert!(engine.stream_once().await.unwrap());
    let (bytes, _) = client.get(&watermark_node).await.unwrap().unwrap();
    assert_eq!(&bytes[..], b"data/c.ndjson");

    // Committed paths in the bucket were strictly increasing throughout.
    assert_eq!(views.insert_pipeline().row_count(), 3);
}

#[tokio::test]
async fn test_commit_fail_point_then_recovery_after_session_loss() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson", "data/b.ndjson"], 1).await;

    let fail_points = FailPoints::new();
    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/failpoint",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![],
            views: views.clone(),
            fail_points: Some(fail_points.clone()),
            queue_log: None,
        },
    )
    .await;

    fail_points.enable(OBJECT_STORAGE_QUEUE_FAIL_COMMIT);
    let err = engine.stream_once().await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownException { .. }), "got {err}");

    // Claims from the failed cycle are still held by this replica's
    // session, so nothing is offered.
    fail_points.disable(OBJECT_STORAGE_QUEUE_FAIL_COMMIT);
    assert!(!engine.stream_once().await.unwrap());

    // Session loss releases the ephemeral claims; the next cycle
    // re-claims and commits everything.
    let client = server.client();
    let processing = client
        .list(&format!("{}/processing", engine.zk_path()))
        .await
        .unwrap();
    assert_eq!(processing.len(), 2);
    for session in 1..10 {
        server.expire_session(session);
    }
    assert!(engine.stream_once().await.unwrap());

    let processed = client
        .list(&format!("{}/processed", engine.zk_path()))
        .await
        .unwrap();
    assert_eq!(processed.len(), 2);
}

#[tokio::test]
async fn test_claim_held_elsewhere_is_skipped_until_session_expiry() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson"], 1).await;

    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/ghost",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    // Another replica holds the claim.
    let ghost = server.client();
    let claim = format!(
        "{}/processing/{}",
        engine.zk_path(),
        encode_node_name("data/a.ndjson")
    );
    ghost
        .create(
            &claim,
            &FileRecord::processing("ghost", 0).to_bytes(),
            CreateMode::Ephemeral,
        )
        .await
        .unwrap();

    assert!(!engine.stream_once().await.unwrap());

    // The ghost replica dies; its ephemeral claim disappears and the file
    // becomes claimable.
    server.expire_session(ghost.session_id());
    assert!(engine.stream_once().await.unwrap());
    assert!(processed_record(&server, engine.zk_path(), "data/a.ndjson")
        .await
        .is_some());
}

#[tokio::test]
async fn test_after_processing_delete_removes_objects_before_commit() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson", "data/b.ndjson"], 1).await;

    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/delete",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![SettingChange::new("after_processing", "delete")],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    assert!(engine.stream_once().await.unwrap());

    let remaining = storage.list_all(Some("data")).await.unwrap();
    assert!(remaining.is_empty(), "objects not deleted: {remaining:?}");

    // Progress is still committed.
    assert!(processed_record(&server, engine.zk_path(), "data/a.ndjson")
        .await
        .is_some());
}

#[tokio::test]
async fn test_queue_log_records_processed_files() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson"], 3).await;

    let log = MemoryQueueLog::new();
    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/log",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![],
            views: views.clone(),
            fail_points: None,
            queue_log: Some(log.clone()),
        },
    )
    .await;

    engine.stream_once().await.unwrap();

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_path, "data/a.ndjson");
    assert_eq!(records[0].rows_processed, 3);
}

#[tokio::test]
async fn test_direct_select_gating_and_commit_once_processed() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson", "data/b.ndjson"], 2).await;

    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/select",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    let err = engine.read(false, None).await.unwrap_err();
    assert!(matches!(err, QueueError::QueryNotAllowed { .. }));

    let blocks = engine.read(true, None).await.unwrap();
    let rows: usize = blocks.iter().map(|b| b.len()).sum();
    assert_eq!(rows, 4);

    // The read committed its files; a second read finds nothing new.
    let blocks = engine.read(true, None).await.unwrap();
    assert!(blocks.is_empty());
}

#[tokio::test]
async fn test_predicate_pushdown_filters_before_claim() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson", "data/b.ndjson"], 1).await;

    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/predicate",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    let predicate: floe::FilePredicate = Arc::new(|object| object.path.ends_with("b.ndjson"));
    let blocks = engine.read(true, Some(predicate)).await.unwrap();
    assert_eq!(blocks.iter().map(|b| b.len()).sum::<usize>(), 1);
    assert!(blocks[0].rows.iter().all(|r| r.key == "data/b.ndjson"));

    // The filtered-out file was never claimed and is still available.
    assert!(processed_record(&server, engine.zk_path(), "data/a.ndjson")
        .await
        .is_none());
}

#[tokio::test]
async fn test_drop_removes_subtree_and_recreate_starts_fresh() {
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson"], 1).await;

    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/drop",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;
    let zk_path = engine.zk_path().to_string();

    engine.startup().await.unwrap();
    let client = server.client();
    assert!(client.exists(&format!("{zk_path}/metadata")).await.unwrap());

    engine.drop_table().await.unwrap();
    assert!(!client.exists(&zk_path).await.unwrap());

    // Re-create with the same keeper path: a fresh metadata node appears.
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/drop",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![],
            views: Arc::new(StaticViewCatalog::new(0)),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;
    assert!(client.exists(&format!("{zk_path}/metadata")).await.unwrap());
    engine.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn test_background_task_streams_to_views() {
    init_tracing();
    let server = Arc::new(MemoryKeeper::new());
    let storage = storage();
    put_files(&storage, &["data/a.ndjson"], 2).await;

    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(
        &server,
        &storage,
        EngineOptions {
            keeper_path: "tables/background",
            replica: "r1",
            mode: "unordered",
            extra_settings: vec![SettingChange::new("polling_min_timeout_ms", "20")],
            views: views.clone(),
            fail_points: None,
            queue_log: None,
        },
    )
    .await;

    engine.startup().await.unwrap();

    // The background task picks the file up without an explicit drive.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while views.insert_pipeline().row_count() < 2 {
        assert!(
            std::time::Instant::now() < deadline,
            "background task never processed the file"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    engine.shutdown(false).await.unwrap();
}

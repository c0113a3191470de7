//! ALTER behavior: MODIFY/RESET settings only, mode-dependent mutability,
//! the detached-views requirement for `buckets`, and persistence of
//! coordinator-backed settings.

use std::sync::Arc;

use floe::{
    AlterCommand, EngineConfig, EngineContext, QueueEngine, QueueError, SettingChange,
    StaticViewCatalog, TableId,
};
use floe_common::{MemoryKeeper, ObjectStorageProvider, ObjectStorageRef, StorageType};

async fn make_engine(
    server: &Arc<MemoryKeeper>,
    keeper_path: &str,
    mode: &str,
    views: Arc<StaticViewCatalog>,
) -> QueueEngine {
    let storage: ObjectStorageRef = Arc::new(ObjectStorageProvider::memory(StorageType::S3));
    let config = EngineConfig {
        engine_name: "S3Queue".to_string(),
        table_id: TableId::new("db", "events"),
        path: "data/".to_string(),
        format: "ndjson".to_string(),
        columns: vec!["id".to_string()],
        settings: vec![
            SettingChange::new("mode", mode),
            SettingChange::new("keeper_path", keeper_path),
        ],
        is_attach: false,
    };
    let context = EngineContext::new(server.client(), "r1", views as Arc<dyn floe::ViewCatalog>);
    QueueEngine::create(config, context, storage).await.unwrap()
}

fn setting<'a>(settings: &'a [SettingChange], name: &str) -> &'a str {
    settings
        .iter()
        .find(|change| change.name == name)
        .map(|change| change.value.as_str())
        .unwrap_or_else(|| panic!("setting {name} missing"))
}

fn modify(name: &str, value: &str) -> AlterCommand {
    AlterCommand::ModifySetting(SettingChange::new(name, value))
}

#[tokio::test]
async fn test_modify_engine_local_setting() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(&server, "alter/local", "unordered", views).await;

    assert_eq!(
        setting(&engine.settings().unwrap(), "polling_max_timeout_ms"),
        "10000"
    );

    // Raising the polling ceiling mid-stream is allowed; the next
    // reschedule honors it.
    engine
        .alter(&[modify("polling_max_timeout_ms", "5000")])
        .await
        .unwrap();
    assert_eq!(
        setting(&engine.settings().unwrap(), "polling_max_timeout_ms"),
        "5000"
    );

    // Streaming still works after the alter.
    engine.stream_once().await.unwrap();
}

#[tokio::test]
async fn test_modify_persisted_setting_reaches_coordinator() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(&server, "alter/persisted", "unordered", views).await;

    engine
        .alter(&[modify("s3queue_loading_retries", "3")])
        .await
        .unwrap();
    assert_eq!(setting(&engine.settings().unwrap(), "loading_retries"), "3");

    // Another replica attaching to the same path observes the new value.
    let views2 = Arc::new(StaticViewCatalog::new(0));
    let engine2 = make_engine(&server, "alter/persisted", "unordered", views2).await;
    assert_eq!(setting(&engine2.settings().unwrap(), "loading_retries"), "3");
}

#[tokio::test]
async fn test_reset_setting_restores_default() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(&server, "alter/reset", "unordered", views).await;

    engine
        .alter(&[modify("loading_retries", "3")])
        .await
        .unwrap();
    engine
        .alter(&[AlterCommand::ResetSetting("s3queue_loading_retries".to_string())])
        .await
        .unwrap();
    assert_eq!(setting(&engine.settings().unwrap(), "loading_retries"), "10");
}

#[tokio::test]
async fn test_non_mutable_setting_rejected_per_mode() {
    let server = Arc::new(MemoryKeeper::new());

    // processing_threads_num is Unordered-mutable only.
    let views = Arc::new(StaticViewCatalog::new(0));
    let ordered = make_engine(&server, "alter/ordered", "ordered", views).await;
    let err = ordered
        .alter(&[modify("processing_threads_num", "8")])
        .await
        .unwrap_err();
    match err {
        QueueError::SupportDisabled { message } => {
            assert!(message.contains("processing_threads_num"));
            assert!(message.contains("ordered"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let views = Arc::new(StaticViewCatalog::new(0));
    let unordered = make_engine(&server, "alter/unordered", "unordered", views).await;
    unordered
        .alter(&[modify("processing_threads_num", "8")])
        .await
        .unwrap();
    assert_eq!(
        setting(&unordered.settings().unwrap(), "processing_threads_num"),
        "8"
    );

    // buckets is Ordered-mutable only.
    let err = unordered.alter(&[modify("buckets", "4")]).await.unwrap_err();
    assert!(matches!(err, QueueError::SupportDisabled { .. }));
}

#[tokio::test]
async fn test_buckets_requires_detached_views() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(1));
    let engine = make_engine(&server, "alter/buckets", "ordered", views.clone()).await;

    let err = engine.alter(&[modify("buckets", "4")]).await.unwrap_err();
    match err {
        QueueError::SupportDisabled { message } => {
            assert!(message.contains("buckets"));
            assert!(message.contains("dependencies count: 1"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // With the views detached the change goes through and persists.
    views.set_view_count(0);
    engine.alter(&[modify("buckets", "4")]).await.unwrap();
    assert_eq!(setting(&engine.settings().unwrap(), "buckets"), "4");
}

#[tokio::test]
async fn test_only_modify_reset_allowed() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(&server, "alter/other", "unordered", views).await;

    let err = engine
        .alter(&[AlterCommand::Other("ADD COLUMN".to_string())])
        .await
        .unwrap_err();
    match err {
        QueueError::SupportDisabled { message } => {
            assert!(message.contains("Only MODIFY/RESET SETTING"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_duplicate_setting_rejected() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(&server, "alter/dup", "unordered", views).await;

    // The prefixed and unprefixed spellings are the same setting.
    let err = engine
        .alter(&[
            modify("loading_retries", "3"),
            modify("s3queue_loading_retries", "4"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::BadArguments { .. }));
}

#[tokio::test]
async fn test_unchanged_value_skips_mutability_check() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(&server, "alter/unchanged", "ordered", views).await;

    // `mode` is never changeable, but re-stating the current value is a
    // no-op rather than an error.
    engine.alter(&[modify("mode", "ordered")]).await.unwrap();

    let err = engine.alter(&[modify("mode", "unordered")]).await.unwrap_err();
    assert!(matches!(err, QueueError::SupportDisabled { .. }));
}

#[tokio::test]
async fn test_check_alter_validates_without_applying() {
    let server = Arc::new(MemoryKeeper::new());
    let views = Arc::new(StaticViewCatalog::new(0));
    let engine = make_engine(&server, "alter/check", "unordered", views).await;

    engine
        .check_alter(&[modify("loading_retries", "3")])
        .unwrap();
    assert_eq!(setting(&engine.settings().unwrap(), "loading_retries"), "10");

    assert!(engine
        .check_alter(&[modify("unknown_setting", "1")])
        .is_err());
}

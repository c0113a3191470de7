//! Cluster-shared per-table queue state.
//!
//! Everything the replicas agree on lives under the table's coordinator
//! path:
//!
//! ```text
//! /metadata            table-level settings digest
//! /processing/<path>   active claim record (ephemeral)
//! /processed/<path>    Unordered: persistent, TTL/cap-evicted
//! /failed/<path>       terminal failures
//! /failed/<path>.retriable   retriable failures carrying the retry counter
//! /buckets/<n>/lock    ephemeral bucket lease (Ordered)
//! /buckets/<n>/path    last-processed watermark
//! /registrations/<id>  ephemeral active-replica marker
//! ```

mod factory;

pub use factory::MetadataFactory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use floe_common::emit;
use floe_common::keeper::{join_path, CreateMode, MetaStoreRef, TxnOp};
use floe_common::metrics::events::{CleanupEvicted, TrackedFiles};
use floe_common::KeeperError;

use crate::error::QueueError;
use crate::settings::{AfterProcessing, QueueMode, QueueSettings, SettingChange};

/// State of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Processing,
    Processed,
    Failed,
}

/// Per-file record persisted in the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub state: FileState,
    pub processing_replica: Option<String>,
    pub retries: u64,
    pub last_exception: Option<String>,
    pub timestamp_ms: i64,
}

impl FileRecord {
    pub fn processing(replica: &str, retries: u64) -> Self {
        Self {
            state: FileState::Processing,
            processing_replica: Some(replica.to_string()),
            retries,
            last_exception: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn processed(replica: &str, retries: u64) -> Self {
        Self {
            state: FileState::Processed,
            processing_replica: Some(replica.to_string()),
            retries,
            last_exception: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn failed(replica: &str, retries: u64, exception: &str) -> Self {
        Self {
            state: FileState::Failed,
            processing_replica: Some(replica.to_string()),
            retries,
            last_exception: Some(exception.to_string()),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("file record serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::LogicalError {
            message: format!("Corrupted file record: {e}"),
        })
    }
}

/// Stable digest of the user column list, used to detect schema drift
/// between replicas attaching to the same coordinator path.
pub fn schema_digest(columns: &[String]) -> u64 {
    xxh3_64(columns.join("\n").as_bytes())
}

/// Table-level metadata persisted at `<zk_path>/metadata`.
///
/// Created once by the winner of the create race; attaching replicas must
/// match it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub format: String,
    pub schema_digest: u64,
    pub mode: QueueMode,
    pub buckets: u64,
    pub after_processing: AfterProcessing,
    pub loading_retries: u64,
    pub processing_threads_num: u64,
    pub tracked_files_limit: u64,
    pub tracked_file_ttl_sec: u64,
    pub last_processed_path: String,
}

impl TableMetadata {
    pub fn from_settings(settings: &QueueSettings, format: &str, columns: &[String]) -> Self {
        Self {
            format: format.to_string(),
            schema_digest: schema_digest(columns),
            mode: settings.mode,
            buckets: settings.buckets,
            after_processing: settings.after_processing,
            loading_retries: settings.loading_retries,
            processing_threads_num: settings.processing_threads_num,
            tracked_files_limit: settings.tracked_files_limit,
            tracked_file_ttl_sec: settings.tracked_file_ttl_sec,
            last_processed_path: settings.last_processed_path.clone(),
        }
    }

    /// Validate that an attaching replica's expectation matches the
    /// persisted table metadata.
    fn check_compatible(&self, candidate: &TableMetadata) -> Result<(), QueueError> {
        if self.format != candidate.format {
            return Err(QueueError::IncompatibleMetadata {
                message: format!(
                    "format mismatch: table has {}, query has {}",
                    self.format, candidate.format
                ),
            });
        }
        if self.schema_digest != candidate.schema_digest {
            return Err(QueueError::IncompatibleMetadata {
                message: "column schema digest mismatch".to_string(),
            });
        }
        if self.mode != candidate.mode {
            return Err(QueueError::IncompatibleMetadata {
                message: format!(
                    "mode mismatch: table has {}, query has {}",
                    self.mode.as_str(),
                    candidate.mode.as_str()
                ),
            });
        }
        if self.buckets != candidate.buckets {
            return Err(QueueError::IncompatibleMetadata {
                message: format!(
                    "buckets mismatch: table has {}, query has {}",
                    self.buckets, candidate.buckets
                ),
            });
        }
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("table metadata serializes")
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::LogicalError {
            message: format!("Corrupted table metadata: {e}"),
        })
    }
}

/// Which bucket a path belongs to (Ordered mode). `buckets == 0` behaves as
/// a single bucket.
pub fn bucket_for(path: &str, buckets: u64) -> u64 {
    xxh3_64(path.as_bytes()) % buckets.max(1)
}

/// Encode an object path into a single coordinator node name.
pub fn encode_node_name(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}

/// Inverse of [`encode_node_name`].
pub fn decode_node_name(name: &str) -> String {
    name.replace("%2F", "/").replace("%25", "%")
}

struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shared per-table queue state bound to one coordinator path.
///
/// Instances are shared process-wide through [`MetadataFactory`]; the
/// factory also owns the lifecycle of the background cleanup task.
pub struct QueueMetadata {
    keeper: MetaStoreRef,
    zk_path: String,
    table: RwLock<TableMetadata>,
    table_label: String,
    cleanup_interval_min_ms: u32,
    cleanup_interval_max_ms: u32,
    multiread_batch_size: usize,
    cleanup: StdMutex<Option<CleanupTask>>,
    shutdown_called: AtomicBool,
}

impl QueueMetadata {
    pub fn new(
        keeper: MetaStoreRef,
        zk_path: &str,
        table: TableMetadata,
        table_label: &str,
        cleanup_interval_min_ms: u32,
        cleanup_interval_max_ms: u32,
        multiread_batch_size: usize,
    ) -> Self {
        Self {
            keeper,
            zk_path: zk_path.to_string(),
            table: RwLock::new(table),
            table_label: table_label.to_string(),
            cleanup_interval_min_ms,
            cleanup_interval_max_ms,
            multiread_batch_size,
            cleanup: StdMutex::new(None),
            shutdown_called: AtomicBool::new(false),
        }
    }

    /// Create or validate the table metadata node.
    ///
    /// On create, writes the candidate; a creation race is resolved by
    /// compare-and-create, losers read back and re-validate. On attach (and
    /// for race losers) the persisted metadata must match the candidate.
    pub async fn sync_with_keeper(
        keeper: &MetaStoreRef,
        zk_path: &str,
        settings: &QueueSettings,
        format: &str,
        columns: &[String],
        is_attach: bool,
    ) -> Result<TableMetadata, QueueError> {
        let candidate = TableMetadata::from_settings(settings, format, columns);
        let metadata_path = join_path(zk_path, "metadata");

        loop {
            if let Some((bytes, _)) = keeper.get(&metadata_path).await? {
                let existing = TableMetadata::from_bytes(&bytes)?;
                existing.check_compatible(&candidate)?;
                return Ok(existing);
            }

            if is_attach {
                debug!(path = %zk_path, "Attach found no metadata node, creating it");
            }

            match keeper
                .create(&metadata_path, &candidate.to_bytes(), CreateMode::Persistent)
                .await
            {
                Ok(()) => {
                    info!(path = %zk_path, mode = candidate.mode.as_str(), "Created table metadata");
                    Self::init_ordered_watermark(keeper, zk_path, &candidate).await?;
                    return Ok(candidate);
                }
                // Lost the race; loop to read the winner's node and validate.
                Err(KeeperError::NodeExists { .. }) => continue,
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Seed the bucket watermark from `last_processed_path` (Ordered only).
    async fn init_ordered_watermark(
        keeper: &MetaStoreRef,
        zk_path: &str,
        table: &TableMetadata,
    ) -> Result<(), QueueError> {
        if table.mode != QueueMode::Ordered || table.last_processed_path.is_empty() {
            return Ok(());
        }
        let bucket = bucket_for(&table.last_processed_path, table.buckets);
        let path = join_path(zk_path, &format!("buckets/{bucket}/path"));
        match keeper
            .create(&path, table.last_processed_path.as_bytes(), CreateMode::Persistent)
            .await
        {
            Ok(()) | Err(KeeperError::NodeExists { .. }) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    // ── Path layout ──

    pub fn zk_path(&self) -> &str {
        &self.zk_path
    }

    pub fn keeper(&self) -> &MetaStoreRef {
        &self.keeper
    }

    pub fn metadata_path(&self) -> String {
        join_path(&self.zk_path, "metadata")
    }

    pub fn processing_path(&self, file: &str) -> String {
        join_path(&self.zk_path, &format!("processing/{}", encode_node_name(file)))
    }

    pub fn processed_path(&self, file: &str) -> String {
        join_path(&self.zk_path, &format!("processed/{}", encode_node_name(file)))
    }

    pub fn processed_dir(&self) -> String {
        join_path(&self.zk_path, "processed")
    }

    pub fn failed_path(&self, file: &str) -> String {
        join_path(&self.zk_path, &format!("failed/{}", encode_node_name(file)))
    }

    pub fn retriable_failed_path(&self, file: &str) -> String {
        format!("{}.retriable", self.failed_path(file))
    }

    pub fn bucket_lock_path(&self, bucket: u64) -> String {
        join_path(&self.zk_path, &format!("buckets/{bucket}/lock"))
    }

    pub fn bucket_watermark_path(&self, bucket: u64) -> String {
        join_path(&self.zk_path, &format!("buckets/{bucket}/path"))
    }

    pub fn registrations_path(&self) -> String {
        join_path(&self.zk_path, "registrations")
    }

    pub fn registration_path(&self, replica: &str) -> String {
        join_path(&self.zk_path, &format!("registrations/{replica}"))
    }

    // ── Table metadata access ──

    pub fn table(&self) -> TableMetadata {
        self.table.read().expect("table metadata lock").clone()
    }

    pub fn mode(&self) -> QueueMode {
        self.table.read().expect("table metadata lock").mode
    }

    pub fn buckets(&self) -> u64 {
        self.table.read().expect("table metadata lock").buckets
    }

    pub fn loading_retries(&self) -> u64 {
        self.table.read().expect("table metadata lock").loading_retries
    }

    pub fn after_processing(&self) -> AfterProcessing {
        self.table.read().expect("table metadata lock").after_processing
    }

    pub fn processing_threads_num(&self) -> u64 {
        self.table
            .read()
            .expect("table metadata lock")
            .processing_threads_num
    }

    pub fn multiread_batch_size(&self) -> usize {
        self.multiread_batch_size
    }

    /// Whether tracked-file records are subject to eviction.
    pub fn file_deletion_enabled(&self) -> bool {
        let table = self.table.read().expect("table metadata lock");
        table.mode == QueueMode::Unordered
            && (table.tracked_file_ttl_sec > 0 || table.tracked_files_limit > 0)
    }

    // ── Replica registration ──

    /// Register this replica as active (idempotent).
    pub async fn register(&self, replica: &str) -> Result<(), QueueError> {
        match self
            .keeper
            .create(&self.registration_path(replica), replica.as_bytes(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) | Err(KeeperError::NodeExists { .. }) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    /// Remove this replica's active registration (idempotent).
    pub async fn unregister(&self, replica: &str) -> Result<(), QueueError> {
        match self.keeper.delete(&self.registration_path(replica), None).await {
            Ok(()) | Err(KeeperError::NoNode { .. }) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    /// Ids of the currently registered (live) replicas.
    pub async fn active_replicas(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.keeper.list(&self.registrations_path()).await?)
    }

    // ── Settings alteration ──

    /// Apply coordinator-persisted setting changes: update the local copy
    /// and CAS-write the `/metadata` node so other replicas observe them.
    pub async fn alter_settings(&self, changes: &[SettingChange]) -> Result<(), QueueError> {
        if changes.is_empty() {
            return Ok(());
        }

        const MAX_CAS_ATTEMPTS: usize = 5;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let (bytes, stat) = self
                .keeper
                .get(&self.metadata_path())
                .await?
                .ok_or_else(|| QueueError::LogicalError {
                    message: format!("Table metadata node is missing at {}", self.zk_path),
                })?;
            let mut table = TableMetadata::from_bytes(&bytes)?;

            for change in changes {
                apply_persisted_setting(&mut table, &change.name, &change.value)?;
            }

            match self
                .keeper
                .set(&self.metadata_path(), &table.to_bytes(), Some(stat.version))
                .await
            {
                Ok(_) => {
                    *self.table.write().expect("table metadata lock") = table;
                    return Ok(());
                }
                Err(KeeperError::BadVersion { .. }) if attempt + 1 < MAX_CAS_ATTEMPTS => {
                    debug!(path = %self.zk_path, attempt, "Metadata CAS lost, retrying");
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(QueueError::LogicalError {
            message: "Failed to apply setting changes: too many metadata races".to_string(),
        })
    }

    // ── Cleanup ──

    /// Start the background cleanup task for this instance, if the mode and
    /// tracking bounds call for one. Invoked by the factory on registration.
    pub fn start_cleanup(self: &Arc<Self>) {
        if !self.file_deletion_enabled() {
            return;
        }
        let mut slot = self.cleanup.lock().expect("cleanup slot lock");
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let task_token = token.clone();
        let metadata = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let sleep_ms = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(
                        metadata.cleanup_interval_min_ms..=metadata.cleanup_interval_max_ms,
                    )
                };
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(u64::from(sleep_ms))) => {}
                }
                if let Err(e) = metadata.cleanup_pass().await {
                    warn!(path = %metadata.zk_path, error = %e, "Cleanup pass failed");
                }
            }
        });
        *slot = Some(CleanupTask { token, handle });
    }

    /// One eviction pass over `/processed/`: drop records past their TTL,
    /// then oldest-first down to the tracked-file cap. One coordinator
    /// transaction per batch.
    pub async fn cleanup_pass(&self) -> Result<(), QueueError> {
        let (ttl_sec, limit) = {
            let table = self.table.read().expect("table metadata lock");
            if table.mode != QueueMode::Unordered {
                return Ok(());
            }
            (table.tracked_file_ttl_sec, table.tracked_files_limit)
        };
        if ttl_sec == 0 && limit == 0 {
            return Ok(());
        }

        let children = self.keeper.list(&self.processed_dir()).await?;
        emit!(TrackedFiles {
            count: children.len(),
            table: self.table_label.clone(),
        });
        if children.is_empty() {
            return Ok(());
        }

        let paths: Vec<String> = children
            .iter()
            .map(|name| join_path(&self.processed_dir(), name))
            .collect();
        let records = self
            .keeper
            .get_many(&paths, self.multiread_batch_size)
            .await?;

        // (timestamp, node path) for every live record
        let mut entries: Vec<(i64, String)> = Vec::with_capacity(paths.len());
        for (path, record) in paths.iter().zip(records) {
            if let Some((bytes, _)) = record {
                let record = FileRecord::from_bytes(&bytes)?;
                entries.push((record.timestamp_ms, path.clone()));
            }
        }
        entries.sort();

        let now_ms = Utc::now().timestamp_millis();
        let mut doomed: Vec<String> = Vec::new();
        let mut live: Vec<&String> = Vec::new();
        for (timestamp_ms, path) in &entries {
            if ttl_sec > 0 && now_ms - timestamp_ms > (ttl_sec as i64) * 1000 {
                doomed.push(path.clone());
            } else {
                live.push(path);
            }
        }
        // Entries are oldest-first, so the cap evicts from the front.
        if limit > 0 && live.len() > limit as usize {
            let excess = live.len() - limit as usize;
            doomed.extend(live.drain(..excess).cloned());
        }
        let survivors = live.len();

        if doomed.is_empty() {
            return Ok(());
        }

        for chunk in doomed.chunks(self.multiread_batch_size.max(1)) {
            let ops: Vec<TxnOp> = chunk.iter().map(|path| TxnOp::delete(path.clone())).collect();
            self.keeper.multi(&ops).await?;
        }

        info!(
            path = %self.zk_path,
            evicted = doomed.len(),
            remaining = survivors,
            "Cleanup pass evicted tracked files"
        );
        emit!(CleanupEvicted {
            count: doomed.len() as u64,
            table: self.table_label.clone(),
        });
        emit!(TrackedFiles {
            count: survivors,
            table: self.table_label.clone(),
        });
        Ok(())
    }

    /// Stop the cleanup task and wait for it to exit.
    pub async fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self.cleanup.lock().expect("cleanup slot lock").take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!(path = %self.zk_path, error = %e, "Cleanup task join failed");
            }
        }
    }

    /// Remove the whole coordinator subtree (explicit DROP only).
    pub async fn drop_subtree(keeper: &MetaStoreRef, zk_path: &str) -> Result<(), QueueError> {
        info!(path = %zk_path, "Removing coordinator subtree");
        keeper.remove_recursive(zk_path).await?;
        Ok(())
    }
}

/// Apply one coordinator-persisted setting to the table metadata.
fn apply_persisted_setting(
    table: &mut TableMetadata,
    name: &str,
    value: &str,
) -> Result<(), QueueError> {
    let bad = |message: String| QueueError::BadArguments { message };
    match name {
        "after_processing" => {
            table.after_processing = match value.to_ascii_lowercase().as_str() {
                "keep" => AfterProcessing::Keep,
                "delete" => AfterProcessing::Delete,
                other => return Err(bad(format!("Invalid after_processing: {other}"))),
            }
        }
        "loading_retries" => {
            table.loading_retries = value
                .parse()
                .map_err(|_| bad(format!("Invalid loading_retries: {value}")))?
        }
        "processing_threads_num" => {
            table.processing_threads_num = value
                .parse()
                .map_err(|_| bad(format!("Invalid processing_threads_num: {value}")))?
        }
        "tracked_files_limit" => {
            table.tracked_files_limit = value
                .parse()
                .map_err(|_| bad(format!("Invalid tracked_files_limit: {value}")))?
        }
        "tracked_file_ttl_sec" => {
            table.tracked_file_ttl_sec = value
                .parse()
                .map_err(|_| bad(format!("Invalid tracked_file_ttl_sec: {value}")))?
        }
        "buckets" => {
            table.buckets = value
                .parse()
                .map_err(|_| bad(format!("Invalid buckets: {value}")))?
        }
        other => {
            return Err(QueueError::LogicalError {
                message: format!("Setting {other} is not persisted in the coordinator"),
            })
        }
    }
    Ok(())
}

/// Names of settings that live in the coordinator metadata node.
pub fn is_persisted_setting(name: &str) -> bool {
    matches!(
        name,
        "after_processing"
            | "loading_retries"
            | "processing_threads_num"
            | "tracked_files_limit"
            | "tracked_file_ttl_sec"
            | "buckets"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_common::MemoryKeeper;

    fn test_settings(mode: QueueMode) -> QueueSettings {
        let mut settings = QueueSettings::default();
        settings.mode = mode;
        settings.mode_set = true;
        settings
    }

    fn columns() -> Vec<String> {
        vec!["id".to_string(), "payload".to_string()]
    }

    #[test]
    fn test_node_name_roundtrip() {
        let path = "data/2026-01/file%20.ndjson";
        let encoded = encode_node_name(path);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_node_name(&encoded), path);
    }

    #[test]
    fn test_bucket_for_is_stable() {
        assert_eq!(bucket_for("a", 4), bucket_for("a", 4));
        assert_eq!(bucket_for("a", 0), 0);
        assert!(bucket_for("some/path", 8) < 8);
    }

    #[tokio::test]
    async fn test_sync_creates_then_validates() {
        let server = std::sync::Arc::new(MemoryKeeper::new());
        let keeper = server.client();
        let settings = test_settings(QueueMode::Unordered);

        let created = QueueMetadata::sync_with_keeper(
            &keeper,
            "/floe/t1",
            &settings,
            "ndjson",
            &columns(),
            false,
        )
        .await
        .unwrap();
        assert_eq!(created.mode, QueueMode::Unordered);

        // A second replica with matching configuration attaches fine.
        let attached = QueueMetadata::sync_with_keeper(
            &keeper,
            "/floe/t1",
            &settings,
            "ndjson",
            &columns(),
            true,
        )
        .await
        .unwrap();
        assert_eq!(attached, created);

        // Mismatching mode is rejected.
        let err = QueueMetadata::sync_with_keeper(
            &keeper,
            "/floe/t1",
            &test_settings(QueueMode::Ordered),
            "ndjson",
            &columns(),
            true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueueError::IncompatibleMetadata { .. }));

        // Mismatching schema is rejected.
        let err = QueueMetadata::sync_with_keeper(
            &keeper,
            "/floe/t1",
            &settings,
            "ndjson",
            &["other".to_string()],
            true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueueError::IncompatibleMetadata { .. }));
    }

    #[tokio::test]
    async fn test_ordered_create_seeds_watermark() {
        let server = std::sync::Arc::new(MemoryKeeper::new());
        let keeper = server.client();
        let mut settings = test_settings(QueueMode::Ordered);
        settings.last_processed_path = "data/b.ndjson".to_string();

        QueueMetadata::sync_with_keeper(&keeper, "/floe/t2", &settings, "ndjson", &columns(), false)
            .await
            .unwrap();

        let bucket = bucket_for("data/b.ndjson", 0);
        let (bytes, _) = keeper
            .get(&format!("/floe/t2/buckets/{bucket}/path"))
            .await
            .unwrap()
            .expect("watermark node");
        assert_eq!(&bytes[..], b"data/b.ndjson");
    }

    #[tokio::test]
    async fn test_register_unregister_and_active() {
        let server = std::sync::Arc::new(MemoryKeeper::new());
        let keeper = server.client();
        let table =
            TableMetadata::from_settings(&test_settings(QueueMode::Unordered), "ndjson", &columns());
        let metadata = QueueMetadata::new(keeper, "/floe/t3", table, "t3", 100, 200, 100);

        metadata.register("r1").await.unwrap();
        metadata.register("r1").await.unwrap(); // idempotent
        metadata.register("r2").await.unwrap();
        assert_eq!(metadata.active_replicas().await.unwrap(), vec!["r1", "r2"]);

        metadata.unregister("r1").await.unwrap();
        metadata.unregister("r1").await.unwrap(); // idempotent
        assert_eq!(metadata.active_replicas().await.unwrap(), vec!["r2"]);
    }

    #[tokio::test]
    async fn test_alter_settings_persists_and_updates_local() {
        let server = std::sync::Arc::new(MemoryKeeper::new());
        let keeper = server.client();
        let settings = test_settings(QueueMode::Unordered);
        let table = QueueMetadata::sync_with_keeper(
            &keeper,
            "/floe/t4",
            &settings,
            "ndjson",
            &columns(),
            false,
        )
        .await
        .unwrap();
        let metadata = QueueMetadata::new(keeper.clone(), "/floe/t4", table, "t4", 100, 200, 100);

        metadata
            .alter_settings(&[SettingChange::new("loading_retries", "3")])
            .await
            .unwrap();
        assert_eq!(metadata.loading_retries(), 3);

        let (bytes, _) = keeper.get("/floe/t4/metadata").await.unwrap().unwrap();
        let persisted = TableMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(persisted.loading_retries, 3);
    }

    #[tokio::test]
    async fn test_cleanup_pass_respects_cap() {
        let server = std::sync::Arc::new(MemoryKeeper::new());
        let keeper = server.client();
        let mut settings = test_settings(QueueMode::Unordered);
        settings.tracked_files_limit = 2;
        settings.tracked_file_ttl_sec = 0;
        let table = TableMetadata::from_settings(&settings, "ndjson", &columns());
        let metadata =
            QueueMetadata::new(keeper.clone(), "/floe/t5", table, "t5", 100, 200, 100);

        // Insert four processed records with increasing timestamps.
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let mut record = FileRecord::processed("r1", 0);
            record.timestamp_ms = 1000 + i as i64;
            keeper
                .create(
                    &metadata.processed_path(name),
                    &record.to_bytes(),
                    CreateMode::Persistent,
                )
                .await
                .unwrap();
        }

        metadata.cleanup_pass().await.unwrap();

        let remaining = keeper.list("/floe/t5/processed").await.unwrap();
        assert_eq!(remaining.len(), 2);
        // Oldest evicted first.
        assert_eq!(remaining, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_cleanup_pass_respects_ttl() {
        let server = std::sync::Arc::new(MemoryKeeper::new());
        let keeper = server.client();
        let mut settings = test_settings(QueueMode::Unordered);
        settings.tracked_files_limit = 0;
        settings.tracked_file_ttl_sec = 60;
        let table = TableMetadata::from_settings(&settings, "ndjson", &columns());
        let metadata =
            QueueMetadata::new(keeper.clone(), "/floe/t6", table, "t6", 100, 200, 100);

        let mut old = FileRecord::processed("r1", 0);
        old.timestamp_ms = Utc::now().timestamp_millis() - 120_000;
        keeper
            .create(&metadata.processed_path("old"), &old.to_bytes(), CreateMode::Persistent)
            .await
            .unwrap();

        let fresh = FileRecord::processed("r1", 0);
        keeper
            .create(&metadata.processed_path("fresh"), &fresh.to_bytes(), CreateMode::Persistent)
            .await
            .unwrap();

        metadata.cleanup_pass().await.unwrap();

        let remaining = keeper.list("/floe/t6/processed").await.unwrap();
        assert_eq!(remaining, vec!["fresh"]);
    }
}

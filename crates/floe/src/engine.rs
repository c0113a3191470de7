//! The queue table engine: lifecycle owner, settings validation, wiring of
//! the iterator/worker/commit machinery, and schema alterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use floe_common::emit;
use floe_common::keeper::{join_path, MetaStoreRef};
use floe_common::metrics::events::InsertIterations;
use floe_common::{ObjectStorageRef, StorageType};

use crate::commit::{commit, FailPoints};
use crate::error::{InsertSnafu, QueueError, TaskJoinSnafu};
use crate::metadata::{is_persisted_setting, MetadataFactory, QueueMetadata};
use crate::queue_log::QueueLogSink;
use crate::settings::{
    normalize_setting, CommitSettings, QueueSettings, SettingChange,
};
use crate::source::{
    check_format_name, format_for_name, Block, FileIterator, FilePredicate, FormatParser,
    ProcessingProgress, SourceWorker,
};
use crate::streaming::run_streaming_loop;
use crate::views::{InsertPipeline, TableId, ViewCatalog};
use snafu::ResultExt;

/// Characters that make a path a glob pattern.
const GLOB_CHARS: [char; 4] = ['*', '?', '{', '['];

/// DDL-level inputs for creating or attaching a queue table.
pub struct EngineConfig {
    /// Engine name from the DDL; `S3Queue` or `AzureQueue`.
    pub engine_name: String,
    pub table_id: TableId,
    /// Object key pattern relative to the storage root. Must end with `/`
    /// or contain globs.
    pub path: String,
    pub format: String,
    /// User column names, digested into the coordinator metadata.
    pub columns: Vec<String>,
    pub settings: Vec<SettingChange>,
    pub is_attach: bool,
}

/// Process-level collaborators handed to every queue table.
pub struct EngineContext {
    pub keeper: MetaStoreRef,
    /// Prefix under which all queue tables keep their coordinator state.
    pub keeper_prefix: String,
    /// Identity of this replica in registrations and claim records.
    pub replica: String,
    pub database_uuid: Uuid,
    pub views: Arc<dyn ViewCatalog>,
    pub queue_log: Option<Arc<dyn QueueLogSink>>,
    /// Session-level flag enabling the S3 queue log regardless of the
    /// table setting.
    pub enable_s3queue_log: bool,
    /// Max fan-out for batched coordinator reads.
    pub multiread_batch_size: usize,
    pub fail_points: Arc<FailPoints>,
}

impl EngineContext {
    pub fn new(keeper: MetaStoreRef, replica: &str, views: Arc<dyn ViewCatalog>) -> Self {
        Self {
            keeper,
            keeper_prefix: "/floe".to_string(),
            replica: replica.to_string(),
            database_uuid: Uuid::new_v4(),
            views,
            queue_log: None,
            enable_s3queue_log: false,
            multiread_batch_size: 10_000,
            fail_points: FailPoints::new(),
        }
    }
}

/// A MODIFY/RESET SETTING alter command. Anything else is refused.
#[derive(Debug, Clone)]
pub enum AlterCommand {
    ModifySetting(SettingChange),
    ResetSetting(String),
    /// A non-settings alter (column change, TTL, ...), kept only to be
    /// rejected with a proper error.
    Other(String),
}

/// Engine-local mutable settings, read by the background task under one
/// mutex; callers snapshot-copy before use.
struct LocalSettings {
    polling_min_timeout_ms: u64,
    polling_max_timeout_ms: u64,
    polling_backoff_ms: u64,
    list_objects_batch_size: u64,
    enable_hash_ring_filtering: bool,
    commit: CommitSettings,
    reschedule_unregister_threshold_ms: u64,
    reschedule_interval_ms: u64,
}

pub(crate) struct EngineInner {
    table_id: TableId,
    table_label: String,
    storage_type: StorageType,
    zk_path: String,
    path_pattern: String,
    format: Arc<dyn FormatParser>,
    storage: ObjectStorageRef,
    keeper: MetaStoreRef,
    views: Arc<dyn ViewCatalog>,
    queue_log: Option<Arc<dyn QueueLogSink>>,
    fail_points: Arc<FailPoints>,
    replica: String,
    keeper_path_setting: Option<String>,
    enable_logging_to_queue_log: u32,
    cleanup_interval_min_ms: u32,
    cleanup_interval_max_ms: u32,
    local: StdMutex<LocalSettings>,
    /// Moved into the global registry exactly once at startup.
    temp_metadata: StdMutex<Option<Arc<QueueMetadata>>>,
    files_metadata: StdMutex<Option<Arc<QueueMetadata>>>,
    mv_attached: AtomicBool,
    shutdown_called: AtomicBool,
    shutdown: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// The queue table engine. `S3Queue` and `AzureQueue` DDL both land here;
/// the engine name selects the storage type.
pub struct QueueEngine {
    inner: Arc<EngineInner>,
}

impl QueueEngine {
    /// Validate the DDL inputs, sync table metadata with the coordinator,
    /// and wire the engine. The background task starts in [`startup`].
    pub async fn create(
        config: EngineConfig,
        context: EngineContext,
        storage: ObjectStorageRef,
    ) -> Result<Self, QueueError> {
        let settings = QueueSettings::from_changes(&config.settings)?;
        settings.validate(config.is_attach)?;
        check_format_name(&config.format)?;
        let format = format_for_name(&config.format)?;

        let storage_type = match config.engine_name.as_str() {
            "S3Queue" => StorageType::S3,
            "AzureQueue" => StorageType::Azure,
            other => {
                return Err(QueueError::LogicalError {
                    message: format!("Unexpected object storage type: {other}"),
                })
            }
        };

        let path_pattern = normalize_path(&config.path)?;
        let zk_path = choose_keeper_path(&config, &context, &settings);
        info!(table = %config.table_id, path = %zk_path, "Using keeper path");

        let table_metadata = QueueMetadata::sync_with_keeper(
            &context.keeper,
            &zk_path,
            &settings,
            &config.format,
            &config.columns,
            config.is_attach,
        )
        .await?;

        let table_label = config.table_id.to_string();
        let temp_metadata = Arc::new(QueueMetadata::new(
            context.keeper.clone(),
            &zk_path,
            table_metadata,
            &table_label,
            settings.cleanup_interval_min_ms,
            settings.cleanup_interval_max_ms,
            context.multiread_batch_size,
        ));

        let queue_log = match storage_type {
            StorageType::S3 => {
                if settings.enable_logging_to_queue_log != 0 || context.enable_s3queue_log {
                    context.queue_log.clone()
                } else {
                    None
                }
            }
            StorageType::Azure => {
                if settings.enable_logging_to_queue_log != 0 {
                    context.queue_log.clone()
                } else {
                    None
                }
            }
        };

        let local = LocalSettings {
            polling_min_timeout_ms: settings.polling_min_timeout_ms,
            polling_max_timeout_ms: settings.polling_max_timeout_ms,
            polling_backoff_ms: settings.polling_backoff_ms,
            list_objects_batch_size: settings.list_objects_batch_size,
            enable_hash_ring_filtering: settings.enable_hash_ring_filtering,
            commit: settings.commit,
            reschedule_unregister_threshold_ms: settings.reschedule_unregister_threshold_ms,
            reschedule_interval_ms: settings.polling_min_timeout_ms,
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                table_id: config.table_id,
                table_label,
                storage_type,
                zk_path,
                path_pattern,
                format,
                storage,
                keeper: context.keeper,
                views: context.views,
                queue_log,
                fail_points: context.fail_points,
                replica: context.replica,
                keeper_path_setting: settings.keeper_path.clone(),
                enable_logging_to_queue_log: settings.enable_logging_to_queue_log,
                cleanup_interval_min_ms: settings.cleanup_interval_min_ms,
                cleanup_interval_max_ms: settings.cleanup_interval_max_ms,
                local: StdMutex::new(local),
                temp_metadata: StdMutex::new(Some(temp_metadata)),
                files_metadata: StdMutex::new(None),
                mv_attached: AtomicBool::new(false),
                shutdown_called: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                task: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Register the metadata in the global factory and start the background
    /// streaming task.
    pub async fn startup(&self) -> Result<(), QueueError> {
        let temp = self
            .inner
            .temp_metadata
            .lock()
            .expect("temp metadata lock")
            .take()
            .ok_or_else(|| QueueError::LogicalError {
                message: "Engine started twice".to_string(),
            })?;

        let shared = MetadataFactory::instance().get_or_create(
            &self.inner.zk_path,
            temp,
            &self.inner.storage_id(),
        );
        *self.inner.files_metadata.lock().expect("files metadata lock") = Some(shared);

        let handle = tokio::spawn(run_streaming_loop(
            Arc::downgrade(&self.inner),
            self.inner.shutdown.clone(),
        ));
        *self.inner.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the background task (waiting for the current tick), unregister
    /// the replica, and release the factory registration. With `is_drop`
    /// the last registration also removes the coordinator subtree.
    pub async fn shutdown(&self, is_drop: bool) -> Result<(), QueueError> {
        if self.inner.shutdown_called.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!(table = %self.inner.table_label, "Shutting down storage");

        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(table = %self.inner.table_label, error = %e, "Streaming task join failed");
            }
        }

        let metadata = self
            .inner
            .files_metadata
            .lock()
            .expect("files metadata lock")
            .take();
        if let Some(metadata) = metadata {
            if let Err(e) = metadata.unregister(&self.inner.replica).await {
                warn!(table = %self.inner.table_label, error = %e, "Unregister failed");
            }
            MetadataFactory::instance()
                .remove(&self.inner.zk_path, &self.inner.storage_id(), is_drop)
                .await?;
        }
        trace!(table = %self.inner.table_label, "Shut down storage");
        Ok(())
    }

    /// DROP TABLE: shutdown plus coordinator subtree removal when this was
    /// the last registration.
    pub async fn drop_table(&self) -> Result<(), QueueError> {
        self.shutdown(true).await
    }

    /// Drive one streaming cycle synchronously instead of waiting for the
    /// background task. Used by embedded schedulers and tests; semantics
    /// match one productive tick (dependency check, replica registration,
    /// streaming loop). Returns whether any row was processed.
    pub async fn stream_once(&self) -> Result<bool, QueueError> {
        let dependencies = self.inner.views.ready_view_count(&self.inner.table_id);
        if dependencies == 0 {
            return Ok(false);
        }
        let metadata = self.inner.metadata()?;
        self.inner.mv_attached.store(true, Ordering::SeqCst);
        metadata.register(&self.inner.replica).await?;
        let result = self.inner.stream_to_views(&metadata).await;
        self.inner.mv_attached.store(false, Ordering::SeqCst);
        result
    }

    /// Direct SELECT. Refused unless the session allows it, and refused
    /// while a materialized view is attached to prevent double-consumption.
    pub async fn read(
        &self,
        allow_direct_select: bool,
        predicate: Option<FilePredicate>,
    ) -> Result<Vec<Block>, QueueError> {
        if !allow_direct_select {
            return Err(QueueError::QueryNotAllowed {
                message: "Direct select is not allowed. \
                          To enable use setting `stream_like_engine_allow_direct_select`"
                    .to_string(),
            });
        }
        if self.inner.mv_attached.load(Ordering::SeqCst) {
            return Err(QueueError::QueryNotAllowed {
                message: format!(
                    "Cannot read from {} with attached materialized views",
                    self.inner.table_label
                ),
            });
        }
        self.inner.read_once(predicate).await
    }

    /// Validate an ALTER without applying it.
    pub fn check_alter(&self, commands: &[AlterCommand]) -> Result<(), QueueError> {
        self.inner.validate_alter(commands).map(|_| ())
    }

    /// Apply MODIFY/RESET SETTING commands.
    pub async fn alter(&self, commands: &[AlterCommand]) -> Result<(), QueueError> {
        let changed = self.inner.validate_alter(commands)?;
        if changed.is_empty() {
            return Ok(());
        }

        let persisted: Vec<SettingChange> = changed
            .iter()
            .filter(|change| is_persisted_setting(&change.name))
            .cloned()
            .collect();
        if !persisted.is_empty() {
            self.inner.metadata()?.alter_settings(&persisted).await?;
        }

        self.inner.apply_local_settings(&changed)?;
        info!(
            table = %self.inner.table_label,
            settings = changed.len(),
            "Applied setting changes"
        );
        Ok(())
    }

    /// Reconstruct the full settings view from the coordinator metadata and
    /// the engine-local fields.
    pub fn settings(&self) -> Result<Vec<SettingChange>, QueueError> {
        self.inner.reconstruct_settings()
    }

    pub fn zk_path(&self) -> &str {
        &self.inner.zk_path
    }

    pub fn table_id(&self) -> &TableId {
        &self.inner.table_id
    }

    pub fn storage_type(&self) -> StorageType {
        self.inner.storage_type
    }

    /// Whether a materialized view is currently being streamed to.
    pub fn mv_attached(&self) -> bool {
        self.inner.mv_attached.load(Ordering::SeqCst)
    }
}

impl EngineInner {
    fn storage_id(&self) -> String {
        format!("{}#{}", self.table_label, self.table_id.uuid)
    }

    fn metadata(&self) -> Result<Arc<QueueMetadata>, QueueError> {
        if let Some(metadata) = self.files_metadata.lock().expect("files metadata lock").as_ref() {
            return Ok(Arc::clone(metadata));
        }
        if let Some(metadata) = self.temp_metadata.lock().expect("temp metadata lock").as_ref() {
            return Ok(Arc::clone(metadata));
        }
        Err(QueueError::LogicalError {
            message: format!("Table {} is shut down", self.table_label),
        })
    }

    /// One scheduler tick. Returns the delay before the next tick.
    pub(crate) async fn tick(&self) -> u64 {
        if !self.shutdown_called.load(Ordering::SeqCst) {
            let dependencies = self.views.ready_view_count(&self.table_id);
            if dependencies > 0 {
                self.mv_attached.store(true, Ordering::SeqCst);
                debug!(
                    table = %self.table_label,
                    views = dependencies,
                    "Started streaming to attached views"
                );

                match self.metadata() {
                    Ok(metadata) => {
                        if let Err(e) = metadata.register(&self.replica).await {
                            warn!(table = %self.table_label, error = %e, "Replica registration failed");
                        }
                        match self.stream_to_views(&metadata).await {
                            Ok(true) => {
                                let mut local = self.local.lock().expect("local settings lock");
                                local.reschedule_interval_ms = local.polling_min_timeout_ms;
                            }
                            Ok(false) => {
                                let mut local = self.local.lock().expect("local settings lock");
                                local.reschedule_interval_ms = (local.reschedule_interval_ms
                                    + local.polling_backoff_ms)
                                    .min(local.polling_max_timeout_ms);
                            }
                            Err(e) => {
                                error!(table = %self.table_label, error = %e, "Failed to process data");
                            }
                        }
                    }
                    Err(e) => error!(table = %self.table_label, error = %e, "No metadata for tick"),
                }

                self.mv_attached.store(false, Ordering::SeqCst);
                debug!(table = %self.table_label, "Stopped streaming to attached views");
            } else {
                trace!(table = %self.table_label, "No attached dependencies");
            }
        }

        let (delay_ms, threshold_ms) = {
            let local = self.local.lock().expect("local settings lock");
            (
                local.reschedule_interval_ms,
                local.reschedule_unregister_threshold_ms,
            )
        };

        // An idle replica steps out of the ring so live ones rebalance; it
        // re-registers on the next productive tick.
        if delay_ms > threshold_ms {
            if let Ok(metadata) = self.metadata() {
                if let Err(e) = metadata.unregister(&self.replica).await {
                    warn!(table = %self.table_label, error = %e, "Idle unregister failed");
                }
            }
        }

        trace!(table = %self.table_label, delay_ms, "Reschedule processing");
        delay_ms
    }

    /// The streaming loop: one insert pipeline per iteration, N workers
    /// pulling from a shared iterator, ending in an atomic commit.
    async fn stream_to_views(&self, metadata: &Arc<QueueMetadata>) -> Result<bool, QueueError> {
        let (list_batch, hash_ring) = {
            let local = self.local.lock().expect("local settings lock");
            (local.list_objects_batch_size, local.enable_hash_ring_filtering)
        };

        let iterator = Arc::new(FileIterator::new(
            Arc::clone(metadata),
            Arc::clone(&self.storage),
            &self.replica,
            &self.path_pattern,
            list_batch,
            None,
            hash_ring,
            self.shutdown.clone(),
        )?);

        let threads = metadata.processing_threads_num().max(1) as usize;
        let mut total_rows: u64 = 0;

        while !self.shutdown.is_cancelled() && !iterator.is_finished() {
            let insert = self
                .views
                .create_insert(&self.table_id)
                .context(InsertSnafu)?;
            let progress = ProcessingProgress::new();
            let commit_settings = {
                let local = self.local.lock().expect("local settings lock");
                local.commit
            };

            let workers: Vec<Arc<SourceWorker>> = (0..threads)
                .map(|processor_id| {
                    Arc::new(SourceWorker::new(
                        processor_id,
                        &self.table_label,
                        &self.replica,
                        Arc::clone(&iterator),
                        Arc::clone(&self.storage),
                        Arc::clone(&self.format),
                        Arc::clone(metadata),
                        commit_settings,
                        Arc::clone(&progress),
                        self.shutdown.clone(),
                        false,
                        self.queue_log.clone(),
                    ))
                })
                .collect();

            emit!(InsertIterations {
                table: self.table_label.clone(),
            });

            let result = run_workers(&workers, insert).await;
            let rows = progress.rows.load(Ordering::Relaxed);

            if let Err(e) = result {
                let message = e.to_string();
                let commit_result = self
                    .commit_cycle(metadata, &workers, false, rows, &message)
                    .await;
                iterator.release_finished_buckets().await;
                commit_result?;
                return Err(e);
            }

            let commit_result = self.commit_cycle(metadata, &workers, true, rows, "").await;
            iterator.release_finished_buckets().await;
            commit_result?;
            total_rows += rows;
        }

        trace!(table = %self.table_label, total_rows, "Streaming loop finished");
        Ok(total_rows > 0)
    }

    async fn commit_cycle(
        &self,
        metadata: &Arc<QueueMetadata>,
        workers: &[Arc<SourceWorker>],
        insert_succeeded: bool,
        inserted_rows: u64,
        exception_message: &str,
    ) -> Result<(), QueueError> {
        commit(
            metadata,
            &self.storage,
            &self.keeper,
            &self.fail_points,
            &self.table_label,
            workers,
            insert_succeeded,
            inserted_rows,
            exception_message,
        )
        .await
    }

    /// One direct-read cycle with `commit_once_processed` semantics.
    async fn read_once(&self, predicate: Option<FilePredicate>) -> Result<Vec<Block>, QueueError> {
        let metadata = self.metadata()?;
        let (list_batch, hash_ring) = {
            let local = self.local.lock().expect("local settings lock");
            (local.list_objects_batch_size, local.enable_hash_ring_filtering)
        };
        let iterator = Arc::new(FileIterator::new(
            Arc::clone(&metadata),
            Arc::clone(&self.storage),
            &self.replica,
            &self.path_pattern,
            list_batch,
            predicate,
            hash_ring,
            self.shutdown.clone(),
        )?);

        let threads = metadata.processing_threads_num().max(1) as usize;
        let progress = ProcessingProgress::new();
        let commit_settings = {
            let local = self.local.lock().expect("local settings lock");
            local.commit
        };
        let sink = Arc::new(crate::views::BufferingInsert::new());

        let workers: Vec<Arc<SourceWorker>> = (0..threads)
            .map(|processor_id| {
                Arc::new(SourceWorker::new(
                    processor_id,
                    &self.table_label,
                    &self.replica,
                    Arc::clone(&iterator),
                    Arc::clone(&self.storage),
                    Arc::clone(&self.format),
                    Arc::clone(&metadata),
                    commit_settings,
                    Arc::clone(&progress),
                    self.shutdown.clone(),
                    true,
                    self.queue_log.clone(),
                ))
            })
            .collect();

        let result = run_workers(&workers, sink.clone() as Arc<dyn InsertPipeline>).await;
        let rows = progress.rows.load(Ordering::Relaxed);

        if let Err(e) = result {
            let message = e.to_string();
            let commit_result = self
                .commit_cycle(&metadata, &workers, false, rows, &message)
                .await;
            iterator.release_finished_buckets().await;
            commit_result?;
            return Err(e);
        }

        self.commit_cycle(&metadata, &workers, true, rows, "").await?;
        iterator.release_finished_buckets().await;
        Ok(sink.blocks())
    }

    /// Normalize, dedupe, and mutability-check alter commands; returns the
    /// actually-changed settings.
    fn validate_alter(&self, commands: &[AlterCommand]) -> Result<Vec<SettingChange>, QueueError> {
        let mut normalized: Vec<SettingChange> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for command in commands {
            let change = match command {
                AlterCommand::ModifySetting(change) => SettingChange::new(
                    normalize_setting(&change.name).to_string(),
                    change.value.clone(),
                ),
                AlterCommand::ResetSetting(name) => {
                    let name = normalize_setting(name).to_string();
                    let value = QueueSettings::default_value(&name)?;
                    SettingChange::new(name, value)
                }
                AlterCommand::Other(what) => {
                    return Err(QueueError::SupportDisabled {
                        message: format!(
                            "Only MODIFY/RESET SETTING alter is allowed (got {what})"
                        ),
                    })
                }
            };
            if !seen.insert(change.name.clone()) {
                return Err(QueueError::BadArguments {
                    message: format!("Setting {} is duplicated", change.name),
                });
            }
            normalized.push(change);
        }

        let current: std::collections::HashMap<String, String> = self
            .reconstruct_settings()?
            .into_iter()
            .map(|change| (change.name, change.value))
            .collect();
        let mode = self.metadata()?.mode();

        let mut changed = Vec::new();
        for change in normalized {
            // Unknown names fail here, before any mutability check.
            QueueSettings::default_value(&change.name)?;

            let setting_changed = current.get(&change.name) != Some(&change.value);
            if !setting_changed {
                continue;
            }

            if !QueueSettings::is_changeable(&change.name, mode) {
                return Err(QueueError::SupportDisabled {
                    message: format!(
                        "Changing setting {} is not allowed for {} mode of {}",
                        change.name,
                        mode.as_str(),
                        self.table_label
                    ),
                });
            }

            if QueueSettings::requires_detached_views(&change.name) {
                let dependencies = self.views.ready_view_count(&self.table_id);
                if dependencies > 0 {
                    return Err(QueueError::SupportDisabled {
                        message: format!(
                            "Changing setting {} is allowed only with detached dependencies \
                             (dependencies count: {dependencies})",
                            change.name
                        ),
                    });
                }
            }

            changed.push(change);
        }
        Ok(changed)
    }

    /// Apply engine-local settings under the mutex.
    fn apply_local_settings(&self, changed: &[SettingChange]) -> Result<(), QueueError> {
        let mut local = self.local.lock().expect("local settings lock");
        for change in changed {
            let parse_u64 = || -> Result<u64, QueueError> {
                change.value.parse().map_err(|_| QueueError::BadArguments {
                    message: format!("Invalid value for setting {}: {}", change.name, change.value),
                })
            };
            match change.name.as_str() {
                "polling_min_timeout_ms" => local.polling_min_timeout_ms = parse_u64()?,
                "polling_max_timeout_ms" => local.polling_max_timeout_ms = parse_u64()?,
                "polling_backoff_ms" => local.polling_backoff_ms = parse_u64()?,
                "max_processed_files_before_commit" => {
                    local.commit.max_processed_files_before_commit = parse_u64()?
                }
                "max_processed_rows_before_commit" => {
                    local.commit.max_processed_rows_before_commit = parse_u64()?
                }
                "max_processed_bytes_before_commit" => {
                    local.commit.max_processed_bytes_before_commit = parse_u64()?
                }
                "max_processing_time_sec_before_commit" => {
                    local.commit.max_processing_time_sec_before_commit = parse_u64()?
                }
                "list_objects_batch_size" => local.list_objects_batch_size = parse_u64()?,
                "reschedule_unregister_threshold_ms" => {
                    local.reschedule_unregister_threshold_ms = parse_u64()?
                }
                "enable_hash_ring_filtering" => {
                    local.enable_hash_ring_filtering =
                        matches!(change.value.as_str(), "1" | "true" | "True")
                }
                // Persisted settings were applied through the metadata.
                _ => {}
            }
        }
        Ok(())
    }

    /// Rebuild the full settings list. Queue settings are not stored
    /// verbatim anywhere; they are reconstructed from the coordinator
    /// metadata plus the engine-local fields.
    fn reconstruct_settings(&self) -> Result<Vec<SettingChange>, QueueError> {
        let table = self.metadata()?.table();
        let mut out = vec![
            SettingChange::new("mode", table.mode.as_str()),
            SettingChange::new("after_processing", table.after_processing.as_str()),
            SettingChange::new(
                "keeper_path",
                self.keeper_path_setting.clone().unwrap_or_default(),
            ),
            SettingChange::new("loading_retries", table.loading_retries.to_string()),
            SettingChange::new(
                "processing_threads_num",
                table.processing_threads_num.to_string(),
            ),
            SettingChange::new(
                "enable_logging_to_queue_log",
                self.enable_logging_to_queue_log.to_string(),
            ),
            SettingChange::new("last_processed_path", table.last_processed_path.clone()),
            SettingChange::new("tracked_file_ttl_sec", table.tracked_file_ttl_sec.to_string()),
            SettingChange::new("tracked_files_limit", table.tracked_files_limit.to_string()),
            SettingChange::new(
                "cleanup_interval_min_ms",
                self.cleanup_interval_min_ms.to_string(),
            ),
            SettingChange::new(
                "cleanup_interval_max_ms",
                self.cleanup_interval_max_ms.to_string(),
            ),
            SettingChange::new("buckets", table.buckets.to_string()),
        ];

        let local = self.local.lock().expect("local settings lock");
        out.extend([
            SettingChange::new("polling_min_timeout_ms", local.polling_min_timeout_ms.to_string()),
            SettingChange::new("polling_max_timeout_ms", local.polling_max_timeout_ms.to_string()),
            SettingChange::new("polling_backoff_ms", local.polling_backoff_ms.to_string()),
            SettingChange::new(
                "max_processed_files_before_commit",
                local.commit.max_processed_files_before_commit.to_string(),
            ),
            SettingChange::new(
                "max_processed_rows_before_commit",
                local.commit.max_processed_rows_before_commit.to_string(),
            ),
            SettingChange::new(
                "max_processed_bytes_before_commit",
                local.commit.max_processed_bytes_before_commit.to_string(),
            ),
            SettingChange::new(
                "max_processing_time_sec_before_commit",
                local.commit.max_processing_time_sec_before_commit.to_string(),
            ),
            SettingChange::new(
                "enable_hash_ring_filtering",
                local.enable_hash_ring_filtering.to_string(),
            ),
            SettingChange::new(
                "list_objects_batch_size",
                local.list_objects_batch_size.to_string(),
            ),
            SettingChange::new(
                "reschedule_unregister_threshold_ms",
                local.reschedule_unregister_threshold_ms.to_string(),
            ),
        ]);
        Ok(out)
    }
}

/// Run one iteration's workers concurrently against a shared insert
/// pipeline; returns the first error.
async fn run_workers(
    workers: &[Arc<SourceWorker>],
    insert: Arc<dyn InsertPipeline>,
) -> Result<(), QueueError> {
    let mut join_set: JoinSet<Result<(), QueueError>> = JoinSet::new();
    for worker in workers {
        let worker = Arc::clone(worker);
        let insert = Arc::clone(&insert);
        join_set.spawn(async move { worker.run(insert.as_ref()).await });
    }

    let mut first_error: Option<QueueError> = None;
    while let Some(joined) = join_set.join_next().await {
        let result = joined.context(TaskJoinSnafu).and_then(|r| r);
        if let Err(e) = result {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Path must end with `/` (normalized to a glob) or already contain globs.
fn normalize_path(path: &str) -> Result<String, QueueError> {
    if path.is_empty() {
        return Ok("*".to_string());
    }
    if path.ends_with('/') {
        return Ok(format!("{path}*"));
    }
    if path.contains(|c| GLOB_CHARS.contains(&c)) {
        return Ok(path.to_string());
    }
    Err(QueueError::BadQueryParameter {
        message: "Queue url must either end with '/' or contain globs".to_string(),
    })
}

/// `<prefix>/<keeper_path>` verbatim when set (no uuid on purpose),
/// `<prefix>/<database_uuid>/<table_uuid>` otherwise.
fn choose_keeper_path(
    config: &EngineConfig,
    context: &EngineContext,
    settings: &QueueSettings,
) -> String {
    match &settings.keeper_path {
        Some(keeper_path) => join_path(&context.keeper_prefix, keeper_path),
        None => join_path(
            &context.keeper_prefix,
            &format!("{}/{}", context.database_uuid, config.table_id.uuid),
        ),
    }
}

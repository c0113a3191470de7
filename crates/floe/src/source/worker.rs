//! Source worker: turns claimed files into row blocks until a commit
//! threshold trips, then prepares the coordinator ops for the commit cycle.
//!
//! Per-file read/parse errors are recovered locally: the file is marked
//! Failed in the worker's outcome and its retry counter is carried into the
//! commit requests. Only a failing downstream insert aborts the cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use floe_common::emit;
use floe_common::keeper::TxnOp;
use floe_common::metrics::events::{FileProcessed, FileStatus};
use floe_common::{ObjectInfo, ObjectStorageRef};

use crate::error::{InsertSnafu, QueueError};
use crate::metadata::{FileRecord, QueueMetadata};
use crate::queue_log::{LogStatus, QueueLogRecord, QueueLogSink};
use crate::settings::{CommitSettings, QueueMode};
use crate::source::format::FormatParser;
use crate::source::iterator::{ClaimedFile, FileIterator};
use crate::source::{Block, Row};
use snafu::ResultExt;

/// Rows per block handed to the insert pipeline.
const BLOCK_ROWS: usize = 8192;

/// Progress shared by every worker of one commit cycle; the commit
/// thresholds are checked against these totals.
#[derive(Debug, Default)]
pub struct ProcessingProgress {
    pub files: AtomicU64,
    pub rows: AtomicU64,
    pub bytes: AtomicU64,
}

impl ProcessingProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

struct ProcessedEntry {
    object: ObjectInfo,
    rows: u64,
    retries: u64,
    bucket: Option<u64>,
}

struct FailedEntry {
    object: ObjectInfo,
    retries: u64,
    exception: String,
}

#[derive(Default)]
struct WorkerOutcome {
    processed: Vec<ProcessedEntry>,
    failed: Vec<FailedEntry>,
}

/// One processing unit of a commit cycle.
pub struct SourceWorker {
    processor_id: usize,
    table_label: String,
    replica: String,
    iterator: Arc<FileIterator>,
    storage: ObjectStorageRef,
    format: Arc<dyn FormatParser>,
    metadata: Arc<QueueMetadata>,
    commit_settings: CommitSettings,
    progress: Arc<ProcessingProgress>,
    started: Instant,
    shutdown: CancellationToken,
    commit_once_processed: bool,
    queue_log: Option<Arc<dyn QueueLogSink>>,
    outcome: StdMutex<WorkerOutcome>,
}

impl SourceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        processor_id: usize,
        table_label: &str,
        replica: &str,
        iterator: Arc<FileIterator>,
        storage: ObjectStorageRef,
        format: Arc<dyn FormatParser>,
        metadata: Arc<QueueMetadata>,
        commit_settings: CommitSettings,
        progress: Arc<ProcessingProgress>,
        shutdown: CancellationToken,
        commit_once_processed: bool,
        queue_log: Option<Arc<dyn QueueLogSink>>,
    ) -> Self {
        Self {
            processor_id,
            table_label: table_label.to_string(),
            replica: replica.to_string(),
            iterator,
            storage,
            format,
            metadata,
            commit_settings,
            progress,
            started: Instant::now(),
            shutdown,
            commit_once_processed,
            queue_log,
            outcome: StdMutex::new(WorkerOutcome::default()),
        }
    }

    /// Pull files from the shared iterator and feed the insert pipeline
    /// until a threshold trips, the iterator is exhausted, or shutdown is
    /// observed. An in-progress file is always finished to its last row.
    pub async fn run(&self, sink: &dyn crate::views::InsertPipeline) -> Result<(), QueueError> {
        loop {
            if self.shutdown.is_cancelled() {
                debug!(worker = self.processor_id, "Shutdown observed, stopping pull");
                return Ok(());
            }
            if self.thresholds_reached() {
                debug!(worker = self.processor_id, "Commit threshold reached");
                return Ok(());
            }
            let Some(claimed) = self.iterator.next().await? else {
                return Ok(());
            };
            self.process_file(claimed, sink).await?;
        }
    }

    fn thresholds_reached(&self) -> bool {
        let limits = &self.commit_settings;
        if limits.max_processed_files_before_commit > 0
            && self.progress.files.load(Ordering::Relaxed) >= limits.max_processed_files_before_commit
        {
            return true;
        }
        if limits.max_processed_rows_before_commit > 0
            && self.progress.rows.load(Ordering::Relaxed) >= limits.max_processed_rows_before_commit
        {
            return true;
        }
        if limits.max_processed_bytes_before_commit > 0
            && self.progress.bytes.load(Ordering::Relaxed) >= limits.max_processed_bytes_before_commit
        {
            return true;
        }
        if limits.max_processing_time_sec_before_commit > 0
            && self.started.elapsed().as_secs() >= limits.max_processing_time_sec_before_commit
        {
            return true;
        }
        false
    }

    async fn process_file(
        &self,
        claimed: ClaimedFile,
        sink: &dyn crate::views::InsertPipeline,
    ) -> Result<(), QueueError> {
        let object = claimed.object.clone();

        let rows = match self.read_and_parse(&object).await {
            Ok(rows) => rows,
            Err(message) => {
                warn!(
                    worker = self.processor_id,
                    path = %object.path,
                    error = %message,
                    "File failed, will retry or fail terminally"
                );
                let sole_unit = {
                    let mut outcome = self.outcome.lock().expect("worker outcome lock");
                    outcome.failed.push(FailedEntry {
                        object,
                        retries: claimed.retries,
                        exception: message.clone(),
                    });
                    outcome.processed.is_empty() && outcome.failed.len() == 1
                };
                if self.commit_once_processed && sole_unit {
                    return Err(QueueError::UnknownException { message });
                }
                return Ok(());
            }
        };

        let row_count = rows.len() as u64;

        // Record the file before the insert: if the pipeline fails, the
        // commit with insert_succeeded=false must still release the claim
        // and bump the retry counter.
        {
            let mut outcome = self.outcome.lock().expect("worker outcome lock");
            outcome.processed.push(ProcessedEntry {
                object: object.clone(),
                rows: row_count,
                retries: claimed.retries,
                bucket: claimed.bucket,
            });
        }

        for chunk in rows.chunks(BLOCK_ROWS) {
            let block = Block {
                rows: chunk
                    .iter()
                    .map(|columns| Row {
                        columns: columns.clone(),
                        key: object.path.clone(),
                        path: format!(
                            "{}/{}",
                            self.storage.url().trim_end_matches('/'),
                            object.path
                        ),
                        size: object.size,
                        last_modified_ms: object.last_modified_ms,
                    })
                    .collect(),
            };
            sink.insert(block).context(InsertSnafu)?;
        }

        self.progress.files.fetch_add(1, Ordering::Relaxed);
        self.progress.rows.fetch_add(row_count, Ordering::Relaxed);
        self.progress.bytes.fetch_add(object.size, Ordering::Relaxed);

        debug!(
            worker = self.processor_id,
            path = %object.path,
            rows = row_count,
            "Processed file"
        );
        Ok(())
    }

    /// Read and decode one object. Errors come back as a message so the
    /// caller can record them without losing the claim bookkeeping.
    async fn read_and_parse(
        &self,
        object: &ObjectInfo,
    ) -> Result<Vec<crate::source::ParsedRow>, String> {
        let bytes = self
            .storage
            .get(&object.path)
            .await
            .map_err(|e| e.to_string())?;
        self.format
            .parse(&object.path, &bytes)
            .map_err(|e| e.to_string())
    }

    /// Append this worker's coordinator ops for the commit transaction.
    ///
    /// Successful files move Processing -> Processed (Unordered) or bump the
    /// bucket watermark (Ordered); failed files are restored with an
    /// incremented retry counter or moved to terminal Failed. With
    /// `insert_succeeded = false` nothing is marked Processed.
    pub fn prepare_commit_requests(
        &self,
        requests: &mut Vec<TxnOp>,
        insert_succeeded: bool,
        successful_objects: &mut Vec<String>,
        exception_message: &str,
    ) {
        let outcome = self.outcome.lock().expect("worker outcome lock");
        let mode = self.metadata.mode();
        let loading_retries = self.metadata.loading_retries();

        if insert_succeeded {
            let mut bucket_watermarks: HashMap<u64, String> = HashMap::new();
            for entry in &outcome.processed {
                requests.push(TxnOp::delete(self.metadata.processing_path(&entry.object.path)));
                match mode {
                    QueueMode::Unordered => {
                        let record = FileRecord::processed(&self.replica, entry.retries);
                        requests.push(TxnOp::create(
                            self.metadata.processed_path(&entry.object.path),
                            record.to_bytes(),
                        ));
                        if entry.retries > 0 {
                            requests.push(TxnOp::delete(
                                self.metadata.retriable_failed_path(&entry.object.path),
                            ));
                        }
                    }
                    QueueMode::Ordered => {
                        let bucket = entry.bucket.unwrap_or(0);
                        let watermark = bucket_watermarks.entry(bucket).or_default();
                        if entry.object.path.as_str() > watermark.as_str() {
                            *watermark = entry.object.path.clone();
                        }
                        if entry.retries > 0 {
                            requests.push(TxnOp::delete(
                                self.metadata.retriable_failed_path(&entry.object.path),
                            ));
                        }
                    }
                }
                successful_objects.push(entry.object.path.clone());
            }
            for (bucket, watermark) in bucket_watermarks {
                requests.push(TxnOp::set(
                    self.metadata.bucket_watermark_path(bucket),
                    watermark.into_bytes(),
                ));
            }
        } else {
            for entry in &outcome.processed {
                self.push_retry_or_fail(
                    requests,
                    &entry.object.path,
                    entry.retries,
                    exception_message,
                    loading_retries,
                );
            }
        }

        for entry in &outcome.failed {
            self.push_retry_or_fail(
                requests,
                &entry.object.path,
                entry.retries,
                &entry.exception,
                loading_retries,
            );
        }
    }

    /// Release the claim and either schedule a retry or fail terminally.
    fn push_retry_or_fail(
        &self,
        requests: &mut Vec<TxnOp>,
        path: &str,
        prior_retries: u64,
        exception: &str,
        loading_retries: u64,
    ) {
        requests.push(TxnOp::delete(self.metadata.processing_path(path)));

        let next = prior_retries + 1;
        if next <= loading_retries {
            let record = FileRecord::failed(&self.replica, next, exception);
            let retriable = self.metadata.retriable_failed_path(path);
            if prior_retries > 0 {
                requests.push(TxnOp::set(retriable, record.to_bytes()));
            } else {
                requests.push(TxnOp::create(retriable, record.to_bytes()));
            }
        } else {
            let record = FileRecord::failed(&self.replica, prior_retries, exception);
            requests.push(TxnOp::create(self.metadata.failed_path(path), record.to_bytes()));
            if prior_retries > 0 {
                requests.push(TxnOp::delete(self.metadata.retriable_failed_path(path)));
            }
        }
    }

    /// Publish metrics and queue-log records after a successful commit
    /// transaction, then release per-file bookkeeping.
    pub fn finalize_commit(&self, insert_succeeded: bool, exception_message: &str) {
        let mut outcome = self.outcome.lock().expect("worker outcome lock");

        for entry in outcome.processed.drain(..) {
            let status = if insert_succeeded {
                FileStatus::Processed
            } else {
                FileStatus::Failed
            };
            emit!(FileProcessed {
                status,
                table: self.table_label.clone(),
            });
            if let Some(log) = &self.queue_log {
                let (log_status, exception) = if insert_succeeded {
                    (LogStatus::Processed, None)
                } else {
                    (LogStatus::Failed, Some(exception_message.to_string()))
                };
                log.add(QueueLogRecord::new(
                    &self.table_label,
                    &entry.object.path,
                    entry.rows,
                    log_status,
                    exception,
                    entry.retries,
                ));
            }
        }

        for entry in outcome.failed.drain(..) {
            emit!(FileProcessed {
                status: FileStatus::Failed,
                table: self.table_label.clone(),
            });
            if let Some(log) = &self.queue_log {
                log.add(QueueLogRecord::new(
                    &self.table_label,
                    &entry.object.path,
                    0,
                    LogStatus::Failed,
                    Some(entry.exception),
                    entry.retries,
                ));
            }
        }
    }

    /// Whether this worker produced anything to commit.
    pub fn has_outcome(&self) -> bool {
        let outcome = self.outcome.lock().expect("worker outcome lock");
        !outcome.processed.is_empty() || !outcome.failed.is_empty()
    }
}

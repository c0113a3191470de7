//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the queue engine.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric. All queue events carry a `table` label so multi-table
//! deployments can be observed per table.

use metrics::{counter, gauge};
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when commit requests are gathered from workers.
pub struct CommitRequests {
    pub count: u64,
    /// Table label for multi-table deployments.
    pub table: String,
}

impl InternalEvent for CommitRequests {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Commit requests");
        counter!("floe_commit_requests_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when a coordinator commit transaction succeeds.
pub struct SuccessfulCommits {
    pub table: String,
}

impl InternalEvent for SuccessfulCommits {
    fn emit(self) {
        trace!(table = %self.table, "Successful commit");
        counter!("floe_successful_commits_total", "table" => self.table).increment(1);
    }
}

/// Event emitted when a coordinator commit transaction fails.
pub struct UnsuccessfulCommits {
    pub table: String,
}

impl InternalEvent for UnsuccessfulCommits {
    fn emit(self) {
        trace!(table = %self.table, "Unsuccessful commit");
        counter!("floe_unsuccessful_commits_total", "table" => self.table).increment(1);
    }
}

/// Event emitted when objects are removed by the after-processing action.
pub struct RemovedObjects {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for RemovedObjects {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Removed objects");
        counter!("floe_removed_objects_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted once per streaming insert iteration.
pub struct InsertIterations {
    pub table: String,
}

impl InternalEvent for InsertIterations {
    fn emit(self) {
        trace!(table = %self.table, "Insert iteration");
        counter!("floe_insert_iterations_total", "table" => self.table).increment(1);
    }
}

/// Event emitted when rows are committed through the streaming loop.
pub struct ProcessedRows {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for ProcessedRows {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Processed rows");
        counter!("floe_processed_rows_total", "table" => self.table).increment(self.count);
    }
}

/// Status of a processed file.
#[derive(Debug, Clone, Copy)]
pub enum FileStatus {
    Processed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Processed => "processed",
            FileStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a file finishes a commit cycle.
pub struct FileProcessed {
    pub status: FileStatus,
    pub table: String,
}

impl InternalEvent for FileProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), table = %self.table, "File processed");
        counter!("floe_files_processed_total", "status" => self.status.as_str(), "table" => self.table)
            .increment(1);
    }
}

/// Event emitted after a cleanup pass evicts tracked-file records.
pub struct CleanupEvicted {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for CleanupEvicted {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Cleanup evicted records");
        counter!("floe_cleanup_evicted_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when the tracked-file count changes.
pub struct TrackedFiles {
    pub count: usize,
    pub table: String,
}

impl InternalEvent for TrackedFiles {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Tracked files");
        gauge!("floe_tracked_files", "table" => self.table).set(self.count as f64);
    }
}

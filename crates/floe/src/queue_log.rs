//! Per-file processing log.
//!
//! When enabled, the engine writes one record per processed file to an
//! external queue-log sink. The sink itself is a collaborator; the
//! in-memory implementation backs tests and embedded deployments.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

/// Outcome recorded for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Processed,
    Failed,
}

/// One queue-log record.
#[derive(Debug, Clone, Serialize)]
pub struct QueueLogRecord {
    pub table: String,
    pub file_path: String,
    pub rows_processed: u64,
    pub status: LogStatus,
    pub exception: Option<String>,
    pub retries: u64,
    pub timestamp_ms: i64,
}

impl QueueLogRecord {
    pub fn new(
        table: &str,
        file_path: &str,
        rows_processed: u64,
        status: LogStatus,
        exception: Option<String>,
        retries: u64,
    ) -> Self {
        Self {
            table: table.to_string(),
            file_path: file_path.to_string(),
            rows_processed,
            status,
            exception,
            retries,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Destination for queue-log records.
pub trait QueueLogSink: Send + Sync {
    fn add(&self, record: QueueLogRecord);
}

/// In-memory queue log.
#[derive(Default)]
pub struct MemoryQueueLog {
    records: Mutex<Vec<QueueLogRecord>>,
}

impl MemoryQueueLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<QueueLogRecord> {
        self.records.lock().expect("queue log lock").clone()
    }
}

impl QueueLogSink for MemoryQueueLog {
    fn add(&self, record: QueueLogRecord) {
        self.records.lock().expect("queue log lock").push(record);
    }
}

//! Reading side of the engine: format parsing, file claiming, and the
//! workers that turn claimed objects into row blocks.

pub mod format;
pub mod iterator;
pub mod worker;

pub use format::{check_format_name, format_for_name, FormatParser, ParsedRow};
pub use iterator::{ClaimedFile, FileIterator, FilePredicate};
pub use worker::{ProcessingProgress, SourceWorker};

use serde_json::Value;

/// Virtual column names exposed alongside user columns.
pub const VIRTUAL_COLUMNS: [&str; 4] = ["_path", "_key", "_size", "_time"];

/// One parsed row plus the object metadata backing the virtual columns.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: ParsedRow,
    /// Object key relative to the storage root.
    pub key: String,
    /// Full path including the storage URL.
    pub path: String,
    pub size: u64,
    pub last_modified_ms: i64,
}

impl Row {
    /// Resolve a virtual column for this row, or `None` for user columns.
    pub fn virtual_value(&self, name: &str) -> Option<Value> {
        match name {
            "_path" => Some(Value::from(self.path.clone())),
            "_key" => Some(Value::from(self.key.clone())),
            "_size" => Some(Value::from(self.size)),
            "_time" => Some(Value::from(self.last_modified_ms)),
            _ => None,
        }
    }
}

/// A batch of rows handed to the insert pipeline.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub rows: Vec<Row>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

//! Downstream-consumer boundaries: dependent-view discovery and the insert
//! pipeline executor.
//!
//! Both are external collaborators of the engine. The buffering
//! implementations below back the integration tests and embedded use; a
//! database integration supplies its own.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::InsertError;
use crate::source::Block;

/// Identity of a queue table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableId {
    pub database: String,
    pub table: String,
    pub uuid: Uuid,
}

impl TableId {
    pub fn new(database: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
            uuid: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// One insert into the dependent views. A fresh pipeline is built per
/// streaming iteration; workers feed it concurrently.
pub trait InsertPipeline: Send + Sync {
    fn insert(&self, block: Block) -> Result<(), InsertError>;
}

/// Discovery of downstream consumers.
pub trait ViewCatalog: Send + Sync {
    /// Number of dependent views that are materialized AND have a resolvable
    /// target table. Zero means the streaming task skips the tick entirely.
    fn ready_view_count(&self, table: &TableId) -> usize;

    /// Build the insert pipeline for one streaming iteration.
    fn create_insert(&self, table: &TableId) -> Result<Arc<dyn InsertPipeline>, InsertError>;
}

/// An insert pipeline that buffers blocks in memory.
///
/// Can be armed to fail a number of inserts, which the retry tests use to
/// model a flaky downstream sink.
#[derive(Default)]
pub struct BufferingInsert {
    blocks: Mutex<Vec<Block>>,
    fail_remaining: AtomicU32,
    calls: AtomicU32,
    fail_at_call: AtomicU32,
}

impl BufferingInsert {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Make the n-th insert call (1-based, counted from construction) fail.
    pub fn fail_at_call(&self, n: u32) {
        self.fail_at_call.store(n, Ordering::SeqCst);
    }

    /// All buffered blocks so far.
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().expect("insert buffer lock").clone()
    }

    /// Total buffered rows.
    pub fn row_count(&self) -> usize {
        self.blocks
            .lock()
            .expect("insert buffer lock")
            .iter()
            .map(Block::len)
            .sum()
    }
}

impl InsertPipeline for BufferingInsert {
    fn insert(&self, block: Block) -> Result<(), InsertError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at_call.load(Ordering::SeqCst) == call {
            return Err(InsertError::new("injected insert failure"));
        }
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(InsertError::new("injected insert failure"));
        }
        self.blocks.lock().expect("insert buffer lock").push(block);
        Ok(())
    }
}

/// A catalog with a settable view count and one shared buffering pipeline.
pub struct StaticViewCatalog {
    view_count: AtomicUsize,
    insert: Arc<BufferingInsert>,
}

impl StaticViewCatalog {
    pub fn new(view_count: usize) -> Self {
        Self {
            view_count: AtomicUsize::new(view_count),
            insert: Arc::new(BufferingInsert::new()),
        }
    }

    pub fn set_view_count(&self, count: usize) {
        self.view_count.store(count, Ordering::SeqCst);
    }

    pub fn insert_pipeline(&self) -> Arc<BufferingInsert> {
        Arc::clone(&self.insert)
    }
}

impl ViewCatalog for StaticViewCatalog {
    fn ready_view_count(&self, _table: &TableId) -> usize {
        self.view_count.load(Ordering::SeqCst)
    }

    fn create_insert(&self, _table: &TableId) -> Result<Arc<dyn InsertPipeline>, InsertError> {
        Ok(self.insert.clone() as Arc<dyn InsertPipeline>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Row;

    fn block(rows: usize) -> Block {
        Block {
            rows: (0..rows)
                .map(|i| Row {
                    columns: crate::source::ParsedRow::new(),
                    key: format!("k{i}"),
                    path: format!("memory:///k{i}"),
                    size: 1,
                    last_modified_ms: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_buffering_insert_counts_rows() {
        let insert = BufferingInsert::new();
        insert.insert(block(3)).unwrap();
        insert.insert(block(2)).unwrap();
        assert_eq!(insert.row_count(), 5);
        assert_eq!(insert.blocks().len(), 2);
    }

    #[test]
    fn test_fail_next_inserts() {
        let insert = BufferingInsert::new();
        insert.fail_next_inserts(1);
        assert!(insert.insert(block(1)).is_err());
        assert!(insert.insert(block(1)).is_ok());
        assert_eq!(insert.row_count(), 1);
    }
}

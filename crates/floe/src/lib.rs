//! floe: a distributed object-storage queue table engine.
//!
//! Pulls objects from a blob store (S3, Azure) into downstream materialized
//! views, coordinating file ownership, processing progress, and commit
//! atomicity across replicas through a strongly-consistent coordination
//! service:
//!
//! - Cluster-wide exactly-once-per-object processing backed by coordinator
//!   transactions
//! - A background streaming loop that batches file processing, feeds the
//!   downstream insert, then atomically commits progress
//! - Ordered mode with per-bucket path watermarks, Unordered mode with a
//!   TTL/cap-evicted tracked-file registry
//! - Optional hash-ring filtering that shards object ownership across live
//!   replicas

pub mod commit;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod queue_log;
pub mod settings;
pub mod source;
mod streaming;
pub mod views;

// Re-export commonly used items
pub use commit::{FailPoints, OBJECT_STORAGE_QUEUE_FAIL_COMMIT};
pub use engine::{AlterCommand, EngineConfig, EngineContext, QueueEngine};
pub use error::{InsertError, QueueError};
pub use metadata::{FileRecord, FileState, MetadataFactory, QueueMetadata, TableMetadata};
pub use queue_log::{MemoryQueueLog, QueueLogRecord, QueueLogSink};
pub use settings::{AfterProcessing, QueueMode, QueueSettings, SettingChange};
pub use source::{Block, FileIterator, FilePredicate, Row, SourceWorker};
pub use views::{BufferingInsert, InsertPipeline, StaticViewCatalog, TableId, ViewCatalog};

//! floe-common: Shared components for the floe queue engine.
//!
//! This crate contains infrastructure used by the table engine crate:
//!
//! - `keeper/` - Coordinator metadata store: hierarchical versioned nodes,
//!   ephemeral ownership, multi-op transactions, watches
//! - `storage/` - Object storage abstraction (S3, Azure, local, in-memory)
//! - `metrics/` - Prometheus metrics infrastructure
//! - `ring` - Consistent-hash ring for replica object ownership
//! - `error` - Common error types

pub mod error;
pub mod keeper;
pub mod metrics;
pub mod ring;
pub mod storage;

// Re-export commonly used items
pub use error::{KeeperError, MetricsError, StorageError};
pub use keeper::{join_path, CreateMode, MemoryKeeper, MetaStore, MetaStoreRef, OpCode, Stat, TxnOp};
pub use metrics::init as init_metrics;
pub use ring::HashRing;
pub use storage::{ObjectInfo, ObjectStorageProvider, ObjectStorageRef, StorageType};

//! Coordinator metadata store abstraction.
//!
//! Models the strongly-consistent hierarchical store the queue engine keeps
//! its cluster state in: versioned nodes, ephemeral ownership tied to a
//! session, multi-op transactions, and change watches. All mutating
//! operations are linearizable; `multi` is the atomicity substrate for
//! commit cycles.

mod memory;

pub use memory::MemoryKeeper;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::KeeperError;

/// A reference-counted handle to a coordinator store client.
pub type MetaStoreRef = Arc<dyn MetaStore>;

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives session loss.
    Persistent,
    /// Removed when the creating session expires.
    Ephemeral,
}

/// Per-node metadata returned by reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Mutation counter; incremented on every `set`.
    pub version: i64,
    /// Last modification time, unix milliseconds.
    pub mtime_ms: i64,
    /// True if the node is owned by a live session.
    pub ephemeral: bool,
}

/// A single operation inside a `multi` transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    Set {
        path: String,
        data: Bytes,
        expected_version: Option<i64>,
    },
    Delete {
        path: String,
        expected_version: Option<i64>,
    },
    /// Assert a node exists (and optionally has the given version)
    /// without mutating it.
    Check {
        path: String,
        expected_version: Option<i64>,
    },
}

impl TxnOp {
    /// The path this op touches.
    pub fn path(&self) -> &str {
        match self {
            TxnOp::Create { path, .. }
            | TxnOp::Set { path, .. }
            | TxnOp::Delete { path, .. }
            | TxnOp::Check { path, .. } => path,
        }
    }

    /// Shorthand for a persistent create carrying serialized data.
    pub fn create(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        TxnOp::Create {
            path: path.into(),
            data: data.into(),
            mode: CreateMode::Persistent,
        }
    }

    /// Shorthand for an ephemeral create.
    pub fn create_ephemeral(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        TxnOp::Create {
            path: path.into(),
            data: data.into(),
            mode: CreateMode::Ephemeral,
        }
    }

    /// Shorthand for an unconditional set.
    pub fn set(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        TxnOp::Set {
            path: path.into(),
            data: data.into(),
            expected_version: None,
        }
    }

    /// Shorthand for an unconditional delete.
    pub fn delete(path: impl Into<String>) -> Self {
        TxnOp::Delete {
            path: path.into(),
            expected_version: None,
        }
    }
}

/// Why an individual operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    NodeExists,
    NoNode,
    BadVersion,
    NotEmpty,
}

/// A subscription to changes of a single node.
///
/// `changed()` resolves the next time the node is created, mutated, or
/// deleted after the watcher was taken out.
pub struct Watcher {
    notify: Arc<Notify>,
}

impl Watcher {
    pub(crate) fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }

    /// Wait for the next change of the watched node.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// The coordinator metadata store interface.
///
/// Implementations must be safe to share across tasks; any single call may
/// fail and be retried idempotently via version checks.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Create a node. Missing ancestors are created as empty persistent
    /// nodes. Fails with `NodeExists` if the node is already present.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), KeeperError>;

    /// Overwrite a node's data, optionally guarded by an expected version.
    async fn set(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<Stat, KeeperError>;

    /// Read a node. Returns `None` if it does not exist.
    async fn get(&self, path: &str) -> Result<Option<(Bytes, Stat)>, KeeperError>;

    /// List the names of a node's direct children, sorted.
    async fn list(&self, path: &str) -> Result<Vec<String>, KeeperError>;

    /// Delete a leaf node, optionally guarded by an expected version.
    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<(), KeeperError>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool, KeeperError>;

    /// Apply all operations atomically, or none of them.
    async fn multi(&self, ops: &[TxnOp]) -> Result<(), KeeperError>;

    /// Delete a node and everything beneath it.
    async fn remove_recursive(&self, path: &str) -> Result<(), KeeperError>;

    /// Subscribe to changes of a node.
    async fn watch(&self, path: &str) -> Watcher;

    /// The session id ephemeral nodes created through this handle belong to.
    fn session_id(&self) -> u64;

    /// Batched point reads, chunked to bound the per-request fan-out.
    async fn get_many(
        &self,
        paths: &[String],
        batch_size: usize,
    ) -> Result<Vec<Option<(Bytes, Stat)>>, KeeperError> {
        let batch = batch_size.max(1);
        let mut out = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(batch) {
            for path in chunk {
                out.push(self.get(path).await?);
            }
        }
        Ok(out)
    }
}

/// Join path segments, normalizing separators.
pub fn join_path(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    format!("{base}/{child}")
}

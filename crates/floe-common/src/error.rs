//! Common error types shared across the floe crates.

use snafu::prelude::*;

use crate::keeper::OpCode;

// ============ Keeper Errors ============

/// Errors returned by the coordinator metadata store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum KeeperError {
    /// A create hit an existing node.
    #[snafu(display("Node already exists: {path}"))]
    NodeExists { path: String },

    /// The referenced node does not exist.
    #[snafu(display("No such node: {path}"))]
    NoNode { path: String },

    /// A versioned mutation lost a compare-and-set race.
    #[snafu(display("Version mismatch on {path}: expected {expected}, actual {actual}"))]
    BadVersion {
        path: String,
        expected: i64,
        actual: i64,
    },

    /// Delete of a node that still has children.
    #[snafu(display("Node has children: {path}"))]
    NotEmpty { path: String },

    /// A multi-op transaction failed; nothing was applied.
    #[snafu(display("Transaction failed at op {op_index} ({code:?}) on {path}"))]
    TransactionFailed {
        op_index: usize,
        code: OpCode,
        path: String,
    },

    /// The session backing an ephemeral operation is gone.
    #[snafu(display("Keeper session {session} has expired"))]
    SessionExpired { session: u64 },
}

impl KeeperError {
    /// The transaction-failure op code, if this is a transaction failure.
    pub fn txn_code(&self) -> Option<OpCode> {
        match self {
            KeeperError::TransactionFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// ============ Storage Errors ============

/// Errors that can occur during object storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics already initialized.
    #[snafu(display("Metrics recorder is already initialized"))]
    AlreadyInitialized,

    /// Metrics not initialized.
    #[snafu(display("Metrics recorder has not been initialized"))]
    NotInitialized,
}

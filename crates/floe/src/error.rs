//! Error types for the floe queue engine.

use snafu::prelude::*;

use floe_common::keeper::OpCode;
use floe_common::{KeeperError, StorageError};

/// Failure raised by the downstream insert pipeline.
#[derive(Debug, Snafu)]
#[snafu(display("Insert pipeline failed: {message}"))]
#[snafu(visibility(pub))]
#[snafu(context(name(InsertErrorSnafu)))]
pub struct InsertError {
    pub message: String,
}

impl InsertError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level engine errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Invalid or missing settings on create/alter.
    #[snafu(display("Bad arguments: {message}"))]
    BadArguments { message: String },

    /// Path shape invalid.
    #[snafu(display("Bad query parameter: {message}"))]
    BadQueryParameter { message: String },

    /// Direct SELECT disallowed.
    #[snafu(display("Query not allowed: {message}"))]
    QueryNotAllowed { message: String },

    /// Alter of a non-mutable setting, or other disabled behavior.
    #[snafu(display("Support is disabled: {message}"))]
    SupportDisabled { message: String },

    /// Internal invariant violation.
    #[snafu(display("Logical error: {message}"))]
    LogicalError { message: String },

    /// Table-level metadata in the coordinator does not match ours.
    #[snafu(display("Incompatible metadata: {message}"))]
    IncompatibleMetadata { message: String },

    /// Coordinator multi-op failed; carries the failed op for diagnosis.
    #[snafu(display("Transaction conflict at op {op_index} ({code:?}): {message}"))]
    TransactionConflict {
        op_index: usize,
        code: OpCode,
        message: String,
    },

    /// Fail-point injections and unclassified collaborator failures.
    #[snafu(display("Unknown exception: {message}"))]
    UnknownException { message: String },

    /// Coordinator store failure.
    #[snafu(display("Keeper error: {source}"))]
    Keeper { source: KeeperError },

    /// Blob store failure.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Downstream insert failure.
    #[snafu(display("{source}"))]
    Insert { source: InsertError },

    /// A worker task panicked.
    #[snafu(display("Worker task failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },
}

impl From<KeeperError> for QueueError {
    fn from(source: KeeperError) -> Self {
        match source {
            KeeperError::TransactionFailed {
                op_index,
                code,
                path,
            } => QueueError::TransactionConflict {
                op_index,
                code,
                message: format!("failed on {path}"),
            },
            other => QueueError::Keeper { source: other },
        }
    }
}

impl From<StorageError> for QueueError {
    fn from(source: StorageError) -> Self {
        QueueError::Storage { source }
    }
}

impl From<InsertError> for QueueError {
    fn from(source: InsertError) -> Self {
        QueueError::Insert { source }
    }
}

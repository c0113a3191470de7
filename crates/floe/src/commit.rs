//! Commit coordinator: one atomic coordinator transaction per cycle.
//!
//! The after-processing delete runs BEFORE the transaction. If the delete
//! happened after the commit, a crash in between would leave the
//! coordinator claiming Processed while the object is still present, and it
//! would be re-claimed after TTL eviction. Deleting first means a crash
//! leaves objects deleted but unmarked, which is safe: the rows were
//! already inserted, and re-listing will simply not find the objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use floe_common::emit;
use floe_common::keeper::{MetaStoreRef, TxnOp};
use floe_common::metrics::events::{
    CommitRequests, ProcessedRows, RemovedObjects, SuccessfulCommits, UnsuccessfulCommits,
};
use floe_common::ObjectStorageRef;

use crate::error::QueueError;
use crate::metadata::QueueMetadata;
use crate::settings::AfterProcessing;
use crate::source::SourceWorker;

/// Named fail point that forces the commit transaction to throw.
pub const OBJECT_STORAGE_QUEUE_FAIL_COMMIT: &str = "object_storage_queue_fail_commit";

/// Testing hooks wired through configuration. When a fail point is armed,
/// the corresponding operation fails with `UnknownException`.
#[derive(Debug, Default)]
pub struct FailPoints {
    fail_commit: AtomicBool,
}

impl FailPoints {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enable(&self, name: &str) {
        match name {
            OBJECT_STORAGE_QUEUE_FAIL_COMMIT => self.fail_commit.store(true, Ordering::SeqCst),
            other => warn!(fail_point = other, "Unknown fail point"),
        }
    }

    pub fn disable(&self, name: &str) {
        if name == OBJECT_STORAGE_QUEUE_FAIL_COMMIT {
            self.fail_commit.store(false, Ordering::SeqCst);
        }
    }

    fn commit_fails(&self) -> bool {
        self.fail_commit.load(Ordering::SeqCst)
    }
}

/// Aggregate worker outcomes into one coordinator transaction and apply the
/// post-processing action.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn commit(
    metadata: &Arc<QueueMetadata>,
    storage: &ObjectStorageRef,
    keeper: &MetaStoreRef,
    fail_points: &Arc<FailPoints>,
    table_label: &str,
    workers: &[Arc<SourceWorker>],
    insert_succeeded: bool,
    inserted_rows: u64,
    exception_message: &str,
) -> Result<(), QueueError> {
    emit!(ProcessedRows {
        count: inserted_rows,
        table: table_label.to_string(),
    });

    let mut requests: Vec<TxnOp> = Vec::new();
    let mut successful_objects: Vec<String> = Vec::new();
    for worker in workers {
        worker.prepare_commit_requests(
            &mut requests,
            insert_succeeded,
            &mut successful_objects,
            exception_message,
        );
    }

    if requests.is_empty() {
        debug!(table = %table_label, "Nothing to commit");
        return Ok(());
    }

    emit!(CommitRequests {
        count: requests.len() as u64,
        table: table_label.to_string(),
    });

    if !successful_objects.is_empty()
        && metadata.after_processing() == AfterProcessing::Delete
    {
        // The after-processing action must run before the coordinator
        // transaction; see the module comment for the ordering trade-off.
        storage.delete_objects_if_exist(&successful_objects).await?;
        emit!(RemovedObjects {
            count: successful_objects.len() as u64,
            table: table_label.to_string(),
        });
    }

    if fail_points.commit_fails() {
        emit!(UnsuccessfulCommits {
            table: table_label.to_string(),
        });
        return Err(QueueError::UnknownException {
            message: "Failed to commit processed files".to_string(),
        });
    }

    if let Err(err) = keeper.multi(&requests).await {
        emit!(UnsuccessfulCommits {
            table: table_label.to_string(),
        });
        return Err(err.into());
    }

    emit!(SuccessfulCommits {
        table: table_label.to_string(),
    });

    for worker in workers {
        worker.finalize_commit(insert_succeeded, exception_message);
    }

    info!(
        table = %table_label,
        requests = requests.len(),
        workers = workers.len(),
        inserted_rows,
        successful_files = successful_objects.len(),
        "Committed cycle"
    );
    Ok(())
}

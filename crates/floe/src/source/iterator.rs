//! File iterator: lists blobs, filters them down to the ones this replica
//! owns, and claims them in the coordinator.
//!
//! The iterator is a lazy, finite sequence per polling cycle. It is shared
//! by every worker of the cycle through a synchronized `next()` handle, so
//! claims are handed out round-robin as workers become free.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use floe_common::keeper::CreateMode;
use floe_common::{HashRing, KeeperError, ObjectInfo, ObjectStorageRef};

use crate::error::QueueError;
use crate::metadata::{bucket_for, FileRecord, QueueMetadata};
use crate::settings::QueueMode;

/// Query predicate over virtual columns, applied before claiming.
pub type FilePredicate = Arc<dyn Fn(&ObjectInfo) -> bool + Send + Sync>;

/// A file claimed for this replica.
#[derive(Debug, Clone)]
pub struct ClaimedFile {
    pub object: ObjectInfo,
    /// Retry counter carried over from a previous failed attempt.
    pub retries: u64,
    /// Bucket the file belongs to (Ordered mode only).
    pub bucket: Option<u64>,
}

struct Candidate {
    object: ObjectInfo,
    retries: u64,
}

struct IterState {
    /// Full cycle listing, fetched lazily on first use.
    listing: Option<Vec<ObjectInfo>>,
    cursor: usize,
    pending: VecDeque<Candidate>,
    /// Live-replica ring, built once per cycle when hash filtering is on.
    ring: Option<HashRing>,
    /// Bucket leases held by this replica: bucket -> watermark at acquire.
    held_buckets: HashMap<u64, String>,
}

/// Lazy, claim-as-you-go iterator over one polling cycle's objects.
pub struct FileIterator {
    metadata: Arc<QueueMetadata>,
    storage: ObjectStorageRef,
    replica: String,
    glob: GlobMatcher,
    list_prefix: Option<String>,
    predicate: Option<FilePredicate>,
    list_batch_size: usize,
    hash_ring_filtering: bool,
    shutdown: CancellationToken,
    finished: AtomicBool,
    state: Mutex<IterState>,
}

impl FileIterator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<QueueMetadata>,
        storage: ObjectStorageRef,
        replica: &str,
        path_pattern: &str,
        list_batch_size: u64,
        predicate: Option<FilePredicate>,
        hash_ring_filtering: bool,
        shutdown: CancellationToken,
    ) -> Result<Self, QueueError> {
        let glob = Glob::new(path_pattern)
            .map_err(|e| QueueError::BadQueryParameter {
                message: format!("Invalid path pattern {path_pattern}: {e}"),
            })?
            .compile_matcher();

        Ok(Self {
            metadata,
            storage,
            replica: replica.to_string(),
            glob,
            list_prefix: static_prefix(path_pattern),
            predicate,
            list_batch_size: list_batch_size.max(1) as usize,
            hash_ring_filtering,
            shutdown,
            finished: AtomicBool::new(false),
            state: Mutex::new(IterState {
                listing: None,
                cursor: 0,
                pending: VecDeque::new(),
                ring: None,
                held_buckets: HashMap::new(),
            }),
        })
    }

    /// Whether the listing has been drained.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Claim the next file for this replica, or `None` when the cycle's
    /// listing is exhausted or shutdown was requested.
    pub async fn next(&self) -> Result<Option<ClaimedFile>, QueueError> {
        let mut state = self.state.lock().await;
        loop {
            if self.shutdown.is_cancelled() {
                self.finished.store(true, Ordering::SeqCst);
                return Ok(None);
            }

            if let Some(candidate) = state.pending.pop_front() {
                if let Some(claimed) = self.try_claim(&mut state, candidate).await? {
                    return Ok(Some(claimed));
                }
                continue;
            }

            if !self.refill(&mut state).await? {
                self.finished.store(true, Ordering::SeqCst);
                return Ok(None);
            }
        }
    }

    /// Release every bucket lease this replica holds. Called after a commit
    /// cycle so drained buckets can be picked up by other replicas.
    pub async fn release_finished_buckets(&self) {
        let mut state = self.state.lock().await;
        for (bucket, _) in state.held_buckets.drain() {
            let lock_path = self.metadata.bucket_lock_path(bucket);
            match self.metadata.keeper().delete(&lock_path, None).await {
                Ok(()) => trace!(bucket, "Released bucket lease"),
                Err(KeeperError::NoNode { .. }) => {}
                Err(e) => warn!(bucket, error = %e, "Failed to release bucket lease"),
            }
        }
    }

    /// Take the next listing page and turn it into claim candidates.
    /// Returns false once the listing is exhausted with nothing pending.
    async fn refill(&self, state: &mut IterState) -> Result<bool, QueueError> {
        if state.listing.is_none() {
            state.listing = Some(self.storage.list_all(self.list_prefix.as_deref()).await?);
            state.cursor = 0;
        }

        loop {
            let batch: Vec<ObjectInfo> = {
                let listing = state.listing.as_ref().expect("listing fetched above");
                if state.cursor >= listing.len() {
                    return Ok(false);
                }
                let end = (state.cursor + self.list_batch_size).min(listing.len());
                let batch = listing[state.cursor..end].to_vec();
                state.cursor = end;
                batch
            };

            let candidates = self.filter_batch(state, batch).await?;
            debug!(
                candidates = candidates.len(),
                "Filtered a page of claim candidates"
            );
            state.pending.extend(candidates);
            if !state.pending.is_empty() {
                return Ok(true);
            }
        }
    }

    /// Apply glob, predicate, hash-ring, and known-state filters to a page.
    async fn filter_batch(
        &self,
        state: &mut IterState,
        batch: Vec<ObjectInfo>,
    ) -> Result<Vec<Candidate>, QueueError> {
        let mut survivors: Vec<ObjectInfo> = Vec::with_capacity(batch.len());
        for object in batch {
            if !self.glob.is_match(&object.path) {
                continue;
            }
            if let Some(predicate) = &self.predicate {
                if !predicate(&object) {
                    continue;
                }
            }
            if self.hash_ring_filtering {
                if state.ring.is_none() {
                    let replicas = self.metadata.active_replicas().await?;
                    state.ring = Some(HashRing::new(replicas));
                }
                let ring = state.ring.as_ref().expect("ring built above");
                // An empty ring means registrations have not appeared yet;
                // claiming still guarantees exclusivity, so do not starve.
                if !ring.is_empty() && !ring.is_owned_by(&object.path, &self.replica) {
                    continue;
                }
            }
            survivors.push(object);
        }

        // The Processed registry only exists in Unordered mode; the failure
        // records (terminal and retriable) are consulted in both.
        let check_processed = self.metadata.mode() == QueueMode::Unordered;
        self.filter_tracked(survivors, check_processed).await
    }

    /// Drop files that are already Processed (Unordered) or terminally
    /// Failed, and pick up retry counters from retriable failures. Uses
    /// batched reads to bound coordinator fan-out.
    async fn filter_tracked(
        &self,
        objects: Vec<ObjectInfo>,
        check_processed: bool,
    ) -> Result<Vec<Candidate>, QueueError> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let keeper = self.metadata.keeper();
        let batch = self.metadata.multiread_batch_size();

        let processed: Vec<Option<(bytes::Bytes, floe_common::Stat)>> = if check_processed {
            let paths: Vec<String> = objects
                .iter()
                .map(|o| self.metadata.processed_path(&o.path))
                .collect();
            keeper.get_many(&paths, batch).await?
        } else {
            vec![None; objects.len()]
        };
        let failed: Vec<String> = objects
            .iter()
            .map(|o| self.metadata.failed_path(&o.path))
            .collect();
        let retriable: Vec<String> = objects
            .iter()
            .map(|o| self.metadata.retriable_failed_path(&o.path))
            .collect();

        let failed = keeper.get_many(&failed, batch).await?;
        let retriable = keeper.get_many(&retriable, batch).await?;

        let mut candidates = Vec::with_capacity(objects.len());
        for (index, object) in objects.into_iter().enumerate() {
            if processed[index].is_some() || failed[index].is_some() {
                continue;
            }
            let retries = match &retriable[index] {
                Some((bytes, _)) => FileRecord::from_bytes(bytes)?.retries,
                None => 0,
            };
            candidates.push(Candidate { object, retries });
        }
        Ok(candidates)
    }

    /// Attempt the coordinator claim for one candidate. `None` means the
    /// file is owned elsewhere (or below the watermark) and must be skipped.
    async fn try_claim(
        &self,
        state: &mut IterState,
        candidate: Candidate,
    ) -> Result<Option<ClaimedFile>, QueueError> {
        let keeper = self.metadata.keeper();
        let path = &candidate.object.path;

        let bucket = match self.metadata.mode() {
            QueueMode::Unordered => None,
            QueueMode::Ordered => {
                let bucket = bucket_for(path, self.metadata.buckets());
                let watermark = match state.held_buckets.get(&bucket) {
                    Some(watermark) => watermark.clone(),
                    None => match self.acquire_bucket(bucket).await? {
                        Some(watermark) => {
                            state.held_buckets.insert(bucket, watermark.clone());
                            watermark
                        }
                        // Held by another replica.
                        None => return Ok(None),
                    },
                };
                if !watermark.is_empty() && path.as_str() <= watermark.as_str() {
                    trace!(path = %path, watermark = %watermark, "Path below watermark, skipping");
                    return Ok(None);
                }
                Some(bucket)
            }
        };

        let record = FileRecord::processing(&self.replica, candidate.retries);
        match keeper
            .create(
                &self.metadata.processing_path(path),
                &record.to_bytes(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(()) => Ok(Some(ClaimedFile {
                object: candidate.object,
                retries: candidate.retries,
                bucket,
            })),
            // Another replica is processing it; a replayed claim after a
            // crash with the same session hits this too and is a no-op.
            Err(KeeperError::NodeExists { .. }) => {
                trace!(path = %path, "Already claimed elsewhere");
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Acquire the ephemeral lease for a bucket, returning its watermark.
    /// `None` means another replica holds the lease.
    async fn acquire_bucket(&self, bucket: u64) -> Result<Option<String>, QueueError> {
        let keeper = self.metadata.keeper();
        let lock_path = self.metadata.bucket_lock_path(bucket);

        match keeper
            .create(&lock_path, self.replica.as_bytes(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) => {}
            Err(KeeperError::NodeExists { .. }) => {
                let holder = keeper
                    .get(&lock_path)
                    .await?
                    .map(|(bytes, _)| String::from_utf8_lossy(&bytes).into_owned());
                if holder.as_deref() != Some(self.replica.as_str()) {
                    return Ok(None);
                }
            }
            Err(other) => return Err(other.into()),
        }

        // Make sure the watermark node exists so commits can set it
        // unconditionally.
        let watermark_path = self.metadata.bucket_watermark_path(bucket);
        match keeper.create(&watermark_path, b"", CreateMode::Persistent).await {
            Ok(()) | Err(KeeperError::NodeExists { .. }) => {}
            Err(other) => return Err(other.into()),
        }

        let watermark = keeper
            .get(&watermark_path)
            .await?
            .map(|(bytes, _)| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        debug!(bucket, watermark = %watermark, "Acquired bucket lease");
        Ok(Some(watermark))
    }
}

/// The longest glob-free directory prefix of a pattern, used to narrow
/// listing.
fn static_prefix(pattern: &str) -> Option<String> {
    let cut = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .unwrap_or(pattern.len());
    let prefix = &pattern[..cut];
    let prefix = match prefix.rfind('/') {
        Some(slash) => &prefix[..slash],
        None => return None,
    };
    if prefix.is_empty() {
        None
    } else {
        Some(prefix.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_prefix() {
        assert_eq!(static_prefix("data/*.ndjson"), Some("data".to_string()));
        assert_eq!(
            static_prefix("data/2026/*/*.ndjson"),
            Some("data/2026".to_string())
        );
        assert_eq!(static_prefix("*.ndjson"), None);
        assert_eq!(static_prefix("data/exact.ndjson"), Some("data".to_string()));
    }
}

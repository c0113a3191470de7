//! Process-wide registry of queue metadata instances.
//!
//! Tables attached to the same coordinator path share one
//! [`QueueMetadata`] instance (and therefore one cleanup task). The factory
//! reference-counts registrations by storage id; the last registration to
//! leave tears the cleanup task down, and removes the coordinator subtree
//! only when the table is being dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info};

use crate::error::QueueError;

use super::QueueMetadata;

struct Entry {
    metadata: Arc<QueueMetadata>,
    registrations: HashSet<String>,
}

/// Global factory singleton. Access through [`MetadataFactory::instance`].
pub struct MetadataFactory {
    entries: Mutex<HashMap<String, Entry>>,
}

static FACTORY: OnceLock<MetadataFactory> = OnceLock::new();

impl MetadataFactory {
    pub fn instance() -> &'static MetadataFactory {
        FACTORY.get_or_init(|| MetadataFactory {
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register a table under the coordinator path.
    ///
    /// Returns the shared instance, discarding `candidate` if the path was
    /// already registered; otherwise installs `candidate` and starts its
    /// cleanup task.
    pub fn get_or_create(
        &self,
        zk_path: &str,
        candidate: Arc<QueueMetadata>,
        storage_id: &str,
    ) -> Arc<QueueMetadata> {
        let mut entries = self.entries.lock().expect("factory lock");
        let entry = entries.entry(zk_path.to_string()).or_insert_with(|| {
            debug!(path = %zk_path, "Installing queue metadata");
            candidate.start_cleanup();
            Entry {
                metadata: candidate,
                registrations: HashSet::new(),
            }
        });
        entry.registrations.insert(storage_id.to_string());
        Arc::clone(&entry.metadata)
    }

    /// Remove a registration. When the reference count reaches zero the
    /// cleanup task is stopped, and on `drop_data` the coordinator subtree
    /// is removed as well.
    pub async fn remove(
        &self,
        zk_path: &str,
        storage_id: &str,
        drop_data: bool,
    ) -> Result<(), QueueError> {
        let released = {
            let mut entries = self.entries.lock().expect("factory lock");
            let Some(entry) = entries.get_mut(zk_path) else {
                return Ok(());
            };
            entry.registrations.remove(storage_id);
            if entry.registrations.is_empty() {
                entries.remove(zk_path).map(|entry| entry.metadata)
            } else {
                None
            }
        };

        if let Some(metadata) = released {
            metadata.shutdown().await;
            if drop_data {
                info!(path = %zk_path, "Last registration dropped the table");
                QueueMetadata::drop_subtree(metadata.keeper(), zk_path).await?;
            }
        }
        Ok(())
    }

    /// Number of registrations for a path (test observability).
    pub fn registered_count(&self, zk_path: &str) -> usize {
        self.entries
            .lock()
            .expect("factory lock")
            .get(zk_path)
            .map(|entry| entry.registrations.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TableMetadata;
    use crate::settings::{QueueMode, QueueSettings};
    use floe_common::MemoryKeeper;

    fn make_metadata(keeper: floe_common::MetaStoreRef, zk_path: &str) -> Arc<QueueMetadata> {
        let mut settings = QueueSettings::default();
        settings.mode = QueueMode::Unordered;
        let table = TableMetadata::from_settings(&settings, "ndjson", &["id".to_string()]);
        Arc::new(QueueMetadata::new(
            keeper, zk_path, table, "factory_test", 60_000, 120_000, 100,
        ))
    }

    #[tokio::test]
    async fn test_refcounting_and_drop() {
        let server = Arc::new(MemoryKeeper::new());
        let keeper = server.client();
        keeper
            .create("/factory/t1/metadata", b"{}", floe_common::CreateMode::Persistent)
            .await
            .unwrap();

        let factory = MetadataFactory::instance();
        let zk_path = "/factory/t1";

        let first = make_metadata(keeper.clone(), zk_path);
        let installed = factory.get_or_create(zk_path, first, "db.t1#a");
        assert_eq!(factory.registered_count(zk_path), 1);

        // A second registration gets the same instance back.
        let candidate = make_metadata(keeper.clone(), zk_path);
        let shared = factory.get_or_create(zk_path, candidate, "db.t1#b");
        assert!(Arc::ptr_eq(&installed, &shared));
        assert_eq!(factory.registered_count(zk_path), 2);

        // Detach one: subtree survives.
        factory.remove(zk_path, "db.t1#a", false).await.unwrap();
        assert_eq!(factory.registered_count(zk_path), 1);
        assert!(keeper.exists("/factory/t1/metadata").await.unwrap());

        // Drop the last: subtree is removed.
        factory.remove(zk_path, "db.t1#b", true).await.unwrap();
        assert_eq!(factory.registered_count(zk_path), 0);
        assert!(!keeper.exists("/factory/t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_unknown_path_is_noop() {
        let factory = MetadataFactory::instance();
        factory.remove("/factory/missing", "x", true).await.unwrap();
    }
}

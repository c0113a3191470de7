//! In-memory coordinator store.
//!
//! A single-process implementation of [`MetaStore`] with the semantics the
//! engine relies on: linearizable mutations, versioned compare-and-set,
//! all-or-nothing transactions, and session-scoped ephemeral nodes.
//! `expire_session` models coordinator session loss: every ephemeral owned
//! by the session disappears and watchers fire, so another replica can
//! reclaim the work.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;

use crate::error::KeeperError;

use super::{CreateMode, MetaStore, MetaStoreRef, OpCode, Stat, TxnOp, Watcher};

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    version: i64,
    mtime_ms: i64,
    ephemeral_owner: Option<u64>,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Arc<Notify>>,
}

/// Shared in-memory coordinator. Hand out per-replica clients with
/// [`MemoryKeeper::client`].
pub struct MemoryKeeper {
    state: Mutex<State>,
    next_session: AtomicU64,
}

impl Default for MemoryKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeeper {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Open a client with its own session for ephemeral ownership.
    pub fn client(self: &Arc<Self>) -> MetaStoreRef {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        Arc::new(KeeperClient {
            server: Arc::clone(self),
            session,
        })
    }

    /// Drop every ephemeral node owned by the session.
    pub fn expire_session(&self, session: u64) {
        let mut state = self.state.lock().expect("keeper state lock");
        let expired: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &expired {
            state.nodes.remove(path);
        }
        for path in &expired {
            notify_path(&mut state, path);
        }
    }

    /// Number of nodes currently stored (test observability).
    pub fn node_count(&self) -> usize {
        self.state.lock().expect("keeper state lock").nodes.len()
    }

    fn create_locked(
        state: &mut State,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session: u64,
    ) -> Result<(), KeeperError> {
        let path = normalize(path);
        if state.nodes.contains_key(&path) {
            return Err(KeeperError::NodeExists { path });
        }
        create_ancestors(&mut state.nodes, &path);
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session),
        };
        state.nodes.insert(
            path.clone(),
            Node {
                data: Bytes::copy_from_slice(data),
                version: 0,
                mtime_ms: Utc::now().timestamp_millis(),
                ephemeral_owner: owner,
            },
        );
        notify_path(state, &path);
        Ok(())
    }

    fn set_locked(
        state: &mut State,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<Stat, KeeperError> {
        let path = normalize(path);
        let node = state
            .nodes
            .get_mut(&path)
            .ok_or_else(|| KeeperError::NoNode { path: path.clone() })?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(KeeperError::BadVersion {
                    path,
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = Bytes::copy_from_slice(data);
        node.version += 1;
        node.mtime_ms = Utc::now().timestamp_millis();
        let stat = stat_of(node);
        notify_path(state, &path);
        Ok(stat)
    }

    fn delete_locked(
        state: &mut State,
        path: &str,
        expected_version: Option<i64>,
    ) -> Result<(), KeeperError> {
        let path = normalize(path);
        let node = state
            .nodes
            .get(&path)
            .ok_or_else(|| KeeperError::NoNode { path: path.clone() })?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(KeeperError::BadVersion {
                    path,
                    expected,
                    actual: node.version,
                });
            }
        }
        if has_children(&state.nodes, &path) {
            return Err(KeeperError::NotEmpty { path });
        }
        state.nodes.remove(&path);
        notify_path(state, &path);
        Ok(())
    }
}

struct KeeperClient {
    server: Arc<MemoryKeeper>,
    session: u64,
}

#[async_trait]
impl MetaStore for KeeperClient {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), KeeperError> {
        let mut state = self.server.state.lock().expect("keeper state lock");
        MemoryKeeper::create_locked(&mut state, path, data, mode, self.session)
    }

    async fn set(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<Stat, KeeperError> {
        let mut state = self.server.state.lock().expect("keeper state lock");
        MemoryKeeper::set_locked(&mut state, path, data, expected_version)
    }

    async fn get(&self, path: &str) -> Result<Option<(Bytes, Stat)>, KeeperError> {
        let state = self.server.state.lock().expect("keeper state lock");
        Ok(state
            .nodes
            .get(&normalize(path))
            .map(|node| (node.data.clone(), stat_of(node))))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, KeeperError> {
        let state = self.server.state.lock().expect("keeper state lock");
        let prefix = format!("{}/", normalize(path));
        let children: Vec<String> = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        Ok(children)
    }

    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<(), KeeperError> {
        let mut state = self.server.state.lock().expect("keeper state lock");
        MemoryKeeper::delete_locked(&mut state, path, expected_version)
    }

    async fn exists(&self, path: &str) -> Result<bool, KeeperError> {
        let state = self.server.state.lock().expect("keeper state lock");
        Ok(state.nodes.contains_key(&normalize(path)))
    }

    async fn multi(&self, ops: &[TxnOp]) -> Result<(), KeeperError> {
        let mut state = self.server.state.lock().expect("keeper state lock");

        // Validate and apply against a scratch copy so a mid-transaction
        // failure leaves the store untouched.
        let mut scratch = State {
            nodes: state.nodes.clone(),
            watches: HashMap::new(),
        };
        for (op_index, op) in ops.iter().enumerate() {
            let result = match op {
                TxnOp::Create { path, data, mode } => {
                    MemoryKeeper::create_locked(&mut scratch, path, data, *mode, self.session)
                }
                TxnOp::Set {
                    path,
                    data,
                    expected_version,
                } => MemoryKeeper::set_locked(&mut scratch, path, data, *expected_version)
                    .map(|_| ()),
                TxnOp::Delete {
                    path,
                    expected_version,
                } => MemoryKeeper::delete_locked(&mut scratch, path, *expected_version),
                TxnOp::Check {
                    path,
                    expected_version,
                } => check_node(&scratch.nodes, path, *expected_version),
            };
            if let Err(err) = result {
                return Err(KeeperError::TransactionFailed {
                    op_index,
                    code: op_code(&err),
                    path: op.path().to_string(),
                });
            }
        }

        state.nodes = scratch.nodes;
        for op in ops {
            notify_path(&mut state, &normalize(op.path()));
        }
        Ok(())
    }

    async fn remove_recursive(&self, path: &str) -> Result<(), KeeperError> {
        let mut state = self.server.state.lock().expect("keeper state lock");
        let root = normalize(path);
        let prefix = format!("{root}/");
        let doomed: Vec<String> = state
            .nodes
            .range(root.clone()..)
            .take_while(|(key, _)| **key == root || key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.nodes.remove(key);
        }
        for key in &doomed {
            notify_path(&mut state, key);
        }
        Ok(())
    }

    async fn watch(&self, path: &str) -> Watcher {
        let mut state = self.server.state.lock().expect("keeper state lock");
        let notify = state
            .watches
            .entry(normalize(path))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        Watcher::new(notify)
    }

    fn session_id(&self) -> u64 {
        self.session
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn stat_of(node: &Node) -> Stat {
    Stat {
        version: node.version,
        mtime_ms: node.mtime_ms,
        ephemeral: node.ephemeral_owner.is_some(),
    }
}

fn create_ancestors(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut ancestor = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        ancestor.push('/');
        ancestor.push_str(segment);
        if ancestor == path {
            break;
        }
        nodes.entry(ancestor.clone()).or_insert_with(|| Node {
            data: Bytes::new(),
            version: 0,
            mtime_ms: Utc::now().timestamp_millis(),
            ephemeral_owner: None,
        });
    }
}

fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    let prefix = format!("{path}/");
    nodes
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

fn check_node(
    nodes: &BTreeMap<String, Node>,
    path: &str,
    expected_version: Option<i64>,
) -> Result<(), KeeperError> {
    let path = normalize(path);
    let node = nodes
        .get(&path)
        .ok_or_else(|| KeeperError::NoNode { path: path.clone() })?;
    if let Some(expected) = expected_version {
        if node.version != expected {
            return Err(KeeperError::BadVersion {
                path,
                expected,
                actual: node.version,
            });
        }
    }
    Ok(())
}

fn op_code(err: &KeeperError) -> OpCode {
    match err {
        KeeperError::NodeExists { .. } => OpCode::NodeExists,
        KeeperError::NoNode { .. } => OpCode::NoNode,
        KeeperError::BadVersion { .. } => OpCode::BadVersion,
        KeeperError::NotEmpty { .. } => OpCode::NotEmpty,
        _ => OpCode::NoNode,
    }
}

fn notify_path(state: &mut State, path: &str) {
    if let Some(notify) = state.watches.get(path) {
        notify.notify_waiters();
    }
}

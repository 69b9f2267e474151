//! In-process coordination store.
//!
//! Good enough for tests and single-process deployments: a tree of
//! directories holding data nodes, with the same watch semantics as the
//! real stores. Watch events are queued while the state lock is held so a
//! watcher always observes changes in the order they were applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{RegistryError, Result};
use crate::remote::{BranchEvent, BranchWatcher, NodeEvent, NodeWatcher, Remote};

#[derive(Default)]
struct State {
    /// branch -> name -> data
    branches: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    branch_watchers: HashMap<String, Vec<mpsc::UnboundedSender<BranchEvent>>>,
    node_watchers: HashMap<String, Vec<mpsc::UnboundedSender<NodeEvent>>>,
    closed: bool,
}

impl State {
    fn notify_branch(&mut self, branch: &str, event: BranchEvent) {
        if let Some(watchers) = self.branch_watchers.get_mut(branch) {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn notify_node(&mut self, path: &str, data: &[u8]) {
        if let Some(watchers) = self.node_watchers.get_mut(path) {
            watchers.retain(|tx| {
                tx.send(NodeEvent {
                    path: path.to_string(),
                    data: data.to_vec(),
                })
                .is_ok()
            });
        }
    }
}

/// In-memory [`Remote`].
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(RegistryError::Closed);
        }
        Ok(state)
    }

    /// Number of live node watches on `path`.
    pub fn node_watch_count(&self, path: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .node_watchers
            .get(path)
            .map(|watchers| watchers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

fn join(branch: &str, name: &str) -> String {
    format!("{}/{}", branch, name)
}

#[async_trait]
impl Remote for MemoryRemote {
    async fn create_node(&self, branch: &str, name: &str, data: Vec<u8>) -> Result<String> {
        let mut state = self.state()?;
        let path = join(branch, name);
        let children = state.branches.entry(branch.to_string()).or_default();
        if children.contains_key(name) {
            return Err(RegistryError::NodeExists(path));
        }
        children.insert(name.to_string(), data.clone());

        state.notify_branch(
            branch,
            BranchEvent {
                adds: vec![(path.clone(), data)],
                dels: Vec::new(),
            },
        );
        Ok(path)
    }

    async fn set_node(&self, branch: &str, name: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.state()?;
        let path = join(branch, name);
        let slot = state
            .branches
            .get_mut(branch)
            .and_then(|children| children.get_mut(name))
            .ok_or_else(|| RegistryError::NodeNotFound(path.clone()))?;
        *slot = data.clone();

        state.notify_node(&path, &data);
        Ok(())
    }

    async fn get_node(&self, branch: &str, name: &str) -> Result<Vec<u8>> {
        let state = self.state()?;
        state
            .branches
            .get(branch)
            .and_then(|children| children.get(name))
            .cloned()
            .ok_or_else(|| RegistryError::NodeNotFound(join(branch, name)))
    }

    async fn delete_node(&self, branch: &str, name: &str) -> Result<()> {
        let mut state = self.state()?;
        let path = join(branch, name);
        let removed = state
            .branches
            .get_mut(branch)
            .and_then(|children| children.remove(name));
        if removed.is_none() {
            return Err(RegistryError::NodeNotFound(path));
        }

        // Dropping the senders ends every watch on the deleted node.
        state.node_watchers.remove(&path);
        state.notify_branch(
            branch,
            BranchEvent {
                adds: Vec::new(),
                dels: vec![path],
            },
        );
        Ok(())
    }

    async fn list_nodes(&self, branch: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let state = self.state()?;
        Ok(state
            .branches
            .get(branch)
            .map(|children| {
                children
                    .iter()
                    .map(|(name, data)| (join(branch, name), data.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch_branch(&self, branch: &str) -> Result<BranchWatcher> {
        let mut state = self.state()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .branch_watchers
            .entry(branch.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn watch_node(&self, path: &str) -> Result<NodeWatcher> {
        let mut state = self.state()?;
        let exists = path
            .rsplit_once('/')
            .and_then(|(branch, name)| state.branches.get(branch).map(|c| c.contains_key(name)))
            .unwrap_or(false);
        if !exists {
            return Err(RegistryError::NodeNotFound(path.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state
            .node_watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.branch_watchers.clear();
        state.node_watchers.clear();
    }
}

//! Coordination store abstraction.
//!
//! A [`Remote`] is a hierarchical key/value store with two kinds of watch:
//! a *branch* watch reporting children added to or removed from a directory,
//! and a *node* watch reporting data changes of a single entry. Watches are
//! plain channel receivers; the stream ends when the watched entry goes away
//! or the remote is closed.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Children added to or removed from a watched directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchEvent {
    /// Full path and data of each new child
    pub adds: Vec<(String, Vec<u8>)>,
    /// Full paths of removed children
    pub dels: Vec<String>,
}

/// New data of a watched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub path: String,
    pub data: Vec<u8>,
}

pub type BranchWatcher = mpsc::UnboundedReceiver<BranchEvent>;
pub type NodeWatcher = mpsc::UnboundedReceiver<NodeEvent>;

#[async_trait]
pub trait Remote: Send + Sync + 'static {
    /// Creates `{branch}/{name}` and returns its full path.
    ///
    /// Fails with `NodeExists` if the entry is already there.
    async fn create_node(&self, branch: &str, name: &str, data: Vec<u8>) -> Result<String>;

    /// Replaces the data of an existing entry.
    async fn set_node(&self, branch: &str, name: &str, data: Vec<u8>) -> Result<()>;

    async fn get_node(&self, branch: &str, name: &str) -> Result<Vec<u8>>;

    async fn delete_node(&self, branch: &str, name: &str) -> Result<()>;

    /// Every child of `branch` as `(path, data)`.
    async fn list_nodes(&self, branch: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn watch_branch(&self, branch: &str) -> Result<BranchWatcher>;

    async fn watch_node(&self, path: &str) -> Result<NodeWatcher>;

    /// Ends every outstanding watch. Further calls fail with `Closed`.
    async fn close(&self);
}

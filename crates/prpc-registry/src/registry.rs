use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{RegistryError, Result};
use crate::node::{base_name, node_key, service_path, Node, NodeOptions};
use crate::remote::{BranchWatcher, NodeWatcher, Remote};

/// A change in the set of nodes backing a subscribed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// New nodes, decoded and checked against their paths
    Added(Vec<Node>),
    /// Node keys (`{group}.{index}`) that went away
    Removed(Vec<String>),
    /// Data of an existing node changed in place
    Updated(Node),
}

/// Consumer of discovery events for one subscription.
///
/// Events for a single watched path arrive in order, and an `Updated` for a
/// node is only delivered after `on_event` returned for the `Added` that
/// carried it. Events from different paths are not ordered relative to each
/// other.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn on_event(&self, event: DiscoveryEvent);
}

type SubscriptionKey = (String, String, String);

/// Service registry on top of a [`Remote`].
///
/// Servers [`register`](Registry::register) their nodes; clients
/// [`subscribe`](Registry::subscribe) to a `(service, group)` and receive the
/// current nodes followed by a stream of [`DiscoveryEvent`]s.
pub struct Registry {
    remote: Arc<dyn Remote>,
    subscriptions: Mutex<HashMap<SubscriptionKey, CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Registry {
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        Self {
            remote,
            subscriptions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn remote(&self) -> &Arc<dyn Remote> {
        &self.remote
    }

    /// Publishes a server node.
    ///
    /// A node left behind by a crashed process with the same address is
    /// replaced; a node owned by another address is an error.
    ///
    /// # Errors
    ///
    /// - `InvalidOption` if `opts` fail validation
    /// - `NodeExists` if another address holds the same `{group}.{index}`
    pub async fn register(
        &self,
        service: &str,
        group: &str,
        index: u32,
        addr: &str,
        opts: NodeOptions,
    ) -> Result<()> {
        opts.validate()?;
        let node = Node::new(group, index, addr, &opts);
        let data = node.encode()?;
        let branch = service_path(service, group);
        let name = node.key();

        tracing::info!(service, group, node = %name, addr, "register service node");

        match self.remote.create_node(&branch, &name, data.clone()).await {
            Ok(_) => Ok(()),
            Err(RegistryError::NodeExists(path)) => {
                let existing = self.remote.get_node(&branch, &name).await?;
                let stale = Node::decode(&path, &existing).map(|prev| prev.addr == addr);
                if !matches!(stale, Ok(true)) {
                    return Err(RegistryError::NodeExists(path));
                }

                tracing::warn!(path = %path, "found node with the same addr, replacing it");
                self.remote.delete_node(&branch, &name).await?;
                self.remote.create_node(&branch, &name, data).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn unregister(&self, service: &str, group: &str, index: u32) -> Result<()> {
        tracing::info!(service, group, index, "unregister service node");
        self.remote
            .delete_node(&service_path(service, group), &node_key(group, index))
            .await
    }

    /// Subscribes `listener` to every node of `(service, group)`.
    ///
    /// The current nodes are delivered to the listener as one
    /// [`DiscoveryEvent::Added`] before any watch event, and also returned.
    /// Records that fail to decode or whose identity disagrees with their
    /// path are skipped.
    ///
    /// # Errors
    ///
    /// `AlreadySubscribed` if `subscriber` already watches this service.
    pub async fn subscribe(
        &self,
        service: &str,
        group: &str,
        subscriber: &str,
        listener: Arc<dyn Listener>,
    ) -> Result<Vec<Node>> {
        if self.shutdown.is_cancelled() {
            return Err(RegistryError::Closed);
        }

        let key = (service.to_string(), group.to_string(), subscriber.to_string());
        let cancel = {
            let mut subscriptions = lock(&self.subscriptions);
            if subscriptions.contains_key(&key) {
                return Err(RegistryError::AlreadySubscribed {
                    service: key.0,
                    group: key.1,
                    subscriber: key.2,
                });
            }
            let cancel = self.shutdown.child_token();
            subscriptions.insert(key.clone(), cancel.clone());
            cancel
        };

        match self.start_watching(service, group, listener, cancel).await {
            Ok(nodes) => Ok(nodes),
            Err(err) => {
                if let Some(cancel) = lock(&self.subscriptions).remove(&key) {
                    cancel.cancel();
                }
                Err(err)
            }
        }
    }

    /// Stops the watches of one subscription.
    pub fn unsubscribe(&self, service: &str, group: &str, subscriber: &str) -> bool {
        let key = (service.to_string(), group.to_string(), subscriber.to_string());
        match lock(&self.subscriptions).remove(&key) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every watch loop, closes the remote and waits for the loops to exit.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("registry close");
        self.shutdown.cancel();
        lock(&self.subscriptions).clear();
        self.remote.close().await;
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn start_watching(
        &self,
        service: &str,
        group: &str,
        listener: Arc<dyn Listener>,
        cancel: CancellationToken,
    ) -> Result<Vec<Node>> {
        let branch = service_path(service, group);
        let watch = Watch {
            remote: self.remote.clone(),
            listener,
            tracker: self.tracker.clone(),
            cancel,
            watched: Arc::new(Mutex::new(HashSet::new())),
        };

        // Watch before listing: a node created in between shows up in both,
        // which the listener treats as a replacement.
        let branch_watcher = self.remote.watch_branch(&branch).await?;

        let mut nodes = Vec::new();
        let mut watchers = Vec::new();
        for (path, data) in self.remote.list_nodes(&branch).await? {
            if let Some(node) = decode_checked(&path, &data) {
                watchers.extend(watch.watch_node(&path).await);
                nodes.push(node);
            }
        }
        tracing::info!(service, group, nodes = nodes.len(), "subscribed");

        watch.listener.on_event(DiscoveryEvent::Added(nodes.clone())).await;
        watch.spawn_node_loops(watchers);

        let branch_watch = watch.clone();
        self.tracker
            .spawn(async move { branch_watch.branch_loop(branch, branch_watcher).await });

        Ok(nodes)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn decode_checked(path: &str, data: &[u8]) -> Option<Node> {
    match Node::decode(path, data) {
        Ok(node) if node.matches_path() => Some(node),
        Ok(node) => {
            tracing::warn!(path, key = %node.key(), "node id mismatch, skipping");
            None
        }
        Err(err) => {
            tracing::warn!(path, error = %err, "decode node failed, skipping");
            None
        }
    }
}

/// Shared state of the watch loops of one subscription.
#[derive(Clone)]
struct Watch {
    remote: Arc<dyn Remote>,
    listener: Arc<dyn Listener>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    /// Node paths with a running watch loop
    watched: Arc<Mutex<HashSet<String>>>,
}

impl Watch {
    /// Registers a node watch with the remote without consuming it yet.
    ///
    /// Changes made from now on queue up in the returned watcher. Its loop
    /// must only be spawned once the listener has seen the node as added,
    /// otherwise an update could overtake the add.
    async fn watch_node(&self, path: &str) -> Option<(String, NodeWatcher)> {
        if !lock(&self.watched).insert(path.to_string()) {
            return None;
        }
        match self.remote.watch_node(path).await {
            Ok(watcher) => Some((path.to_string(), watcher)),
            Err(err) => {
                lock(&self.watched).remove(path);
                tracing::warn!(path, error = %err, "watch node failed");
                None
            }
        }
    }

    fn spawn_node_loops(&self, watchers: Vec<(String, NodeWatcher)>) {
        for (path, watcher) in watchers {
            let watch = self.clone();
            self.tracker
                .spawn(async move { watch.node_loop(path, watcher).await });
        }
    }

    async fn branch_loop(self, branch: String, mut watcher: BranchWatcher) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = watcher.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!(branch = %branch, "branch watch ended");
                        break;
                    }
                },
            };

            let mut adds = Vec::new();
            let mut watchers = Vec::new();
            for (path, data) in &event.adds {
                if let Some(node) = decode_checked(path, data) {
                    watchers.extend(self.watch_node(path).await);
                    adds.push(node);
                }
            }

            let mut dels = Vec::with_capacity(event.dels.len());
            {
                let mut watched = lock(&self.watched);
                for path in &event.dels {
                    watched.remove(path);
                    dels.push(base_name(path).to_string());
                }
            }

            if !adds.is_empty() {
                self.listener.on_event(DiscoveryEvent::Added(adds)).await;
            }
            self.spawn_node_loops(watchers);
            if !dels.is_empty() {
                self.listener.on_event(DiscoveryEvent::Removed(dels)).await;
            }
        }
    }

    async fn node_loop(self, path: String, mut watcher: NodeWatcher) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = watcher.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!(path = %path, "node watch ended");
                        break;
                    }
                },
            };

            if event.path != path {
                tracing::warn!(
                    path = %path,
                    got = %event.path,
                    "node path mismatch, stop watching"
                );
                break;
            }
            let node = match Node::decode(&path, &event.data) {
                Ok(node) => node,
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "decode node failed");
                    continue;
                }
            };
            if !node.matches_path() {
                tracing::warn!(path = %path, key = %node.key(), "node id mismatch, stop watching");
                break;
            }

            self.listener.on_event(DiscoveryEvent::Updated(node)).await;
        }
    }
}

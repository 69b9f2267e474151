//! Service client: one logical service as configured by the caller.
//!
//! A [`ServiceClient`] owns the live endpoints of one `(service, group)`
//! subscription. Calls go through a per-method circuit breaker, pick an
//! endpoint (fixed index, or version filter + selector) and retry retryable
//! failures according to the [`RetryPolicy`].

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use futures::future::join_all;
use prpc_common::{PrpcError, Result};
use prpc_registry::{DiscoveryEvent, Listener, Node};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::task::TaskTracker;

use crate::breaker::{breaker_name, BreakerRegistry};
use crate::connection::ConnectionConfig;
use crate::endpoint::Endpoint;
use crate::metrics::{RequestCounters, ServiceMetrics};
use crate::options::ServiceOptions;
use crate::selector::{SelectType, Selector};

/// What to do when a call fails with a retryable error.
///
/// Only connection-level failures and timeouts are retried; selection,
/// protocol, breaker and remote handler errors end the call at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry on the endpoint chosen for the first attempt
    SameEndpoint { attempts: usize },
    /// Run endpoint selection again before every retry
    Reselect { attempts: usize },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::SameEndpoint { attempts: 3 }
    }
}

impl RetryPolicy {
    /// Total attempts, first one included. Never less than one.
    pub fn attempts(&self) -> usize {
        match *self {
            RetryPolicy::SameEndpoint { attempts } | RetryPolicy::Reselect { attempts } => {
                attempts.max(1)
            }
        }
    }
}

pub struct ServiceClient {
    service: String,
    group: String,
    options: ServiceOptions,
    fingerprint: String,
    selector: Selector,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    connection: ConnectionConfig,
    counters: RequestCounters,
    tracker: TaskTracker,
}

impl ServiceClient {
    /// Creates a service client with no endpoints.
    ///
    /// Endpoints arrive through [`Listener::on_event`] once the client is
    /// subscribed to the registry.
    pub fn new(
        service: &str,
        group: &str,
        options: ServiceOptions,
        connection: ConnectionConfig,
        retry: RetryPolicy,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let selector = Selector::new(options.select_type, options.index.map(|i| i as usize));
        Self {
            service: service.to_string(),
            group: group.to_string(),
            fingerprint: options.fingerprint(service, group),
            options,
            selector,
            endpoints: RwLock::new(Vec::new()),
            breakers,
            retry,
            connection,
            counters: RequestCounters::default(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Identity of this configuration; equal for equal `(service, group, options)`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Endpoint>>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current endpoints, in arrival order.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.read().clone()
    }

    /// Calls `method` of this service.
    ///
    /// # Errors
    ///
    /// - `CircuitOpen` / `MaxConcurrency` if the breaker refused the call
    /// - `IndexNotFound` / `NoAvailableServers` if no endpoint qualifies
    /// - the last attempt's error if every attempt failed
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let breaker = self
            .breakers
            .get(&breaker_name(&self.group, &self.service, method));
        let result = breaker.execute(|| self.do_call(method, args)).await;

        self.counters.record(&result);
        if let Err(err) = &result {
            tracing::debug!(
                service = %self.service,
                group = %self.group,
                method,
                error = %err,
                "call failed"
            );
        }
        result
    }

    /// Issues the call in the background; `callback` gets `args` back along
    /// with the result, exactly once.
    pub fn go<A, R, F>(self: &Arc<Self>, method: &str, args: A, callback: F)
    where
        A: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
        F: FnOnce(A, Result<R>) + Send + 'static,
    {
        let client = self.clone();
        let method = method.to_string();
        self.tracker.spawn(async move {
            let result = client.call(&method, &args).await;
            callback(args, result);
        });
    }

    async fn do_call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let service_method = format!("{}.{}", self.service, method);
        let attempts = self.retry.attempts();
        let mut endpoint = self.pick()?;
        let mut attempt = 1;

        loop {
            match endpoint.call(&service_method, args).await {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        method = %service_method,
                        addr = endpoint.addr(),
                        attempt,
                        error = %err,
                        "call failed, retrying"
                    );
                    attempt += 1;
                    if let RetryPolicy::Reselect { .. } = self.retry {
                        endpoint = self.pick()?;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Chooses the endpoint for one attempt.
    ///
    /// A configured index (outside [`SelectType::Specified`], where it is the
    /// selector's position) pins the call to the endpoint with that node
    /// index; it must also pass the version filter.
    pub fn pick(&self) -> Result<Arc<Endpoint>> {
        let endpoints = self.read();
        let version = &self.options.version;

        if let Some(index) = self.options.index {
            if self.options.select_type != SelectType::Specified {
                return endpoints
                    .iter()
                    .find(|ep| ep.index() == index && version.matches(&ep.version()))
                    .cloned()
                    .ok_or(PrpcError::IndexNotFound(i64::from(index)));
            }
        }

        let candidates: Vec<Arc<Endpoint>> = endpoints
            .iter()
            .filter(|ep| version.matches(&ep.version()) && !ep.conn().is_shutdown())
            .cloned()
            .collect();
        self.selector
            .select(&candidates)
            .cloned()
            .ok_or(PrpcError::NoAvailableServers)
    }

    /// Dials and adds endpoints for `nodes`.
    ///
    /// A node whose key is already present replaces the old endpoint, unless
    /// it is the same server, in which case only its mutable fields are
    /// applied. Nodes that cannot be dialed are skipped.
    pub async fn add_endpoints(&self, nodes: Vec<Node>) {
        let mut to_dial = Vec::new();
        for node in nodes {
            match self.find(&node.path) {
                Some(existing) if existing.is_same_server(&node) => {
                    if existing.update(&node) {
                        tracing::info!(key = %node.path, "endpoint re-added, updated in place");
                    }
                }
                _ => to_dial.push(node),
            }
        }

        let dials = to_dial
            .iter()
            .map(|node| Endpoint::connect(node, &self.connection));
        let dialed = join_all(dials).await;

        let mut replaced = Vec::new();
        for (node, result) in to_dial.iter().zip(dialed) {
            let endpoint = match result {
                Ok(endpoint) => Arc::new(endpoint),
                Err(err) => {
                    tracing::warn!(
                        key = %node.path,
                        addr = %node.addr,
                        error = %err,
                        "dial endpoint failed, skipping"
                    );
                    continue;
                }
            };

            let total = {
                let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
                if let Some(pos) = endpoints.iter().position(|ep| ep.key() == endpoint.key()) {
                    replaced.push(endpoints.remove(pos));
                }
                endpoints.push(endpoint.clone());
                endpoints.len()
            };
            tracing::info!(
                service = %self.service,
                key = endpoint.key(),
                addr = endpoint.addr(),
                total,
                "add endpoint"
            );
        }

        for old in replaced {
            old.close().await;
        }
    }

    /// Removes and closes the endpoints named by `names` (`{group}.{index}`).
    pub async fn remove_endpoints(&self, names: &[String]) {
        let (removed, total) = {
            let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            let mut removed = Vec::new();
            endpoints.retain(|ep| {
                if names.iter().any(|name| name == ep.name()) {
                    removed.push(ep.clone());
                    false
                } else {
                    true
                }
            });
            (removed, endpoints.len())
        };

        for endpoint in removed {
            tracing::info!(
                service = %self.service,
                key = endpoint.key(),
                total,
                "delete endpoint"
            );
            endpoint.close().await;
        }
    }

    /// Applies weight/version changes of an existing node.
    pub fn update_endpoint(&self, node: &Node) {
        match self.find(&node.path) {
            Some(endpoint) => {
                if endpoint.update(node) {
                    tracing::info!(
                        key = %node.path,
                        weight = node.weight,
                        version = %node.version,
                        "update endpoint"
                    );
                }
            }
            None => {
                tracing::warn!(key = %node.path, "node updated, found no corresponding endpoint");
            }
        }
    }

    fn find(&self, key: &str) -> Option<Arc<Endpoint>> {
        self.read().iter().find(|ep| ep.key() == key).cloned()
    }

    pub fn metrics(&self) -> ServiceMetrics {
        let endpoints = self.read().iter().map(|ep| ep.metrics()).collect();
        self.counters.snapshot(&self.service, &self.group, endpoints)
    }

    /// Waits for background calls, then closes every endpoint.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;

        let endpoints = std::mem::take(
            &mut *self.endpoints.write().unwrap_or_else(PoisonError::into_inner),
        );
        for endpoint in endpoints {
            endpoint.close().await;
        }
    }
}

#[async_trait]
impl Listener for ServiceClient {
    async fn on_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added(nodes) => self.add_endpoints(nodes).await,
            DiscoveryEvent::Removed(names) => self.remove_endpoints(&names).await,
            DiscoveryEvent::Updated(node) => self.update_endpoint(&node),
        }
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service)
            .field("group", &self.group)
            .field("options", &self.options)
            .field("endpoints", &self.read().len())
            .finish()
    }
}

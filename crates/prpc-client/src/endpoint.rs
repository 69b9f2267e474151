use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use prpc_common::{Codec, Result, SerializeType};
use prpc_registry::node::base_name;
use prpc_registry::Node;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::{ConnectionConfig, RpcClient};
use crate::metrics::EndpointMetrics;
use crate::selector::Weighted;

/// Fields the registry may change in place.
#[derive(Debug, Clone)]
struct Mutable {
    weight: u32,
    version: String,
}

/// One server instance backing a service, with its own connection.
///
/// Address and serialization type are fixed for the endpoint's lifetime; a
/// server changing them is seen as removed and re-added.
pub struct Endpoint {
    key: String,
    index: u32,
    addr: String,
    serialize_type: SerializeType,
    mutable: RwLock<Mutable>,
    conn: RpcClient,
    call_count: AtomicU64,
}

impl Endpoint {
    /// Dials the node and wraps the connection.
    pub async fn connect(node: &Node, config: &ConnectionConfig) -> Result<Self> {
        let codec = Codec::for_type(node.serialize_type)?;
        let conn = RpcClient::dial(&node.addr, codec, config.clone()).await?;
        Ok(Self::with_conn(node, conn))
    }

    pub fn with_conn(node: &Node, conn: RpcClient) -> Self {
        Self {
            key: node.path.clone(),
            index: node.index,
            addr: node.addr.clone(),
            serialize_type: node.serialize_type,
            mutable: RwLock::new(Mutable {
                weight: node.weight,
                version: node.version.clone(),
            }),
            conn,
            call_count: AtomicU64::new(0),
        }
    }

    /// Registry path of the node.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `{group}.{index}`, as carried by removal events.
    pub fn name(&self) -> &str {
        base_name(&self.key)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn serialize_type(&self) -> SerializeType {
        self.serialize_type
    }

    pub fn version(&self) -> String {
        self.read().version.clone()
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn conn(&self) -> &RpcClient {
        &self.conn
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Mutable> {
        self.mutable.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `node` describes the same physical server.
    pub fn is_same_server(&self, node: &Node) -> bool {
        self.addr == node.addr && self.serialize_type == node.serialize_type
    }

    /// Applies the mutable fields of `node`. Returns whether anything changed.
    pub fn update(&self, node: &Node) -> bool {
        let mut mutable = self.mutable.write().unwrap_or_else(PoisonError::into_inner);
        if mutable.weight == node.weight && mutable.version == node.version {
            return false;
        }
        mutable.weight = node.weight;
        mutable.version = node.version.clone();
        true
    }

    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.conn.call(service_method, args).await
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    pub fn metrics(&self) -> EndpointMetrics {
        let mutable = self.read();
        EndpointMetrics {
            key: self.key.clone(),
            index: self.index,
            addr: self.addr.clone(),
            weight: mutable.weight,
            version: mutable.version.clone(),
            call_count: self.call_count(),
        }
    }
}

impl Weighted for Endpoint {
    fn weight(&self) -> u32 {
        self.read().weight
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mutable = self.read();
        f.debug_struct("Endpoint")
            .field("key", &self.key)
            .field("addr", &self.addr)
            .field("weight", &mutable.weight)
            .field("version", &mutable.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prpc_registry::NodeOptions;

    fn endpoint(node: &Node) -> Endpoint {
        let (client_side, _server_side) = tokio::io::duplex(1024);
        let config = ConnectionConfig::default();
        let conn = RpcClient::from_stream(client_side, &node.addr, Codec::MsgPack, config);
        Endpoint::with_conn(node, conn)
    }

    fn node(weight: u32, version: &str) -> Node {
        let mut node = Node::new(
            "zone1",
            1,
            "127.0.0.1:9000",
            &NodeOptions::default().with_weight(weight).with_version(version),
        );
        node.path = "/__PRPC__/Arith@zone1/zone1.1".to_string();
        node
    }

    #[tokio::test]
    async fn test_update_only_touches_mutable_fields() {
        let ep = endpoint(&node(10, "v1.0"));
        assert_eq!(ep.name(), "zone1.1");
        assert!(!ep.update(&node(10, "v1.0")));

        let mut changed = node(40, "v1.1");
        changed.addr = "10.0.0.1:1".to_string();
        assert!(ep.update(&changed));
        assert_eq!(ep.weight(), 40);
        assert_eq!(ep.version(), "v1.1");
        assert_eq!(ep.addr(), "127.0.0.1:9000");
        assert!(!ep.is_same_server(&changed));
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let ep = endpoint(&node(7, "v2"));
        let metrics = ep.metrics();
        assert_eq!(metrics.key, "/__PRPC__/Arith@zone1/zone1.1");
        assert_eq!(metrics.weight, 7);
        assert_eq!(metrics.version, "v2");
        assert_eq!(metrics.call_count, 0);
    }
}

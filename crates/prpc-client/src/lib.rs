//! prpc Client
//!
//! Layers, bottom up:
//!
//! - [`connection`] - [`RpcClient`], one multiplexed connection to one server
//! - [`selector`] - endpoint selection policies
//! - [`breaker`] - per-method circuit breakers
//! - [`endpoint`] - a server instance with its connection
//! - [`service`] - [`ServiceClient`], the endpoints of one subscribed service
//! - [`client`] - [`Client`], deduplicated service clients over a registry
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use prpc_client::{Client, ClientConfig, SelectType, ServiceOption};
//! use prpc_registry::{MemoryRemote, Registry};
//!
//! # async fn run() -> prpc_common::Result<()> {
//! let registry = Arc::new(Registry::new(Arc::new(MemoryRemote::new())));
//! let client = Client::new(registry, ClientConfig::default());
//!
//! let arith = client
//!     .service("Arith", "zone1", [ServiceOption::SelectType(SelectType::RoundRobin)])
//!     .await?;
//! let product: i64 = arith.call("Multiply", &(2, 3)).await?;
//! assert_eq!(product, 6);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod client;
pub mod connection;
pub mod endpoint;
pub mod metrics;
pub mod options;
pub mod selector;
pub mod service;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use client::{Client, ClientConfig};
pub use connection::{ConnectionConfig, RpcClient};
pub use endpoint::Endpoint;
pub use metrics::{EndpointMetrics, ServiceMetrics};
pub use options::{ServiceOption, ServiceOptions, VersionFilter};
pub use selector::{SelectType, Selector, Weighted};
pub use service::{RetryPolicy, ServiceClient};

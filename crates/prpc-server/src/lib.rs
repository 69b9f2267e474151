//! prpc Server
//!
//! Serves explicitly registered `"Service.Method"` handlers over the prpc
//! wire protocol and publishes every served service to a [`Registry`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use prpc_registry::{MemoryRemote, Registry};
//! use prpc_server::{Server, ServerConfig};
//!
//! # async fn run() -> prpc_common::Result<()> {
//! let registry = Arc::new(Registry::new(Arc::new(MemoryRemote::new())));
//! let server = Server::new(ServerConfig::default())?;
//! server.handle("Arith", "Multiply", |(a, b): (i64, i64)| async move { Ok(a * b) })?;
//! let addr = server.serve("127.0.0.1:0", registry).await?;
//! println!("serving on {}", addr);
//! # server.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`Registry`]: prpc_registry::Registry

pub mod router;
pub mod server;

pub use router::Router;
pub use server::{Server, ServerConfig};

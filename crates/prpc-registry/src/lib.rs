//! prpc Service Registry
//!
//! Servers publish one node record per instance; clients subscribe to a
//! `(service, group)` and are kept up to date through two kinds of watch:
//!
//! - a **branch watch** on the service directory, reporting nodes added or removed
//! - a **node watch** per node, reporting in-place weight/version changes
//!
//! The coordination store itself sits behind the [`Remote`] trait.
//! [`MemoryRemote`] is an in-process implementation used by tests and
//! single-process setups.

pub mod error;
pub mod memory;
pub mod node;
pub mod registry;
pub mod remote;

pub use error::{RegistryError, Result};
pub use memory::MemoryRemote;
pub use node::{Node, NodeOptions, DEFAULT_GROUP, DEFAULT_VERSION};
pub use registry::{DiscoveryEvent, Listener, Registry};
pub use remote::{BranchEvent, NodeEvent, Remote};

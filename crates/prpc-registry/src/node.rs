//! Registry node records and path layout.
//!
//! Every server instance is stored as one JSON document at
//!
//! ```text
//! /__PRPC__/{service}@{group}/{group}.{index}
//! ```
//!
//! The base name `{group}.{index}` doubles as the node's identity; a record
//! whose own `group`/`index` disagree with its path is considered corrupt.

use prpc_common::SerializeType;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

pub const ROOT_PATH: &str = "/__PRPC__";
pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_VERSION: &str = "v1.0";
pub const DEFAULT_WEIGHT: u32 = 10;
pub const MAX_WEIGHT: u32 = 10_000;

/// One registered server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub group: String,
    pub index: u32,
    /// `ip:port`
    pub addr: String,
    pub weight: u32,
    #[serde(rename = "styp")]
    pub serialize_type: SerializeType,
    pub version: String,

    /// Registry path the record was read from; not part of the stored document.
    #[serde(skip)]
    pub path: String,
}

impl Node {
    pub fn new(group: &str, index: u32, addr: &str, opts: &NodeOptions) -> Self {
        Self {
            group: group.to_string(),
            index,
            addr: addr.to_string(),
            weight: opts.weight,
            serialize_type: opts.serialize_type,
            version: opts.version.clone(),
            path: String::new(),
        }
    }

    /// Identity of the node within its service directory: `{group}.{index}`.
    pub fn key(&self) -> String {
        node_key(&self.group, self.index)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a record and remembers where it came from.
    pub fn decode(path: &str, data: &[u8]) -> Result<Self> {
        let mut node: Node = serde_json::from_slice(data)?;
        node.path = path.to_string();
        Ok(node)
    }

    /// Whether the record's own identity agrees with its path.
    pub fn matches_path(&self) -> bool {
        base_name(&self.path) == self.key()
    }
}

/// Options a server publishes with its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    /// Relative traffic share, 1..=10000
    pub weight: u32,
    pub serialize_type: SerializeType,
    /// Version tag clients may filter on
    pub version: String,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            weight: DEFAULT_WEIGHT,
            serialize_type: SerializeType::MsgPack,
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

impl NodeOptions {
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_serialize_type(mut self, serialize_type: SerializeType) -> Self {
        self.serialize_type = serialize_type;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.weight == 0 || self.weight > MAX_WEIGHT {
            return Err(RegistryError::InvalidOption(format!(
                "weight {} out of range 1..={}",
                self.weight, MAX_WEIGHT
            )));
        }
        if self.serialize_type == SerializeType::None {
            return Err(RegistryError::InvalidOption(
                "serialize type must be set".to_string(),
            ));
        }
        if self.version.is_empty() {
            return Err(RegistryError::InvalidOption("empty version".to_string()));
        }
        Ok(())
    }
}

/// Directory holding every node of `service` in `group`.
pub fn service_path(service: &str, group: &str) -> String {
    format!("{}/{}@{}", ROOT_PATH, service, group)
}

pub fn node_key(group: &str, index: u32) -> String {
    format!("{}.{}", group, index)
}

pub fn node_path(service: &str, group: &str, index: u32) -> String {
    format!("{}/{}", service_path(service, group), node_key(group, index))
}

/// Last path segment.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(service_path("Arith", "zone1"), "/__PRPC__/Arith@zone1");
        assert_eq!(node_path("Arith", "zone1", 3), "/__PRPC__/Arith@zone1/zone1.3");
        assert_eq!(base_name("/__PRPC__/Arith@zone1/zone1.3"), "zone1.3");
        assert_eq!(base_name("zone1.3"), "zone1.3");
    }

    #[test]
    fn test_record_format() {
        let node = Node::new("zone1", 1, "127.0.0.1:9000", &NodeOptions::default());
        let json: serde_json::Value = serde_json::from_slice(&node.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "group": "zone1",
                "index": 1,
                "addr": "127.0.0.1:9000",
                "weight": 10,
                "styp": 1,
                "version": "v1.0"
            })
        );
    }

    #[test]
    fn test_decode_keeps_path() {
        let data = br#"{"group":"g","index":2,"addr":"a:1","weight":5,"styp":2,"version":"v2"}"#;
        let node = Node::decode("/__PRPC__/S@g/g.2", data).unwrap();
        assert_eq!(node.serialize_type, SerializeType::Json);
        assert_eq!(node.path, "/__PRPC__/S@g/g.2");
        assert!(node.matches_path());

        let moved = Node::decode("/__PRPC__/S@g/g.7", data).unwrap();
        assert!(!moved.matches_path());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Node::decode("/x", b"not json"),
            Err(RegistryError::Decode(_))
        ));
    }

    #[test]
    fn test_options_validation() {
        assert!(NodeOptions::default().validate().is_ok());
        assert!(NodeOptions::default().with_weight(0).validate().is_err());
        assert!(NodeOptions::default()
            .with_weight(MAX_WEIGHT + 1)
            .validate()
            .is_err());
        assert!(NodeOptions::default()
            .with_serialize_type(SerializeType::None)
            .validate()
            .is_err());
        assert!(NodeOptions::default().with_version("").validate().is_err());
    }
}

use prpc_common::{PrpcError, Result};
use prpc_registry::DEFAULT_VERSION;
use sha2::{Digest, Sha256};

use crate::selector::SelectType;

/// Version string that selects every version.
pub const VERSION_ALL: &str = "all";

/// Which endpoint versions a service client may call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionFilter {
    Only(String),
    All,
}

impl VersionFilter {
    pub fn matches(&self, version: &str) -> bool {
        match self {
            VersionFilter::Only(wanted) => wanted == version,
            VersionFilter::All => true,
        }
    }

    fn as_str(&self) -> &str {
        match self {
            VersionFilter::Only(version) => version,
            VersionFilter::All => VERSION_ALL,
        }
    }
}

/// One service client option. Options are applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOption {
    /// Only call endpoints with this version; `"all"` disables the filter
    Version(String),
    /// Call endpoints of any version
    VersionAll,
    /// Pin calls to the endpoint with this node index
    Index(i64),
    SelectType(SelectType),
}

/// Resolved service client options.
///
/// # Default Configuration
///
/// - `version`: only `v1.0`
/// - `index`: none
/// - `select_type`: weighted random
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub version: VersionFilter,
    pub index: Option<u32>,
    pub select_type: SelectType,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            version: VersionFilter::Only(DEFAULT_VERSION.to_string()),
            index: None,
            select_type: SelectType::WeightedRandom,
        }
    }
}

impl ServiceOptions {
    /// Applies `options` over the defaults.
    ///
    /// # Errors
    ///
    /// `InvalidOption` for an empty version, a negative or oversized index, or
    /// [`SelectType::Specified`] without an index.
    pub fn resolve<I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = ServiceOption>,
    {
        let mut resolved = Self::default();
        for option in options {
            resolved.apply(option)?;
        }
        if resolved.select_type == SelectType::Specified && resolved.index.is_none() {
            return Err(PrpcError::InvalidOption(
                "specified selection requires an index".to_string(),
            ));
        }
        Ok(resolved)
    }

    fn apply(&mut self, option: ServiceOption) -> Result<()> {
        match option {
            ServiceOption::Version(version) if version.is_empty() => {
                return Err(PrpcError::InvalidOption("empty version".to_string()));
            }
            ServiceOption::Version(version) if version == VERSION_ALL => {
                self.version = VersionFilter::All;
            }
            ServiceOption::Version(version) => self.version = VersionFilter::Only(version),
            ServiceOption::VersionAll => self.version = VersionFilter::All,
            ServiceOption::Index(index) => {
                let index = u32::try_from(index).map_err(|_| {
                    PrpcError::InvalidOption(format!("index {} out of range", index))
                })?;
                self.index = Some(index);
            }
            ServiceOption::SelectType(select_type) => self.select_type = select_type,
        }
        Ok(())
    }

    /// Stable fingerprint of `(service, group)` plus these options.
    ///
    /// Equal inputs always give the same value; any differing field gives a
    /// different one.
    pub fn fingerprint(&self, service: &str, group: &str) -> String {
        let mut hasher = Sha256::new();
        let index = self.index.map(i64::from).unwrap_or(-1);
        hasher.update(index.to_le_bytes());
        hasher.update(self.select_type.code().to_le_bytes());
        for part in [service, group, self.version.as_str()] {
            // Length prefix keeps ("ab", "c") apart from ("a", "bc").
            hasher.update((part.len() as u32).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

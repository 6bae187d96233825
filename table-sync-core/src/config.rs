use tracing::{debug, info};

/// Partition used for records whose file does not set `PartitionKey`.
pub const DEFAULT_PARTITION_KEY: &str = "pkey";

/// Fields consulted, in order, when a file has no explicit `RowKey`.
pub const DEFAULT_ROW_KEY_FALLBACKS: [&str; 2] = ["prefix", "id"];

/// Identity rules applied to every parsed record and to every lookup that
/// omits a partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub default_partition_key: String,
    pub row_key_fallbacks: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            default_partition_key: DEFAULT_PARTITION_KEY.to_string(),
            row_key_fallbacks: DEFAULT_ROW_KEY_FALLBACKS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

impl IdentityConfig {
    /// Default fallbacks, custom partition.
    pub fn with_default_partition_key(partition_key: impl Into<String>) -> Self {
        IdentityConfig {
            default_partition_key: partition_key.into(),
            ..Default::default()
        }
    }

    /// Resolves an optional caller-supplied partition key against the default.
    pub fn partition_key_or_default<'a>(&'a self, partition_key: Option<&'a str>) -> &'a str {
        partition_key.unwrap_or(&self.default_partition_key)
    }

    pub fn trace_loaded(&self) {
        info!(
            default_partition_key = %self.default_partition_key,
            row_key_fallbacks = ?self.row_key_fallbacks,
            "Loaded IdentityConfig"
        );
        debug!(?self, "IdentityConfig loaded (full debug)");
    }
}

//! Server configuration.

use std::path::PathBuf;

/// Everything the response builder is parameterized by.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Dataset name (usually a file path; may be a virtual name).
    pub dataset: String,
    /// Per-response wall-clock limit in seconds; zero disables it.
    pub timeout_seconds: u32,
    /// Largest allowed projected response in bytes; zero means unbounded.
    pub response_limit: u64,
    /// Protocol version advertised in the `XDAP` header.
    pub default_protocol: String,
    /// Where function results are cached.
    pub cache_root: PathBuf,
    /// File-name prefix for cache entries.
    pub cache_prefix: String,
    /// Cache size budget in bytes; zero disables caching entirely.
    pub cache_max_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            timeout_seconds: 0,
            response_limit: 0,
            default_protocol: "3.2".to_owned(),
            cache_root: PathBuf::from("/tmp/dap_functions_cache"),
            cache_prefix: "f".to_owned(),
            cache_max_bytes: 1 << 22,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.default_protocol, "3.2");
        assert_eq!(config.timeout_seconds, 0);
        assert_eq!(config.cache_max_bytes, 1 << 22);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::node_pool::NodeEndpoint;

pub const HEAVY_METHODS: &[&str] = &["eth_sendRawTransaction", "eth_sendTransaction"];

/// Full policy tree consumed by the gateway core.
///
/// Every level deserializes with defaults so a JSON config file only needs to name the
/// values it changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub node_selection: NodeSelectionConfig,
    pub discovery: DiscoveryConfig,
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub admission: AdmissionConfig,
    pub block_cache: BlockCacheConfig,
    pub recorder: RecorderConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeSelectionConfig {
    pub use_static_node: bool,
    pub static_node: Option<NodeEndpoint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub archivers: Vec<String>,
    pub refresh_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    pub bootstrap_retry_delay_ms: u64,
    /// Contact every listed node and keep only those reporting an active status.
    pub probe_liveness: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            archivers: vec!["http://127.0.0.1:4000".to_string()],
            refresh_interval_secs: 60,
            health_check_timeout_ms: 2_000,
            bootstrap_retry_delay_ms: 1_000,
            probe_liveness: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub default_timeout_ms: u64,
    /// Timeouts keyed by route key (`/inject`, `/contract/call`, ...).
    pub route_timeouts_ms: HashMap<String, u64>,
    /// Negative means retry forever.
    pub max_retries: i32,
    pub penalized_routes: Vec<String>,
    pub bad_node_ttl_ms: u64,
    pub max_select_attempts: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        let route_timeouts_ms = [
            ("/inject", 10_000),
            ("/contract/call", 10_000),
            ("/contract/estimateGas", 10_000),
            ("/contract/accesslist", 10_000),
        ]
        .into_iter()
        .map(|(route, ms)| (route.to_string(), ms))
        .collect();

        Self {
            default_timeout_ms: 3_000,
            route_timeouts_ms,
            max_retries: 3,
            penalized_routes: vec![
                "/inject".to_string(),
                "/eth_blockNumber".to_string(),
                "/tx".to_string(),
            ],
            bad_node_ttl_ms: 3 * 60 * 1_000,
            max_select_attempts: 10,
            backoff_min_ms: 50,
            backoff_max_ms: 250,
            connect_timeout_ms: 2_000,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout_for(&self, route_key: &str) -> Duration {
        let ms = self
            .route_timeouts_ms
            .get(route_key)
            .copied()
            .unwrap_or(self.default_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn is_penalized(&self, route_key: &str) -> bool {
        self.penalized_routes.iter().any(|r| r == route_key)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub allowed_ips: Vec<String>,
    pub heavy_methods: Vec<String>,
    pub window_ms: u64,
    pub heavy_soft_ceiling: usize,
    pub heavy_hard_ceiling: usize,
    pub address_ceiling: usize,
    pub limit_from_address: bool,
    pub limit_to_address: bool,
    pub allowed_tx_count_in_interval: u64,
    pub spam_sweep_interval_secs: u64,
    pub ban_duration_ms: u64,
    pub ban_expiry_sweep_interval_secs: u64,
    pub soft_reject: bool,
    pub soft_reject_min_ms: u64,
    pub soft_reject_max_ms: u64,
    pub exempt_account_types: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_ips: vec!["127.0.0.1".to_string()],
            heavy_methods: HEAVY_METHODS.iter().map(|m| m.to_string()).collect(),
            window_ms: 60_000,
            heavy_soft_ceiling: 20,
            heavy_hard_ceiling: 61,
            address_ceiling: 10,
            limit_from_address: true,
            limit_to_address: true,
            allowed_tx_count_in_interval: 10,
            spam_sweep_interval_secs: 3 * 60,
            ban_duration_ms: 60 * 60 * 1_000,
            ban_expiry_sweep_interval_secs: 60 * 60,
            soft_reject: false,
            soft_reject_min_ms: 1_000,
            soft_reject_max_ms: 5_000,
            exempt_account_types: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdmissionConfig {
    pub nonce_validation: bool,
    pub adaptive_rejection: bool,
    pub drain_pause_ms: u64,
    pub max_backlog_per_sender: usize,
    pub backlog_ttl_secs: u64,
    pub backlog_sweep_interval_secs: u64,
    pub receipt_poll_attempts: u32,
    pub receipt_poll_interval_ms: u64,
    pub gas_estimate_ttl_secs: u64,
    pub gas_estimate_max_entries: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            nonce_validation: true,
            adaptive_rejection: true,
            drain_pause_ms: 100,
            max_backlog_per_sender: 64,
            backlog_ttl_secs: 10 * 60,
            backlog_sweep_interval_secs: 60,
            receipt_poll_attempts: 5,
            receipt_poll_interval_ms: 2_000,
            gas_estimate_ttl_secs: 5 * 60,
            gas_estimate_max_entries: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlockCacheConfig {
    /// `N`: latest blocks kept warm by the poller.
    pub recent_blocks: u64,
    /// `M`: an index that reaches this size evicts its oldest block.
    pub max_entries: usize,
    pub poll_interval_ms: u64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            recent_blocks: 10,
            max_entries: 1_000,
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecorderConfig {
    pub flush_threshold: usize,
    pub flush_interval_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1_000,
            flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingStaticNode,
    NoArchivers,
    InvalidArchiverUrl { url: String },
    ZeroCacheCeiling,
    InvertedRange { field: &'static str, min: u64, max: u64 },
    CeilingOrder { soft: usize, hard: usize },
    ZeroWindow,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingStaticNode => {
                write!(f, "useStaticNode is set but no staticNode is configured")
            }
            ConfigError::NoArchivers => {
                write!(f, "at least one discovery archiver URL is required")
            }
            ConfigError::InvalidArchiverUrl { url } => {
                write!(f, "invalid archiver URL: {}", url)
            }
            ConfigError::ZeroCacheCeiling => {
                write!(f, "blockCache.maxEntries must be > 0")
            }
            ConfigError::InvertedRange { field, min, max } => {
                write!(f, "{} range is inverted: min {} > max {}", field, min, max)
            }
            ConfigError::CeilingOrder { soft, hard } => {
                write!(
                    f,
                    "heavySoftCeiling ({}) must be below heavyHardCeiling ({})",
                    soft, hard
                )
            }
            ConfigError::ZeroWindow => write!(f, "rateLimit.windowMs must be > 0"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_selection.use_static_node {
            if self.node_selection.static_node.is_none() {
                return Err(ConfigError::MissingStaticNode);
            }
        } else {
            if self.discovery.archivers.is_empty() {
                return Err(ConfigError::NoArchivers);
            }
            for url in &self.discovery.archivers {
                if reqwest::Url::parse(url).is_err() {
                    return Err(ConfigError::InvalidArchiverUrl { url: url.clone() });
                }
            }
        }
        if self.block_cache.max_entries == 0 {
            return Err(ConfigError::ZeroCacheCeiling);
        }
        if self.upstream.backoff_min_ms > self.upstream.backoff_max_ms {
            return Err(ConfigError::InvertedRange {
                field: "upstream.backoff",
                min: self.upstream.backoff_min_ms,
                max: self.upstream.backoff_max_ms,
            });
        }
        if self.rate_limit.soft_reject_min_ms > self.rate_limit.soft_reject_max_ms {
            return Err(ConfigError::InvertedRange {
                field: "rateLimit.softReject",
                min: self.rate_limit.soft_reject_min_ms,
                max: self.rate_limit.soft_reject_max_ms,
            });
        }
        if self.rate_limit.heavy_soft_ceiling >= self.rate_limit.heavy_hard_ceiling {
            return Err(ConfigError::CeilingOrder {
                soft: self.rate_limit.heavy_soft_ceiling,
                hard: self.rate_limit.heavy_hard_ceiling,
            });
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn static_mode_requires_a_node() {
        let mut config = GatewayConfig::default();
        config.node_selection.use_static_node = true;
        assert_eq!(config.validate(), Err(ConfigError::MissingStaticNode));

        config.node_selection.static_node = Some(NodeEndpoint::new("10.0.0.1", 9001));
        config.discovery.archivers.clear();
        assert!(config.validate().is_ok(), "static mode needs no archivers");
    }

    #[test]
    fn dynamic_mode_rejects_bad_archiver_urls() {
        let mut config = GatewayConfig::default();
        config.discovery.archivers = vec!["not a url".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidArchiverUrl { .. })
        ));
    }

    #[test]
    fn soft_ceiling_must_stay_below_hard_ceiling() {
        let mut config = GatewayConfig::default();
        config.rate_limit.heavy_soft_ceiling = 61;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CeilingOrder { soft: 61, hard: 61 })
        ));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"rateLimit": {"heavySoftCeiling": 5}, "blockCache": {"maxEntries": 8}}"#,
        )
        .expect("parse partial config");
        assert_eq!(config.rate_limit.heavy_soft_ceiling, 5);
        assert_eq!(config.rate_limit.heavy_hard_ceiling, 61);
        assert_eq!(config.block_cache.max_entries, 8);
        assert_eq!(config.upstream.max_retries, 3);
    }

    #[test]
    fn route_timeouts_fall_back_to_default() {
        let upstream = UpstreamConfig::default();
        assert_eq!(upstream.timeout_for("/inject"), Duration::from_secs(10));
        assert_eq!(upstream.timeout_for("/account"), Duration::from_secs(3));
        assert!(upstream.is_penalized("/tx"));
        assert!(!upstream.is_penalized("/account"));
    }
}

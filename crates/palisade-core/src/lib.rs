mod abuse;
mod admission;
mod ban_store;
mod block_cache;
mod config;
mod discovery;
mod gas_cache;
mod node_pool;
mod recorder;
mod tx;
mod upstream;

pub use abuse::{AbuseGuard, Admission, ExemptionCheck, NoExemptions, SweepReport};
pub use admission::{
    AdmissionError, InjectOutcome, SubmitOutcome, TxAdmission, TxForwarder,
};
pub use ban_store::{BanRecord, BanStore, BanStoreError};
pub use block_cache::{canonical_hash, canonical_number, BlockCache, BlockLookup, CachedBlock};
pub use config::{
    AdmissionConfig, BlockCacheConfig, ConfigError, DiscoveryConfig, GatewayConfig,
    NodeSelectionConfig, RateLimitConfig, RecorderConfig, UpstreamConfig, HEAVY_METHODS,
};
pub use discovery::{rewrite_loopback, ArchiverStat, Discovery, DiscoveryError};
pub use gas_cache::{function_selector, GasEstimateCache};
pub use node_pool::{NodeEndpoint, NodePool};
pub use recorder::{
    spawn_flush_loop, PerfRecorder, PerfSample, StatusSink, TxStatus, TxStatusRecorder,
};
pub use tx::{decode_raw_transaction, DecodedTx, GatewayTx, InternalTx, TxDecodeError};
pub use upstream::{
    parse_quantity, route_key, Method, UpstreamClient, UpstreamRequest, UpstreamResponse,
};

/// Milliseconds since the Unix epoch; every policy window in the crate is expressed in it.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

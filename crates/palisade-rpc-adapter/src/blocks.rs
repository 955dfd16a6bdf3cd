use palisade_core::{BlockCache, BlockCacheConfig, BlockLookup, UpstreamClient};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Validator query parameter for a lookup.
fn block_param(lookup: &BlockLookup) -> String {
    match lookup {
        BlockLookup::Hash(h) | BlockLookup::Number(h) => h.clone(),
        BlockLookup::Earliest => "earliest".to_string(),
        BlockLookup::Latest => "latest".to_string(),
    }
}

/// Read a block through the cache, fetching from the pool on a miss.
pub async fn cached_block(
    cache: &Arc<BlockCache>,
    upstream: &Arc<UpstreamClient>,
    lookup: BlockLookup,
) -> Option<Value> {
    let upstream = Arc::clone(upstream);
    let param = block_param(&lookup);
    let by_hash = matches!(lookup, BlockLookup::Hash(_));
    cache
        .get_or_fetch(lookup, move || async move {
            if by_hash {
                upstream.block_by_hash(&param).await
            } else {
                upstream.block_by_number(&param).await
            }
        })
        .await
}

/// Hash of block `number`, from the cache when present.
pub async fn block_hash(
    cache: &Arc<BlockCache>,
    upstream: &Arc<UpstreamClient>,
    number: u64,
) -> Option<String> {
    if let Some(hash) = cache.hash_for_number(number) {
        return Some(hash);
    }
    let block = cached_block(cache, upstream, BlockLookup::Number(format!("0x{:x}", number))).await?;
    block.get("hash").and_then(Value::as_str).map(ToOwned::to_owned)
}

/// Keeps the latest block number current and the newest blocks warm in the cache.
pub struct BlockPoller {
    cache: Arc<BlockCache>,
    upstream: Arc<UpstreamClient>,
    latest: Arc<AtomicU64>,
    config: BlockCacheConfig,
}

impl BlockPoller {
    pub fn new(
        cache: Arc<BlockCache>,
        upstream: Arc<UpstreamClient>,
        latest: Arc<AtomicU64>,
        config: BlockCacheConfig,
    ) -> Self {
        Self {
            cache,
            upstream,
            latest,
            config,
        }
    }

    /// One poll. Returns how many blocks were newly warmed.
    pub async fn poll_once(&self) -> Result<u64, String> {
        let head = self
            .upstream
            .block_number()
            .await
            .ok_or("eth_blockNumber: no node answered")?;
        let previous = self.latest.fetch_max(head, Ordering::AcqRel);
        if head <= previous && previous != 0 {
            return Ok(0);
        }

        let window_start = head.saturating_sub(self.config.recent_blocks.saturating_sub(1));
        let start = if previous == 0 {
            window_start
        } else {
            window_start.max(previous + 1)
        };

        let mut warmed = 0;
        for number in start..=head {
            let lookup = BlockLookup::Number(format!("0x{:x}", number));
            match cached_block(&self.cache, &self.upstream, lookup).await {
                Some(_) => warmed += 1,
                None => debug!(number, "Block not available yet"),
            }
        }
        Ok(warmed)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.poll_interval_ms.max(100));
        tokio::spawn(async move {
            info!(recent_blocks = self.config.recent_blocks, "Block poller started");
            let mut consecutive_failures = 0u32;
            loop {
                match self.poll_once().await {
                    Ok(warmed) => {
                        if consecutive_failures > 0 {
                            info!(consecutive_failures, "Block poller recovered");
                        }
                        consecutive_failures = 0;
                        if warmed > 0 {
                            let (hashes, numbers) = self.cache.len();
                            debug!(
                                warmed,
                                latest = self.latest.load(Ordering::Acquire),
                                hashes,
                                numbers,
                                "Block cache updated"
                            );
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(consecutive_failures, "Block poll failed: {}", e);
                        } else if consecutive_failures % 10 == 0 {
                            error!(consecutive_failures, "Block poll repeatedly failing: {}", e);
                        }
                    }
                }
                tokio::time::sleep(period).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, routing::get, Json, Router};
    use palisade_core::{NodeEndpoint, NodePool, NodeSelectionConfig, UpstreamConfig};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn block(n: u64) -> Value {
        json!({ "number": format!("0x{:x}", n), "hash": format!("0x{:064x}", n + 0xb000) })
    }

    async fn mock_chain(head: Arc<AtomicU64>, fetches: Arc<AtomicUsize>) -> Arc<UpstreamClient> {
        let head_for_number = head.clone();
        let app = Router::new()
            .route(
                "/eth_blockNumber",
                get(move || {
                    let head = head_for_number.clone();
                    async move {
                        Json(json!({ "blockNumber": format!("0x{:x}", head.load(Ordering::SeqCst)) }))
                    }
                }),
            )
            .route(
                "/eth_getBlockByNumber",
                get(move |Query(q): Query<HashMap<String, String>>| {
                    let fetches = fetches.clone();
                    async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        let raw = q.get("blockNumber").cloned().unwrap_or_default();
                        let n = u64::from_str_radix(raw.trim_start_matches("0x"), 16).unwrap_or(0);
                        Json(json!({ "block": block(n) }))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = UpstreamConfig {
            max_retries: 0,
            ..UpstreamConfig::default()
        };
        let pool = Arc::new(NodePool::new(&NodeSelectionConfig::default(), &config));
        pool.replace_nodes(vec![NodeEndpoint::new("127.0.0.1", port)]);
        Arc::new(UpstreamClient::new(pool, config))
    }

    #[tokio::test]
    async fn poller_warms_only_new_blocks() {
        let head = Arc::new(AtomicU64::new(20));
        let fetches = Arc::new(AtomicUsize::new(0));
        let upstream = mock_chain(head.clone(), fetches.clone()).await;
        let cache = Arc::new(BlockCache::new(100));
        let latest = Arc::new(AtomicU64::new(0));
        let config = BlockCacheConfig {
            recent_blocks: 5,
            ..BlockCacheConfig::default()
        };
        let poller = BlockPoller::new(cache.clone(), upstream.clone(), latest.clone(), config);

        assert_eq!(poller.poll_once().await, Ok(5));
        assert_eq!(latest.load(Ordering::SeqCst), 20);
        assert_eq!(cache.len(), (5, 5));
        assert!(cache.hash_for_number(16).is_some());
        assert!(cache.hash_for_number(15).is_none());

        assert_eq!(poller.poll_once().await, Ok(0));

        head.store(22, Ordering::SeqCst);
        assert_eq!(poller.poll_once().await, Ok(2));
        assert_eq!(fetches.load(Ordering::SeqCst), 7);

        // Served from the cache, no extra upstream fetch.
        let hash = block_hash(&cache, &upstream, 21).await;
        assert_eq!(hash, Some(format!("0x{:064x}", 21 + 0xb000)));
        assert_eq!(fetches.load(Ordering::SeqCst), 7);
    }
}

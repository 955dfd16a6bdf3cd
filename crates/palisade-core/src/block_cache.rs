use futures_util::future::{BoxFuture, FutureExt, Shared};
use schnellru::{LruMap, Unlimited};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// How a caller addresses a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockLookup {
    Hash(String),
    Number(String),
    Earliest,
    Latest,
}

impl BlockLookup {
    /// Interpret a JSON-RPC block tag or quantity.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "earliest" => BlockLookup::Earliest,
            "latest" | "pending" | "safe" | "finalized" => BlockLookup::Latest,
            other => BlockLookup::Number(other.to_string()),
        }
    }

    fn inflight_key(&self) -> String {
        match self {
            BlockLookup::Hash(h) => format!("hash:{}", canonical_hash(h)),
            BlockLookup::Number(n) => format!(
                "number:{}",
                canonical_number(n).unwrap_or_else(|| n.to_lowercase())
            ),
            BlockLookup::Earliest => "earliest".to_string(),
            BlockLookup::Latest => "latest".to_string(),
        }
    }
}

/// A materialized block and the two keys it is indexed under.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedBlock {
    pub hash: String,
    pub number: String,
    pub block: Value,
}

impl CachedBlock {
    /// Build from an upstream block object. `None` when either key is missing or unparseable.
    pub fn from_value(block: Value) -> Option<Self> {
        let hash = block.get("hash").and_then(Value::as_str).map(canonical_hash)?;
        let number = block
            .get("number")
            .and_then(Value::as_str)
            .and_then(canonical_number)?;
        Some(Self {
            hash,
            number,
            block,
        })
    }
}

/// Lower-case, `0x`-prefixed.
pub fn canonical_hash(hash: &str) -> String {
    let digits = hash.strip_prefix("0x").unwrap_or(hash);
    format!("0x{}", digits.to_lowercase())
}

/// `0x{:x}` form of a hex quantity, with or without its prefix.
pub fn canonical_number(number: &str) -> Option<String> {
    let digits = number.strip_prefix("0x").unwrap_or(number);
    u64::from_str_radix(digits, 16)
        .ok()
        .map(|n| format!("0x{:x}", n))
}

struct Indexes {
    by_hash: LruMap<String, Arc<CachedBlock>, Unlimited>,
    by_number: LruMap<String, Arc<CachedBlock>, Unlimited>,
    earliest: Option<Arc<CachedBlock>>,
}

impl Indexes {
    /// Drop `evicted`'s key from the other index if it still names the same block.
    fn drop_counterpart_number(&mut self, evicted: &CachedBlock) {
        if self
            .by_number
            .peek(evicted.number.as_str())
            .is_some_and(|b| b.hash == evicted.hash)
        {
            self.by_number.remove(evicted.number.as_str());
        }
    }

    fn drop_counterpart_hash(&mut self, evicted: &CachedBlock) {
        if self
            .by_hash
            .peek(evicted.hash.as_str())
            .is_some_and(|b| b.number == evicted.number)
        {
            self.by_hash.remove(evicted.hash.as_str());
        }
    }
}

type FetchFuture = Shared<BoxFuture<'static, Option<Value>>>;

/// Recently seen blocks indexed by hash and by number, plus a single `earliest` slot.
///
/// Both indexes always hold the same set of blocks: every eviction or re-index on one side
/// removes the matching key on the other inside the same critical section.
pub struct BlockCache {
    indexes: Mutex<Indexes>,
    max_entries: usize,
    inflight: Mutex<HashMap<String, (u64, FetchFuture)>>,
    next_fetch_id: AtomicU64,
}

impl BlockCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            indexes: Mutex::new(Indexes {
                by_hash: LruMap::new(Unlimited),
                by_number: LruMap::new(Unlimited),
                earliest: None,
            }),
            max_entries: max_entries.max(2),
            inflight: Mutex::new(HashMap::new()),
            next_fetch_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Indexes> {
        self.indexes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A hit promotes the block in both indexes.
    pub fn get(&self, lookup: &BlockLookup) -> Option<Arc<CachedBlock>> {
        let mut guard = self.lock();
        let indexes = &mut *guard;
        let found = match lookup {
            BlockLookup::Hash(hash) => indexes.by_hash.get(canonical_hash(hash).as_str()).cloned(),
            BlockLookup::Number(number) => {
                let key = canonical_number(number)?;
                indexes.by_number.get(key.as_str()).cloned()
            }
            BlockLookup::Earliest => return indexes.earliest.clone(),
            BlockLookup::Latest => return None,
        }?;
        indexes.by_hash.get(found.hash.as_str());
        indexes.by_number.get(found.number.as_str());
        Some(found)
    }

    /// Store `block` as fetched for `lookup`. `Latest` lookups are stored under the block's
    /// own hash and number; `Earliest` only fills its slot.
    pub fn update(&self, lookup: &BlockLookup, block: Value) -> Option<Arc<CachedBlock>> {
        let entry = Arc::new(CachedBlock::from_value(block)?);
        let mut guard = self.lock();
        let indexes = &mut *guard;

        if matches!(lookup, BlockLookup::Earliest) {
            indexes.earliest = Some(entry.clone());
            return Some(entry);
        }

        // A key re-pointing at a different block orphans that block's other key.
        if let Some(stale) = indexes.by_hash.peek(entry.hash.as_str()).cloned() {
            if stale.number != entry.number {
                indexes.drop_counterpart_number(&stale);
            }
        }
        if let Some(stale) = indexes.by_number.peek(entry.number.as_str()).cloned() {
            if stale.hash != entry.hash {
                indexes.drop_counterpart_hash(&stale);
            }
        }

        indexes.by_hash.insert(entry.hash.clone(), entry.clone());
        indexes.by_number.insert(entry.number.clone(), entry.clone());

        while indexes.by_hash.len() >= self.max_entries {
            let Some((_, evicted)) = indexes.by_hash.pop_oldest() else {
                break;
            };
            indexes.drop_counterpart_number(&evicted);
        }
        while indexes.by_number.len() >= self.max_entries {
            let Some((_, evicted)) = indexes.by_number.pop_oldest() else {
                break;
            };
            indexes.drop_counterpart_hash(&evicted);
        }

        Some(entry)
    }

    /// Serve from cache or run `fetch`, sharing one upstream fetch among concurrent callers
    /// that miss on the same key.
    pub async fn get_or_fetch<F, Fut>(self: &Arc<Self>, lookup: BlockLookup, fetch: F) -> Option<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        if let Some(hit) = self.get(&lookup) {
            return Some(hit.block.clone());
        }

        let key = lookup.inflight_key();
        let (fetch_id, shared, leader) = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((id, existing)) = inflight.get(&key) {
                (*id, existing.clone(), false)
            } else {
                let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let cache = Arc::clone(self);
                let populate_lookup = lookup.clone();
                let populate_key = key.clone();
                let upstream = fetch();
                let future = async move {
                    let result = upstream.await;
                    if let Some(block) = &result {
                        cache.update(&populate_lookup, block.clone());
                    }
                    cache.clear_inflight(&populate_key, id);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key.clone(), (id, future.clone()));
                (id, future, true)
            }
        };

        if !leader {
            debug!(key = %key, "Joining in-flight block fetch");
            return shared.await;
        }

        let _guard = InflightGuard {
            cache: self,
            key,
            fetch_id,
        };
        shared.await
    }

    fn clear_inflight(&self, key: &str, fetch_id: u64) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.get(key).is_some_and(|(id, _)| *id == fetch_id) {
            inflight.remove(key);
        }
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Entry counts of the hash and number indexes.
    pub fn len(&self) -> (usize, usize) {
        let indexes = self.lock();
        (indexes.by_hash.len(), indexes.by_number.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }

    pub fn hash_for_number(&self, number: u64) -> Option<String> {
        let key = format!("0x{:x}", number);
        self.lock().by_number.peek(key.as_str()).map(|b| b.hash.clone())
    }

    #[cfg(test)]
    fn snapshot(&self) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let indexes = self.lock();
        let mut by_hash: Vec<_> = indexes
            .by_hash
            .iter()
            .map(|(_, b)| (b.hash.clone(), b.number.clone()))
            .collect();
        let mut by_number: Vec<_> = indexes
            .by_number
            .iter()
            .map(|(_, b)| (b.hash.clone(), b.number.clone()))
            .collect();
        by_hash.sort();
        by_number.sort();
        (by_hash, by_number)
    }
}

/// Clears the leader's in-flight entry even if the leader is cancelled mid-fetch.
struct InflightGuard<'a> {
    cache: &'a BlockCache,
    key: String,
    fetch_id: u64,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.cache.clear_inflight(&self.key, self.fetch_id);
    }
}

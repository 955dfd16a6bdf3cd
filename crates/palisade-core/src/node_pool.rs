use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::config::{NodeSelectionConfig, UpstreamConfig};

/// One validator the gateway can forward calls to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub ip: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// `"ip:port"`, the key used by the node map and the bad-node list.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

impl std::str::FromStr for NodeEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected ip:port, got {}", s))?;
        if ip.is_empty() {
            return Err(format!("missing host in {}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {}: {}", s, e))?;
        Ok(Self::new(ip, port))
    }
}

struct PoolState {
    nodes: Vec<NodeEndpoint>,
    by_key: HashMap<String, NodeEndpoint>,
    active: Option<NodeEndpoint>,
    /// `"ip:port"` -> millis when the node was marked bad.
    bad: HashMap<String, u64>,
    cursor: usize,
}

/// Known validators, the currently targeted one, and the temporary bad-node list.
///
/// All of it sits behind one lock; nothing in here is held across an await.
pub struct NodePool {
    state: Mutex<PoolState>,
    static_node: Option<NodeEndpoint>,
    bad_node_ttl_ms: u64,
    max_select_attempts: usize,
}

impl NodePool {
    pub fn new(selection: &NodeSelectionConfig, upstream: &UpstreamConfig) -> Self {
        let static_node = if selection.use_static_node {
            selection.static_node.clone()
        } else {
            None
        };
        Self {
            state: Mutex::new(PoolState {
                nodes: Vec::new(),
                by_key: HashMap::new(),
                active: static_node.clone(),
                bad: HashMap::new(),
                cursor: 0,
            }),
            static_node,
            bad_node_ttl_ms: upstream.bad_node_ttl_ms,
            max_select_attempts: upstream.max_select_attempts.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_static(&self) -> bool {
        self.static_node.is_some()
    }

    /// Swap in a freshly discovered node list. The bad-node list, the active node and the
    /// rotation cursor survive the swap.
    pub fn replace_nodes(&self, nodes: Vec<NodeEndpoint>) -> usize {
        let mut by_key = HashMap::with_capacity(nodes.len());
        let mut deduped = Vec::with_capacity(nodes.len());
        for node in nodes {
            if by_key.insert(node.key(), node.clone()).is_none() {
                deduped.push(node);
            }
        }

        let mut state = self.lock();
        let previous = state.nodes.len();
        let count = deduped.len();
        state.nodes = deduped;
        state.by_key = by_key;
        if count != previous {
            info!(previous, count, "Node list refreshed");
        } else {
            debug!(count, "Node list refreshed");
        }
        count
    }

    pub fn nodes(&self) -> Vec<NodeEndpoint> {
        self.lock().nodes.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().by_key.contains_key(key)
    }

    pub fn active(&self) -> Option<NodeEndpoint> {
        self.lock().active.clone()
    }

    pub fn bad_count(&self) -> usize {
        self.lock().bad.len()
    }

    pub fn is_bad(&self, node: &NodeEndpoint) -> bool {
        self.lock().bad.contains_key(&node.key())
    }

    /// Pick the node for the next outbound attempt.
    ///
    /// Rotates round-robin, skipping unexpired bad nodes for a bounded number of candidates
    /// before accepting a possibly-bad one. An empty pool keeps whatever was active.
    pub fn select_active_at(&self, now_ms: u64) -> Option<NodeEndpoint> {
        if let Some(node) = &self.static_node {
            return Some(node.clone());
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        let ttl = self.bad_node_ttl_ms;
        state.bad.retain(|_, marked| now_ms.saturating_sub(*marked) < ttl);

        if state.nodes.is_empty() {
            return state.active.clone();
        }

        let len = state.nodes.len();
        let mut candidate = None;
        for _ in 0..self.max_select_attempts {
            state.cursor = (state.cursor + 1) % len;
            let node = &state.nodes[state.cursor];
            let is_bad = state.bad.contains_key(&node.key());
            candidate = Some(node.clone());
            if !is_bad {
                break;
            }
        }

        if let Some(node) = &candidate {
            if state.bad.contains_key(&node.key()) {
                debug!(node = %node.key(), "All rotation candidates are bad, using one anyway");
            }
        }
        state.active = candidate.clone();
        candidate
    }

    pub fn select_active(&self) -> Option<NodeEndpoint> {
        self.select_active_at(crate::now_millis())
    }

    /// Blacklist a node for the bad-node TTL. Refused once 2/3 of the pool is already bad so
    /// rotation always keeps a usable remainder.
    pub fn mark_bad_at(&self, node: &NodeEndpoint, now_ms: u64) -> bool {
        if self.is_static() {
            return false;
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = node.key();
        if state.bad.contains_key(&key) {
            state.bad.insert(key, now_ms);
            return true;
        }
        if state.bad.len() * 3 >= state.nodes.len() * 2 {
            debug!(node = %key, bad = state.bad.len(), "Bad-node list at capacity");
            return false;
        }
        warn!(node = %key, "Marking node bad");
        state.bad.insert(key, now_ms);
        true
    }

    pub fn mark_bad(&self, node: &NodeEndpoint) -> bool {
        self.mark_bad_at(node, crate::now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: u16) -> NodePool {
        let pool = NodePool::new(&NodeSelectionConfig::default(), &UpstreamConfig::default());
        pool.replace_nodes((0..n).map(|i| NodeEndpoint::new("10.0.0.1", 9000 + i)).collect());
        pool
    }

    #[test]
    fn parses_ip_port() {
        let node: NodeEndpoint = "192.168.1.7:9001".parse().expect("valid endpoint");
        assert_eq!(node, NodeEndpoint::new("192.168.1.7", 9001));
        assert!("192.168.1.7".parse::<NodeEndpoint>().is_err());
        assert!(":9001".parse::<NodeEndpoint>().is_err());
        assert!("host:notaport".parse::<NodeEndpoint>().is_err());
    }

    #[test]
    fn rotation_visits_every_node() {
        let pool = pool_of(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(pool.select_active_at(0).expect("node").key());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn rotation_skips_bad_nodes_until_expiry() {
        let pool = pool_of(3);
        let bad = NodeEndpoint::new("10.0.0.1", 9001);
        assert!(pool.mark_bad_at(&bad, 1_000));

        for _ in 0..6 {
            assert_ne!(pool.select_active_at(2_000), Some(bad.clone()));
        }

        let after_ttl = 1_000 + UpstreamConfig::default().bad_node_ttl_ms;
        let mut picked_again = false;
        for _ in 0..3 {
            if pool.select_active_at(after_ttl) == Some(bad.clone()) {
                picked_again = true;
            }
        }
        assert!(picked_again, "expired bad node should rotate back in");
        assert_eq!(pool.bad_count(), 0);
    }

    #[test]
    fn bad_list_is_capped_below_two_thirds() {
        let pool = pool_of(3);
        assert!(pool.mark_bad_at(&NodeEndpoint::new("10.0.0.1", 9000), 0));
        assert!(pool.mark_bad_at(&NodeEndpoint::new("10.0.0.1", 9001), 0));
        assert!(!pool.mark_bad_at(&NodeEndpoint::new("10.0.0.1", 9002), 0));
        assert_eq!(pool.bad_count(), 2);
    }

    #[test]
    fn all_bad_candidates_still_yield_a_node() {
        let pool = pool_of(1);
        let only = NodeEndpoint::new("10.0.0.1", 9000);
        assert!(pool.mark_bad_at(&only, 0));
        assert_eq!(pool.select_active_at(0), Some(only));
    }

    #[test]
    fn refresh_with_same_list_keeps_bad_and_active() {
        let pool = pool_of(4);
        let first = pool.select_active_at(0).expect("node");
        let bad = NodeEndpoint::new("10.0.0.1", 9003);
        assert!(pool.mark_bad_at(&bad, 0));

        let same = pool.nodes();
        pool.replace_nodes(same.clone());

        assert_eq!(pool.nodes(), same);
        assert_eq!(pool.active(), Some(first));
        assert!(pool.is_bad(&bad));
        assert!(pool.contains("10.0.0.1:9002"));
    }

    #[test]
    fn replace_dedupes_by_key() {
        let pool = pool_of(0);
        let count = pool.replace_nodes(vec![
            NodeEndpoint::new("10.0.0.2", 1),
            NodeEndpoint::new("10.0.0.2", 1),
            NodeEndpoint::new("10.0.0.3", 1),
        ]);
        assert_eq!(count, 2);
    }

    #[test]
    fn empty_pool_returns_previous_active() {
        let pool = pool_of(2);
        let active = pool.select_active_at(0);
        pool.replace_nodes(Vec::new());
        assert_eq!(pool.select_active_at(0), active);
    }

    #[test]
    fn static_mode_pins_the_configured_node() {
        let pinned = NodeEndpoint::new("10.9.9.9", 8080);
        let selection = NodeSelectionConfig {
            use_static_node: true,
            static_node: Some(pinned.clone()),
        };
        let pool = NodePool::new(&selection, &UpstreamConfig::default());
        pool.replace_nodes(vec![NodeEndpoint::new("10.0.0.1", 1)]);
        for _ in 0..3 {
            assert_eq!(pool.select_active_at(0), Some(pinned.clone()));
        }
        assert!(!pool.mark_bad_at(&pinned, 0));
    }
}

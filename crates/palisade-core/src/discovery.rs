use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::node_pool::{NodeEndpoint, NodePool};

const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "localhost", "0.0.0.0", "::1"];

/// One discovery-service instance and the last consensus cycle it reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiverStat {
    pub url: String,
    pub cycle_counter: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    NoHealthyArchiver,
    Request { url: String, message: String },
    EmptyNodeList { url: String },
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::NoHealthyArchiver => {
                write!(f, "no discovery service instance is reachable")
            }
            DiscoveryError::Request { url, message } => {
                write!(f, "discovery request to {} failed: {}", url, message)
            }
            DiscoveryError::EmptyNodeList { url } => {
                write!(f, "discovery service {} returned no active nodes", url)
            }
        }
    }
}

impl std::error::Error for DiscoveryError {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeListResponse {
    #[serde(default)]
    node_list: Vec<NodeEndpoint>,
}

fn is_loopback(host: &str) -> bool {
    LOOPBACK_HOSTS.contains(&host.trim_start_matches('[').trim_end_matches(']'))
}

/// Point loopback node addresses at the discovery service's own host, unless that host is
/// itself loopback.
pub fn rewrite_loopback(nodes: Vec<NodeEndpoint>, archiver_url: &str) -> Vec<NodeEndpoint> {
    let host = reqwest::Url::parse(archiver_url)
        .ok()
        .and_then(|u| u.host_str().map(ToOwned::to_owned));
    let Some(host) = host.filter(|h| !is_loopback(h)) else {
        return nodes;
    };
    nodes
        .into_iter()
        .map(|mut node| {
            if is_loopback(&node.ip) {
                node.ip = host.clone();
            }
            node
        })
        .collect()
}

/// Keeps the node pool in step with the discovery service.
pub struct Discovery {
    http: reqwest::Client,
    stats: Mutex<Vec<ArchiverStat>>,
    healthy: Mutex<Vec<String>>,
    cursor: AtomicUsize,
    config: DiscoveryConfig,
    pool: Arc<NodePool>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, pool: Arc<NodePool>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.health_check_timeout_ms))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build discovery HTTP client ({}), using defaults", e);
                reqwest::Client::new()
            });
        let stats = config
            .archivers
            .iter()
            .map(|url| ArchiverStat {
                url: url.trim_end_matches('/').to_string(),
                cycle_counter: None,
            })
            .collect();
        Self {
            http,
            stats: Mutex::new(stats),
            healthy: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            config,
            pool,
        }
    }

    pub fn stats(&self) -> Vec<ArchiverStat> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn healthy(&self) -> Vec<String> {
        self.healthy.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn cycle_counter(&self, url: &str) -> Option<u64> {
        let body: Value = self
            .http
            .get(format!("{}/cycleinfo/1", url))
            .timeout(Duration::from_millis(self.config.health_check_timeout_ms))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        body.get("cycleInfo")?.get(0)?.get("counter")?.as_u64()
    }

    /// Query every instance's cycle counter; those at the maximum become the healthy set.
    pub async fn check_archivers(&self) -> usize {
        let urls: Vec<String> = self.stats().into_iter().map(|s| s.url).collect();
        let counters = join_all(urls.iter().map(|url| self.cycle_counter(url))).await;

        let max = counters.iter().flatten().max().copied();
        let healthy: Vec<String> = urls
            .iter()
            .zip(&counters)
            .filter(|(_, c)| c.is_some() && **c == max)
            .map(|(u, _)| u.clone())
            .collect();

        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = urls
            .into_iter()
            .zip(counters)
            .map(|(url, cycle_counter)| ArchiverStat { url, cycle_counter })
            .collect();
        debug!(healthy = healthy.len(), max_cycle = ?max, "Checked discovery services");
        let count = healthy.len();
        *self.healthy.lock().unwrap_or_else(PoisonError::into_inner) = healthy;
        count
    }

    fn next_archiver(&self) -> Option<String> {
        let healthy = self.healthy.lock().unwrap_or_else(PoisonError::into_inner);
        if healthy.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].clone())
    }

    async fn probe(&self, node: &NodeEndpoint) -> bool {
        let url = format!("{}/nodeinfo", node.base_url());
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_millis(self.config.health_check_timeout_ms))
            .send()
            .await;
        let Ok(resp) = resp else {
            return false;
        };
        let Ok(body) = resp.json::<Value>().await else {
            return false;
        };
        body.get("nodeInfo")
            .and_then(|i| i.get("status"))
            .and_then(Value::as_str)
            == Some("active")
    }

    /// Node list from the next healthy discovery instance.
    pub async fn fetch_node_list(&self) -> Result<Vec<NodeEndpoint>, DiscoveryError> {
        let archiver = self.next_archiver().ok_or(DiscoveryError::NoHealthyArchiver)?;
        self.fetch_from(&archiver).await
    }

    async fn fetch_from(&self, archiver: &str) -> Result<Vec<NodeEndpoint>, DiscoveryError> {
        let url = format!("{}/full-nodelist?activeOnly=true", archiver);
        let request_err = |message: String| DiscoveryError::Request {
            url: archiver.to_string(),
            message,
        };
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_millis(self.config.health_check_timeout_ms * 5))
            .send()
            .await
            .map_err(|e| request_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(request_err(format!("HTTP {}", resp.status())));
        }
        let list: NodeListResponse = resp.json().await.map_err(|e| request_err(e.to_string()))?;
        let nodes = rewrite_loopback(list.node_list, archiver);

        if !self.config.probe_liveness {
            return Ok(nodes);
        }
        let alive = join_all(nodes.iter().map(|n| self.probe(n))).await;
        let before = nodes.len();
        let nodes: Vec<NodeEndpoint> = nodes
            .into_iter()
            .zip(alive)
            .filter_map(|(n, ok)| ok.then_some(n))
            .collect();
        debug!(listed = before, active = nodes.len(), "Probed node liveness");
        Ok(nodes)
    }

    /// Replace the pool's node list. An empty answer leaves the previous list in place.
    pub async fn refresh(&self) -> Result<usize, DiscoveryError> {
        let archiver = self.next_archiver().ok_or(DiscoveryError::NoHealthyArchiver)?;
        let nodes = self.fetch_from(&archiver).await?;
        if nodes.is_empty() {
            return Err(DiscoveryError::EmptyNodeList { url: archiver });
        }
        Ok(self.pool.replace_nodes(nodes))
    }

    /// Block until the pool holds at least one node.
    ///
    /// Fails only when no discovery instance answers at all.
    pub async fn bootstrap(&self) -> Result<usize, DiscoveryError> {
        if self.check_archivers().await == 0 {
            return Err(DiscoveryError::NoHealthyArchiver);
        }
        let delay = Duration::from_millis(self.config.bootstrap_retry_delay_ms);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.refresh().await {
                Ok(count) => {
                    info!(count, attempt, "Initial node list loaded");
                    return Ok(count);
                }
                Err(e) => {
                    warn!(attempt, "Initial node list fetch failed: {}", e);
                    tokio::time::sleep(delay).await;
                    if self.healthy().is_empty() {
                        self.check_archivers().await;
                    }
                }
            }
        }
    }

    pub fn spawn_refresh_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let discovery = Arc::clone(self);
        let period = Duration::from_secs(self.config.refresh_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if discovery.check_archivers().await == 0 {
                    warn!("No healthy discovery service, keeping current node list");
                    continue;
                }
                if let Err(e) = discovery.refresh().await {
                    warn!("Node list refresh failed, keeping current list: {}", e);
                }
            }
        })
    }
}

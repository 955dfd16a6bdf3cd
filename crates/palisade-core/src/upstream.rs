use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::node_pool::{NodeEndpoint, NodePool};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One logical call against the validator pool.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path plus optional query, e.g. `/tx/0xab` or `/eth_getCode?address=0x..`.
    pub route: String,
    pub body: Option<Value>,
    /// Overrides the configured retry count; negative retries forever.
    pub max_retries: Option<i32>,
}

impl UpstreamRequest {
    pub fn get(route: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            route: route.into(),
            body: None,
            max_retries: None,
        }
    }

    pub fn post(route: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            route: route.into(),
            body: Some(body),
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamResponse {
    /// Response body; objects carry a `nodeUrl` field naming the serving node.
    pub body: Value,
    pub node_url: String,
}

/// Path without its query string.
fn route_path(route: &str) -> &str {
    route.split('?').next().unwrap_or(route)
}

/// First path segment of a route: `/tx/0xab?x=1` becomes `/tx`.
pub fn route_key(route: &str) -> &str {
    let path = route_path(route);
    let rest = path.strip_prefix('/').unwrap_or(path);
    match rest.find('/') {
        Some(idx) => &path[..idx + (path.len() - rest.len())],
        None => path,
    }
}

/// HTTP client over the node pool with per-route timeouts, retries and failover.
pub struct UpstreamClient {
    http: reqwest::Client,
    pool: Arc<NodePool>,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(pool: Arc<NodePool>, config: UpstreamConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .unwrap_or_else(|e| {
                warn!(
                    "Failed to build HTTP client with connect timeout ({}), using defaults",
                    e
                );
                reqwest::Client::new()
            });
        Self { http, pool, config }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    fn timeout_for(&self, route: &str) -> Duration {
        let path = route_path(route);
        if self.config.route_timeouts_ms.contains_key(path) {
            self.config.timeout_for(path)
        } else {
            self.config.timeout_for(route_key(route))
        }
    }

    /// Run `request` against the active node, rotating and retrying on failure.
    ///
    /// Returns `None` once retries are exhausted; transport errors never escape.
    pub async fn call(&self, request: UpstreamRequest) -> Option<UpstreamResponse> {
        let key = route_key(&request.route);
        let penalized = self.config.is_penalized(key);
        let timeout = self.timeout_for(&request.route);
        let max_retries = request.max_retries.unwrap_or(self.config.max_retries);

        let mut attempt: i64 = 0;
        loop {
            match self.pool.select_active() {
                Some(node) => match self.attempt(&node, &request, timeout).await {
                    Ok(mut body) => {
                        let node_url = node.base_url();
                        if let Some(obj) = body.as_object_mut() {
                            obj.insert("nodeUrl".to_string(), Value::String(node_url.clone()));
                        }
                        return Some(UpstreamResponse { body, node_url });
                    }
                    Err(reason) => {
                        debug!(
                            node = %node.key(),
                            route = %request.route,
                            attempt,
                            "Upstream call failed: {}",
                            reason
                        );
                        if penalized {
                            self.pool.mark_bad(&node);
                        }
                    }
                },
                None => debug!(route = %request.route, attempt, "No upstream node available"),
            }

            if max_retries >= 0 && attempt >= i64::from(max_retries) {
                warn!(route = %request.route, attempts = attempt + 1, "Upstream retries exhausted");
                return None;
            }
            attempt += 1;

            let backoff = {
                let mut rng = rand::thread_rng();
                rng.gen_range(self.config.backoff_min_ms..=self.config.backoff_max_ms)
            };
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    async fn attempt(
        &self,
        node: &NodeEndpoint,
        request: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<Value, String> {
        let url = format!("{}{}", node.base_url(), request.route);
        let builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => {
                let builder = self.http.post(&url);
                match &request.body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            }
        };
        let resp = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("request error: {}", e))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("invalid JSON body: {}", e))?;
        if body.get("error").is_some_and(|e| !e.is_null()) {
            return Err(format!("application error: {}", body["error"]));
        }
        Ok(body)
    }

    async fn fetch_field(&self, request: UpstreamRequest, field: &str) -> Option<Value> {
        let resp = self.call(request).await?;
        resp.body.get(field).cloned()
    }

    pub async fn inject(&self, payload: &Value) -> Option<UpstreamResponse> {
        self.call(UpstreamRequest::post("/inject", payload.clone())).await
    }

    pub async fn block_number(&self) -> Option<u64> {
        let value = self
            .fetch_field(UpstreamRequest::get("/eth_blockNumber"), "blockNumber")
            .await?;
        parse_quantity(&value)
    }

    pub async fn block_by_hash(&self, hash: &str) -> Option<Value> {
        self.fetch_field(
            UpstreamRequest::get(format!("/eth_getBlockByHash?blockHash={}", hash)),
            "block",
        )
        .await
        .filter(|b| !b.is_null())
    }

    pub async fn block_by_number(&self, number: &str) -> Option<Value> {
        self.fetch_field(
            UpstreamRequest::get(format!("/eth_getBlockByNumber?blockNumber={}", number)),
            "block",
        )
        .await
        .filter(|b| !b.is_null())
    }

    pub async fn account(&self, address: &str) -> Option<Value> {
        self.fetch_field(UpstreamRequest::get(format!("/account/{}", address)), "account")
            .await
    }

    pub async fn code(&self, address: &str) -> Option<Value> {
        self.fetch_field(
            UpstreamRequest::get(format!("/eth_getCode?address={}", address)),
            "contractCode",
        )
        .await
    }

    pub async fn tx_receipt(&self, hash: &str) -> Option<Value> {
        self.fetch_field(UpstreamRequest::get(format!("/tx/{}", hash)), "receipt")
            .await
    }

    pub async fn gas_price(&self) -> Option<Value> {
        self.fetch_field(UpstreamRequest::get("/eth_gasPrice"), "result")
            .await
    }

    pub async fn contract_call(&self, call: &Value) -> Option<Value> {
        self.fetch_field(UpstreamRequest::post("/contract/call", call.clone()), "result")
            .await
    }

    pub async fn estimate_gas(&self, call: &Value) -> Option<Value> {
        self.fetch_field(
            UpstreamRequest::post("/contract/estimateGas", call.clone()),
            "result",
        )
        .await
    }

    pub async fn access_list(&self, call: &Value) -> Option<Value> {
        self.fetch_field(
            UpstreamRequest::post("/contract/accesslist", call.clone()),
            "result",
        )
        .await
    }

    /// Body for injecting a raw signed transaction.
    pub fn raw_inject_payload(raw: &str) -> Value {
        json!({ "raw": raw, "timestamp": crate::now_millis() })
    }
}

/// Accepts `"0x1a"` or a JSON number.
pub fn parse_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => {
            let digits = s.strip_prefix("0x").unwrap_or(s);
            u64::from_str_radix(digits, 16).ok()
        }
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_is_first_segment() {
        assert_eq!(route_key("/tx/0xab"), "/tx");
        assert_eq!(route_key("/eth_getCode?address=0x1"), "/eth_getCode");
        assert_eq!(route_key("/inject"), "/inject");
        assert_eq!(route_key("/contract/call"), "/contract");
        assert_eq!(route_key("/account/0xab?x=/y"), "/account");
    }

    #[test]
    fn full_path_timeouts_take_precedence() {
        let pool = Arc::new(NodePool::new(
            &crate::config::NodeSelectionConfig::default(),
            &UpstreamConfig::default(),
        ));
        let client = UpstreamClient::new(pool, UpstreamConfig::default());
        assert_eq!(client.timeout_for("/contract/call"), Duration::from_secs(10));
        assert_eq!(client.timeout_for("/contract/other"), Duration::from_secs(3));
        assert_eq!(client.timeout_for("/inject"), Duration::from_secs(10));
    }

    #[test]
    fn quantities_parse_from_hex_or_number() {
        assert_eq!(parse_quantity(&json!("0x1a")), Some(26));
        assert_eq!(parse_quantity(&json!(26)), Some(26));
        assert_eq!(parse_quantity(&json!("zz")), None);
        assert_eq!(parse_quantity(&Value::Null), None);
    }

    #[tokio::test]
    async fn empty_pool_yields_no_result() {
        let config = UpstreamConfig {
            max_retries: 2,
            backoff_min_ms: 1,
            backoff_max_ms: 1,
            ..UpstreamConfig::default()
        };
        let pool = Arc::new(NodePool::new(
            &crate::config::NodeSelectionConfig::default(),
            &config,
        ));
        let client = UpstreamClient::new(pool, config);
        assert!(client.call(UpstreamRequest::get("/eth_blockNumber")).await.is_none());
    }
}

use async_trait::async_trait;
use palisade_core::{ExemptionCheck, UpstreamClient};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Lets accounts of configured classes (`accountType` on the validator's account record)
/// exceed the per-address ceiling.
pub struct AccountTypeExemption {
    upstream: Arc<UpstreamClient>,
    exempt_types: Vec<String>,
}

impl AccountTypeExemption {
    pub fn new(upstream: Arc<UpstreamClient>, exempt_types: Vec<String>) -> Self {
        Self {
            upstream,
            exempt_types,
        }
    }
}

#[async_trait]
impl ExemptionCheck for AccountTypeExemption {
    async fn is_exempt(&self, address: &str) -> bool {
        let Some(account) = self.upstream.account(address).await else {
            return false;
        };
        let account_type = account.get("accountType").and_then(Value::as_str);
        let exempt = account_type.is_some_and(|t| self.exempt_types.iter().any(|e| e == t));
        debug!(address, ?account_type, exempt, "Checked account class");
        exempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, routing::get, Json, Router};
    use palisade_core::{NodeEndpoint, NodePool, NodeSelectionConfig, UpstreamConfig};
    use serde_json::json;

    async fn account(Path(address): Path<String>) -> Json<Value> {
        let account = if address.ends_with("01") {
            json!({ "accountType": "ValidatorOperator", "nonce": "0x0" })
        } else {
            json!({ "accountType": "EOA", "nonce": "0x0" })
        };
        Json(json!({ "account": account }))
    }

    async fn upstream() -> Arc<UpstreamClient> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/account/:address", get(account));
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
    async fn configured_account_types_are_exempt() {
        let check = AccountTypeExemption::new(upstream().await, vec!["ValidatorOperator".into()]);
        assert!(check.is_exempt("0x0000000000000000000000000000000000000001").await);
        assert!(!check.is_exempt("0x0000000000000000000000000000000000000002").await);
    }
}

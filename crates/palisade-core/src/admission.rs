use alloy_primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AdmissionConfig;
use crate::gas_cache::{function_selector, GasEstimateCache};
use crate::recorder::{TxStatus, TxStatusRecorder};
use crate::tx::{DecodedTx, GatewayTx, InternalTx};
use crate::upstream::{parse_quantity, UpstreamClient};

/// What a validator said about one injected transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectOutcome {
    pub success: bool,
    pub reason: String,
    pub status: u64,
    pub node_url: Option<String>,
}

/// Where admitted transactions go. `None` means no node produced an answer.
#[async_trait]
pub trait TxForwarder: Send + Sync {
    async fn inject(&self, payload: &Value) -> Option<InjectOutcome>;
    async fn receipt(&self, tx_hash: &str) -> Option<Value>;
}

#[async_trait]
impl TxForwarder for UpstreamClient {
    async fn inject(&self, payload: &Value) -> Option<InjectOutcome> {
        let resp = UpstreamClient::inject(self, payload).await?;
        Some(InjectOutcome {
            success: resp.body.get("success").and_then(Value::as_bool).unwrap_or(false),
            reason: resp
                .body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: resp.body.get("status").and_then(Value::as_u64).unwrap_or(0),
            node_url: Some(resp.node_url),
        })
    }

    async fn receipt(&self, tx_hash: &str) -> Option<Value> {
        self.tx_receipt(tx_hash).await.filter(|r| !r.is_null())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Forwarded { hash: String },
    /// Held until the sender's missing nonces arrive. The caller sees the hash either way.
    Buffered { hash: String },
}

impl SubmitOutcome {
    pub fn hash(&self) -> &str {
        match self {
            SubmitOutcome::Forwarded { hash } | SubmitOutcome::Buffered { hash } => hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    Rejected { reason: String, status: u64 },
    UpstreamUnavailable,
    BacklogFull { sender: String, limit: usize },
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Rejected { reason, status } => {
                write!(f, "transaction rejected (status {}): {}", status, reason)
            }
            AdmissionError::UpstreamUnavailable => write!(f, "upstream busy, try again later"),
            AdmissionError::BacklogFull { sender, limit } => write!(
                f,
                "sender {} already has {} transactions waiting on a nonce gap",
                sender, limit
            ),
        }
    }
}

impl std::error::Error for AdmissionError {}

struct PendingTx {
    tx: DecodedTx,
    ip: Option<String>,
    received_at: u64,
}

#[derive(Default)]
struct Lane {
    last_forwarded: Option<u64>,
    highest_seen: Option<u64>,
    backlog: BTreeMap<u64, PendingTx>,
    last_activity: u64,
}

impl Lane {
    fn next_expected(&self) -> Option<u64> {
        self.last_forwarded.map(|n| n.saturating_add(1))
    }

    /// Drop buffered copies of nonces that have already gone upstream.
    fn drop_superseded(&mut self) {
        let Some(last) = self.last_forwarded else {
            return;
        };
        let stale: Vec<u64> = self.backlog.range(..=last).map(|(n, _)| *n).collect();
        for nonce in stale {
            self.backlog.remove(&nonce);
            debug!(nonce, "Dropped buffered copy of a forwarded nonce");
        }
    }

    fn head_is_ready(&self) -> bool {
        match (self.backlog.keys().next(), self.next_expected()) {
            (Some(head), Some(next)) => *head == next,
            _ => false,
        }
    }
}

/// Per-sender nonce ordering in front of the forwarder.
pub struct TxAdmission {
    lanes: Mutex<HashMap<Address, Arc<AsyncMutex<Lane>>>>,
    forwarder: Arc<dyn TxForwarder>,
    recorder: Arc<TxStatusRecorder>,
    gas_cache: Arc<GasEstimateCache>,
    config: AdmissionConfig,
}

impl TxAdmission {
    pub fn new(
        config: AdmissionConfig,
        forwarder: Arc<dyn TxForwarder>,
        recorder: Arc<TxStatusRecorder>,
        gas_cache: Arc<GasEstimateCache>,
    ) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            forwarder,
            recorder,
            gas_cache,
            config,
        }
    }

    fn lane(&self, sender: Address) -> Arc<AsyncMutex<Lane>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        lanes.entry(sender).or_default().clone()
    }

    pub async fn submit(
        self: &Arc<Self>,
        tx: GatewayTx,
        ip: Option<&str>,
    ) -> Result<SubmitOutcome, AdmissionError> {
        let tx = match tx {
            GatewayTx::Internal(internal) => return self.forward_internal(internal, ip).await,
            GatewayTx::Legacy(tx) | GatewayTx::AccessList(tx) | GatewayTx::FeeMarket(tx) => tx,
        };

        if !self.config.nonce_validation {
            let hash = self.forward(&tx, ip).await?;
            return Ok(SubmitOutcome::Forwarded { hash });
        }

        let mut lane = self.lane(tx.from).lock_owned().await;
        lane.last_activity = crate::now_millis();
        let frontier = lane.highest_seen;
        lane.highest_seen = Some(frontier.map_or(tx.nonce, |h| h.max(tx.nonce)));

        let in_order = match lane.next_expected() {
            None => true,
            Some(next) => tx.nonce <= next,
        };

        let result = if in_order {
            let result = self.forward(&tx, ip).await;
            if !matches!(result, Err(AdmissionError::UpstreamUnavailable)) {
                lane.last_forwarded =
                    Some(lane.last_forwarded.map_or(tx.nonce, |n| n.max(tx.nonce)));
                lane.drop_superseded();
            }
            if frontier.is_some_and(|h| h > tx.nonce) {
                debug!(nonce = tx.nonce, frontier = ?frontier, "Submission fills a nonce gap");
            }
            result.map(|hash| SubmitOutcome::Forwarded { hash })
        } else {
            self.buffer(&mut lane, tx, ip)
        };

        if lane.head_is_ready() {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drain(lane).await });
        }
        result
    }

    fn buffer(
        &self,
        lane: &mut Lane,
        tx: DecodedTx,
        ip: Option<&str>,
    ) -> Result<SubmitOutcome, AdmissionError> {
        let sender = tx.from.to_string().to_lowercase();
        if lane.backlog.len() >= self.config.max_backlog_per_sender
            && !lane.backlog.contains_key(&tx.nonce)
        {
            warn!(sender = %sender, nonce = tx.nonce, "Nonce backlog full, rejecting");
            let mut status = TxStatus::rejected(tx.hash.to_string(), "nonce backlog full", ip);
            status.raw = Some(tx.raw.clone());
            self.recorder.record(status);
            return Err(AdmissionError::BacklogFull {
                sender,
                limit: self.config.max_backlog_per_sender,
            });
        }

        let waiting_for = lane.next_expected().unwrap_or_default();
        let hash = tx.hash.to_string();
        debug!(sender = %sender, nonce = tx.nonce, waiting_for, "Buffering out-of-order transaction");

        let mut status = TxStatus::rejected(
            hash.clone(),
            format!("buffered: waiting for nonce {}", waiting_for),
            ip,
        );
        status.raw = Some(tx.raw.clone());
        self.recorder.record(status);

        lane.backlog.insert(
            tx.nonce,
            PendingTx {
                tx,
                ip: ip.map(ToOwned::to_owned),
                received_at: crate::now_millis(),
            },
        );
        Ok(SubmitOutcome::Buffered { hash })
    }

    /// Forward contiguous backlog entries while still holding the sender's lane.
    async fn drain(self: Arc<Self>, mut lane: OwnedMutexGuard<Lane>) {
        let pause = Duration::from_millis(self.config.drain_pause_ms);
        while let Some(next) = lane.next_expected() {
            let Some(pending) = lane.backlog.remove(&next) else {
                break;
            };
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            match self.forward(&pending.tx, pending.ip.as_deref()).await {
                Err(AdmissionError::UpstreamUnavailable) => {
                    warn!(nonce = next, "Upstream unavailable while draining, re-buffering");
                    lane.backlog.insert(next, pending);
                    break;
                }
                Err(e) => debug!(nonce = next, "Drained transaction rejected: {}", e),
                Ok(hash) => debug!(nonce = next, hash = %hash, "Drained buffered transaction"),
            }
            lane.last_forwarded = Some(next);
        }
    }

    async fn forward(&self, tx: &DecodedTx, ip: Option<&str>) -> Result<String, AdmissionError> {
        let hash = tx.hash.to_string();
        let payload = UpstreamClient::raw_inject_payload(&tx.raw);
        let outcome = self.forwarder.inject(&payload).await;
        let result = self.settle(&hash, Some(tx.raw.clone()), ip, outcome);
        if result.is_ok() {
            self.spawn_gas_check(tx);
        }
        result
    }

    async fn forward_internal(
        &self,
        tx: InternalTx,
        ip: Option<&str>,
    ) -> Result<SubmitOutcome, AdmissionError> {
        let hash = tx.hash.to_string();
        let outcome = self.forwarder.inject(&tx.payload).await;
        self.settle(&hash, None, ip, outcome)
            .map(|hash| SubmitOutcome::Forwarded { hash })
    }

    /// Record the injection outcome and map it to what the caller sees.
    fn settle(
        &self,
        hash: &str,
        raw: Option<String>,
        ip: Option<&str>,
        outcome: Option<InjectOutcome>,
    ) -> Result<String, AdmissionError> {
        let Some(outcome) = outcome else {
            let mut status = TxStatus::rejected(hash, "upstream unavailable", ip);
            status.raw = raw;
            self.recorder.record(status);
            return Err(AdmissionError::UpstreamUnavailable);
        };

        self.recorder.record(TxStatus {
            tx_hash: hash.to_string(),
            raw,
            injected: true,
            accepted: outcome.success,
            reason: outcome.reason.clone(),
            timestamp: crate::now_millis(),
            ip: ip.map(ToOwned::to_owned),
            node_url: outcome.node_url.clone(),
        });

        if outcome.success || !self.config.adaptive_rejection {
            Ok(hash.to_string())
        } else {
            Err(AdmissionError::Rejected {
                reason: outcome.reason,
                status: outcome.status,
            })
        }
    }

    /// Poll the receipt and drop the cached gas estimate if the call ran out of gas.
    fn spawn_gas_check(&self, tx: &DecodedTx) {
        let (Some(to), Some(selector)) = (tx.to, function_selector(&tx.input)) else {
            return;
        };
        if self.config.receipt_poll_attempts == 0 {
            return;
        }
        let to = to.to_string().to_lowercase();
        let hash = tx.hash.to_string();
        let gas_limit = tx.gas_limit;
        let forwarder = Arc::clone(&self.forwarder);
        let gas_cache = Arc::clone(&self.gas_cache);
        let attempts = self.config.receipt_poll_attempts;
        let interval = Duration::from_millis(self.config.receipt_poll_interval_ms);

        tokio::spawn(async move {
            for _ in 0..attempts {
                tokio::time::sleep(interval).await;
                let Some(receipt) = forwarder.receipt(&hash).await else {
                    continue;
                };
                let out_of_gas = receipt
                    .get("reason")
                    .and_then(Value::as_str)
                    .is_some_and(|r| r.to_lowercase().contains("out of gas"));
                let exhausted = receipt
                    .get("gasUsed")
                    .and_then(parse_quantity)
                    .is_some_and(|used| used == gas_limit);
                if (out_of_gas || exhausted) && gas_cache.invalidate(&to, &selector) {
                    info!(to = %to, selector = %selector, "Evicted undersized gas estimate");
                }
                return;
            }
        });
    }

    /// Expire backlog entries older than the TTL and forget idle, empty lanes.
    pub fn expire_backlogs_at(&self, now_ms: u64) -> usize {
        let ttl_ms = self.config.backlog_ttl_secs.saturating_mul(1_000);
        let lanes: Vec<(Address, Arc<AsyncMutex<Lane>>)> = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(a, l)| (*a, l.clone()))
            .collect();

        let mut expired = 0;
        let mut idle = Vec::new();
        for (sender, lane) in lanes {
            // A lane being drained or submitted to is busy; catch it next sweep.
            let Ok(mut lane) = lane.try_lock() else {
                continue;
            };
            let stale: Vec<u64> = lane
                .backlog
                .iter()
                .filter(|(_, p)| now_ms.saturating_sub(p.received_at) >= ttl_ms)
                .map(|(nonce, _)| *nonce)
                .collect();
            for nonce in stale {
                if let Some(pending) = lane.backlog.remove(&nonce) {
                    let mut status = TxStatus::rejected(
                        pending.tx.hash.to_string(),
                        "nonce gap expired",
                        pending.ip.as_deref(),
                    );
                    status.raw = Some(pending.tx.raw);
                    self.recorder.record(status);
                    expired += 1;
                }
            }
            if lane.backlog.is_empty() && now_ms.saturating_sub(lane.last_activity) >= ttl_ms {
                idle.push(sender);
            }
        }

        if !idle.is_empty() {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            for sender in idle {
                // Only drop lanes nobody is holding right now.
                if lanes.get(&sender).is_some_and(|l| Arc::strong_count(l) == 1) {
                    lanes.remove(&sender);
                }
            }
        }
        expired
    }

    /// Restart draining for idle lanes whose backlog head is next in line, which is where a
    /// drain stops when the upstream drops out mid-way.
    pub fn resume_stalled_drains(self: &Arc<Self>) -> usize {
        let lanes: Vec<Arc<AsyncMutex<Lane>>> = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut resumed = 0;
        for lane in lanes {
            let Ok(lane) = lane.try_lock_owned() else {
                continue;
            };
            if lane.head_is_ready() {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.drain(lane).await });
                resumed += 1;
            }
        }
        resumed
    }

    pub fn spawn_backlog_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = Duration::from_secs(self.config.backlog_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = crate::now_millis();
                let expired = this.expire_backlogs_at(now);
                let stale_estimates = this.gas_cache.purge_expired_at(now);
                if stale_estimates > 0 {
                    debug!(stale_estimates, "Purged expired gas estimates");
                }
                if expired > 0 {
                    info!(expired, "Expired gapped transactions");
                }
                let resumed = this.resume_stalled_drains();
                if resumed > 0 {
                    info!(resumed, "Resumed stalled backlog drains");
                }
            }
        })
    }

    /// Buffered entries for `sender`, or `None` while the lane is busy.
    pub fn backlog_len(&self, sender: Address) -> Option<usize> {
        let lane = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sender)
            .cloned()?;
        let len = lane.try_lock().ok()?.backlog.len();
        Some(len)
    }
}

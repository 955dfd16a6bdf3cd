use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ban_store::{BanRecord, BanStore};
use crate::config::RateLimitConfig;
use crate::recorder::{TxStatus, TxStatusRecorder};
use crate::tx::{decode_raw_transaction, DecodedTx, InternalTx};

const RAW_TX_METHOD: &str = "eth_sendRawTransaction";
const SEND_TX_METHOD: &str = "eth_sendTransaction";

/// Decides whether an address belongs to an account class that is never throttled.
#[async_trait]
pub trait ExemptionCheck: Send + Sync {
    async fn is_exempt(&self, address: &str) -> bool;
}

pub struct NoExemptions;

#[async_trait]
impl ExemptionCheck for NoExemptions {
    async fn is_exempt(&self, _address: &str) -> bool {
        false
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// What one spam sweep decided.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub banned_ips: Vec<String>,
    pub new_spammers: Vec<String>,
}

#[derive(Default)]
struct SenderCount {
    count: u64,
    ips: HashMap<String, u64>,
}

#[derive(Default)]
struct TargetCount {
    count: u64,
    senders: HashMap<String, SenderCount>,
}

/// Address-ceiling rejections since the last sweep.
#[derive(Default)]
struct AbuseAggregate {
    targets: HashMap<String, TargetCount>,
    senders: HashMap<String, u64>,
}

impl AbuseAggregate {
    fn record(&mut self, ip: &str, from: &str, to: &str) {
        let target = self.targets.entry(to.to_string()).or_default();
        target.count += 1;
        let sender = target.senders.entry(from.to_string()).or_default();
        sender.count += 1;
        *sender.ips.entry(ip.to_string()).or_default() += 1;
        *self.senders.entry(from.to_string()).or_default() += 1;
    }
}

#[derive(Default)]
struct GuardState {
    heavy_requests: HashMap<String, VecDeque<u64>>,
    heavy_addresses: HashMap<String, VecDeque<u64>>,
    bans: HashMap<String, u64>,
    spammers: HashSet<String>,
    aggregate: AbuseAggregate,
}

fn trim(window: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
    while window
        .front()
        .is_some_and(|t| now_ms.saturating_sub(*t) >= window_ms)
    {
        window.pop_front();
    }
}

fn window_len(
    windows: &mut HashMap<String, VecDeque<u64>>,
    key: &str,
    now_ms: u64,
    window_ms: u64,
) -> usize {
    match windows.get_mut(key) {
        Some(window) => {
            trim(window, now_ms, window_ms);
            window.len()
        }
        None => 0,
    }
}

enum HeavyVerdict {
    Pass,
    Reject(String),
    Ban,
}

/// A submitted transaction as far as auditing needs it.
struct Submission {
    hash: String,
    raw: Option<String>,
    decoded: Option<DecodedTx>,
}

/// Per-IP and per-address admission policy for inbound RPC calls.
pub struct AbuseGuard {
    config: RateLimitConfig,
    state: Mutex<GuardState>,
    store: Arc<BanStore>,
    recorder: Arc<TxStatusRecorder>,
    exemptions: Arc<dyn ExemptionCheck>,
}

impl AbuseGuard {
    /// Seeds the ban and spammer sets from `store`. Unreadable files are logged and skipped.
    pub fn new(
        config: RateLimitConfig,
        store: Arc<BanStore>,
        recorder: Arc<TxStatusRecorder>,
        exemptions: Arc<dyn ExemptionCheck>,
    ) -> Self {
        let mut state = GuardState::default();
        match store.load_bans() {
            Ok(records) => {
                for record in records {
                    let ts = state.bans.entry(record.ip).or_insert(record.timestamp);
                    *ts = (*ts).max(record.timestamp);
                }
            }
            Err(e) => warn!("Could not load ban list: {}", e),
        }
        match store.load_spammers() {
            Ok(spammers) => state.spammers.extend(spammers),
            Err(e) => warn!("Could not load spammer list: {}", e),
        }
        if !state.bans.is_empty() || !state.spammers.is_empty() {
            info!(
                bans = state.bans.len(),
                spammers = state.spammers.len(),
                "Loaded abuse lists"
            );
        }
        Self {
            config,
            state: Mutex::new(state),
            store,
            recorder,
            exemptions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_heavy(&self, method: &str) -> bool {
        self.config.heavy_methods.iter().any(|m| m == method)
    }

    /// Admit or reject one inbound call, applying the soft-reject delay when configured.
    pub async fn admit(&self, ip: &str, method: &str, params: &Value) -> Admission {
        let decision = self.check_at(ip, method, params, crate::now_millis()).await;
        if !decision.is_admitted() && self.config.soft_reject {
            let delay = {
                let mut rng = rand::thread_rng();
                rng.gen_range(self.config.soft_reject_min_ms..=self.config.soft_reject_max_ms)
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        decision
    }

    pub async fn check_at(&self, ip: &str, method: &str, params: &Value, now_ms: u64) -> Admission {
        if !self.config.enabled || self.config.allowed_ips.iter().any(|a| a == ip) {
            return Admission::Admitted;
        }

        let is_tx_method = method == RAW_TX_METHOD || method == SEND_TX_METHOD;

        if self.is_banned_at(ip, now_ms) {
            if is_tx_method {
                if let Some(submission) = parse_submission(method, params) {
                    self.record_rejection(ip, &submission, "IP banned");
                }
            }
            return Admission::Rejected("IP banned".to_string());
        }

        if !self.is_heavy(method) {
            return Admission::Admitted;
        }

        let submission = if is_tx_method {
            parse_submission(method, params)
        } else {
            None
        };

        match self.heavy_verdict(ip, now_ms) {
            HeavyVerdict::Pass => {}
            HeavyVerdict::Reject(reason) => {
                if let Some(submission) = &submission {
                    self.record_rejection(ip, submission, &reason);
                }
                return Admission::Rejected(reason);
            }
            HeavyVerdict::Ban => {
                self.ban_at(ip, now_ms);
                if let Some(submission) = &submission {
                    self.record_rejection(ip, submission, "IP banned");
                }
                return Admission::Rejected("IP banned".to_string());
            }
        }

        if method != RAW_TX_METHOD {
            return Admission::Admitted;
        }
        // Undecodable payloads go through so the handler reports the malformed input.
        let Some(submission) = submission else {
            return Admission::Admitted;
        };
        let Some(tx) = &submission.decoded else {
            return Admission::Admitted;
        };
        self.check_addresses(ip, tx, &submission, now_ms).await
    }

    fn heavy_verdict(&self, ip: &str, now_ms: u64) -> HeavyVerdict {
        let mut state = self.lock();
        let window = state.heavy_requests.entry(ip.to_string()).or_default();
        trim(window, now_ms, self.config.window_ms);
        window.push_back(now_ms);
        let count = window.len();
        if count >= self.config.heavy_hard_ceiling {
            warn!(ip, count, "Heavy request ceiling exceeded, banning IP");
            HeavyVerdict::Ban
        } else if count > self.config.heavy_soft_ceiling {
            debug!(ip, count, "Heavy request soft ceiling exceeded");
            HeavyVerdict::Reject("rate limit exceeded".to_string())
        } else {
            HeavyVerdict::Pass
        }
    }

    async fn check_addresses(
        &self,
        ip: &str,
        tx: &DecodedTx,
        submission: &Submission,
        now_ms: u64,
    ) -> Admission {
        let from = tx.from.to_string().to_lowercase();
        let to = tx.to.map(|a| a.to_string().to_lowercase());
        let window_ms = self.config.window_ms;
        let ceiling = self.config.address_ceiling;

        let over_ceiling = {
            let mut state = self.lock();
            if state.spammers.contains(&from) {
                drop(state);
                self.record_rejection(ip, submission, "sender blacklisted");
                return Admission::Rejected("sender blacklisted".to_string());
            }
            let from_over = self.config.limit_from_address
                && window_len(&mut state.heavy_addresses, &from, now_ms, window_ms) >= ceiling;
            let to_over = self.config.limit_to_address
                && to.as_deref().is_some_and(|to| {
                    window_len(&mut state.heavy_addresses, to, now_ms, window_ms) >= ceiling
                });
            if !from_over && !to_over {
                state
                    .heavy_addresses
                    .entry(from.clone())
                    .or_default()
                    .push_back(now_ms);
                if let Some(to) = &to {
                    state
                        .heavy_addresses
                        .entry(to.clone())
                        .or_default()
                        .push_back(now_ms);
                }
            }
            from_over || to_over
        };

        if !over_ceiling {
            return Admission::Admitted;
        }

        if self.exemptions.is_exempt(&from).await {
            debug!(from = %from, "Address ceiling reached by exempt account, allowing");
            return Admission::Admitted;
        }

        let target = to.as_deref().unwrap_or("contract-creation");
        self.lock().aggregate.record(ip, &from, target);
        self.record_rejection(ip, submission, "address rate limit exceeded");
        Admission::Rejected("address rate limit exceeded".to_string())
    }

    fn record_rejection(&self, ip: &str, submission: &Submission, reason: &str) {
        let mut status = TxStatus::rejected(submission.hash.clone(), reason, Some(ip));
        status.raw = submission.raw.clone();
        self.recorder.record(status);
    }

    pub fn is_banned_at(&self, ip: &str, now_ms: u64) -> bool {
        self.lock()
            .bans
            .get(ip)
            .is_some_and(|ts| now_ms.saturating_sub(*ts) < self.config.ban_duration_ms)
    }

    pub fn is_spammer(&self, address: &str) -> bool {
        self.lock().spammers.contains(&address.to_lowercase())
    }

    pub fn ban_count(&self) -> usize {
        self.lock().bans.len()
    }

    fn ban_at(&self, ip: &str, now_ms: u64) {
        self.lock().bans.insert(ip.to_string(), now_ms);
        let record = BanRecord {
            ip: ip.to_string(),
            timestamp: now_ms,
        };
        if let Err(e) = self.store.append_ban(&record) {
            warn!(ip, "Failed to persist ban: {}", e);
        }
    }

    /// Add an address to the durable spammer set. Returns false if it was already there.
    pub fn add_spammer(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        if !self.lock().spammers.insert(address.clone()) {
            return false;
        }
        if let Err(e) = self.store.append_spammer(&address) {
            warn!(address = %address, "Failed to persist spammer: {}", e);
        }
        true
    }

    /// Promote the worst offenders since the last sweep to bans and spammers, then reset.
    pub fn sweep_spammers_at(&self, now_ms: u64) -> SweepReport {
        let allowed = self.config.allowed_tx_count_in_interval;
        let window_ms = self.config.window_ms;
        let aggregate = {
            let mut state = self.lock();
            state.heavy_requests.retain(|_, w| {
                trim(w, now_ms, window_ms);
                !w.is_empty()
            });
            state.heavy_addresses.retain(|_, w| {
                trim(w, now_ms, window_ms);
                !w.is_empty()
            });
            std::mem::take(&mut state.aggregate)
        };

        let mut ip_totals: HashMap<&str, u64> = HashMap::new();
        let mut offenders: HashSet<&str> = HashSet::new();
        for (to, target) in &aggregate.targets {
            if target.count > allowed {
                debug!(to = %to, count = target.count, "Abused target address");
            }
            for (from, sender) in &target.senders {
                if sender.count > allowed {
                    offenders.insert(from.as_str());
                }
                for (ip, count) in &sender.ips {
                    *ip_totals.entry(ip.as_str()).or_default() += *count;
                }
            }
        }
        for (from, count) in &aggregate.senders {
            if *count > allowed {
                offenders.insert(from.as_str());
            }
        }

        let mut ranked: Vec<(&str, u64)> = ip_totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut report = SweepReport::default();
        for (ip, total) in ranked {
            if total <= allowed {
                break;
            }
            if self.config.allowed_ips.iter().any(|a| a == ip) {
                continue;
            }
            info!(ip, total, "Banning IP after spam sweep");
            self.ban_at(ip, now_ms);
            report.banned_ips.push(ip.to_string());
        }

        let mut offenders: Vec<&str> = offenders.into_iter().collect();
        offenders.sort_unstable();
        for from in offenders {
            if self.add_spammer(from) {
                info!(address = from, "Blacklisting sender after spam sweep");
                report.new_spammers.push(from.to_string());
            }
        }
        report
    }

    /// Drop bans older than the ban duration from the live set. The ban file keeps them.
    pub fn expire_bans_at(&self, now_ms: u64) -> usize {
        let ttl = self.config.ban_duration_ms;
        let mut state = self.lock();
        let before = state.bans.len();
        state.bans.retain(|_, ts| now_ms.saturating_sub(*ts) < ttl);
        before - state.bans.len()
    }

    pub fn spawn_sweep_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let spam = {
            let guard = Arc::clone(self);
            let period = Duration::from_secs(self.config.spam_sweep_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let report = guard.sweep_spammers_at(crate::now_millis());
                    if !report.banned_ips.is_empty() || !report.new_spammers.is_empty() {
                        info!(
                            banned = report.banned_ips.len(),
                            spammers = report.new_spammers.len(),
                            "Spam sweep complete"
                        );
                    }
                }
            })
        };
        let expiry = {
            let guard = Arc::clone(self);
            let period = Duration::from_secs(self.config.ban_expiry_sweep_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let expired = guard.expire_bans_at(crate::now_millis());
                    if expired > 0 {
                        info!(expired, "Expired IP bans");
                    }
                }
            })
        };
        vec![spam, expiry]
    }
}

fn parse_submission(method: &str, params: &Value) -> Option<Submission> {
    let first = params.as_array().and_then(|p| p.first())?;
    if method == RAW_TX_METHOD {
        let raw = first.as_str()?;
        let tx = decode_raw_transaction(raw).ok()?;
        let decoded = tx.into_signed()?;
        Some(Submission {
            hash: decoded.hash.to_string(),
            raw: Some(decoded.raw.clone()),
            decoded: Some(decoded),
        })
    } else {
        let internal = InternalTx::from_payload(first.clone()).ok()?;
        Some(Submission {
            hash: internal.hash.to_string(),
            raw: None,
            decoded: None,
        })
    }
}

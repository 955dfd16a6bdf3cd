use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One attempted injection, including rejections that never reached a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStatus {
    pub tx_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub injected: bool,
    pub accepted: bool,
    pub reason: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_url: Option<String>,
}

impl TxStatus {
    /// A submission turned away before injection.
    pub fn rejected(tx_hash: impl Into<String>, reason: impl Into<String>, ip: Option<&str>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            raw: None,
            injected: false,
            accepted: false,
            reason: reason.into(),
            timestamp: crate::now_millis(),
            ip: ip.map(ToOwned::to_owned),
            node_url: None,
        }
    }
}

/// Per-method interface latency aggregated over one flush interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfSample {
    pub method: String,
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub timestamp: u64,
}

/// Durable store for audit records. Calls return immediately; the sink owns the write.
pub trait StatusSink: Send + Sync {
    fn persist_tx_statuses(&self, batch: Vec<TxStatus>);
    fn persist_perf_samples(&self, batch: Vec<PerfSample>);
}

pub struct TxStatusRecorder {
    buffer: Mutex<Vec<TxStatus>>,
    flush_threshold: usize,
    sink: Arc<dyn StatusSink>,
}

impl TxStatusRecorder {
    pub fn new(sink: Arc<dyn StatusSink>, flush_threshold: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            flush_threshold: flush_threshold.max(1),
            sink,
        }
    }

    pub fn record(&self, status: TxStatus) {
        let full = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(status);
            if buffer.len() >= self.flush_threshold {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            debug!(count = batch.len(), "Flushing tx statuses at threshold");
            self.sink.persist_tx_statuses(batch);
        }
    }

    pub fn flush(&self) -> usize {
        let batch = std::mem::take(
            &mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = batch.len();
        if count > 0 {
            self.sink.persist_tx_statuses(batch);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Default, Clone, Copy)]
struct MethodStats {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

pub struct PerfRecorder {
    stats: Mutex<HashMap<String, MethodStats>>,
    sink: Arc<dyn StatusSink>,
}

impl PerfRecorder {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            sink,
        }
    }

    pub fn record(&self, method: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(method.to_string()).or_default();
        entry.count += 1;
        entry.total_ms += ms;
        entry.max_ms = entry.max_ms.max(ms);
    }

    pub fn flush(&self) -> usize {
        let drained = std::mem::take(&mut *self.stats.lock().unwrap_or_else(PoisonError::into_inner));
        if drained.is_empty() {
            return 0;
        }
        let timestamp = crate::now_millis();
        let mut samples: Vec<PerfSample> = drained
            .into_iter()
            .map(|(method, s)| PerfSample {
                method,
                count: s.count,
                total_ms: s.total_ms,
                max_ms: s.max_ms,
                timestamp,
            })
            .collect();
        samples.sort_by(|a, b| a.method.cmp(&b.method));
        let count = samples.len();
        self.sink.persist_perf_samples(samples);
        count
    }
}

/// Flush both recorders on a fixed interval for the life of the process.
pub fn spawn_flush_loop(
    statuses: Arc<TxStatusRecorder>,
    perf: Arc<PerfRecorder>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let tx_count = statuses.flush();
            let perf_count = perf.flush();
            if tx_count > 0 || perf_count > 0 {
                debug!(tx_count, perf_count, "Periodic recorder flush");
            }
        }
    })
}

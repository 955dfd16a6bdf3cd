use palisade_core::{PerfSample, StatusSink, TxStatus};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

pub const TX_STATUS_FILE: &str = "tx_statuses.jsonl";
pub const PERF_SAMPLE_FILE: &str = "perf_samples.jsonl";

/// One batch, already rendered as JSON lines.
struct Batch {
    path: PathBuf,
    lines: String,
    count: usize,
}

fn render<T: Serialize>(records: &[T]) -> serde_json::Result<String> {
    let mut lines = String::new();
    for record in records {
        lines.push_str(&serde_json::to_string(record)?);
        lines.push('\n');
    }
    Ok(lines)
}

fn append(path: &Path, lines: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(lines.as_bytes())?;
    file.flush()
}

fn write_batches(mut batches: UnboundedReceiver<Batch>) {
    while let Some(batch) = batches.blocking_recv() {
        match append(&batch.path, &batch.lines) {
            Ok(()) => debug!(count = batch.count, path = %batch.path.display(), "Persisted records"),
            Err(e) => warn!(path = %batch.path.display(), "Failed to persist records: {}", e),
        }
    }
}

/// Durable sink writing JSON lines under the data directory.
///
/// Batches are handed to one writer thread, so records land whole and in the order they were
/// persisted. Dropping the sink waits for queued batches to be written.
pub struct JsonlSink {
    dir: PathBuf,
    batches: Option<UnboundedSender<Batch>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (tx, rx) = unbounded_channel();
        let writer = std::thread::Builder::new()
            .name("jsonl-writer".to_string())
            .spawn(move || write_batches(rx));
        let writer = match writer {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to start the JSON-lines writer, records will be dropped: {}", e);
                None
            }
        };
        Self {
            dir: dir.into(),
            batches: writer.is_some().then_some(tx),
            writer,
        }
    }

    fn enqueue<T: Serialize>(&self, file: &'static str, records: &[T]) {
        if records.is_empty() {
            return;
        }
        let path = self.dir.join(file);
        let lines = match render(records) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(path = %path.display(), "Failed to encode records: {}", e);
                return;
            }
        };
        let Some(batches) = &self.batches else {
            return;
        };
        let batch = Batch {
            path,
            lines,
            count: records.len(),
        };
        if batches.send(batch).is_err() {
            warn!(file, "JSON-lines writer is gone, dropping records");
        }
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        // Closing the channel lets the writer finish the queue and exit.
        self.batches.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("JSON-lines writer panicked");
            }
        }
    }
}

impl StatusSink for JsonlSink {
    fn persist_tx_statuses(&self, statuses: Vec<TxStatus>) {
        self.enqueue(TX_STATUS_FILE, &statuses);
    }

    fn persist_perf_samples(&self, samples: Vec<PerfSample>) {
        self.enqueue(PERF_SAMPLE_FILE, &samples);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn statuses_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path());

        sink.persist_tx_statuses(vec![TxStatus::rejected("0xaa", "IP banned", Some("1.2.3.4"))]);
        sink.persist_tx_statuses(vec![TxStatus::rejected("0xbb", "sender blacklisted", None)]);
        drop(sink);

        let lines = read_lines(&dir.path().join(TX_STATUS_FILE));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["txHash"], "0xaa");
        assert_eq!(lines[0]["ip"], "1.2.3.4");
        assert_eq!(lines[1]["reason"], "sender blacklisted");
        assert!(lines[1].get("ip").is_none());
    }

    #[test]
    fn concurrent_batches_stay_whole_and_ordered_per_caller() {
        let dir = tempfile::tempdir().unwrap();
        let sink = std::sync::Arc::new(JsonlSink::new(dir.path()));

        let callers: Vec<_> = (0..4)
            .map(|caller| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for batch in 0..25 {
                        let records = (0..20)
                            .map(|i| {
                                let hash = format!("0x{:02x}{:04x}", caller, batch * 20 + i);
                                TxStatus::rejected(hash, "x".repeat(200), None)
                            })
                            .collect();
                        sink.persist_tx_statuses(records);
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        drop(std::sync::Arc::into_inner(sink));

        let lines = read_lines(&dir.path().join(TX_STATUS_FILE));
        assert_eq!(lines.len(), 4 * 25 * 20);
        for caller in 0..4 {
            let prefix = format!("0x{:02x}", caller);
            let seen: Vec<String> = lines
                .iter()
                .filter_map(|l| l["txHash"].as_str())
                .filter(|h| h.starts_with(&prefix))
                .map(ToOwned::to_owned)
                .collect();
            let mut sorted = seen.clone();
            sorted.sort();
            assert_eq!(seen.len(), 500);
            assert_eq!(seen, sorted, "caller {} records out of order", caller);
        }
    }

    #[test]
    fn empty_batches_create_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path());
        sink.persist_perf_samples(Vec::new());
        drop(sink);
        assert!(!dir.path().join(PERF_SAMPLE_FILE).exists());
    }

    #[test]
    fn unwritable_directory_is_logged_not_fatal() {
        let sink = JsonlSink::new("/nonexistent/palisade/data");
        sink.persist_tx_statuses(vec![TxStatus::rejected("0xcc", "x", None)]);
        drop(sink);
    }
}

//! Channel and job types for the sender pipeline.
//!
//! Scanner -> work channel -> Workers, with an unbounded results channel
//! flowing back so workers never block on reporting.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Minimum work-channel capacity; scaled up with the connection count.
pub const WORK_CHANNEL_MIN: usize = 1024;

/// Per-task attempt cap; beyond it the task is a terminal failure.
pub const MAX_ATTEMPTS: u32 = 5;

/// Create the bounded Scanner -> Workers channel.
pub fn work_channel(conns: usize) -> (mpsc::Sender<TransferTask>, mpsc::Receiver<TransferTask>) {
    mpsc::channel(WORK_CHANNEL_MIN.max(conns * 128))
}

/// Create the unbounded Workers -> Scanner results channel.
pub fn report_channel() -> (
    mpsc::UnboundedSender<TaskOutcome>,
    mpsc::UnboundedReceiver<TaskOutcome>,
) {
    mpsc::unbounded_channel()
}

// =============================================================================
// Jobs
// =============================================================================

/// A candidate file promoted to ready by the probe.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Name relative to the source directory.
    pub name: String,
    pub absolute_path: PathBuf,
    /// Stable size observed by the readiness probe.
    pub size_at_probe: u64,
    pub ready: bool,
}

/// One file transfer, owned by exactly one worker at a time.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub entry: SourceEntry,
    /// Destination directory under the receiver's out_dir; empty selects
    /// the legacy protocol.
    pub destination_path: String,
    pub attempts: u32,
}

/// Worker report back to the scanner, which owns all bookkeeping.
#[derive(Debug)]
pub enum TaskOutcome {
    Sent { name: String, bytes: u64 },
    /// Transient failure; the scanner re-enqueues up to [`MAX_ATTEMPTS`].
    Retry { task: TransferTask, error: String },
    /// Source file vanished between probe and send.
    Missing { name: String },
}

// =============================================================================
// Stats
// =============================================================================

/// Final run summary surfaced to the operator.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TransferStats {
    pub files_sent: u64,
    pub files_failed: u64,
    pub files_missing: u64,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub per_file_errors: Vec<FileError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub name: String,
    pub attempts: u32,
    pub error: String,
}

impl TransferStats {
    pub fn record_sent(&mut self, bytes: u64) {
        self.files_sent += 1;
        self.bytes += bytes;
    }

    pub fn record_failed(&mut self, name: String, attempts: u32, error: String) {
        self.files_failed += 1;
        self.per_file_errors.push(FileError {
            name,
            attempts,
            error,
        });
    }

    pub fn summary_line(&self) -> String {
        let elapsed = self.elapsed_secs.max(1e-9);
        let mib = self.bytes as f64 / (1024.0 * 1024.0);
        format!(
            "files={} failed={} missing={} bytes={} elapsed={:.3}s rate={:.2} MiB/s files/s={:.1}",
            self.files_sent,
            self.files_failed,
            self.files_missing,
            self.bytes,
            elapsed,
            mib / elapsed,
            self.files_sent as f64 / elapsed,
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn work_channel_delivers_tasks() {
        let (tx, mut rx) = work_channel(1);
        tx.send(TransferTask {
            entry: SourceEntry {
                name: "a.jpg".to_string(),
                absolute_path: PathBuf::from("/src/a.jpg"),
                size_at_probe: 11,
                ready: true,
            },
            destination_path: String::new(),
            attempts: 0,
        })
        .await
        .unwrap();
        drop(tx);

        let task = rx.recv().await.unwrap();
        assert_eq!(task.entry.name, "a.jpg");
        assert_eq!(task.attempts, 0);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn stats_accumulate() {
        let mut stats = TransferStats::default();
        stats.record_sent(1024);
        stats.record_sent(1024);
        stats.record_failed("b.jpg".to_string(), 5, "connection reset".to_string());

        assert_eq!(stats.files_sent, 2);
        assert_eq!(stats.bytes, 2048);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.per_file_errors.len(), 1);
        assert_eq!(stats.per_file_errors[0].name, "b.jpg");
    }

    #[test]
    fn stats_serialize_to_json() {
        let mut stats = TransferStats::default();
        stats.record_sent(100);
        stats.elapsed_secs = 0.5;

        let json = stats.to_json().unwrap();
        assert!(json.contains("\"files_sent\":1"));
        assert!(json.contains("\"bytes\":100"));
    }
}

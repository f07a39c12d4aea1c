//! Source directory scanner.
//!
//! Polls the source directory, filters candidates by glob pattern and the
//! strict `start_after` bound, probes readiness, and feeds ready files to
//! the worker pool. The scanner alone owns the `in_flight` / `completed`
//! bookkeeping; workers report outcomes back over the results channel.

pub mod pattern;
pub mod readiness;

use crate::config::{SenderConfig, SHUTDOWN_GRACE, STALE_PART_AGE};
use crate::sender::channel::{
    SourceEntry, TaskOutcome, TransferStats, TransferTask, MAX_ATTEMPTS,
};
use anyhow::{Context, Result};
use readiness::{probe, ProbeConfig, Readiness};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub src_dir: PathBuf,
    pub pattern: String,
    pub start_after: String,
    pub max_files: u64,
    pub once: bool,
    pub poll_ms: u64,
    pub drain_grace_ms: u64,
    pub cleanup_part_files: bool,
    pub dest_prefix: String,
    pub preserve_structure: bool,
    pub probe: ProbeConfig,
}

impl ScannerConfig {
    pub fn from_sender(config: &SenderConfig) -> Self {
        Self {
            src_dir: config.src_dir.clone(),
            pattern: config.pattern.clone(),
            start_after: config.start_after.clone(),
            max_files: config.max_files,
            once: config.once,
            poll_ms: config.poll_ms,
            drain_grace_ms: config.drain_grace_ms,
            cleanup_part_files: config.cleanup_part_files,
            dest_prefix: config.dest_prefix().to_string(),
            preserve_structure: config.preserve_structure,
            probe: ProbeConfig {
                lookahead: config.lookahead,
                stable_ms: config.stable_ms,
                file_wait_ms: config.file_wait_ms,
            },
        }
    }
}

pub struct Scanner {
    config: ScannerConfig,
    in_flight: HashSet<String>,
    completed: HashSet<String>,
    /// Every matching name ever listed; drives the once-mode drain timer.
    seen: HashSet<String>,
    stats: TransferStats,
}

impl Scanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self {
            config,
            in_flight: HashSet::new(),
            completed: HashSet::new(),
            seen: HashSet::new(),
            stats: TransferStats::default(),
        }
    }

    /// Run the scan/probe/dispatch loop until the run completes or is
    /// cancelled. Dropping `work_tx` on return shuts the workers down.
    pub async fn run(
        mut self,
        work_tx: mpsc::Sender<TransferTask>,
        mut report_rx: mpsc::UnboundedReceiver<TaskOutcome>,
        cancel: CancellationToken,
    ) -> Result<TransferStats> {
        if self.config.cleanup_part_files {
            self.cleanup_stale_parts().await;
        }

        let drain_grace = Duration::from_millis(self.config.drain_grace_ms);
        let mut last_new = Instant::now();
        let mut lookahead_waived = false;

        'scan: loop {
            while let Ok(outcome) = report_rx.try_recv() {
                self.apply_outcome(outcome, &work_tx, true).await;
            }
            if self.sent_enough() || cancel.is_cancelled() {
                break;
            }

            let names = self.discover().await?;
            for name in &names {
                if self.seen.insert(name.clone()) {
                    last_new = Instant::now();
                    lookahead_waived = false;
                }
            }

            if self.config.once && !lookahead_waived && last_new.elapsed() >= drain_grace {
                info!("no new files for {}ms; draining backlog without lookahead",
                    self.config.drain_grace_ms);
                lookahead_waived = true;
            }

            for (index, name) in names.iter().enumerate() {
                if cancel.is_cancelled() {
                    continue 'scan;
                }
                if !self.is_candidate(name) {
                    continue;
                }
                if self.config.max_files > 0 {
                    let remaining = self.config.max_files - self.stats.files_sent;
                    if self.in_flight.len() as u64 >= remaining {
                        break;
                    }
                }

                let path = self.config.src_dir.join(name);
                match probe(&path, index, names.len(), lookahead_waived, &self.config.probe)
                    .await
                {
                    Readiness::Ready(size) => {
                        let task = self.make_task(name, path, size);
                        self.in_flight.insert(name.clone());
                        debug!(name, size, "dispatching");
                        if work_tx.send(task).await.is_err() {
                            break 'scan;
                        }
                    }
                    Readiness::NotYet => {}
                    Readiness::Missing => {
                        warn!(name, "file_missing: candidate vanished before probe");
                        self.completed.insert(name.clone());
                        self.stats.files_missing += 1;
                    }
                }
            }

            if self.config.once
                && self.in_flight.is_empty()
                && !names.iter().any(|n| self.is_candidate(n))
            {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(Duration::from_millis(self.config.poll_ms)) => {}
                outcome = report_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.apply_outcome(outcome, &work_tx, true).await;
                    }
                }
            }
        }

        self.drain_in_flight(&work_tx, &mut report_rx, &cancel).await;
        Ok(self.stats)
    }

    /// Wait for in-flight transfers to resolve; a cancelled run gets a
    /// bounded grace period instead of an open-ended wait.
    async fn drain_in_flight(
        &mut self,
        work_tx: &mpsc::Sender<TransferTask>,
        report_rx: &mut mpsc::UnboundedReceiver<TaskOutcome>,
        cancel: &CancellationToken,
    ) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.in_flight.is_empty() {
            let outcome = if cancel.is_cancelled() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(pending = self.in_flight.len(), "grace period expired; abandoning in-flight files");
                    break;
                }
                match timeout(remaining, report_rx.recv()).await {
                    Ok(Some(outcome)) => outcome,
                    _ => break,
                }
            } else {
                tokio::select! {
                    outcome = report_rx.recv() => match outcome {
                        Some(outcome) => outcome,
                        None => break,
                    },
                    _ = cancel.cancelled() => continue,
                }
            };
            let allow_retry = !cancel.is_cancelled();
            self.apply_outcome(outcome, work_tx, allow_retry).await;
        }
    }

    async fn apply_outcome(
        &mut self,
        outcome: TaskOutcome,
        work_tx: &mpsc::Sender<TransferTask>,
        allow_retry: bool,
    ) {
        match outcome {
            TaskOutcome::Sent { name, bytes } => {
                self.in_flight.remove(&name);
                self.completed.insert(name);
                self.stats.record_sent(bytes);
            }
            TaskOutcome::Missing { name } => {
                warn!(name, "file_missing: source vanished before send");
                self.in_flight.remove(&name);
                self.completed.insert(name);
                self.stats.files_missing += 1;
            }
            TaskOutcome::Retry { mut task, error } => {
                task.attempts += 1;
                let name = task.entry.name.clone();
                let attempts = task.attempts;
                if allow_retry && attempts < MAX_ATTEMPTS {
                    warn!(name, attempts, error, "transfer failed; re-enqueueing");
                    if work_tx.send(task).await.is_ok() {
                        return;
                    }
                }
                error!(name, attempts, error, "transfer failed terminally");
                self.in_flight.remove(&name);
                self.completed.insert(name.clone());
                self.stats.record_failed(name, attempts, error);
            }
        }
    }

    fn sent_enough(&self) -> bool {
        self.config.max_files > 0 && self.stats.files_sent >= self.config.max_files
    }

    fn is_candidate(&self, name: &str) -> bool {
        name > self.config.start_after.as_str()
            && !self.in_flight.contains(name)
            && !self.completed.contains(name)
    }

    fn make_task(&self, name: &str, path: PathBuf, size: u64) -> TransferTask {
        let wire_name = if self.config.preserve_structure {
            name.to_string()
        } else {
            Path::new(name)
                .file_name()
                .map(|base| base.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string())
        };
        TransferTask {
            entry: SourceEntry {
                name: wire_name,
                absolute_path: path,
                size_at_probe: size,
                ready: true,
            },
            destination_path: self.config.dest_prefix.clone(),
            attempts: 0,
        }
    }

    async fn discover(&self) -> Result<Vec<String>> {
        discover(&self.config.src_dir, &self.config.pattern).await
    }

    /// Startup hygiene: remove orphaned `.part` files older than the stale
    /// threshold. Never touches names currently in flight.
    async fn cleanup_stale_parts(&self) {
        let mut rd = match fs::read_dir(&self.config.src_dir).await {
            Ok(rd) => rd,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !name.ends_with(".part") || self.in_flight.contains(&name) {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok());
            if let Some(age) = age {
                if age >= STALE_PART_AGE {
                    match fs::remove_file(entry.path()).await {
                        Ok(()) => info!(name, "removed stale .part file"),
                        Err(e) => warn!(name, error = %e, "failed to remove stale .part file"),
                    }
                }
            }
        }
    }
}

/// List matching regular files in `src_dir`, sorted ascending by name.
/// A missing directory yields an empty listing, as the producer may not
/// have created it yet.
pub async fn discover(src_dir: &Path, pattern_str: &str) -> Result<Vec<String>> {
    let mut rd = match fs::read_dir(src_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to list {}", src_dir.display()))
        }
    };

    let mut names = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if !pattern::matches(pattern_str, &name) {
            continue;
        }
        match entry.file_type().await {
            Ok(ft) if ft.is_file() => names.push(name),
            _ => {}
        }
    }
    names.sort();
    Ok(names)
}

// =============================================================================
// Tests
// =============================================================================

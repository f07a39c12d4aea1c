//! Sender pipeline: Scanner -> work channel -> Workers -> TCP.
//!
//! `run` wires the scanner and the worker pool together and returns the
//! final transfer summary. The scanner owns all candidate bookkeeping;
//! workers own their sockets exclusively.

pub mod channel;
pub mod worker;

pub use channel::{FileError, SourceEntry, TaskOutcome, TransferStats, TransferTask};
pub use worker::{Worker, WorkerConfig};

use crate::config::SenderConfig;
use crate::scan::readiness::{probe, Readiness};
use crate::scan::{discover, Scanner, ScannerConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run a sender to completion (backlog drain, max_files, or cancellation).
pub async fn run(config: SenderConfig, cancel: CancellationToken) -> Result<TransferStats> {
    config.validate()?;
    let started = Instant::now();

    let mut stats = if config.count_first {
        run_counted(&config, cancel).await?
    } else {
        run_pipeline(&config, cancel).await?
    };
    stats.elapsed_secs = started.elapsed().as_secs_f64();

    info!("{}", stats.summary_line());
    Ok(stats)
}

async fn run_pipeline(config: &SenderConfig, cancel: CancellationToken) -> Result<TransferStats> {
    let (work_tx, work_rx) = channel::work_channel(config.conns);
    let (report_tx, report_rx) = channel::report_channel();
    let work_rx = Arc::new(Mutex::new(work_rx));

    let worker_config = WorkerConfig::from_sender(config);
    let mut handles = Vec::with_capacity(config.conns);
    for id in 0..config.conns {
        let worker = Worker::new(id, worker_config.clone());
        handles.push(tokio::spawn(worker.run(
            Arc::clone(&work_rx),
            report_tx.clone(),
            cancel.clone(),
        )));
    }
    drop(report_tx);

    let scanner = Scanner::new(ScannerConfig::from_sender(config));
    let stats = scanner.run(work_tx, report_rx, cancel).await?;

    for handle in handles {
        let _ = handle.await;
    }
    Ok(stats)
}

/// Count-first mode: collect the backlog in one pass, announce its size on
/// a single connection, then stream the files sequentially.
async fn run_counted(config: &SenderConfig, cancel: CancellationToken) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    let scanner_config = ScannerConfig::from_sender(config);
    let probe_config = &scanner_config.probe;

    let names = discover(&config.src_dir, &config.pattern).await?;
    let mut tasks = Vec::new();
    for (index, name) in names.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        if name.as_str() <= config.start_after.as_str() {
            continue;
        }
        if config.max_files > 0 && tasks.len() as u64 >= config.max_files {
            break;
        }

        // A counted session is a bounded backlog snapshot; wait for each
        // file to stabilize, waiving lookahead like the once-mode drain.
        let path = config.src_dir.join(name);
        let entry = loop {
            match probe(&path, index, names.len(), true, probe_config).await {
                Readiness::Ready(size) => {
                    break Some(SourceEntry {
                        name: name.clone(),
                        absolute_path: path.clone(),
                        size_at_probe: size,
                        ready: true,
                    })
                }
                Readiness::Missing => {
                    warn!(name, "file_missing: candidate vanished before probe");
                    stats.files_missing += 1;
                    break None;
                }
                Readiness::NotYet => {
                    if cancel.is_cancelled() {
                        break None;
                    }
                    sleep(Duration::from_millis(config.stable_ms.max(1))).await;
                }
            }
        };
        if let Some(entry) = entry {
            tasks.push(TransferTask {
                entry,
                destination_path: config.dest_prefix().to_string(),
                attempts: 0,
            });
        }
    }

    info!(files = tasks.len(), "counted session backlog collected");
    let worker = Worker::new(0, WorkerConfig::from_sender(config));
    worker
        .run_counted(tasks, &mut stats, cancel)
        .await
        .context("counted session failed")?;
    Ok(stats)
}

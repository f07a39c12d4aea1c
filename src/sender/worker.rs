//! Transfer worker: one persistent connection, one file at a time.
//!
//! Workers pull tasks from the shared work channel, stream each file as a
//! single frame, and wait for the receiver's commit ack. Any failure tears
//! the connection down; the next task reconnects lazily with exponential
//! backoff. Retry bookkeeping lives in the scanner; the worker only
//! reports outcomes.

use crate::config::{SenderConfig, CONNECT_TIMEOUT, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::protocol::{encode_file_count, FrameHeader, ACK_OK};
use crate::sender::channel::{TaskOutcome, TransferStats, TransferTask, MAX_ATTEMPTS};
use anyhow::{Context, Result};
use rand::Rng;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Backoff
// =============================================================================

/// Exponential reconnect backoff: 100 ms initial, x2 per failure, 5 s cap,
/// +-20% jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_secs(5);

    pub(crate) fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }

    /// Next delay to sleep, advancing the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.8..=1.2);
        let current = self.delay.mul_f64(jitter);
        self.delay = (self.delay * 2).min(Self::CAP);
        current
    }
}

// =============================================================================
// Worker
// =============================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `host:port` of the receiver.
    pub addr: String,
    pub chunk_bytes: usize,
    /// Send with-dest frames (tag 0x02) carrying the task's destination.
    pub with_dest: bool,
}

impl WorkerConfig {
    pub fn from_sender(config: &SenderConfig) -> Self {
        Self {
            addr: config.endpoint(),
            chunk_bytes: config.chunk_bytes,
            with_dest: !config.dest_prefix().is_empty(),
        }
    }
}

enum SendOutcome {
    Sent(u64),
    SourceMissing,
}

pub struct Worker {
    id: usize,
    config: WorkerConfig,
    stream: Option<TcpStream>,
    backoff: Backoff,
    bytes_sent_lifetime: u64,
    last_error: Option<String>,
}

impl Worker {
    pub fn new(id: usize, config: WorkerConfig) -> Self {
        Self {
            id,
            config,
            stream: None,
            backoff: Backoff::new(),
            bytes_sent_lifetime: 0,
            last_error: None,
        }
    }

    /// Pull tasks until the work channel closes or the run is cancelled.
    pub async fn run(
        mut self,
        work_rx: Arc<Mutex<mpsc::Receiver<TransferTask>>>,
        report_tx: mpsc::UnboundedSender<TaskOutcome>,
        cancel: CancellationToken,
    ) {
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = async { work_rx.lock().await.recv().await } => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            match self.send_task(&task).await {
                Ok(SendOutcome::Sent(bytes)) => {
                    self.bytes_sent_lifetime += bytes;
                    debug!(worker = self.id, name = %task.entry.name, bytes, "sent");
                    let _ = report_tx.send(TaskOutcome::Sent {
                        name: task.entry.name.clone(),
                        bytes,
                    });
                }
                Ok(SendOutcome::SourceMissing) => {
                    let _ = report_tx.send(TaskOutcome::Missing {
                        name: task.entry.name.clone(),
                    });
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    self.disconnect(&error);
                    let delay = self.backoff.next_delay();
                    let _ = report_tx.send(TaskOutcome::Retry { task, error });
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Counted single-connection session: announce the backlog size, then
    /// stream the files sequentially, retrying each up to the attempt cap.
    pub(crate) async fn run_counted(
        mut self,
        tasks: Vec<TransferTask>,
        stats: &mut TransferStats,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.ensure_connected().await?;
        let count = u32::try_from(tasks.len()).context("backlog too large for counted session")?;
        let stream = self.stream.as_mut().context("connection lost")?;
        timeout(WRITE_TIMEOUT, stream.write_all(&encode_file_count(count)))
            .await
            .context("count header write timed out")??;
        debug!(count, "announced file count");

        for mut task in tasks {
            if cancel.is_cancelled() {
                break;
            }
            loop {
                match self.send_task(&task).await {
                    Ok(SendOutcome::Sent(bytes)) => {
                        stats.record_sent(bytes);
                        break;
                    }
                    Ok(SendOutcome::SourceMissing) => {
                        warn!(name = %task.entry.name, "file_missing: source vanished before send");
                        stats.files_missing += 1;
                        break;
                    }
                    Err(e) => {
                        let error = format!("{e:#}");
                        self.disconnect(&error);
                        task.attempts += 1;
                        if task.attempts >= MAX_ATTEMPTS || cancel.is_cancelled() {
                            stats.record_failed(task.entry.name.clone(), task.attempts, error);
                            break;
                        }
                        warn!(name = %task.entry.name, attempts = task.attempts, error,
                            "transfer failed; retrying");
                        sleep(self.backoff.next_delay()).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_task(&mut self, task: &TransferTask) -> Result<SendOutcome> {
        let mut file = match File::open(&task.entry.absolute_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SendOutcome::SourceMissing),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open {}", task.entry.absolute_path.display())
                })
            }
        };
        let size = file
            .metadata()
            .await
            .context("failed to stat source file")?
            .len();

        self.ensure_connected().await?;
        let chunk_bytes = self.config.chunk_bytes;
        let stream = self.stream.as_mut().context("connection lost")?;

        let header = FrameHeader {
            name: task.entry.name.clone(),
            dest: if self.config.with_dest {
                Some(task.destination_path.clone())
            } else {
                None
            },
            payload_len: size,
        };
        timeout(WRITE_TIMEOUT, stream.write_all(&header.encode()))
            .await
            .context("header write timed out")??;

        let mut buf = vec![0u8; chunk_bytes];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(chunk_bytes as u64) as usize;
            let n = file
                .read(&mut buf[..want])
                .await
                .context("source read failed")?;
            if n == 0 {
                anyhow::bail!("source file truncated mid-send");
            }
            timeout(WRITE_TIMEOUT, stream.write_all(&buf[..n]))
                .await
                .context("chunk write timed out")??;
            remaining -= n as u64;
        }

        let mut ack = [0u8; 1];
        timeout(READ_TIMEOUT, stream.read_exact(&mut ack))
            .await
            .context("ack read timed out")?
            .context("connection closed before ack")?;
        if ack[0] != ACK_OK {
            anyhow::bail!("receiver reported failure (status {:#04x})", ack[0]);
        }

        Ok(SendOutcome::Sent(size))
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        match &self.last_error {
            Some(last) => debug!(worker = self.id, addr = %self.config.addr,
                last_error = %last, "reconnecting"),
            None => debug!(worker = self.id, addr = %self.config.addr, "connecting"),
        }
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.config.addr))
            .await
            .with_context(|| format!("connect to {} timed out", self.config.addr))?
            .with_context(|| format!("connect to {} failed", self.config.addr))?;
        stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
        self.backoff.reset();
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self, error: &str) {
        debug!(worker = self.id, bytes_sent = self.bytes_sent_lifetime, error,
            "closing connection");
        self.last_error = Some(error.to_string());
        self.stream = None;
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Sender and receiver configuration.
//!
//! Configuration is validated fail-fast at startup; anything invalid maps
//! to exit code 1 before any socket or directory is touched.

use crate::error::{Result, TransferError};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PATTERN: &str = "*.jpg";
pub const DEFAULT_CONNS: usize = 8;
pub const DEFAULT_LOOKAHEAD: usize = 4;
pub const DEFAULT_STABLE_MS: u64 = 5;
pub const DEFAULT_FILE_WAIT_MS: u64 = 10;
pub const DEFAULT_CHUNK_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_POLL_MS: u64 = 50;
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 500;
pub const DEFAULT_RECV_WORKERS: usize = 16;

/// Age past which an orphaned `.part` file is considered stale.
pub const STALE_PART_AGE: Duration = Duration::from_secs(60);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an interrupted run waits for in-flight files to finish.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Sender
// =============================================================================

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Source directory to scan.
    pub src_dir: PathBuf,
    /// Destination endpoint.
    pub host: String,
    pub port: u16,
    /// Glob filter for candidate names.
    pub pattern: String,
    /// Skip names lexicographically <= this marker.
    pub start_after: String,
    /// Worker / connection count.
    pub conns: usize,
    /// Readiness lookahead K (0 disables the lookahead signal).
    pub lookahead: usize,
    /// Interval between the two size-stability samples.
    pub stable_ms: u64,
    /// How long to wait for a candidate that vanished between scan and probe.
    pub file_wait_ms: u64,
    /// Stop after this many successful transfers (0 = unlimited).
    pub max_files: u64,
    /// Destination prefix on the receiver; empty selects the legacy protocol.
    pub dest_path: String,
    /// Keep paths relative to src_dir instead of sending basenames.
    pub preserve_structure: bool,
    /// Remove stale `.part` files from src_dir at startup.
    pub cleanup_part_files: bool,
    /// Exit after the current backlog drains.
    pub once: bool,
    /// Announce the backlog size up front (requires conns=1 and once).
    pub count_first: bool,
    /// Socket send chunk size.
    pub chunk_bytes: usize,
    /// Directory scan interval.
    pub poll_ms: u64,
    /// Once mode: waive the lookahead signal after this long without new files.
    pub drain_grace_ms: u64,
    /// Log each file event.
    pub verbose: bool,
    /// Emit machine-readable final stats.
    pub json_stats: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            src_dir: PathBuf::new(),
            host: String::new(),
            port: 0,
            pattern: DEFAULT_PATTERN.to_string(),
            start_after: String::new(),
            conns: DEFAULT_CONNS,
            lookahead: DEFAULT_LOOKAHEAD,
            stable_ms: DEFAULT_STABLE_MS,
            file_wait_ms: DEFAULT_FILE_WAIT_MS,
            max_files: 0,
            dest_path: String::new(),
            preserve_structure: false,
            cleanup_part_files: false,
            once: false,
            count_first: false,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            poll_ms: DEFAULT_POLL_MS,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            verbose: false,
            json_stats: false,
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.src_dir.is_dir() {
            return Err(TransferError::Config(format!(
                "src_dir is not a directory: {}",
                self.src_dir.display()
            )));
        }
        if self.host.is_empty() {
            return Err(TransferError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(TransferError::Config("port must be non-zero".into()));
        }
        if self.conns == 0 {
            return Err(TransferError::Config("conns must be at least 1".into()));
        }
        if self.pattern.is_empty() {
            return Err(TransferError::Config("pattern must not be empty".into()));
        }
        if self.chunk_bytes < 4096 {
            return Err(TransferError::Config(
                "chunk_bytes must be at least 4096".into(),
            ));
        }
        if self.count_first && (self.conns != 1 || !self.once) {
            return Err(TransferError::Config(
                "count_first requires conns=1 and once".into(),
            ));
        }
        Ok(())
    }

    /// `dest_path` with trailing separators trimmed.
    pub fn dest_prefix(&self) -> &str {
        self.dest_path.trim_end_matches('/')
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Receiver
// =============================================================================

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub listen_ip: IpAddr,
    pub port: u16,
    /// Base output directory; created at startup.
    pub out_dir: PathBuf,
    /// Accept-loop count when reuseport is enabled.
    pub workers: usize,
    /// Bind `workers` sockets with SO_REUSEPORT for kernel load balancing.
    pub reuseport: bool,
    /// Expect a u32 file count at the start of each session.
    pub expect_count_first: bool,
    /// Accept with-dest frames (tag 0x02).
    pub use_dest_paths: bool,
    /// fsync each file before the atomic rename.
    pub fsync: bool,
    pub verbose: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            out_dir: PathBuf::new(),
            workers: DEFAULT_RECV_WORKERS,
            reuseport: false,
            expect_count_first: false,
            use_dest_paths: false,
            fsync: false,
            verbose: false,
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.out_dir.as_os_str().is_empty() {
            return Err(TransferError::Config("out_dir must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(TransferError::Config("workers must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_sender(tmp: &TempDir) -> SenderConfig {
        SenderConfig {
            src_dir: tmp.path().to_path_buf(),
            host: "127.0.0.1".to_string(),
            port: 50001,
            ..Default::default()
        }
    }

    #[test]
    fn sender_validates() {
        let tmp = TempDir::new().unwrap();
        assert!(valid_sender(&tmp).validate().is_ok());
    }

    #[test]
    fn sender_rejects_missing_src_dir() {
        let tmp = TempDir::new().unwrap();
        let mut config = valid_sender(&tmp);
        config.src_dir = tmp.path().join("nope");
        assert!(matches!(
            config.validate(),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn sender_rejects_zero_conns() {
        let tmp = TempDir::new().unwrap();
        let mut config = valid_sender(&tmp);
        config.conns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn count_first_needs_single_conn_once() {
        let tmp = TempDir::new().unwrap();
        let mut config = valid_sender(&tmp);
        config.count_first = true;
        assert!(config.validate().is_err());

        config.conns = 1;
        config.once = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn dest_prefix_trims_trailing_slash() {
        let tmp = TempDir::new().unwrap();
        let mut config = valid_sender(&tmp);
        config.dest_path = "ball_01/camera02/".to_string();
        assert_eq!(config.dest_prefix(), "ball_01/camera02");
    }

    #[test]
    fn receiver_rejects_empty_out_dir() {
        let config = ReceiverConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn receiver_validates() {
        let config = ReceiverConfig {
            out_dir: PathBuf::from("/tmp/frames"),
            port: 50001,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}

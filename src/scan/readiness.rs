//! File-readiness probe.
//!
//! A candidate written by an external producer is ready only when two
//! independent signals agree:
//!
//! - lookahead: a name K positions after it exists in the sorted listing,
//!   implying the producer has moved on and closed earlier files;
//! - size stability: two size samples taken `stable_ms` apart are equal
//!   and non-zero.
//!
//! Neither filesystem events nor a single stat are authoritative for
//! "closed by writer", so both signals are required. A candidate that was
//! listed but no longer stats (rotated away, or not yet renamed from its
//! `.part` name) gets a short wait before being declared missing.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Lookahead distance K; 0 disables the lookahead signal.
    pub lookahead: usize,
    /// Interval between the two size samples.
    pub stable_ms: u64,
    /// Total wait for a candidate that does not stat.
    pub file_wait_ms: u64,
}

/// Outcome of probing one candidate on one scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Fully written; safe to dispatch. Carries the stable size.
    Ready(u64),
    /// Signals not yet satisfied; re-probe on the next scan.
    NotYet,
    /// Vanished and stayed gone for the whole wait window.
    Missing,
}

/// Probe candidate `index` of a sorted `listing_len`-entry directory listing.
///
/// `waive_lookahead` drops the lookahead requirement (end-of-stream drain);
/// size stability is never waived.
pub async fn probe(
    path: &Path,
    index: usize,
    listing_len: usize,
    waive_lookahead: bool,
    config: &ProbeConfig,
) -> Readiness {
    if !waive_lookahead && config.lookahead > 0 && index + config.lookahead >= listing_len {
        return Readiness::NotYet;
    }

    let first = match stat_with_wait(path, config.file_wait_ms).await {
        Some(size) => size,
        None => return Readiness::Missing,
    };

    sleep(Duration::from_millis(config.stable_ms)).await;

    let second = match fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Readiness::Missing,
        Err(_) => return Readiness::NotYet,
    };

    if first == second && first > 0 {
        Readiness::Ready(first)
    } else {
        Readiness::NotYet
    }
}

/// Stat the file, re-trying for up to `file_wait_ms` if it is absent.
async fn stat_with_wait(path: &Path, file_wait_ms: u64) -> Option<u64> {
    let deadline = Instant::now() + Duration::from_millis(file_wait_ms);
    let retry_step = Duration::from_millis((file_wait_ms / 4).max(1));

    loop {
        match fs::metadata(path).await {
            Ok(meta) => return Some(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if Instant::now() >= deadline {
                    return None;
                }
                sleep(retry_step).await;
            }
            Err(_) => return None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn config() -> ProbeConfig {
        ProbeConfig {
            lookahead: 4,
            stable_ms: 5,
            file_wait_ms: 10,
        }
    }

    #[tokio::test]
    async fn stable_file_with_lookahead_is_ready() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("frame_cam_000000001.jpg");
        std_fs::write(&path, b"jpeg bytes").unwrap();

        // index 0 of 10 listed names: lookahead satisfied
        let r = probe(&path, 0, 10, false, &config()).await;
        assert_eq!(r, Readiness::Ready(10));
    }

    #[tokio::test]
    async fn missing_lookahead_blocks_dispatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("frame_cam_000000003.jpg");
        std_fs::write(&path, b"jpeg bytes").unwrap();

        // last of 3 names with K=4: no lookahead file can exist
        let r = probe(&path, 2, 3, false, &config()).await;
        assert_eq!(r, Readiness::NotYet);
    }

    #[tokio::test]
    async fn waiver_drops_lookahead_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("frame_cam_000000003.jpg");
        std_fs::write(&path, b"jpeg bytes").unwrap();

        let r = probe(&path, 2, 3, true, &config()).await;
        assert_eq!(r, Readiness::Ready(10));
    }

    #[tokio::test]
    async fn growing_file_is_not_ready() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("frame_cam_000000001.jpg");
        let mut f = std_fs::File::create(&path).unwrap();
        f.write_all(b"start").unwrap();
        f.flush().unwrap();

        let cfg = ProbeConfig {
            stable_ms: 80,
            ..config()
        };
        let path2 = path.clone();
        let writer = tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(30));
            let mut f = std_fs::OpenOptions::new().append(true).open(&path2).unwrap();
            f.write_all(b"more bytes").unwrap();
        });

        let r = probe(&path, 0, 10, false, &cfg).await;
        writer.await.unwrap();
        assert_eq!(r, Readiness::NotYet);
    }

    #[tokio::test]
    async fn empty_file_is_not_ready() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("frame_cam_000000001.jpg");
        std_fs::write(&path, b"").unwrap();

        let r = probe(&path, 0, 10, false, &config()).await;
        assert_eq!(r, Readiness::NotYet);
    }

    #[tokio::test]
    async fn absent_file_is_missing_after_wait() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("frame_cam_000000009.jpg");

        let r = probe(&path, 0, 10, false, &config()).await;
        assert_eq!(r, Readiness::Missing);
    }

    #[tokio::test]
    async fn late_rename_beats_the_wait() {
        let tmp = TempDir::new().unwrap();
        let part = tmp.path().join("frame_cam_000000001.jpg.part");
        let path = tmp.path().join("frame_cam_000000001.jpg");
        std_fs::write(&part, b"jpeg bytes").unwrap();

        let cfg = ProbeConfig {
            file_wait_ms: 200,
            ..config()
        };
        let (part2, path2) = (part.clone(), path.clone());
        let renamer = tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(20));
            std_fs::rename(&part2, &path2).unwrap();
        });

        let r = probe(&path, 0, 10, false, &cfg).await;
        renamer.await.unwrap();
        assert_eq!(r, Readiness::Ready(10));
    }
}

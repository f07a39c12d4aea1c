//! Per-connection receive session.
//!
//! State machine per frame: AwaitHeader -> AwaitName -> [AwaitDest] ->
//! AwaitPayload -> Finalize, looping until clean EOF (or the declared
//! count in count-first mode). The payload streams into a guarded temp
//! file that only becomes visible at its final path through an atomic
//! rename; any mid-frame error deletes the temp file and closes only this
//! connection.

use crate::protocol::{
    normalize_path, read_file_count, read_header_fields, read_tag, FrameHeader, ProtocolTag,
    ACK_OK,
};
use crate::temp_file::TempFileGuard;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Receive chunk size.
const RECV_CHUNK: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub out_dir: PathBuf,
    pub use_dest_paths: bool,
    pub expect_count_first: bool,
    pub fsync: bool,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Serve one accepted connection until EOF, declared count, or error.
pub async fn run_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    session_id: u64,
    config: &SessionConfig,
) -> Result<()> {
    let mut seq = 0u64;

    let mut remaining_files = if config.expect_count_first {
        let count = timeout(config.idle_timeout, read_file_count(&mut stream))
            .await
            .context("timed out waiting for file count")??;
        debug!(%peer, count, "expecting declared file count");
        if count == 0 {
            return Ok(());
        }
        Some(count)
    } else {
        None
    };

    loop {
        let tag = match timeout(config.idle_timeout, read_tag(&mut stream))
            .await
            .context("session idle timeout")??
        {
            Some(tag) => tag,
            None => break,
        };
        if tag == ProtocolTag::WithDest && !config.use_dest_paths {
            anyhow::bail!("with-dest frame received but destination paths are disabled");
        }

        let header = timeout(config.read_timeout, read_header_fields(&mut stream, tag))
            .await
            .context("timed out reading frame header")??;

        receive_file(&mut stream, &header, session_id, seq, config).await?;
        seq += 1;

        stream
            .write_all(&[ACK_OK])
            .await
            .context("failed to send ack")?;
        debug!(%peer, name = %header.name, bytes = header.payload_len, "committed");

        if let Some(count) = remaining_files.as_mut() {
            *count -= 1;
            if *count == 0 {
                debug!(%peer, "received declared file count; closing");
                break;
            }
        }
    }

    Ok(())
}

/// Stream one payload into a temp file and atomically rename it into place.
async fn receive_file(
    stream: &mut TcpStream,
    header: &FrameHeader,
    session_id: u64,
    seq: u64,
    config: &SessionConfig,
) -> Result<()> {
    let (final_dir, final_path) = resolve_target(&config.out_dir, header)?;

    fs::create_dir_all(&final_dir)
        .await
        .with_context(|| format!("failed to create {}", final_dir.display()))?;

    let basename = final_path
        .file_name()
        .context("frame name has no final component")?
        .to_string_lossy()
        .into_owned();
    let temp_path = final_dir.join(format!(".{basename}.part.{session_id}.{seq}"));

    let guard = TempFileGuard::new(&temp_path);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("failed to create {}", temp_path.display()))?;

    let mut buf = vec![0u8; RECV_CHUNK];
    let mut remaining = header.payload_len;
    while remaining > 0 {
        let want = remaining.min(RECV_CHUNK as u64) as usize;
        let n = timeout(config.read_timeout, stream.read(&mut buf[..want]))
            .await
            .context("payload read timed out")?
            .context("payload read failed")?;
        if n == 0 {
            anyhow::bail!("connection closed mid-payload");
        }
        file.write_all(&buf[..n])
            .await
            .context("temp file write failed")?;
        remaining -= n as u64;
    }

    file.flush().await?;
    if config.fsync {
        file.sync_all().await.context("fsync failed")?;
    }
    drop(file);

    fs::rename(&temp_path, &final_path)
        .await
        .with_context(|| format!("failed to rename into {}", final_path.display()))?;
    guard.defuse();

    Ok(())
}

/// Join the validated wire paths under out_dir and re-check containment.
fn resolve_target(out_dir: &Path, header: &FrameHeader) -> Result<(PathBuf, PathBuf)> {
    let final_dir = match header.dest.as_deref() {
        Some(dest) if !dest.is_empty() => out_dir.join(dest),
        _ => out_dir.to_path_buf(),
    };
    let final_path = final_dir.join(&header.name);

    let normalized = normalize_path(&final_path);
    if !normalized.starts_with(normalize_path(out_dir)) {
        anyhow::bail!("target escapes output directory: {}", final_path.display());
    }

    // The name may carry subdirectories; the temp file must sit next to
    // the final path so the rename stays on one filesystem.
    let parent = final_path.parent().map(Path::to_path_buf).unwrap_or(final_dir);
    Ok((parent, final_path))
}

// =============================================================================
// Tests
// =============================================================================

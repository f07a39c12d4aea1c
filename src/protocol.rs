//! Wire protocol for frame transfer sessions.
//!
//! One frame per file, big-endian integers throughout:
//!
//! ```text
//! u8   tag          0x02 with-dest (preferred) / 0x01 legacy
//! u32  name_len     bounded by MAX_PATH_LEN
//! u8[] name         UTF-8 relative path
//! u32  dest_len     with-dest only
//! u8[] dest         UTF-8 relative directory under the receiver's out_dir
//! u64  payload_len
//! u8[] payload
//! ```
//!
//! The receiver answers one status byte after the atomic rename; a session
//! may optionally begin with a `u32` file count (count-first variant).

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound for name and dest fields.
pub const MAX_PATH_LEN: usize = 4096;

/// Upper bound for a single file payload (64 GiB). Anything larger is a
/// corrupted or hostile length field.
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024 * 1024;

/// Status byte sent by the receiver after a successful commit.
pub const ACK_OK: u8 = 0x00;

// =============================================================================
// Protocol tags
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolTag {
    /// Name + payload only; destination inferred from the receiver's out_dir.
    Legacy = 0x01,
    /// Name + destination directory + payload.
    WithDest = 0x02,
}

impl ProtocolTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Legacy),
            0x02 => Some(Self::WithDest),
            _ => None,
        }
    }
}

// =============================================================================
// Frame header
// =============================================================================

/// Per-file header; the payload is streamed separately in bounded chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// File name, possibly containing relative subdirectories.
    pub name: String,
    /// Destination directory under the receiver's out_dir. `None` selects
    /// the legacy tag; an empty string addresses out_dir itself.
    pub dest: Option<String>,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn tag(&self) -> ProtocolTag {
        if self.dest.is_some() {
            ProtocolTag::WithDest
        } else {
            ProtocolTag::Legacy
        }
    }

    pub fn encode(&self) -> Bytes {
        let name_bytes = self.name.as_bytes();
        let dest_bytes = self.dest.as_ref().map(|d| d.as_bytes());

        let mut len = 1 + 4 + name_bytes.len() + 8;
        if let Some(d) = dest_bytes {
            len += 4 + d.len();
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.tag() as u8);
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
        if let Some(d) = dest_bytes {
            buf.put_u32(d.len() as u32);
            buf.put_slice(d);
        }
        buf.put_u64(self.payload_len);

        buf.freeze()
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Read the frame tag. Returns `None` on clean EOF (peer finished the
/// session); an unknown tag is a protocol error.
pub async fn read_tag<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<ProtocolTag>> {
    let mut byte = [0u8; 1];
    match r.read_exact(&mut byte).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame tag"),
    }
    let tag = ProtocolTag::from_u8(byte[0])
        .with_context(|| format!("unknown protocol tag {:#04x}", byte[0]))?;
    Ok(Some(tag))
}

/// Read and validate the header fields that follow the tag.
pub async fn read_header_fields<R: AsyncRead + Unpin>(
    r: &mut R,
    tag: ProtocolTag,
) -> Result<FrameHeader> {
    let name = read_path_field(r, "name").await?;

    let dest = if tag == ProtocolTag::WithDest {
        let dest = read_dest_field(r).await?;
        Some(dest)
    } else {
        None
    };

    let payload_len = r.read_u64().await.context("failed to read payload length")?;
    if payload_len > MAX_PAYLOAD_LEN {
        anyhow::bail!(
            "payload length {} exceeds maximum {}",
            payload_len,
            MAX_PAYLOAD_LEN
        );
    }

    Ok(FrameHeader {
        name,
        dest,
        payload_len,
    })
}

async fn read_path_field<R: AsyncRead + Unpin>(r: &mut R, what: &str) -> Result<String> {
    let len = r
        .read_u32()
        .await
        .with_context(|| format!("failed to read {what} length"))? as usize;
    if len == 0 {
        anyhow::bail!("empty {what} field");
    }
    if len > MAX_PATH_LEN {
        anyhow::bail!("{what} length {} exceeds maximum {}", len, MAX_PATH_LEN);
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)
        .await
        .with_context(|| format!("failed to read {what}"))?;
    let s = String::from_utf8(bytes).with_context(|| format!("invalid UTF-8 in {what}"))?;
    validate_rel_path(&s).with_context(|| format!("unsafe {what}"))?;
    Ok(s)
}

/// Like `read_path_field` but an empty dest is allowed (addresses out_dir).
async fn read_dest_field<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = r.read_u32().await.context("failed to read dest length")? as usize;
    if len > MAX_PATH_LEN {
        anyhow::bail!("dest length {} exceeds maximum {}", len, MAX_PATH_LEN);
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)
        .await
        .context("failed to read dest")?;
    let s = String::from_utf8(bytes).context("invalid UTF-8 in dest")?;
    if !s.is_empty() {
        validate_rel_path(&s).context("unsafe dest")?;
    }
    Ok(s)
}

/// Read the leading `u32` file count of a count-first session.
pub async fn read_file_count<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32> {
    r.read_u32().await.context("failed to read file count")
}

pub fn encode_file_count(count: u32) -> [u8; 4] {
    count.to_be_bytes()
}

// =============================================================================
// Path validation
// =============================================================================

/// Validate that a wire path is a safe relative path: non-empty, no NUL,
/// not absolute, no `..` segments, no platform prefix.
pub fn validate_rel_path(relative: &str) -> Result<()> {
    if relative.is_empty() {
        anyhow::bail!("empty path not allowed");
    }
    if relative.contains('\0') {
        anyhow::bail!("NUL byte in path");
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        anyhow::bail!("absolute path not allowed: {}", relative);
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("path traversal not allowed: {}", relative);
            }
            Component::Prefix(_) => {
                anyhow::bail!("prefixed path not allowed: {}", relative);
            }
            _ => {}
        }
    }

    Ok(())
}

/// Normalize a path without requiring it to exist (unlike canonicalize).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

// =============================================================================
// Tests
// =============================================================================

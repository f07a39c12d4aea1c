//! Typed trigger message from the external request/reply channel.
//!
//! The orchestrator consumes one trigger per run and derives the sender's
//! `start_after` marker and destination suffix from it. The schema is
//! strict: unknown fields are rejected rather than silently ignored.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Width of the monotonic counter in frame names.
const FRAME_DIGITS: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerMessage {
    /// Frame name the run starts after, e.g. `frame_camera01_000046836.jpg`.
    pub frame_id: String,
    /// External identifier mapped to a destination path suffix.
    pub destination_tag: String,
}

impl TriggerMessage {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid trigger message")
    }

    pub fn frame(&self) -> Result<FrameId> {
        FrameId::parse(&self.frame_id)
    }

    /// The scanner's exclusive lower bound: the named frame itself.
    pub fn start_after(&self) -> Result<String> {
        Ok(self.frame()?.name())
    }

    /// Destination suffix `<tag>/<camera>` appended to a camera's dest prefix.
    pub fn dest_suffix(&self) -> Result<String> {
        let frame = self.frame()?;
        Ok(format!("{}/{}", self.destination_tag, frame.camera))
    }
}

/// Parsed frame name `frame_<camera>_<9-digit counter>.jpg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameId {
    pub camera: String,
    pub number: u64,
}

impl FrameId {
    pub fn parse(frame_id: &str) -> Result<Self> {
        let parse = || -> Option<Self> {
            let stem = frame_id.strip_prefix("frame_")?.strip_suffix(".jpg")?;
            let (camera, digits) = stem.rsplit_once('_')?;
            if camera.is_empty()
                || digits.len() != FRAME_DIGITS
                || !digits.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            Some(Self {
                camera: camera.to_string(),
                number: digits.parse().ok()?,
            })
        };
        parse().with_context(|| format!("invalid frame id: {frame_id}"))
    }

    pub fn name(&self) -> String {
        format!("frame_{}_{:0width$}.jpg", self.camera, self.number, width = FRAME_DIGITS)
    }
}

// =============================================================================
// Tests
// =============================================================================

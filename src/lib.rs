//! framepipe: low-latency camera frame transfer.
//!
//! Moves continuously produced image files from source directories to
//! remote storage over TCP. The sender detects completion of files still
//! being written by an external producer (lookahead + size stability) and
//! streams them over a pool of persistent connections; the receiver
//! commits each file with a temp-write-then-atomic-rename protocol so a
//! partial transfer is never visible at its final path.
//!
//! ```text
//! Scanner -> ReadinessProbe -> work queue -> Workers -> TCP
//!         -> Listener -> ReceiveWorker -> filesystem
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod scan;
pub mod sender;
pub mod temp_file;
pub mod trigger;

pub use config::{ReceiverConfig, SenderConfig};
pub use error::{Result, TransferError};
pub use receiver::Listener;
pub use sender::TransferStats;

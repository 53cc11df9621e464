//! Protocol timings and limits for one session.

use std::time::Duration;

use crate::protocol::MAX_CHUNK_SIZE;

/// Default room file-size limit, in MB.
pub const DEFAULT_FILE_LIMIT_MB: u64 = 10;

/// Frames further than this behind a newly seen frame are evicted unfinished.
pub const FRAME_EVICTION_WINDOW: u32 = 5;

/// Video frame indices wrap at this value on the sender.
pub const FRAME_INDEX_MODULUS: u32 = 10_000;

/// Records replayed to a newly accepted peer.
pub const HISTORY_REPLAY_LIMIT: usize = 100;

/// Session configuration. Defaults suit a LAN room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Period of the heartbeat task (host sweep, peer BEAT).
    pub heartbeat_interval: Duration,
    /// Host drops a peer unheard from for longer than this.
    pub timeout_limit: Duration,
    /// Extra silence a peer tolerates before declaring the host lost.
    pub host_loss_margin: Duration,
    /// Largest file or frame chunk per datagram.
    pub max_chunk_size: usize,
    /// File-size limit a new room starts with (MB).
    pub file_limit_mb: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            timeout_limit: Duration::from_secs(12),
            host_loss_margin: Duration::from_secs(2),
            max_chunk_size: MAX_CHUNK_SIZE,
            file_limit_mb: DEFAULT_FILE_LIMIT_MB,
        }
    }
}

impl Config {
    /// Silence after which a peer treats its host as lost.
    pub fn host_loss_after(&self) -> Duration {
        self.timeout_limit + self.host_loss_margin
    }
}

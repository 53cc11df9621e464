//! Liveness on both sides of the star: the host sweeps silent peers out of its registry,
//! peers count silence from their host and fire failover once per episode.

use std::time::{Duration, Instant};

use crate::identity::ParticipantId;
use crate::registry::{PeerRecord, PeerRegistry};

/// Remove every non-self record unheard from for longer than `timeout`. Returns the removed
/// records so the caller can announce them and rebroadcast the roster.
pub fn sweep_expired(
    registry: &mut PeerRegistry,
    self_id: &ParticipantId,
    now: Instant,
    timeout: Duration,
) -> Vec<PeerRecord> {
    registry
        .expired(self_id, now, timeout)
        .into_iter()
        .filter_map(|id| registry.remove(&id))
        .collect()
}

/// Peer-side silence counter for the current host target.
///
/// Counts in heartbeat ticks rather than wall time, so a suspended process does not fail over
/// the moment it wakes.
#[derive(Debug, Default, Clone)]
pub struct HostWatch {
    silence: Duration,
    fired: bool,
}

impl HostWatch {
    /// Any datagram from the current target ends the episode.
    pub fn contact(&mut self) {
        self.silence = Duration::ZERO;
        self.fired = false;
    }

    /// Advance by one heartbeat. True exactly once per episode, when silence exceeds `limit`.
    pub fn on_tick(&mut self, interval: Duration, limit: Duration) -> bool {
        if self.fired {
            return false;
        }
        self.silence += interval;
        if self.silence > limit {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn silence(&self) -> Duration {
        self.silence
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

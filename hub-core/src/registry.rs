//! Peer registry (host-authoritative), ban set and avatar cache.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::identity::ParticipantId;
use crate::protocol::RosterEntry;

/// One admitted participant, as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: ParticipantId,
    pub addr: SocketAddr,
    pub nickname: String,
    pub bio: String,
    pub last_seen: Instant,
    pub live: bool,
    pub is_host: bool,
}

/// Identity → record, kept in join order so rosters are stable.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record. Returns true if the identity was not present.
    /// A replaced record keeps its position.
    pub fn insert(&mut self, record: PeerRecord) -> bool {
        match self.get_mut(&record.identity) {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                self.peers.push(record);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<PeerRecord> {
        let pos = self.peers.iter().position(|p| p.identity == *id)?;
        Some(self.peers.remove(pos))
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.identity == *id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.identity == *id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.get(id).is_some()
    }

    /// Record an inbound datagram: refresh address and last-seen. Returns false for unknown ids.
    pub fn touch(&mut self, id: &ParticipantId, addr: SocketAddr, now: Instant) -> bool {
        match self.get_mut(id) {
            Some(p) => {
                p.addr = addr;
                p.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Non-self identities unheard from for longer than `timeout`.
    pub fn expired(&self, self_id: &ParticipantId, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        self.peers
            .iter()
            .filter(|p| p.identity != *self_id)
            .filter(|p| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|p| p.identity.clone())
            .collect()
    }

    /// Every record except `self_id`: the relay fan-out set.
    pub fn others<'a>(&'a self, self_id: &'a ParticipantId) -> impl Iterator<Item = &'a PeerRecord> + 'a {
        self.peers.iter().filter(move |p| p.identity != *self_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Roster snapshot for a LIST broadcast.
    pub fn roster(&self, avatars: &AvatarCache) -> Vec<RosterEntry> {
        self.peers
            .iter()
            .map(|p| RosterEntry {
                identity: p.identity.clone(),
                nickname: p.nickname.clone(),
                live: p.live,
                avatar: avatars.get(&p.identity).unwrap_or_default().to_owned(),
                bio: p.bio.clone(),
            })
            .collect()
    }
}

/// Identities rejected on JOIN until unbanned. Lives for the session only.
#[derive(Debug, Default)]
pub struct BanList {
    banned: HashSet<ParticipantId>,
}

impl BanList {
    pub fn ban(&mut self, id: ParticipantId) {
        self.banned.insert(id);
    }

    /// Returns true if the identity was banned.
    pub fn unban(&mut self, id: &ParticipantId) -> bool {
        self.banned.remove(id)
    }

    pub fn is_banned(&self, id: &ParticipantId) -> bool {
        self.banned.contains(id)
    }

    pub fn clear(&mut self) {
        self.banned.clear();
    }
}

/// Identity → base64 avatar payload.
#[derive(Debug, Default)]
pub struct AvatarCache {
    avatars: HashMap<ParticipantId, String>,
}

impl AvatarCache {
    pub fn set(&mut self, id: ParticipantId, avatar: String) {
        self.avatars.insert(id, avatar);
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&str> {
        self.avatars.get(id).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.avatars.clear();
    }
}

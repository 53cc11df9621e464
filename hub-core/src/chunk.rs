//! Chunk reassembly: split payloads into datagram-sized segments, collect them out of order,
//! and hand back the whole payload once complete. Files complete on the EOF segment plus every
//! earlier index; video frames complete when the declared chunk count has arrived.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::debug;

use crate::config::{FRAME_EVICTION_WINDOW, FRAME_INDEX_MODULUS};
use crate::identity::ParticipantId;
use crate::protocol::MAX_CHUNK_SIZE;

/// Split a payload into segments of at most `chunk_size` bytes (0 means `MAX_CHUNK_SIZE`).
/// An empty payload is one empty segment, so the receiver still sees an EOF.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    let size = if chunk_size == 0 {
        MAX_CHUNK_SIZE
    } else {
        chunk_size
    };
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(size).collect()
}

/// Outcome of storing one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Chunk stored; the unit is complete and these are its bytes.
    Complete(Vec<u8>),
    /// Chunk stored; still waiting for more.
    InProgress,
    /// Chunk does not fit its unit (index out of range, zero total).
    Ignored,
}

/// Index → bytes, concatenated in ascending index order.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl ChunkBuffer {
    /// Store a chunk. A duplicate index overwrites the earlier copy.
    pub fn insert(&mut self, index: u32, data: Vec<u8>) {
        self.chunks.insert(index, data);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether every index in `0..count` is present.
    pub fn has_all(&self, count: u32) -> bool {
        self.chunks.len() as u64 >= u64::from(count) && (0..count).all(|i| self.chunks.contains_key(&i))
    }

    /// Join indices `0..count` in order. Chunks at or beyond `count` are dropped.
    pub fn concat_upto(self, count: u32) -> Vec<u8> {
        let parts: Vec<&Vec<u8>> = self.chunks.range(..count).map(|(_, c)| c).collect();
        let mut out = Vec::with_capacity(parts.iter().map(|c| c.len()).sum());
        for chunk in parts {
            out.extend_from_slice(chunk);
        }
        out
    }
}

#[derive(Debug, Default)]
struct FileBuffer {
    chunks: ChunkBuffer,
    last_index: Option<u32>,
}

/// In-flight file transfers keyed by (sender, filename). No expiry: a lost chunk stalls its
/// transfer until the session ends.
#[derive(Debug, Default)]
pub struct FileAssembler {
    transfers: HashMap<(ParticipantId, String), FileBuffer>,
}

impl FileAssembler {
    pub fn on_chunk(
        &mut self,
        sender: &ParticipantId,
        filename: &str,
        index: u32,
        data: Vec<u8>,
        last: bool,
    ) -> ChunkReceiveResult {
        let key = (sender.clone(), filename.to_owned());
        let buf = self.transfers.entry(key.clone()).or_default();
        buf.chunks.insert(index, data);
        if last {
            buf.last_index = Some(index);
        }
        let count = match buf.last_index {
            Some(last) if buf.chunks.has_all(last.saturating_add(1)) => last.saturating_add(1),
            _ => return ChunkReceiveResult::InProgress,
        };
        match self.transfers.remove(&key) {
            Some(buf) => ChunkReceiveResult::Complete(buf.chunks.concat_upto(count)),
            None => ChunkReceiveResult::InProgress,
        }
    }

    /// Transfers still waiting for chunks.
    pub fn pending(&self) -> usize {
        self.transfers.len()
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
    }
}

#[derive(Debug)]
struct FrameBuffer {
    total: u32,
    chunks: ChunkBuffer,
    created: Instant,
}

/// In-flight video frames keyed by frame index. Favors recency: frames that fall more than
/// `FRAME_EVICTION_WINDOW` behind a newly seen frame are dropped unfinished.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    frames: HashMap<u32, FrameBuffer>,
}

impl FrameAssembler {
    pub fn on_chunk(
        &mut self,
        frame: u32,
        total: u32,
        index: u32,
        data: Vec<u8>,
        now: Instant,
    ) -> ChunkReceiveResult {
        if total == 0 || index >= total {
            return ChunkReceiveResult::Ignored;
        }
        if !self.frames.contains_key(&frame) {
            self.evict_behind(frame, now);
            self.frames.insert(
                frame,
                FrameBuffer {
                    total,
                    chunks: ChunkBuffer::default(),
                    created: now,
                },
            );
        }
        let Some(buf) = self.frames.get_mut(&frame) else {
            return ChunkReceiveResult::InProgress;
        };
        if index >= buf.total {
            return ChunkReceiveResult::Ignored;
        }
        buf.chunks.insert(index, data);
        if buf.chunks.len() as u64 != u64::from(buf.total) {
            return ChunkReceiveResult::InProgress;
        }
        match self.frames.remove(&frame) {
            Some(buf) => ChunkReceiveResult::Complete(buf.chunks.concat_upto(buf.total)),
            None => ChunkReceiveResult::InProgress,
        }
    }

    fn evict_behind(&mut self, newest: u32, now: Instant) {
        self.frames.retain(|&old, buf| {
            let behind = frames_behind(newest, old);
            let keep = behind <= FRAME_EVICTION_WINDOW;
            if !keep {
                debug!(
                    frame = old,
                    newest,
                    received = buf.chunks.len(),
                    total = buf.total,
                    age_ms = now.saturating_duration_since(buf.created).as_millis() as u64,
                    "evicting stale video frame"
                );
            }
            keep
        });
    }

    /// Frames still waiting for chunks.
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// How far `old` lies behind `newest`, modulo the sender's frame counter. Frames that appear
/// ahead (more than half the counter range "behind") count as zero.
fn frames_behind(newest: u32, old: u32) -> u32 {
    let m = FRAME_INDEX_MODULUS;
    let behind = (newest % m + m - old % m) % m;
    if behind > m / 2 {
        0
    } else {
        behind
    }
}

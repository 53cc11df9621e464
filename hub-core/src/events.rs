//! Collaborator seams: the event sink the front end implements and the chat-history store.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::HISTORY_REPLAY_LIMIT;
use crate::identity::ParticipantId;
use crate::protocol::RosterEntry;
use crate::role::SessionRole;

/// Owned form of every session event, for sinks that queue events elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Chat {
        author: ParticipantId,
        nickname: String,
        text: String,
    },
    Notice(String),
    Roster(Vec<RosterEntry>),
    Frame {
        streamer: ParticipantId,
        jpeg: Vec<u8>,
    },
    Audio {
        sender: ParticipantId,
        data: Vec<u8>,
    },
    Speaking(ParticipantId),
    RoomAccepted {
        code: String,
        name: String,
    },
    HostPrompt(ParticipantId),
    FileReceived {
        sender: ParticipantId,
        nickname: String,
        filename: String,
        data: Vec<u8>,
    },
    RoleChanged(SessionRole),
    Closed(String),
}

/// Callbacks from the session to its front end. Every method defaults to forwarding an owned
/// `HubEvent` to `emit`, so a sink may implement either the methods it cares about or `emit`.
pub trait SessionEvents {
    fn emit(&mut self, _event: HubEvent) {}

    fn chat_received(&mut self, author: &ParticipantId, nickname: &str, text: &str) {
        self.emit(HubEvent::Chat {
            author: author.clone(),
            nickname: nickname.to_owned(),
            text: text.to_owned(),
        });
    }

    /// System-style line ("X joined.", "Host closed the room.").
    fn system_notice(&mut self, text: &str) {
        self.emit(HubEvent::Notice(text.to_owned()));
    }

    fn roster_changed(&mut self, roster: &[RosterEntry]) {
        self.emit(HubEvent::Roster(roster.to_vec()));
    }

    /// A complete JPEG frame from the watched streamer.
    fn frame_ready(&mut self, streamer: &ParticipantId, jpeg: Vec<u8>) {
        self.emit(HubEvent::Frame {
            streamer: streamer.clone(),
            jpeg,
        });
    }

    /// Raw audio to hand to the playback device.
    fn audio_received(&mut self, sender: &ParticipantId, data: &[u8]) {
        self.emit(HubEvent::Audio {
            sender: sender.clone(),
            data: data.to_vec(),
        });
    }

    fn speaking(&mut self, sender: &ParticipantId) {
        self.emit(HubEvent::Speaking(sender.clone()));
    }

    fn room_accepted(&mut self, code: &str, name: &str) {
        self.emit(HubEvent::RoomAccepted {
            code: code.to_owned(),
            name: name.to_owned(),
        });
    }

    /// The host asks this peer to act as secondary host.
    fn host_prompt(&mut self, host: &ParticipantId) {
        self.emit(HubEvent::HostPrompt(host.clone()));
    }

    fn file_received(&mut self, sender: &ParticipantId, nickname: &str, filename: &str, data: Vec<u8>) {
        self.emit(HubEvent::FileReceived {
            sender: sender.clone(),
            nickname: nickname.to_owned(),
            filename: filename.to_owned(),
            data,
        });
    }

    fn role_changed(&mut self, role: SessionRole) {
        self.emit(HubEvent::RoleChanged(role));
    }

    /// The session is over (room closed, banned, local shutdown).
    fn session_closed(&mut self, reason: &str) {
        self.emit(HubEvent::Closed(reason.to_owned()));
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl SessionEvents for NullEvents {}

/// One logged chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    #[serde(rename = "uid")]
    pub author: ParticipantId,
    #[serde(rename = "nick")]
    pub nickname: String,
    #[serde(rename = "msg")]
    pub text: String,
}

/// Chat log the host appends to and replays to new peers.
pub trait HistoryStore {
    /// Switch to the log of `room_code`. Called when this instance starts hosting a room.
    fn open_room(&mut self, _room_code: &str) {}

    fn append(&mut self, record: ChatRecord);

    /// Oldest first, at most `HISTORY_REPLAY_LIMIT` records.
    fn replay(&self) -> Vec<ChatRecord>;
}

/// In-memory log bounded to the replay length.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: VecDeque<ChatRecord>,
}

impl HistoryStore for MemoryHistory {
    fn open_room(&mut self, _room_code: &str) {
        self.records.clear();
    }

    fn append(&mut self, record: ChatRecord) {
        if self.records.len() == HISTORY_REPLAY_LIMIT {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn replay(&self) -> Vec<ChatRecord> {
        self.records.iter().cloned().collect()
    }
}

//! Hub wire protocol: message types and framing constants.

use std::net::SocketAddr;

use crate::identity::ParticipantId;

/// Field delimiter between type tag, sender and payload sub-fields.
pub const DELIMITER: u8 = b'|';

/// Suffix on the final chunk of a file transfer.
pub const EOF_SENTINEL: &[u8] = b"<-EOF->";

/// Sender field used by host-originated control packets.
pub const HOST_SENDER: &str = "Host";

/// Largest chunk payload carried in a single datagram.
pub const MAX_CHUNK_SIZE: usize = 60_000;

/// Reason sent when a JOIN carries the wrong password.
pub const REJECT_INVALID_PASSWORD: &str = "Invalid Password.";

/// Reason sent when a banned identity tries to JOIN.
pub const REJECT_BANNED: &str = "You are BANNED from this room.";

/// Reason sent to a participant when the host bans them.
pub const REJECT_BANNED_BY_HOST: &str = "You have been BANNED by the Admin.";

/// One record of a LIST broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub identity: ParticipantId,
    pub nickname: String,
    pub live: bool,
    pub avatar: String,
    pub bio: String,
}

/// All wire message types. One variant per type tag; see `wire` for the byte layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Peer asks the host to be admitted.
    Join {
        sender: ParticipantId,
        nickname: String,
        password: String,
        avatar: String,
        bio: String,
    },
    /// Host admits a peer.
    Accept {
        room_code: String,
        room_name: String,
        file_limit_mb: u64,
    },
    /// Host refuses a peer (bad password, ban).
    Reject { reason: String },
    /// Graceful leave. From the host it means the room is closed.
    Leave { sender: ParticipantId },
    /// Peer liveness heartbeat.
    Beat { sender: ParticipantId },
    Text {
        sender: ParticipantId,
        nickname: String,
        text: String,
    },
    /// Replay of one logged chat record to a newly accepted peer.
    History {
        author: ParticipantId,
        nickname: String,
        text: String,
    },
    /// One segment of a file. `last` is carried on the wire as the EOF sentinel.
    File {
        sender: ParticipantId,
        filename: String,
        index: u32,
        data: Vec<u8>,
        last: bool,
    },
    Audio {
        sender: ParticipantId,
        data: Vec<u8>,
    },
    /// One chunk of a JPEG video frame.
    Video {
        sender: ParticipantId,
        frame: u32,
        total: u32,
        index: u32,
        data: Vec<u8>,
    },
    Profile {
        sender: ParticipantId,
        nickname: String,
        avatar: String,
        bio: String,
    },
    /// Host roster snapshot.
    List { entries: Vec<RosterEntry> },
    /// Host asks a peer to act as secondary host.
    RequestSecondary { sender: ParticipantId },
    /// Peer agrees to act as secondary host.
    SecondaryAccept { sender: ParticipantId },
    /// Host announces the secondary-host designation.
    NewSecondary {
        identity: ParticipantId,
        addr: Option<SocketAddr>,
    },
    /// Host hands the room over to the secondary host.
    Migrate {
        identity: ParticipantId,
        addr: Option<SocketAddr>,
    },
    StreamStart { sender: ParticipantId },
    StreamStop { sender: ParticipantId },
    /// New file-size limit (MB).
    Limit { file_limit_mb: u64 },
}

impl Message {
    /// Type tag on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::Accept { .. } => "ACCEPT",
            Message::Reject { .. } => "REJECT",
            Message::Leave { .. } => "LEAVE",
            Message::Beat { .. } => "BEAT",
            Message::Text { .. } => "T",
            Message::History { .. } => "HISTORY",
            Message::File { .. } => "FILE",
            Message::Audio { .. } => "A",
            Message::Video { .. } => "V",
            Message::Profile { .. } => "PROFILE",
            Message::List { .. } => "LIST",
            Message::RequestSecondary { .. } => "REQ_SEC",
            Message::SecondaryAccept { .. } => "SEC_ACCEPT",
            Message::NewSecondary { .. } => "NEW_SEC_HOST",
            Message::Migrate { .. } => "MIGRATE",
            Message::StreamStart { .. } => "STREAM_START",
            Message::StreamStop { .. } => "STREAM_STOP",
            Message::Limit { .. } => "LIMIT",
        }
    }

    /// Participant in the sender field, or `None` for `Host`-sent control packets.
    pub fn sender(&self) -> Option<&ParticipantId> {
        match self {
            Message::Join { sender, .. }
            | Message::Leave { sender }
            | Message::Beat { sender }
            | Message::Text { sender, .. }
            | Message::File { sender, .. }
            | Message::Audio { sender, .. }
            | Message::Video { sender, .. }
            | Message::Profile { sender, .. }
            | Message::RequestSecondary { sender }
            | Message::SecondaryAccept { sender }
            | Message::StreamStart { sender }
            | Message::StreamStop { sender } => Some(sender),
            Message::History { author, .. } => Some(author),
            Message::Accept { .. }
            | Message::Reject { .. }
            | Message::List { .. }
            | Message::NewSecondary { .. }
            | Message::Migrate { .. }
            | Message::Limit { .. } => None,
        }
    }

    /// Whether the host forwards this message verbatim to every other peer.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            Message::Text { .. }
                | Message::File { .. }
                | Message::Audio { .. }
                | Message::Video { .. }
                | Message::Profile { .. }
        )
    }
}

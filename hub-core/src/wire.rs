//! Framing: `TAG|sender|payload`. Only the first two delimiters split the datagram, so
//! binary payloads (audio, file and frame chunks) are never mis-split.

use std::str::FromStr;

use crate::config::DEFAULT_FILE_LIMIT_MB;
use crate::identity::ParticipantId;
use crate::protocol::{Message, RosterEntry, DELIMITER, EOF_SENTINEL, HOST_SENDER};

/// Datagram split into type tag, sender field and the untouched payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub kind: String,
    pub sender: String,
    pub payload: &'a [u8],
}

/// Split a datagram on at most the first two delimiters. Fewer than two fields is an error.
pub fn split_frame(bytes: &[u8]) -> Result<RawFrame<'_>, FrameDecodeError> {
    let mut parts = bytes.splitn(3, |b| *b == DELIMITER);
    let kind = parts.next().ok_or(FrameDecodeError::TooFewFields)?;
    let sender = parts.next().ok_or(FrameDecodeError::TooFewFields)?;
    let payload = parts.next().unwrap_or(&[]);
    Ok(RawFrame {
        kind: text(kind),
        sender: text(sender),
        payload,
    })
}

/// Decode one datagram into a typed message.
pub fn decode_frame(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    let raw = split_frame(bytes)?;
    let sender = || ParticipantId::new(raw.sender.clone());
    let payload = raw.payload;

    let msg = match raw.kind.as_str() {
        "JOIN" => {
            let f = fields(payload, 4);
            Message::Join {
                sender: sender(),
                nickname: text(f[0]),
                password: opt_text(&f, 1),
                avatar: opt_text(&f, 2),
                bio: opt_text(&f, 3),
            }
        }
        "ACCEPT" => {
            let f = fields(payload, 3);
            if f.len() < 2 {
                return Err(FrameDecodeError::MissingField("room name"));
            }
            let file_limit_mb = match f.get(2) {
                Some(v) => number(v, "file limit")?,
                None => DEFAULT_FILE_LIMIT_MB,
            };
            Message::Accept {
                room_code: text(f[0]),
                room_name: text(f[1]),
                file_limit_mb,
            }
        }
        "REJECT" => Message::Reject {
            reason: text(payload),
        },
        "LEAVE" => Message::Leave { sender: sender() },
        "BEAT" => Message::Beat { sender: sender() },
        "STREAM_START" => Message::StreamStart { sender: sender() },
        "STREAM_STOP" => Message::StreamStop { sender: sender() },
        "REQ_SEC" => Message::RequestSecondary { sender: sender() },
        "SEC_ACCEPT" => Message::SecondaryAccept { sender: sender() },
        "T" | "HISTORY" => {
            let f = fields(payload, 2);
            if f.len() < 2 {
                return Err(FrameDecodeError::MissingField("message text"));
            }
            let (nickname, body) = (text(f[0]), text(f[1]));
            if raw.kind == "T" {
                Message::Text {
                    sender: sender(),
                    nickname,
                    text: body,
                }
            } else {
                Message::History {
                    author: sender(),
                    nickname,
                    text: body,
                }
            }
        }
        "FILE" => {
            let f = fields(payload, 3);
            if f.len() < 3 {
                return Err(FrameDecodeError::MissingField("file chunk"));
            }
            let (data, last) = match f[2].strip_suffix(EOF_SENTINEL) {
                Some(d) => (d.to_vec(), true),
                None => (f[2].to_vec(), false),
            };
            Message::File {
                sender: sender(),
                filename: text(f[0]),
                index: number(f[1], "chunk index")?,
                data,
                last,
            }
        }
        "A" => Message::Audio {
            sender: sender(),
            data: payload.to_vec(),
        },
        "V" => {
            let f = fields(payload, 4);
            if f.len() < 4 {
                return Err(FrameDecodeError::MissingField("frame chunk"));
            }
            Message::Video {
                sender: sender(),
                frame: number(f[0], "frame index")?,
                total: number(f[1], "total chunks")?,
                index: number(f[2], "chunk index")?,
                data: f[3].to_vec(),
            }
        }
        "PROFILE" => {
            let f = fields(payload, 3);
            if f.len() < 2 {
                return Err(FrameDecodeError::MissingField("avatar"));
            }
            Message::Profile {
                sender: sender(),
                nickname: text(f[0]),
                avatar: text(f[1]),
                bio: opt_text(&f, 2),
            }
        }
        "LIST" => Message::List {
            entries: decode_roster(&text(payload)),
        },
        "NEW_SEC_HOST" | "MIGRATE" => {
            let f = fields(payload, 2);
            let identity = text(f[0]);
            if identity.is_empty() {
                return Err(FrameDecodeError::MissingField("identity"));
            }
            let identity = ParticipantId::new(identity);
            let addr = f.get(1).and_then(|a| text(a).parse().ok());
            if raw.kind == "MIGRATE" {
                Message::Migrate { identity, addr }
            } else {
                Message::NewSecondary { identity, addr }
            }
        }
        "LIMIT" => Message::Limit {
            file_limit_mb: number(payload, "file limit")?,
        },
        other => return Err(FrameDecodeError::UnknownKind(other.to_owned())),
    };
    Ok(msg)
}

/// Encode a message into one datagram.
pub fn encode_frame(msg: &Message) -> Vec<u8> {
    let kind = msg.kind();
    match msg {
        Message::Join {
            sender,
            nickname,
            password,
            avatar,
            bio,
        } => {
            let mut out = head(kind, sender.as_str());
            push(&mut out, nickname.as_bytes());
            push(&mut out, password.as_bytes());
            push(&mut out, avatar.as_bytes());
            push(&mut out, bio.as_bytes());
            out
        }
        Message::Accept {
            room_code,
            room_name,
            file_limit_mb,
        } => {
            let mut out = head(kind, HOST_SENDER);
            push(&mut out, room_code.as_bytes());
            push(&mut out, room_name.as_bytes());
            push(&mut out, file_limit_mb.to_string().as_bytes());
            out
        }
        Message::Reject { reason } => {
            let mut out = head(kind, HOST_SENDER);
            push(&mut out, reason.as_bytes());
            out
        }
        Message::Leave { sender }
        | Message::Beat { sender }
        | Message::StreamStart { sender }
        | Message::StreamStop { sender }
        | Message::RequestSecondary { sender }
        | Message::SecondaryAccept { sender } => head(kind, sender.as_str()),
        Message::Text {
            sender: who,
            nickname,
            text,
        }
        | Message::History {
            author: who,
            nickname,
            text,
        } => {
            let mut out = head(kind, who.as_str());
            push(&mut out, nickname.as_bytes());
            push(&mut out, text.as_bytes());
            out
        }
        Message::File {
            sender,
            filename,
            index,
            data,
            last,
        } => {
            let mut out = head(kind, sender.as_str());
            push(&mut out, filename.as_bytes());
            push(&mut out, index.to_string().as_bytes());
            push(&mut out, data);
            if *last {
                out.extend_from_slice(EOF_SENTINEL);
            }
            out
        }
        Message::Audio { sender, data } => {
            let mut out = head(kind, sender.as_str());
            push(&mut out, data);
            out
        }
        Message::Video {
            sender,
            frame,
            total,
            index,
            data,
        } => {
            let mut out = head(kind, sender.as_str());
            push(&mut out, frame.to_string().as_bytes());
            push(&mut out, total.to_string().as_bytes());
            push(&mut out, index.to_string().as_bytes());
            push(&mut out, data);
            out
        }
        Message::Profile {
            sender,
            nickname,
            avatar,
            bio,
        } => {
            let mut out = head(kind, sender.as_str());
            push(&mut out, nickname.as_bytes());
            push(&mut out, avatar.as_bytes());
            push(&mut out, bio.as_bytes());
            out
        }
        Message::List { entries } => {
            let mut out = head(kind, HOST_SENDER);
            push(&mut out, encode_roster(entries).as_bytes());
            out
        }
        Message::NewSecondary { identity, addr } | Message::Migrate { identity, addr } => {
            let mut out = head(kind, HOST_SENDER);
            push(&mut out, identity.as_str().as_bytes());
            if let Some(addr) = addr {
                push(&mut out, addr.to_string().as_bytes());
            }
            out
        }
        Message::Limit { file_limit_mb } => {
            let mut out = head(kind, HOST_SENDER);
            push(&mut out, file_limit_mb.to_string().as_bytes());
            out
        }
    }
}

/// Roster payload: `identity:nickname:isLive:avatar:bio` records joined by `,`.
/// Delimiters inside nickname and bio are replaced by spaces.
pub fn encode_roster(entries: &[RosterEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "{}:{}:{}:{}:{}",
                e.identity,
                e.nickname.replace([':', ',', '|'], " "),
                if e.live { "1" } else { "0" },
                e.avatar,
                e.bio.replace(',', " "),
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a roster payload. Records with fewer than four fields are skipped.
pub fn decode_roster(payload: &str) -> Vec<RosterEntry> {
    payload
        .split(',')
        .filter(|r| !r.is_empty())
        .filter_map(|r| {
            let f: Vec<&str> = r.splitn(5, ':').collect();
            if f.len() < 4 {
                return None;
            }
            Some(RosterEntry {
                identity: ParticipantId::new(f[0]),
                nickname: f[1].to_owned(),
                live: f[2] == "1",
                avatar: f[3].to_owned(),
                bio: f.get(4).map(|b| (*b).to_owned()).unwrap_or_default(),
            })
        })
        .collect()
}

fn head(kind: &str, sender: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(kind.len() + sender.len() + 64);
    out.extend_from_slice(kind.as_bytes());
    push(&mut out, sender.as_bytes());
    out
}

fn push(out: &mut Vec<u8>, field: &[u8]) {
    out.push(DELIMITER);
    out.extend_from_slice(field);
}

fn fields(payload: &[u8], n: usize) -> Vec<&[u8]> {
    payload.splitn(n, |b| *b == DELIMITER).collect()
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn opt_text(f: &[&[u8]], i: usize) -> String {
    f.get(i).map(|b| text(b)).unwrap_or_default()
}

fn number<T: FromStr>(bytes: &[u8], field: &'static str) -> Result<T, FrameDecodeError> {
    text(bytes)
        .trim()
        .parse()
        .map_err(|_| FrameDecodeError::InvalidNumber(field))
}

/// Error decoding a datagram. The dispatcher drops the datagram; none of these are fatal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("fewer than two fields")]
    TooFewFields,
    #[error("unknown message type {0:?}")]
    UnknownKind(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid number in {0}")]
    InvalidNumber(&'static str),
}

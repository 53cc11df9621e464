//! Hub session core: framing, peer registry, chunk reassembly, roles and failover.
//! No I/O; the embedding program passes datagrams and ticks in and performs the returned actions.

pub mod chunk;
pub mod config;
pub mod core;
pub mod events;
pub mod heartbeat;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod role;
pub mod wire;

pub use config::Config;
pub use core::{HubCore, OutboundAction, Profile, SessionError};
pub use events::{ChatRecord, HistoryStore, HubEvent, MemoryHistory, NullEvents, SessionEvents};
pub use identity::{generate_room_code, ParticipantId};
pub use protocol::{Message, RosterEntry};
pub use role::{FailoverDecision, RoomInfo, SecondaryHost, SessionRole};
pub use wire::{decode_frame, encode_frame, FrameDecodeError};

//! Session core: HubCore receives datagrams and ticks from the embedding program and returns
//! actions. As host it admits peers, relays traffic and keeps the roster; as peer it follows
//! its host and fails over when the host goes silent.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::chunk::{split_into_chunks, ChunkReceiveResult, FileAssembler, FrameAssembler};
use crate::config::{Config, FRAME_INDEX_MODULUS};
use crate::events::{ChatRecord, HistoryStore, MemoryHistory, NullEvents, SessionEvents};
use crate::heartbeat::{sweep_expired, HostWatch};
use crate::identity::{generate_room_code, ParticipantId};
use crate::protocol::{
    Message, RosterEntry, REJECT_BANNED, REJECT_BANNED_BY_HOST, REJECT_INVALID_PASSWORD,
};
use crate::registry::{AvatarCache, BanList, PeerRecord, PeerRegistry};
use crate::role::{FailoverDecision, RoleError, RoleMachine, RoomInfo, SecondaryHost, SessionRole};
use crate::wire::{decode_frame, encode_frame};

/// Display identity this instance presents to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub identity: ParticipantId,
    pub nickname: String,
    pub bio: String,
    /// Base64 image payload, possibly empty.
    pub avatar: String,
}

/// Action for the embedding program to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Send one datagram. Fire-and-forget; failures are the sender's to log.
    Send(SocketAddr, Vec<u8>),
    /// The session is over; stop the listener and heartbeat tasks.
    Closed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no active session")]
    NotActive,
    #[error("session already active as {0}")]
    AlreadyActive(SessionRole),
    #[error("only the host can do that")]
    NotHost,
    #[error("only a joined peer can do that")]
    NotPeer,
    #[error("no secondary host designated")]
    NoSecondary,
    #[error("unknown participant {0}")]
    UnknownPeer(ParticipantId),
    #[error("file is {size} bytes, room limit is {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },
    #[error(transparent)]
    Role(#[from] RoleError),
}

struct JoinRequest {
    sender: ParticipantId,
    nickname: String,
    password: String,
    avatar: String,
    bio: String,
}

/// One session instance. Owns the registry, caches and reassembly buffers; the embedding
/// program owns the socket and the clock.
pub struct HubCore {
    config: Config,
    profile: Profile,
    roles: RoleMachine,
    local_port: u16,
    registry: PeerRegistry,
    bans: BanList,
    avatars: AvatarCache,
    /// Last roster seen (received as peer, broadcast as host).
    roster: Vec<RosterEntry>,
    files: FileAssembler,
    frames: FrameAssembler,
    watching: Option<ParticipantId>,
    host_watch: HostWatch,
    /// JOIN sent, no ACCEPT yet. JOIN is repeated on every tick until one arrives.
    awaiting_accept: bool,
    next_frame: u32,
    streaming: bool,
    events: Box<dyn SessionEvents + Send>,
    history: Box<dyn HistoryStore + Send>,
}

impl HubCore {
    pub fn new(
        config: Config,
        profile: Profile,
        events: Box<dyn SessionEvents + Send>,
        history: Box<dyn HistoryStore + Send>,
    ) -> Self {
        Self {
            config,
            profile,
            roles: RoleMachine::new(),
            local_port: 0,
            registry: PeerRegistry::new(),
            bans: BanList::default(),
            avatars: AvatarCache::default(),
            roster: Vec::new(),
            files: FileAssembler::default(),
            frames: FrameAssembler::default(),
            watching: None,
            host_watch: HostWatch::default(),
            awaiting_accept: false,
            next_frame: 0,
            streaming: false,
            events,
            history,
        }
    }

    /// Default timings, no event sink, in-memory history.
    pub fn with_profile(profile: Profile) -> Self {
        Self::new(
            Config::default(),
            profile,
            Box::new(NullEvents),
            Box::new(MemoryHistory::default()),
        )
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.profile.identity
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> SessionRole {
        self.roles.role()
    }

    pub fn room(&self) -> Option<&RoomInfo> {
        self.roles.room()
    }

    /// Current host address while joined.
    pub fn target(&self) -> Option<SocketAddr> {
        self.roles.target()
    }

    pub fn secondary(&self) -> Option<&SecondaryHost> {
        self.roles.secondary()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn is_banned(&self, id: &ParticipantId) -> bool {
        self.bans.is_banned(id)
    }

    pub fn watching(&self) -> Option<&ParticipantId> {
        self.watching.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Limit of the current room, or the configured default before one is known.
    pub fn file_limit_mb(&self) -> u64 {
        self.roles
            .room()
            .map(|r| r.file_limit_mb)
            .unwrap_or(self.config.file_limit_mb)
    }

    /// Open a room on `local_port`. `room_code` resumes a previous room; `None` generates one.
    pub fn start_host(
        &mut self,
        name: &str,
        password: &str,
        room_code: Option<String>,
        local_port: u16,
        now: Instant,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        if self.roles.role().is_active() {
            return Err(SessionError::AlreadyActive(self.roles.role()));
        }
        let code = room_code
            .filter(|c| !c.is_empty())
            .unwrap_or_else(generate_room_code);
        self.roles.start_hosting(RoomInfo {
            code: code.clone(),
            name: name.to_owned(),
            password: password.to_owned(),
            file_limit_mb: self.config.file_limit_mb,
        })?;
        self.local_port = local_port;
        self.reset_session_state();
        self.register_self(now);
        self.history.open_room(&code);
        for record in self.history.replay() {
            self.events
                .chat_received(&record.author, &record.nickname, &record.text);
        }
        info!(room = %code, name, port = local_port, "hosting room");
        self.events.role_changed(SessionRole::Hosting);
        self.events.room_accepted(&code, name);
        Ok(self.broadcast_roster())
    }

    /// Join the host at `target`. Returns the JOIN handshake.
    pub fn start_peer(
        &mut self,
        target: SocketAddr,
        password: &str,
        local_port: u16,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        if self.roles.role().is_active() {
            return Err(SessionError::AlreadyActive(self.roles.role()));
        }
        self.roles.start_joined(target, password)?;
        self.local_port = local_port;
        self.reset_session_state();
        self.host_watch.contact();
        self.awaiting_accept = true;
        info!(%target, "joining room");
        self.events.role_changed(SessionRole::Joined);
        Ok(vec![OutboundAction::Send(
            target,
            encode_frame(&self.join_message()),
        )])
    }

    /// Leave the room (host: close it). Best-effort LEAVE, then all state is dropped.
    pub fn shutdown(&mut self) -> Vec<OutboundAction> {
        let role = self.roles.role();
        if !role.is_active() {
            return Vec::new();
        }
        let leave = encode_frame(&Message::Leave {
            sender: self.profile.identity.clone(),
        });
        let mut actions = if role.is_host() {
            self.fan_out(&leave, None)
        } else {
            self.to_target(&leave)
        };
        self.close("You left the room.");
        actions.push(OutboundAction::Closed);
        actions
    }

    /// Handle one inbound datagram.
    pub fn on_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Vec<OutboundAction> {
        let role = self.roles.role();
        if !role.is_active() {
            return Vec::new();
        }
        let msg = match decode_frame(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed datagram");
                return Vec::new();
            }
        };
        if role.is_host() {
            self.on_host_message(from, bytes, msg, now)
        } else {
            self.on_peer_message(from, msg, now)
        }
    }

    /// Heartbeat period elapsed. Host: sweep silent peers. Peer: BEAT and watch for host loss.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        match self.roles.role() {
            SessionRole::Unhosted => Vec::new(),
            SessionRole::Hosting | SessionRole::PromotedHost => {
                let gone = sweep_expired(
                    &mut self.registry,
                    &self.profile.identity,
                    now,
                    self.config.timeout_limit,
                );
                if gone.is_empty() {
                    return Vec::new();
                }
                for record in &gone {
                    info!(peer = %record.identity, "peer timed out");
                    self.events
                        .system_notice(&format!("{} timed out and left.", record.nickname));
                }
                self.broadcast_roster()
            }
            SessionRole::Joined => {
                let beat = encode_frame(&Message::Beat {
                    sender: self.profile.identity.clone(),
                });
                let mut actions = self.to_target(&beat);
                if self.awaiting_accept {
                    actions.extend(self.to_target(&encode_frame(&self.join_message())));
                }
                if self
                    .host_watch
                    .on_tick(self.config.heartbeat_interval, self.config.host_loss_after())
                {
                    actions.extend(self.fail_over(now));
                }
                actions
            }
        }
    }

    pub fn send_text(&mut self, text: &str) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_active()?;
        let me = self.profile.identity.clone();
        if self.roles.role().is_host() {
            self.history.append(ChatRecord {
                author: me.clone(),
                nickname: self.profile.nickname.clone(),
                text: text.to_owned(),
            });
        }
        self.events
            .chat_received(&me, &self.profile.nickname, text);
        let msg = Message::Text {
            sender: me,
            nickname: self.profile.nickname.clone(),
            text: text.to_owned(),
        };
        Ok(self.publish(&encode_frame(&msg)))
    }

    /// Split a file into FILE datagrams. The caller paces them.
    pub fn send_file(
        &mut self,
        filename: &str,
        data: &[u8],
    ) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_active()?;
        let limit_mb = self.file_limit_mb();
        let limit = limit_mb.saturating_mul(1024 * 1024);
        let size = data.len() as u64;
        if size > limit {
            self.events.system_notice(&format!(
                "{filename} is larger than the room limit of {limit_mb}MB."
            ));
            return Err(SessionError::FileTooLarge { size, limit });
        }
        let me = self.profile.identity.clone();
        let chunks = split_into_chunks(data, self.config.max_chunk_size);
        let last = chunks.len().saturating_sub(1);
        let mut actions = Vec::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let msg = Message::File {
                sender: me.clone(),
                filename: filename.to_owned(),
                index: i as u32,
                data: chunk.to_vec(),
                last: i == last,
            };
            actions.extend(self.publish(&encode_frame(&msg)));
        }
        if self.roles.role().is_host() {
            self.history.append(ChatRecord {
                author: me,
                nickname: self.profile.nickname.clone(),
                text: shared_file_line(filename),
            });
        }
        info!(filename, size, chunks = last + 1, "sending file");
        Ok(actions)
    }

    pub fn send_audio(&mut self, data: &[u8]) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_active()?;
        let msg = Message::Audio {
            sender: self.profile.identity.clone(),
            data: data.to_vec(),
        };
        Ok(self.publish(&encode_frame(&msg)))
    }

    /// Chunk one JPEG frame into V datagrams under the next frame index.
    pub fn send_video_frame(&mut self, jpeg: &[u8]) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_active()?;
        let frame = self.next_frame;
        self.next_frame = (self.next_frame + 1) % FRAME_INDEX_MODULUS;
        let chunks = split_into_chunks(jpeg, self.config.max_chunk_size);
        let total = chunks.len() as u32;
        let mut actions = Vec::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let msg = Message::Video {
                sender: self.profile.identity.clone(),
                frame,
                total,
                index: i as u32,
                data: chunk.to_vec(),
            };
            actions.extend(self.publish(&encode_frame(&msg)));
        }
        if self.watching.as_ref() == Some(&self.profile.identity) {
            let me = self.profile.identity.clone();
            self.events.frame_ready(&me, jpeg.to_vec());
        }
        Ok(actions)
    }

    pub fn set_streaming(&mut self, on: bool) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_active()?;
        self.streaming = on;
        let me = self.profile.identity.clone();
        if self.roles.role().is_host() {
            if let Some(record) = self.registry.get_mut(&me) {
                record.live = on;
            }
            return Ok(self.broadcast_roster());
        }
        let msg = if on {
            Message::StreamStart { sender: me }
        } else {
            Message::StreamStop { sender: me }
        };
        Ok(self.to_target(&encode_frame(&msg)))
    }

    /// Choose whose video frames to reassemble. Pending frames of the previous streamer are dropped.
    pub fn watch(&mut self, streamer: Option<ParticipantId>) {
        self.frames.clear();
        debug!(streamer = ?streamer, "watching");
        self.watching = streamer;
    }

    /// Update the local profile and announce it when in a room.
    pub fn update_profile(
        &mut self,
        nickname: &str,
        bio: &str,
        avatar: &str,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        self.profile.nickname = nickname.to_owned();
        self.profile.bio = bio.to_owned();
        self.profile.avatar = avatar.to_owned();
        let role = self.roles.role();
        if !role.is_active() {
            return Ok(Vec::new());
        }
        let me = self.profile.identity.clone();
        let bytes = encode_frame(&Message::Profile {
            sender: me.clone(),
            nickname: nickname.to_owned(),
            avatar: avatar.to_owned(),
            bio: bio.to_owned(),
        });
        if !role.is_host() {
            return Ok(self.to_target(&bytes));
        }
        if let Some(record) = self.registry.get_mut(&me) {
            record.nickname = nickname.to_owned();
            record.bio = bio.to_owned();
        }
        self.avatars.set(me, avatar.to_owned());
        let mut actions = self.fan_out(&bytes, None);
        actions.extend(self.broadcast_roster());
        Ok(actions)
    }

    pub fn set_file_limit(&mut self, mb: u64) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_host()?;
        self.roles.set_file_limit(mb);
        info!(limit_mb = mb, "file limit changed");
        self.events
            .system_notice(&format!("File limit set to {mb}MB."));
        Ok(self.fan_out(&encode_frame(&Message::Limit { file_limit_mb: mb }), None))
    }

    /// Remove a registered peer and reject its future JOINs.
    pub fn ban(&mut self, id: &ParticipantId) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_host()?;
        if *id == self.profile.identity {
            return Err(SessionError::UnknownPeer(id.clone()));
        }
        let record = self
            .registry
            .remove(id)
            .ok_or_else(|| SessionError::UnknownPeer(id.clone()))?;
        self.bans.ban(id.clone());
        info!(peer = %id, "banned");
        let mut actions = vec![reject_to(record.addr, REJECT_BANNED_BY_HOST)];
        actions.extend(self.broadcast_roster());
        self.events
            .system_notice(&format!("Admin banned {}.", record.nickname));
        Ok(actions)
    }

    pub fn unban(&mut self, id: &ParticipantId) -> Result<(), SessionError> {
        self.require_host()?;
        if !self.bans.unban(id) {
            return Err(SessionError::UnknownPeer(id.clone()));
        }
        info!(peer = %id, "unbanned");
        self.events
            .system_notice(&format!("Admin unbanned UID: {}...", id.short()));
        Ok(())
    }

    /// Ask a registered peer to act as secondary host.
    pub fn request_secondary(
        &mut self,
        id: &ParticipantId,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_host()?;
        let record = self
            .registry
            .get(id)
            .filter(|r| r.identity != self.profile.identity)
            .ok_or_else(|| SessionError::UnknownPeer(id.clone()))?;
        let msg = Message::RequestSecondary {
            sender: self.profile.identity.clone(),
        };
        Ok(vec![OutboundAction::Send(record.addr, encode_frame(&msg))])
    }

    /// Agree to the host's secondary-host request.
    pub fn accept_secondary(&mut self) -> Result<Vec<OutboundAction>, SessionError> {
        if self.roles.role() != SessionRole::Joined {
            return Err(SessionError::NotPeer);
        }
        let msg = Message::SecondaryAccept {
            sender: self.profile.identity.clone(),
        };
        Ok(self.to_target(&encode_frame(&msg)))
    }

    /// Hand the room to the secondary host. The caller shuts this session down after a grace period.
    pub fn migrate(&mut self) -> Result<Vec<OutboundAction>, SessionError> {
        self.require_host()?;
        let secondary = self
            .roles
            .secondary()
            .cloned()
            .ok_or(SessionError::NoSecondary)?;
        info!(new_host = %secondary.identity, addr = ?secondary.addr, "migrating room");
        let nickname = self.nickname_of(&secondary.identity);
        self.events
            .system_notice(&format!("Migrating the room to {nickname}..."));
        let msg = Message::Migrate {
            identity: secondary.identity,
            addr: secondary.addr,
        };
        Ok(self.fan_out(&encode_frame(&msg), None))
    }

    fn on_host_message(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        msg: Message,
        now: Instant,
    ) -> Vec<OutboundAction> {
        let Some(sender) = msg.sender().cloned() else {
            debug!(%from, kind = msg.kind(), "dropping host-originated message");
            return Vec::new();
        };
        if sender == self.profile.identity {
            return Vec::new();
        }
        let msg = match msg {
            Message::Join {
                nickname,
                password,
                avatar,
                bio,
                ..
            } => {
                let join = JoinRequest {
                    sender,
                    nickname,
                    password,
                    avatar,
                    bio,
                };
                return self.on_join(from, join, now);
            }
            other => other,
        };
        if !self.registry.touch(&sender, from, now) {
            debug!(%from, %sender, kind = msg.kind(), "dropping datagram from unregistered sender");
            return Vec::new();
        }

        match msg {
            // Answered so a quiet room still counts as contact on the peer side.
            Message::Beat { .. } => vec![OutboundAction::Send(
                from,
                encode_frame(&Message::Beat {
                    sender: self.profile.identity.clone(),
                }),
            )],
            Message::Leave { .. } => {
                let Some(record) = self.registry.remove(&sender) else {
                    return Vec::new();
                };
                info!(peer = %sender, "peer left");
                self.events
                    .system_notice(&format!("{} left the room.", record.nickname));
                self.broadcast_roster()
            }
            Message::Text { nickname, text, .. } => {
                self.history.append(ChatRecord {
                    author: sender.clone(),
                    nickname: nickname.clone(),
                    text: text.clone(),
                });
                self.events.chat_received(&sender, &nickname, &text);
                self.fan_out(bytes, Some(&sender))
            }
            Message::File {
                filename,
                index,
                data,
                last,
                ..
            } => {
                let actions = self.fan_out(bytes, Some(&sender));
                self.on_file_chunk(&sender, &filename, index, data, last);
                actions
            }
            Message::Audio { data, .. } => {
                let actions = self.fan_out(bytes, Some(&sender));
                self.events.audio_received(&sender, &data);
                self.events.speaking(&sender);
                actions
            }
            Message::Video {
                frame,
                total,
                index,
                data,
                ..
            } => {
                let actions = self.fan_out(bytes, Some(&sender));
                self.on_video_chunk(&sender, frame, total, index, data, now);
                actions
            }
            Message::Profile {
                nickname,
                avatar,
                bio,
                ..
            } => {
                if let Some(record) = self.registry.get_mut(&sender) {
                    record.nickname = nickname;
                    record.bio = bio;
                }
                self.avatars.set(sender.clone(), avatar);
                let mut actions = self.fan_out(bytes, Some(&sender));
                actions.extend(self.broadcast_roster());
                actions
            }
            Message::StreamStart { .. } => self.set_peer_live(&sender, true),
            Message::StreamStop { .. } => self.set_peer_live(&sender, false),
            Message::SecondaryAccept { .. } => {
                let nickname = self.nickname_of(&sender);
                self.roles.designate_secondary(SecondaryHost {
                    identity: sender.clone(),
                    addr: Some(from),
                });
                info!(peer = %sender, %from, "secondary host designated");
                self.events
                    .system_notice(&format!("{nickname} is now the Secondary Host."));
                let announce = encode_frame(&Message::NewSecondary {
                    identity: sender,
                    addr: Some(from),
                });
                self.fan_out(&announce, None)
            }
            other => {
                debug!(peer = %sender, kind = other.kind(), "ignoring peer-bound message");
                Vec::new()
            }
        }
    }

    fn on_join(&mut self, from: SocketAddr, join: JoinRequest, now: Instant) -> Vec<OutboundAction> {
        if self.bans.is_banned(&join.sender) {
            info!(peer = %join.sender, %from, "rejected banned identity");
            return vec![reject_to(from, REJECT_BANNED)];
        }
        let Some(room) = self.roles.room() else {
            return Vec::new();
        };
        if !room.admits(&join.password) {
            info!(peer = %join.sender, %from, "rejected join: bad password");
            return vec![reject_to(from, REJECT_INVALID_PASSWORD)];
        }
        let accept = encode_frame(&Message::Accept {
            room_code: room.code.clone(),
            room_name: room.name.clone(),
            file_limit_mb: room.file_limit_mb,
        });

        // A retransmitted JOIN only needs its ACCEPT again.
        let repeated = self
            .registry
            .get(&join.sender)
            .is_some_and(|p| p.addr == from);
        if repeated && self.registry.touch(&join.sender, from, now) {
            debug!(peer = %join.sender, %from, "repeated join");
            return vec![OutboundAction::Send(from, accept)];
        }

        let is_new = self.registry.insert(PeerRecord {
            identity: join.sender.clone(),
            addr: from,
            nickname: join.nickname.clone(),
            bio: join.bio,
            last_seen: now,
            live: false,
            is_host: false,
        });
        self.avatars.set(join.sender.clone(), join.avatar);

        let mut actions = vec![OutboundAction::Send(from, accept)];
        for record in self.history.replay() {
            let replay = Message::History {
                author: record.author,
                nickname: record.nickname,
                text: record.text,
            };
            actions.push(OutboundAction::Send(from, encode_frame(&replay)));
        }
        if let Some(secondary) = self.roles.secondary() {
            let current = Message::NewSecondary {
                identity: secondary.identity.clone(),
                addr: secondary.addr,
            };
            actions.push(OutboundAction::Send(from, encode_frame(&current)));
        }
        actions.extend(self.broadcast_roster());
        if is_new {
            info!(peer = %join.sender, %from, nickname = %join.nickname, "peer joined");
            self.events
                .system_notice(&format!("{} joined.", join.nickname));
        }
        actions
    }

    fn on_peer_message(
        &mut self,
        from: SocketAddr,
        msg: Message,
        now: Instant,
    ) -> Vec<OutboundAction> {
        if self.roles.target() != Some(from) {
            debug!(%from, kind = msg.kind(), "dropping datagram from outside the current host");
            return Vec::new();
        }
        self.host_watch.contact();

        match msg {
            Message::Accept {
                room_code,
                room_name,
                file_limit_mb,
            } => {
                if !self.awaiting_accept {
                    debug!("duplicate ACCEPT");
                    return Vec::new();
                }
                match self.roles.accept_room(room_code, room_name, file_limit_mb) {
                    Ok(room) => {
                        let (code, name) = (room.code.clone(), room.name.clone());
                        self.awaiting_accept = false;
                        info!(room = %code, name = %name, limit_mb = file_limit_mb, "joined room");
                        self.events.room_accepted(&code, &name);
                    }
                    Err(e) => debug!(error = %e, "unexpected ACCEPT"),
                }
                Vec::new()
            }
            Message::Reject { reason } => {
                info!(%reason, "join rejected");
                self.events
                    .system_notice(&format!("Connection rejected: {reason}"));
                self.close(&reason);
                vec![OutboundAction::Closed]
            }
            Message::Leave { .. } => {
                info!("host closed the room");
                self.events.system_notice("Host closed the room.");
                self.close("Host closed the room.");
                vec![OutboundAction::Closed]
            }
            Message::Limit { file_limit_mb } => {
                self.roles.set_file_limit(file_limit_mb);
                self.events.system_notice(&format!(
                    "Host changed file limit to {file_limit_mb}MB."
                ));
                Vec::new()
            }
            Message::RequestSecondary { sender } => {
                self.events.host_prompt(&sender);
                Vec::new()
            }
            Message::NewSecondary { identity, addr } => {
                debug!(secondary = %identity, ?addr, "secondary host announced");
                if identity == self.profile.identity {
                    self.events.system_notice("You are now the Secondary Host.");
                }
                self.roles
                    .designate_secondary(SecondaryHost { identity, addr });
                Vec::new()
            }
            Message::Migrate { identity, addr } => self.on_migrate(identity, addr, now),
            Message::History {
                author,
                nickname,
                text,
            }
            | Message::Text {
                sender: author,
                nickname,
                text,
            } => {
                self.events.chat_received(&author, &nickname, &text);
                Vec::new()
            }
            Message::Profile { sender, avatar, .. } => {
                self.avatars.set(sender, avatar);
                Vec::new()
            }
            Message::List { entries } => {
                for entry in &entries {
                    self.avatars
                        .set(entry.identity.clone(), entry.avatar.clone());
                }
                self.events.roster_changed(&entries);
                self.roster = entries;
                Vec::new()
            }
            Message::File {
                sender,
                filename,
                index,
                data,
                last,
            } => {
                self.on_file_chunk(&sender, &filename, index, data, last);
                Vec::new()
            }
            Message::Audio { sender, data } => {
                self.events.audio_received(&sender, &data);
                self.events.speaking(&sender);
                Vec::new()
            }
            Message::Video {
                sender,
                frame,
                total,
                index,
                data,
            } => {
                self.on_video_chunk(&sender, frame, total, index, data, now);
                Vec::new()
            }
            other => {
                debug!(kind = other.kind(), "ignoring host-bound message");
                Vec::new()
            }
        }
    }

    fn on_migrate(
        &mut self,
        identity: ParticipantId,
        addr: Option<SocketAddr>,
        now: Instant,
    ) -> Vec<OutboundAction> {
        if identity == self.profile.identity {
            self.events
                .system_notice("You have been promoted to Host! Room migrated.");
            return self.promote(now);
        }
        match addr {
            Some(addr) => {
                self.events
                    .system_notice("Host left. Migrating to Secondary Host...");
                self.redirect_and_join(addr)
            }
            None => {
                warn!(new_host = %identity, "migrate directive without an address");
                self.events
                    .system_notice("Host left without a reachable successor.");
                Vec::new()
            }
        }
    }

    fn fail_over(&mut self, now: Instant) -> Vec<OutboundAction> {
        let decision = self.roles.on_host_lost(&self.profile.identity);
        info!(
            ?decision,
            silence_ms = self.host_watch.silence().as_millis() as u64,
            "host lost"
        );
        match decision {
            FailoverDecision::Promote => {
                self.events
                    .system_notice("Host timed out! You are taking over as Host.");
                self.promote(now)
            }
            FailoverDecision::Redirect(addr) => {
                self.events
                    .system_notice("Host timed out! Migrating to Secondary Host...");
                self.redirect_and_join(addr)
            }
            FailoverDecision::Stranded => {
                self.events
                    .system_notice("Host timed out. No secondary host to take over.");
                Vec::new()
            }
        }
    }

    /// Take over the room learned as a peer. No JOIN: peers come to us.
    fn promote(&mut self, now: Instant) -> Vec<OutboundAction> {
        let code = match self.roles.promote() {
            Ok(room) => room.code.clone(),
            Err(e) => {
                warn!(error = %e, "cannot take over the room");
                return Vec::new();
            }
        };
        self.registry.clear();
        self.register_self(now);
        self.history.open_room(&code);
        self.host_watch.contact();
        info!(room = %code, port = self.local_port, "took over as host");
        self.events.role_changed(SessionRole::PromotedHost);
        self.broadcast_roster()
    }

    fn redirect_and_join(&mut self, addr: SocketAddr) -> Vec<OutboundAction> {
        if let Err(e) = self.roles.redirect(addr) {
            warn!(error = %e, "cannot redirect");
            return Vec::new();
        }
        self.host_watch.contact();
        self.awaiting_accept = true;
        info!(%addr, "rejoining at secondary host");
        vec![OutboundAction::Send(addr, encode_frame(&self.join_message()))]
    }

    fn on_file_chunk(
        &mut self,
        sender: &ParticipantId,
        filename: &str,
        index: u32,
        data: Vec<u8>,
        last: bool,
    ) {
        let ChunkReceiveResult::Complete(bytes) =
            self.files.on_chunk(sender, filename, index, data, last)
        else {
            return;
        };
        let nickname = self.nickname_of(sender);
        info!(from = %sender, filename, size = bytes.len(), "file received");
        if self.roles.role().is_host() {
            self.history.append(ChatRecord {
                author: sender.clone(),
                nickname: nickname.clone(),
                text: shared_file_line(filename),
            });
        }
        self.events
            .file_received(sender, &nickname, filename, bytes);
    }

    fn on_video_chunk(
        &mut self,
        sender: &ParticipantId,
        frame: u32,
        total: u32,
        index: u32,
        data: Vec<u8>,
        now: Instant,
    ) {
        if self.watching.as_ref() != Some(sender) {
            return;
        }
        if let ChunkReceiveResult::Complete(jpeg) =
            self.frames.on_chunk(frame, total, index, data, now)
        {
            self.events.frame_ready(sender, jpeg);
        }
    }

    fn set_peer_live(&mut self, id: &ParticipantId, live: bool) -> Vec<OutboundAction> {
        if let Some(record) = self.registry.get_mut(id) {
            record.live = live;
        }
        self.broadcast_roster()
    }

    /// Recompute the roster, send it to every peer and show it locally.
    fn broadcast_roster(&mut self) -> Vec<OutboundAction> {
        let roster = self.registry.roster(&self.avatars);
        let bytes = encode_frame(&Message::List {
            entries: roster.clone(),
        });
        let actions = self.fan_out(&bytes, None);
        self.events.roster_changed(&roster);
        self.roster = roster;
        actions
    }

    /// Host: one send per registered peer except self and `exclude`.
    fn fan_out(&self, bytes: &[u8], exclude: Option<&ParticipantId>) -> Vec<OutboundAction> {
        self.registry
            .others(&self.profile.identity)
            .filter(|p| Some(&p.identity) != exclude)
            .map(|p| OutboundAction::Send(p.addr, bytes.to_vec()))
            .collect()
    }

    fn to_target(&self, bytes: &[u8]) -> Vec<OutboundAction> {
        self.roles
            .target()
            .map(|t| OutboundAction::Send(t, bytes.to_vec()))
            .into_iter()
            .collect()
    }

    /// Host fans out; peer sends to its host.
    fn publish(&self, bytes: &[u8]) -> Vec<OutboundAction> {
        if self.roles.role().is_host() {
            self.fan_out(bytes, None)
        } else {
            self.to_target(bytes)
        }
    }

    fn join_message(&self) -> Message {
        Message::Join {
            sender: self.profile.identity.clone(),
            nickname: self.profile.nickname.clone(),
            password: self.roles.join_password().to_owned(),
            avatar: self.profile.avatar.clone(),
            bio: self.profile.bio.clone(),
        }
    }

    fn nickname_of(&self, id: &ParticipantId) -> String {
        if *id == self.profile.identity {
            return self.profile.nickname.clone();
        }
        if let Some(record) = self.registry.get(id) {
            return record.nickname.clone();
        }
        self.roster
            .iter()
            .find(|e| e.identity == *id)
            .map(|e| e.nickname.clone())
            .unwrap_or_else(|| "Someone".to_owned())
    }

    fn register_self(&mut self, now: Instant) {
        let me = self.profile.identity.clone();
        self.registry.insert(PeerRecord {
            identity: me.clone(),
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port)),
            nickname: self.profile.nickname.clone(),
            bio: self.profile.bio.clone(),
            last_seen: now,
            live: self.streaming,
            is_host: true,
        });
        self.avatars.set(me, self.profile.avatar.clone());
    }

    fn reset_session_state(&mut self) {
        self.registry.clear();
        self.bans.clear();
        self.avatars.clear();
        self.roster.clear();
        self.files.clear();
        self.frames.clear();
        self.watching = None;
        self.host_watch = HostWatch::default();
        self.awaiting_accept = false;
        self.next_frame = 0;
        self.streaming = false;
    }

    fn close(&mut self, reason: &str) {
        info!(reason, "session closed");
        self.roles.reset();
        self.reset_session_state();
        self.events.role_changed(SessionRole::Unhosted);
        self.events.session_closed(reason);
    }

    fn require_active(&self) -> Result<(), SessionError> {
        if self.roles.role().is_active() {
            Ok(())
        } else {
            Err(SessionError::NotActive)
        }
    }

    fn require_host(&self) -> Result<(), SessionError> {
        if self.roles.role().is_host() {
            Ok(())
        } else {
            Err(SessionError::NotHost)
        }
    }
}

fn reject_to(to: SocketAddr, reason: &str) -> OutboundAction {
    let msg = Message::Reject {
        reason: reason.to_owned(),
    };
    OutboundAction::Send(to, encode_frame(&msg))
}

fn shared_file_line(filename: &str) -> String {
    format!("Shared a file: '{filename}'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HubEvent;
    use crate::protocol::MAX_CHUNK_SIZE;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const HOST_PORT: u16 = 40_000;
    const A_PORT: u16 = 41_001;
    const C_PORT: u16 = 41_003;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<HubEvent>>>);

    impl SessionEvents for Recorder {
        fn emit(&mut self, event: HubEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<HubEvent> {
            self.0.lock().unwrap().clone()
        }

        fn notices(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    HubEvent::Notice(n) => Some(n),
                    _ => None,
                })
                .collect()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn id(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn node(name: &str) -> (HubCore, Recorder) {
        let rec = Recorder::default();
        let profile = Profile {
            identity: id(name),
            nickname: name.to_uppercase(),
            bio: String::new(),
            avatar: String::new(),
        };
        let core = HubCore::new(
            Config::default(),
            profile,
            Box::new(rec.clone()),
            Box::new(MemoryHistory::default()),
        );
        (core, rec)
    }

    fn hosting(now: Instant) -> (HubCore, Recorder) {
        let (mut host, rec) = node("host");
        host.start_host("lounge", "", Some("1234567890".into()), HOST_PORT, now)
            .unwrap();
        (host, rec)
    }

    fn sends(actions: &[OutboundAction]) -> Vec<(SocketAddr, Message)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send(to, bytes) => Some((*to, decode_frame(bytes).unwrap())),
                OutboundAction::Closed => None,
            })
            .collect()
    }

    /// Feed every datagram addressed to `to` into `node`, as sent from `from`.
    fn deliver(
        node: &mut HubCore,
        from: SocketAddr,
        to: SocketAddr,
        actions: &[OutboundAction],
        now: Instant,
    ) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        for action in actions {
            if let OutboundAction::Send(dest, bytes) = action {
                if *dest == to {
                    out.extend(node.on_datagram(from, bytes, now));
                }
            }
        }
        out
    }

    /// Peer `name` on `port` joins `host`; the host's replies are delivered back.
    fn join(
        host: &mut HubCore,
        name: &str,
        port: u16,
        password: &str,
        now: Instant,
    ) -> (HubCore, Recorder, Vec<OutboundAction>) {
        let (mut peer, rec) = node(name);
        let hello = peer.start_peer(addr(HOST_PORT), password, port).unwrap();
        let replies = deliver(host, addr(port), addr(HOST_PORT), &hello, now);
        deliver(&mut peer, addr(HOST_PORT), addr(port), &replies, now);
        (peer, rec, replies)
    }

    /// Host asks `peer` to be secondary, it accepts, and the announcement reaches `others`.
    fn designate(
        host: &mut HubCore,
        peer: &mut HubCore,
        port: u16,
        others: &mut [(&mut HubCore, u16)],
        now: Instant,
    ) {
        let request = host.request_secondary(peer.identity()).unwrap();
        deliver(peer, addr(HOST_PORT), addr(port), &request, now);
        let accept = peer.accept_secondary().unwrap();
        let announce = deliver(host, addr(port), addr(HOST_PORT), &accept, now);
        deliver(peer, addr(HOST_PORT), addr(port), &announce, now);
        for (other, other_port) in others.iter_mut() {
            deliver(other, addr(HOST_PORT), addr(*other_port), &announce, now);
        }
    }

    #[test]
    fn join_with_correct_password_is_accepted_and_wrong_one_rejected() {
        let now = Instant::now();
        let (mut host, host_events) = hosting(now);

        let (peer_a, a_events, replies) = join(&mut host, "a", A_PORT, "", now);
        let to_a = sends(&replies);
        assert!(matches!(
            &to_a[0],
            (to, Message::Accept { room_code, .. }) if *to == addr(A_PORT) && room_code == "1234567890"
        ));
        assert_eq!(peer_a.room().map(|r| r.code.as_str()), Some("1234567890"));
        assert!(a_events.events().contains(&HubEvent::RoomAccepted {
            code: "1234567890".into(),
            name: "lounge".into(),
        }));
        assert!(host_events.notices().contains(&"A joined.".to_owned()));

        let (peer_b, b_events, replies) = join(&mut host, "b", 41_002, "wrong", now);
        assert_eq!(
            sends(&replies),
            vec![(
                addr(41_002),
                Message::Reject {
                    reason: REJECT_INVALID_PASSWORD.into()
                }
            )]
        );
        assert!(!host.registry().contains(&id("b")));
        assert_eq!(peer_b.role(), SessionRole::Unhosted);
        assert!(b_events
            .notices()
            .contains(&"Connection rejected: Invalid Password.".to_owned()));
    }

    #[test]
    fn accepted_peer_receives_roster_with_everyone() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        let (peer_a, a_events, _) = join(&mut host, "a", A_PORT, "", now);
        let ids: Vec<&str> = peer_a.roster().iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, ["host", "a"]);
        assert!(a_events
            .events()
            .iter()
            .any(|e| matches!(e, HubEvent::Roster(r) if r.len() == 2)));
    }

    #[test]
    fn banned_identity_is_rejected_until_unbanned() {
        let now = Instant::now();
        let (mut host, host_events) = hosting(now);
        let (mut peer_a, _, _) = join(&mut host, "a", A_PORT, "", now);

        let actions = host.ban(&id("a")).unwrap();
        assert!(sends(&actions).contains(&(
            addr(A_PORT),
            Message::Reject {
                reason: REJECT_BANNED_BY_HOST.into()
            }
        )));
        assert!(!host.registry().contains(&id("a")));
        assert!(host_events.notices().contains(&"Admin banned A.".to_owned()));
        deliver(&mut peer_a, addr(HOST_PORT), addr(A_PORT), &actions, now);
        assert_eq!(peer_a.role(), SessionRole::Unhosted);

        let (_, _, replies) = join(&mut host, "a", A_PORT, "", now);
        assert_eq!(
            sends(&replies),
            vec![(
                addr(A_PORT),
                Message::Reject {
                    reason: REJECT_BANNED.into()
                }
            )]
        );

        host.unban(&id("a")).unwrap();
        let (peer_a, _, _) = join(&mut host, "a", A_PORT, "", now);
        assert!(peer_a.room().is_some());
        assert_eq!(host.ban(&id("zz")), Err(SessionError::UnknownPeer(id("zz"))));
        assert_eq!(host.unban(&id("zz")), Err(SessionError::UnknownPeer(id("zz"))));
    }

    #[test]
    fn silent_peer_is_swept_and_next_roster_excludes_it() {
        let start = Instant::now();
        let (mut host, host_events) = hosting(start);
        join(&mut host, "a", A_PORT, "", start);
        join(&mut host, "c", C_PORT, "", start);

        let beat = encode_frame(&Message::Beat { sender: id("c") });
        host.on_datagram(addr(C_PORT), &beat, start + Duration::from_secs(10));
        assert!(host.tick(start + Duration::from_secs(10)).is_empty());

        let actions = host.tick(start + Duration::from_secs(13));
        assert!(!host.registry().contains(&id("a")));
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (to, Message::List { entries }) => {
                assert_eq!(*to, addr(C_PORT));
                assert!(entries.iter().all(|e| e.identity != id("a")));
                assert_eq!(entries.len(), 2);
            }
            other => panic!("expected roster, got {other:?}"),
        }
        assert!(host_events.notices().contains(&"A timed out and left.".to_owned()));
    }

    #[test]
    fn host_relays_to_everyone_but_sender_and_logs_chat() {
        let now = Instant::now();
        let (mut host, host_events) = hosting(now);
        join(&mut host, "a", A_PORT, "", now);
        join(&mut host, "c", C_PORT, "", now);

        let text = encode_frame(&Message::Text {
            sender: id("a"),
            nickname: "A".into(),
            text: "hello".into(),
        });
        let out = host.on_datagram(addr(A_PORT), &text, now);
        assert_eq!(out, vec![OutboundAction::Send(addr(C_PORT), text.clone())]);
        assert!(host_events.events().contains(&HubEvent::Chat {
            author: id("a"),
            nickname: "A".into(),
            text: "hello".into(),
        }));

        let (_, d_events, replies) = join(&mut host, "d", 41_004, "", now);
        assert!(sends(&replies).contains(&(
            addr(41_004),
            Message::History {
                author: id("a"),
                nickname: "A".into(),
                text: "hello".into(),
            }
        )));
        assert!(d_events.events().contains(&HubEvent::Chat {
            author: id("a"),
            nickname: "A".into(),
            text: "hello".into(),
        }));
    }

    #[test]
    fn host_drops_unregistered_and_malformed_datagrams() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        let stranger = encode_frame(&Message::Text {
            sender: id("zz"),
            nickname: "Z".into(),
            text: "spam".into(),
        });
        assert!(host.on_datagram(addr(9), &stranger, now).is_empty());
        assert!(host.on_datagram(addr(9), b"garbage", now).is_empty());
        assert!(host.on_datagram(addr(9), b"WHAT|zz|x", now).is_empty());
        assert_eq!(host.registry().len(), 1);
    }

    #[test]
    fn stream_state_and_profile_reach_the_roster() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        let (mut peer_a, _, _) = join(&mut host, "a", A_PORT, "", now);

        let start = peer_a.set_streaming(true).unwrap();
        let roster = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &start, now);
        assert!(host.registry().get(&id("a")).unwrap().live);
        deliver(&mut peer_a, addr(HOST_PORT), addr(A_PORT), &roster, now);
        assert!(peer_a.roster().iter().any(|e| e.identity == id("a") && e.live));

        let profile = peer_a.update_profile("Alice", "hi", "QUJD").unwrap();
        let out = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &profile, now);
        assert_eq!(host.registry().get(&id("a")).unwrap().nickname, "Alice");
        deliver(&mut peer_a, addr(HOST_PORT), addr(A_PORT), &out, now);
        let me = peer_a.roster().iter().find(|e| e.identity == id("a")).unwrap();
        assert_eq!(me.avatar, "QUJD");
        assert_eq!(me.bio, "hi");
    }

    #[test]
    fn secondary_promotes_once_and_other_peers_rejoin_it() {
        let start = Instant::now();
        let (mut host, _) = hosting(start);
        let (mut peer_a, a_events, _) = join(&mut host, "a", A_PORT, "", start);
        let (mut peer_c, c_events, _) = join(&mut host, "c", C_PORT, "", start);
        designate(&mut host, &mut peer_a, A_PORT, &mut [(&mut peer_c, C_PORT)], start);
        assert!(a_events.events().contains(&HubEvent::HostPrompt(id("host"))));
        assert_eq!(
            peer_c.secondary(),
            Some(&SecondaryHost {
                identity: id("a"),
                addr: Some(addr(A_PORT)),
            })
        );

        // The host goes silent.
        let mut a_out = Vec::new();
        let mut c_out = Vec::new();
        for i in 1..=12u64 {
            let t = start + Duration::from_secs(2 * i);
            a_out.extend(peer_a.tick(t));
            c_out.extend(peer_c.tick(t));
        }

        assert_eq!(peer_a.role(), SessionRole::PromotedHost);
        let promotions = a_events
            .events()
            .iter()
            .filter(|e| **e == HubEvent::RoleChanged(SessionRole::PromotedHost))
            .count();
        assert_eq!(promotions, 1);
        assert!(!sends(&a_out)
            .iter()
            .any(|(_, m)| matches!(m, Message::Join { .. })));

        let joins: Vec<_> = sends(&c_out)
            .into_iter()
            .filter(|(_, m)| matches!(m, Message::Join { .. }))
            .collect();
        // Repeated each tick until ACCEPT arrives.
        assert!(!joins.is_empty());
        assert!(joins.iter().all(|(to, _)| *to == addr(A_PORT)));
        assert_eq!(peer_c.target(), Some(addr(A_PORT)));
        assert!(c_events
            .notices()
            .contains(&"Host timed out! Migrating to Secondary Host...".to_owned()));

        let t = start + Duration::from_secs(26);
        let replies = deliver(&mut peer_a, addr(C_PORT), addr(A_PORT), &c_out, t);
        assert!(matches!(
            &sends(&replies)[0],
            (_, Message::Accept { room_code, .. }) if room_code == "1234567890"
        ));
        deliver(&mut peer_c, addr(A_PORT), addr(C_PORT), &replies, t);
        assert_eq!(peer_c.room().unwrap().code, "1234567890");
        assert!(peer_a.registry().contains(&id("c")));
        assert_eq!(peer_a.registry().len(), 2);
    }

    #[test]
    fn no_designation_leaves_peer_stranded_once() {
        let start = Instant::now();
        let (mut host, _) = hosting(start);
        let (mut peer_c, c_events, _) = join(&mut host, "c", C_PORT, "", start);
        let mut out = Vec::new();
        for i in 1..=20u64 {
            out.extend(peer_c.tick(start + Duration::from_secs(2 * i)));
        }
        assert_eq!(peer_c.role(), SessionRole::Joined);
        assert_eq!(peer_c.target(), Some(addr(HOST_PORT)));
        let stranded = c_events
            .notices()
            .iter()
            .filter(|n| n.starts_with("Host timed out."))
            .count();
        assert_eq!(stranded, 1);
        // Still probing the old host.
        assert!(sends(&out)
            .iter()
            .all(|(to, m)| *to == addr(HOST_PORT) && matches!(m, Message::Beat { .. })));
    }

    #[test]
    fn migrate_hands_room_over_and_stale_leave_is_ignored() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        let (mut peer_a, _, _) = join(&mut host, "a", A_PORT, "", now);
        let (mut peer_c, _, _) = join(&mut host, "c", C_PORT, "", now);
        assert_eq!(host.migrate(), Err(SessionError::NoSecondary));
        designate(&mut host, &mut peer_a, A_PORT, &mut [(&mut peer_c, C_PORT)], now);

        let directive = host.migrate().unwrap();
        deliver(&mut peer_a, addr(HOST_PORT), addr(A_PORT), &directive, now);
        assert_eq!(peer_a.role(), SessionRole::PromotedHost);
        let rejoin = deliver(&mut peer_c, addr(HOST_PORT), addr(C_PORT), &directive, now);
        assert_eq!(peer_c.target(), Some(addr(A_PORT)));
        assert!(matches!(&sends(&rejoin)[0], (to, Message::Join { .. }) if *to == addr(A_PORT)));

        let farewell = host.shutdown();
        assert!(farewell.contains(&OutboundAction::Closed));
        assert_eq!(host.role(), SessionRole::Unhosted);
        deliver(&mut peer_c, addr(HOST_PORT), addr(C_PORT), &farewell, now);
        assert_eq!(peer_c.role(), SessionRole::Joined);
        assert!(deliver(&mut peer_a, addr(HOST_PORT), addr(A_PORT), &farewell, now).is_empty());
        assert_eq!(peer_a.role(), SessionRole::PromotedHost);
    }

    #[test]
    fn leave_from_host_closes_peer() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        let (mut peer_a, a_events, _) = join(&mut host, "a", A_PORT, "", now);
        let farewell = host.shutdown();
        let out = deliver(&mut peer_a, addr(HOST_PORT), addr(A_PORT), &farewell, now);
        assert_eq!(out, vec![OutboundAction::Closed]);
        assert_eq!(peer_a.role(), SessionRole::Unhosted);
        assert!(a_events
            .events()
            .contains(&HubEvent::Closed("Host closed the room.".into())));
    }

    #[test]
    fn file_is_relayed_and_reassembled_everywhere() {
        let now = Instant::now();
        let (mut host, host_events) = hosting(now);
        let (mut peer_a, _, _) = join(&mut host, "a", A_PORT, "", now);
        let (mut peer_c, c_events, _) = join(&mut host, "c", C_PORT, "", now);

        let data: Vec<u8> = (0..MAX_CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let chunks = peer_a.send_file("big.bin", &data).unwrap();
        assert_eq!(chunks.len(), 3);
        let relayed = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &chunks, now);
        assert!(relayed
            .iter()
            .all(|a| matches!(a, OutboundAction::Send(to, _) if *to == addr(C_PORT))));
        deliver(&mut peer_c, addr(HOST_PORT), addr(C_PORT), &relayed, now);

        let expected = HubEvent::FileReceived {
            sender: id("a"),
            nickname: "A".into(),
            filename: "big.bin".into(),
            data: data.clone(),
        };
        assert!(host_events.events().contains(&expected));
        assert!(c_events.events().contains(&expected));
    }

    #[test]
    fn file_limit_propagates_and_blocks_large_files() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        let (mut peer_a, a_events, _) = join(&mut host, "a", A_PORT, "", now);
        let limit = host.set_file_limit(1).unwrap();
        deliver(&mut peer_a, addr(HOST_PORT), addr(A_PORT), &limit, now);
        assert_eq!(peer_a.file_limit_mb(), 1);
        assert!(a_events
            .notices()
            .contains(&"Host changed file limit to 1MB.".to_owned()));

        let big = vec![0u8; 1024 * 1024 + 1];
        assert_eq!(
            peer_a.send_file("big.bin", &big),
            Err(SessionError::FileTooLarge {
                size: big.len() as u64,
                limit: 1024 * 1024,
            })
        );
        assert_eq!(peer_a.set_file_limit(5), Err(SessionError::NotHost));
    }

    #[test]
    fn only_the_watched_stream_is_rendered() {
        let now = Instant::now();
        let (mut host, host_events) = hosting(now);
        let (mut peer_a, _, _) = join(&mut host, "a", A_PORT, "", now);
        let (mut peer_c, c_events, _) = join(&mut host, "c", C_PORT, "", now);
        peer_c.watch(Some(id("a")));

        let jpeg: Vec<u8> = (0..MAX_CHUNK_SIZE + 10).map(|i| i as u8).collect();
        let frame = peer_a.send_video_frame(&jpeg).unwrap();
        assert_eq!(frame.len(), 2);
        let relayed = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &frame, now);
        deliver(&mut peer_c, addr(HOST_PORT), addr(C_PORT), &relayed, now);

        let rendered: Vec<_> = c_events
            .events()
            .into_iter()
            .filter(|e| matches!(e, HubEvent::Frame { .. }))
            .collect();
        assert_eq!(
            rendered,
            vec![HubEvent::Frame {
                streamer: id("a"),
                jpeg,
            }]
        );
        assert!(!host_events
            .events()
            .iter()
            .any(|e| matches!(e, HubEvent::Frame { .. })));
    }

    #[test]
    fn audio_is_relayed_and_marks_speaker() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        let (mut peer_a, _, _) = join(&mut host, "a", A_PORT, "", now);
        let (mut peer_c, c_events, _) = join(&mut host, "c", C_PORT, "", now);
        let audio = peer_a.send_audio(&[1, 2, 3, b'|', 4]).unwrap();
        let relayed = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &audio, now);
        deliver(&mut peer_c, addr(HOST_PORT), addr(C_PORT), &relayed, now);
        let events = c_events.events();
        assert!(events.contains(&HubEvent::Audio {
            sender: id("a"),
            data: vec![1, 2, 3, b'|', 4],
        }));
        assert!(events.contains(&HubEvent::Speaking(id("a"))));
    }

    #[test]
    fn starting_twice_is_an_error() {
        let now = Instant::now();
        let (mut host, _) = hosting(now);
        assert_eq!(
            host.start_peer(addr(1), "", 2),
            Err(SessionError::AlreadyActive(SessionRole::Hosting))
        );
        let (mut idle, _) = node("idle");
        assert_eq!(idle.send_text("hi"), Err(SessionError::NotActive));
        assert_eq!(idle.accept_secondary(), Err(SessionError::NotPeer));
    }

    #[test]
    fn join_repeats_until_accepted() {
        let start = Instant::now();
        let (mut host, _) = hosting(start);
        let (mut peer, _) = node("a");
        let hello = peer.start_peer(addr(HOST_PORT), "", A_PORT).unwrap();

        // First JOIN lost; the next tick carries another one.
        let retry = peer.tick(start + Duration::from_secs(2));
        let kinds: Vec<_> = sends(&retry).into_iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, vec!["BEAT", "JOIN"]);
        assert_eq!(sends(&retry)[1].1, sends(&hello)[0].1);

        let replies = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &retry, start);
        deliver(&mut peer, addr(HOST_PORT), addr(A_PORT), &replies, start);
        assert!(peer.room().is_some());
        let after = peer.tick(start + Duration::from_secs(4));
        assert!(sends(&after)
            .iter()
            .all(|(_, m)| matches!(m, Message::Beat { .. })));
    }

    #[test]
    fn host_answers_beat_so_idle_rooms_stay_up() {
        let start = Instant::now();
        let (mut host, _) = hosting(start);
        let (mut peer, events, _) = join(&mut host, "a", A_PORT, "", start);
        for i in 1..=20u64 {
            let t = start + Duration::from_secs(2 * i);
            let beat = peer.tick(t);
            let echo = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &beat, t);
            assert!(matches!(
                &sends(&echo)[..],
                [(to, Message::Beat { sender })] if *to == addr(A_PORT) && *sender == id("host")
            ));
            deliver(&mut peer, addr(HOST_PORT), addr(A_PORT), &echo, t);
        }
        assert_eq!(peer.role(), SessionRole::Joined);
        assert!(!events.notices().iter().any(|n| n.starts_with("Host timed out")));
    }

    #[test]
    fn repeated_join_gets_accept_without_replay() {
        let now = Instant::now();
        let (mut host, host_events) = hosting(now);
        host.send_text("welcome").unwrap();
        let (mut peer, peer_events) = node("a");
        let hello = peer.start_peer(addr(HOST_PORT), "", A_PORT).unwrap();

        let first = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &hello, now);
        let second = deliver(&mut host, addr(A_PORT), addr(HOST_PORT), &hello, now);
        assert!(sends(&first)
            .iter()
            .any(|(_, m)| matches!(m, Message::History { .. })));
        assert!(matches!(
            &sends(&second)[..],
            [(to, Message::Accept { .. })] if *to == addr(A_PORT)
        ));
        let joined = host_events
            .notices()
            .iter()
            .filter(|n| *n == "A joined.")
            .count();
        assert_eq!(joined, 1);

        deliver(&mut peer, addr(HOST_PORT), addr(A_PORT), &first, now);
        deliver(&mut peer, addr(HOST_PORT), addr(A_PORT), &second, now);
        let accepted = peer_events
            .events()
            .iter()
            .filter(|e| matches!(e, HubEvent::RoomAccepted { .. }))
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn own_chat_is_echoed_locally() {
        let now = Instant::now();
        let (mut host, host_events) = hosting(now);
        let (mut peer, peer_events, _) = join(&mut host, "a", A_PORT, "", now);

        peer.send_text("hi all").unwrap();
        assert!(peer_events.events().contains(&HubEvent::Chat {
            author: id("a"),
            nickname: "A".into(),
            text: "hi all".into(),
        }));

        host.send_text("welcome").unwrap();
        assert!(host_events.events().contains(&HubEvent::Chat {
            author: id("host"),
            nickname: "HOST".into(),
            text: "welcome".into(),
        }));
    }

    proptest! {
        #[test]
        fn join_with_matching_password_is_always_accepted(
            name in "p[a-z0-9]{0,15}",
            password in "[a-zA-Z0-9]{1,12}",
            locked in any::<bool>(),
        ) {
            let now = Instant::now();
            let room_password = if locked { password.as_str() } else { "" };
            let (mut host, _) = node("host");
            host.start_host("lounge", room_password, Some("1234567890".into()), HOST_PORT, now)
                .unwrap();

            let (peer, _, replies) = join(&mut host, &name, A_PORT, room_password, now);
            let first = sends(&replies).into_iter().next();
            let accepted = matches!(
                first,
                Some((to, Message::Accept { .. })) if to == addr(A_PORT)
            );
            prop_assert!(accepted);
            prop_assert!(host.registry().contains(&id(&name)));
            prop_assert!(peer.room().is_some());
        }
    }
}

//! Session role machine: hosting, joined, promoted after failover or migration.

use std::fmt;
use std::net::SocketAddr;

use crate::identity::ParticipantId;

/// What this instance currently is in its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionRole {
    #[default]
    Unhosted,
    Hosting,
    Joined,
    /// Took over the room after host loss or a migrate directive. Behaves as `Hosting`.
    PromotedHost,
}

impl SessionRole {
    pub fn is_host(self) -> bool {
        matches!(self, SessionRole::Hosting | SessionRole::PromotedHost)
    }

    pub fn is_active(self) -> bool {
        self != SessionRole::Unhosted
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionRole::Unhosted => "unhosted",
            SessionRole::Hosting => "host",
            SessionRole::Joined => "peer",
            SessionRole::PromotedHost => "promoted host",
        };
        f.write_str(s)
    }
}

/// Room session state. Immutable once created except for the file limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    /// Ten decimal digits.
    pub code: String,
    pub name: String,
    /// Empty for an open room.
    pub password: String,
    pub file_limit_mb: u64,
}

impl RoomInfo {
    /// Whether a JOIN password admits the peer. Exact match; an open room expects an empty one.
    pub fn admits(&self, password: &str) -> bool {
        self.password == password
    }

    pub fn file_limit_bytes(&self) -> u64 {
        self.file_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// The elected failover target, with the address the host observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryHost {
    pub identity: ParticipantId,
    pub addr: Option<SocketAddr>,
}

/// What a peer does once its host has gone silent for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    /// This instance is the designee: take over without re-joining.
    Promote,
    /// Point at the designee and send JOIN again.
    Redirect(SocketAddr),
    /// No usable designation; stay disconnected until the host is heard again.
    Stranded,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoleError {
    #[error("session already active as {0}")]
    AlreadyActive(SessionRole),
    #[error("operation needs a joined peer, this instance is {0}")]
    NotJoined(SessionRole),
    #[error("no room accepted yet")]
    NoRoom,
}

#[derive(Debug, Default)]
pub struct RoleMachine {
    role: SessionRole,
    room: Option<RoomInfo>,
    /// Host address while joined.
    target: Option<SocketAddr>,
    join_password: String,
    secondary: Option<SecondaryHost>,
}

impl RoleMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn room(&self) -> Option<&RoomInfo> {
        self.room.as_ref()
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    pub fn join_password(&self) -> &str {
        &self.join_password
    }

    pub fn secondary(&self) -> Option<&SecondaryHost> {
        self.secondary.as_ref()
    }

    /// `Unhosted → Hosting`.
    pub fn start_hosting(&mut self, room: RoomInfo) -> Result<(), RoleError> {
        if self.role.is_active() {
            return Err(RoleError::AlreadyActive(self.role));
        }
        self.role = SessionRole::Hosting;
        self.room = Some(room);
        self.target = None;
        self.secondary = None;
        Ok(())
    }

    /// `Unhosted → Joined`, pointed at `target`.
    pub fn start_joined(&mut self, target: SocketAddr, password: &str) -> Result<(), RoleError> {
        if self.role.is_active() {
            return Err(RoleError::AlreadyActive(self.role));
        }
        self.role = SessionRole::Joined;
        self.target = Some(target);
        self.join_password = password.to_owned();
        self.room = None;
        self.secondary = None;
        Ok(())
    }

    /// Record the room a host admitted us to. The password is the one we joined with.
    pub fn accept_room(&mut self, code: String, name: String, file_limit_mb: u64) -> Result<&RoomInfo, RoleError> {
        if self.role != SessionRole::Joined {
            return Err(RoleError::NotJoined(self.role));
        }
        let room = self.room.insert(RoomInfo {
            code,
            name,
            password: self.join_password.clone(),
            file_limit_mb,
        });
        Ok(&*room)
    }

    pub fn set_file_limit(&mut self, mb: u64) {
        if let Some(room) = self.room.as_mut() {
            room.file_limit_mb = mb;
        }
    }

    /// Replace the secondary-host designation.
    pub fn designate_secondary(&mut self, secondary: SecondaryHost) {
        self.secondary = Some(secondary);
    }

    pub fn is_secondary(&self, me: &ParticipantId) -> bool {
        self.secondary.as_ref().is_some_and(|s| s.identity == *me)
    }

    /// `Joined → PromotedHost`. Keeps the room learned from ACCEPT; the designation is spent.
    pub fn promote(&mut self) -> Result<&RoomInfo, RoleError> {
        if self.role != SessionRole::Joined {
            return Err(RoleError::NotJoined(self.role));
        }
        let Some(room) = self.room.as_ref() else {
            return Err(RoleError::NoRoom);
        };
        self.role = SessionRole::PromotedHost;
        self.target = None;
        self.secondary = None;
        Ok(room)
    }

    /// Point a joined peer at a new host.
    pub fn redirect(&mut self, target: SocketAddr) -> Result<(), RoleError> {
        if self.role != SessionRole::Joined {
            return Err(RoleError::NotJoined(self.role));
        }
        self.target = Some(target);
        Ok(())
    }

    /// Decide the failover path once the host is declared lost.
    pub fn on_host_lost(&self, me: &ParticipantId) -> FailoverDecision {
        if self.role != SessionRole::Joined {
            return FailoverDecision::Stranded;
        }
        match &self.secondary {
            Some(s) if s.identity == *me => {
                if self.room.is_some() {
                    FailoverDecision::Promote
                } else {
                    FailoverDecision::Stranded
                }
            }
            // A designee living at the lost address is the lost host.
            Some(SecondaryHost { addr: Some(addr), .. }) if Some(*addr) != self.target => {
                FailoverDecision::Redirect(*addr)
            }
            _ => FailoverDecision::Stranded,
        }
    }

    /// Back to `Unhosted`; drops room, target and designation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

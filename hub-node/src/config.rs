//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use hub_core::{ParticipantId, Profile};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Node configuration. File: ~/.config/hub/config.toml or /etc/hub/config.toml.
/// Env overrides: HUB_NICKNAME, HUB_DOWNLOADS_DIR, HUB_HISTORY_DIR, HUB_HEARTBEAT_SECS,
/// HUB_TIMEOUT_SECS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    /// Stable participant identity. Generated and written back on first run.
    #[serde(default)]
    pub identity: String,
    #[serde(default = "default_nickname")]
    pub nickname: String,
    #[serde(default)]
    pub bio: String,
    /// Image sent as the avatar (base64-encoded on load).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Where received files land (default ./hub_downloads).
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    /// One JSON chat log per room code (default ./logs).
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    /// Heartbeat period in seconds (default 2).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Peer timeout in seconds (default 12).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// File limit for rooms this node hosts, in MB (default 10).
    #[serde(default = "default_file_limit_mb")]
    pub file_limit_mb: u64,
    /// Frames per second while streaming (default 10).
    #[serde(default = "default_stream_fps")]
    pub stream_fps: u32,
}

fn default_nickname() -> String {
    "NewUser".to_owned()
}
fn default_downloads_dir() -> PathBuf {
    PathBuf::from("hub_downloads")
}
fn default_history_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_heartbeat_secs() -> u64 {
    2
}
fn default_timeout_secs() -> u64 {
    12
}
fn default_file_limit_mb() -> u64 {
    hub_core::config::DEFAULT_FILE_LIMIT_MB
}
fn default_stream_fps() -> u32 {
    10
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            nickname: default_nickname(),
            bio: String::new(),
            avatar_path: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            history_dir: default_history_dir(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            timeout_secs: default_timeout_secs(),
            file_limit_mb: default_file_limit_mb(),
            stream_fps: default_stream_fps(),
        }
    }
}

impl Config {
    /// Session timings for the core.
    pub fn core_config(&self) -> hub_core::Config {
        hub_core::Config {
            heartbeat_interval: Duration::from_secs(self.timing.heartbeat_secs.max(1)),
            timeout_limit: Duration::from_secs(self.timing.timeout_secs.max(1)),
            file_limit_mb: self.timing.file_limit_mb,
            ..hub_core::Config::default()
        }
    }

    /// Profile presented to the room. Reads and encodes the avatar image, if any.
    pub fn profile(&self) -> Result<Profile> {
        let avatar = match &self.profile.avatar_path {
            Some(path) => load_avatar(path)?,
            None => String::new(),
        };
        Ok(Profile {
            identity: ParticipantId::new(self.profile.identity.clone()),
            nickname: self.profile.nickname.clone(),
            bio: self.profile.bio.clone(),
            avatar,
        })
    }
}

/// Load config: default, then the config file (explicit or the first one found), then env vars.
/// Returns the path identity changes should be written back to.
pub fn load(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    let (mut c, path) = match explicit {
        Some(p) => (read_file(p)?, Some(p.to_path_buf())),
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => (read_file(&p)?, Some(p)),
            None => (Config::default(), user_config_path()),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok((c, path))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HUB_NICKNAME") {
        if !s.is_empty() {
            c.profile.nickname = s;
        }
    }
    if let Some(s) = var("HUB_DOWNLOADS_DIR") {
        c.storage.downloads_dir = PathBuf::from(s);
    }
    if let Some(s) = var("HUB_HISTORY_DIR") {
        c.storage.history_dir = PathBuf::from(s);
    }
    if let Some(s) = var("HUB_HEARTBEAT_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.timing.heartbeat_secs = n;
        }
    }
    if let Some(s) = var("HUB_TIMEOUT_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.timing.timeout_secs = n;
        }
    }
}

/// Give the config an identity if it has none, and persist it so it survives restarts.
/// A failed write is logged; the generated identity still holds for this run.
pub fn ensure_identity(c: &mut Config, path: Option<&Path>) -> Result<()> {
    if !c.profile.identity.is_empty() {
        return Ok(());
    }
    c.profile.identity = ParticipantId::generate().to_string();
    info!(identity = %c.profile.identity, "generated participant identity");
    let Some(path) = path else {
        return Ok(());
    };
    if let Err(e) = save(c, path) {
        warn!(path = %path.display(), error = %e, "could not persist identity");
    }
    Ok(())
}

pub fn save(c: &Config, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let text = toml::to_string_pretty(c).context("serializing config")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn load_avatar(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading avatar {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn user_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/hub/config.toml"))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = user_config_path() {
        out.push(p);
    }
    out.push(PathBuf::from("/etc/hub/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

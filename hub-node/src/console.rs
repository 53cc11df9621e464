//! Terminal front end: slash commands in, session events out.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hub_core::{HubEvent, ParticipantId, RosterEntry, SessionError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::{SharedMedia, VideoSender};
use crate::session::{Session, FILE_PACING};

const HELP: &str = "\
commands:
  /file <path>        share a file
  /stream             start or stop streaming
  /watch <id>         watch a participant's stream
  /unwatch            stop watching
  /nick <name>        change nickname
  /who                list participants
  /ban <id>           (host) remove and ban a participant
  /unban <id>         (host) lift a ban
  /limit <mb>         (host) set the room file limit
  /secondary <id>     (host) ask a participant to be secondary host
  /migrate            (host) hand the room to the secondary host and leave
  /accept             agree to be secondary host
  /quit               leave the room
anything else is sent as chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    File(PathBuf),
    Stream,
    Watch(ParticipantId),
    Unwatch,
    Nick(String),
    Who,
    Ban(ParticipantId),
    Unban(ParticipantId),
    Limit(u64),
    Secondary(ParticipantId),
    Migrate,
    Accept,
    Help,
    Quit,
}

/// Parse one input line. Blank lines are `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_owned())));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let need = |what: &str| required(name, arg, what);
    let cmd = match name {
        "file" => Command::File(PathBuf::from(need("a path")?)),
        "stream" => Command::Stream,
        "watch" => Command::Watch(ParticipantId::new(need("a participant id")?)),
        "unwatch" => Command::Unwatch,
        "nick" => Command::Nick(need("a name")?.to_owned()),
        "who" => Command::Who,
        "ban" => Command::Ban(ParticipantId::new(need("a participant id")?)),
        "unban" => Command::Unban(ParticipantId::new(need("a participant id")?)),
        "limit" => {
            let mb = need("a size in MB")?
                .parse::<u64>()
                .with_context(|| format!("bad size {arg:?}"))?;
            Command::Limit(mb)
        }
        "secondary" => Command::Secondary(ParticipantId::new(need("a participant id")?)),
        "migrate" => Command::Migrate,
        "accept" => Command::Accept,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command /{other} (try /help)"),
    };
    Ok(Some(cmd))
}

fn required<'a>(name: &str, arg: &'a str, what: &str) -> Result<&'a str> {
    if arg.is_empty() {
        bail!("/{name} needs {what}");
    }
    Ok(arg)
}

/// Store a received file under `dir`, keeping only the last path component of the sender's name.
pub async fn save_download(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf> {
    let name = Path::new(filename)
        .file_name()
        .filter(|n| !n.is_empty())
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download.bin".into());
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(name);
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn format_roster(entries: &[RosterEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let live = if e.live { " [live]" } else { "" };
            format!("  {} ({}){live}", e.nickname, e.identity)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Console {
    session: Session,
    media: SharedMedia,
    video: VideoSender,
    downloads: PathBuf,
    stream_fps: u32,
}

impl Console {
    pub fn new(session: Session, media: SharedMedia, downloads: PathBuf, stream_fps: u32) -> Self {
        Self {
            session,
            media,
            video: VideoSender::default(),
            downloads,
            stream_fps,
        }
    }

    /// Read stdin and render events until the session ends or the user quits.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<HubEvent>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        loop {
            tokio::select! {
                line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                    Some(line) => {
                        if !self.execute(&line).await {
                            break;
                        }
                    }
                    None => {
                        // Detached from a terminal: keep serving until a signal arrives.
                        debug!("stdin closed");
                        stdin_open = false;
                    }
                },
                Some(event) = events.recv() => {
                    if !self.render(event).await {
                        break;
                    }
                }
                _ = self.session.closed() => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            self.render(event).await;
        }
        Ok(())
    }

    /// Returns false once the user asked to leave.
    async fn execute(&self, line: &str) -> bool {
        let cmd = match parse_command(line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return true,
            Err(e) => {
                println!("! {e:#}");
                return true;
            }
        };
        let session = &self.session;
        let result: Result<(), SessionError> = match cmd {
            Command::Say(text) => session.apply(|c| c.send_text(&text)).await,
            Command::File(path) => return self.share_file(&path).await,
            Command::Stream => self.toggle_stream().await,
            Command::Watch(id) => {
                session.with_core(|c| c.watch(Some(id))).await;
                Ok(())
            }
            Command::Unwatch => {
                session.with_core(|c| c.watch(None)).await;
                Ok(())
            }
            Command::Nick(name) => {
                session
                    .apply(|c| {
                        let p = c.profile().clone();
                        c.update_profile(&name, &p.bio, &p.avatar)
                    })
                    .await
            }
            Command::Who => {
                let roster = session.with_core(|c| c.roster().to_vec()).await;
                println!("{}", format_roster(&roster));
                Ok(())
            }
            Command::Ban(id) => session.apply(|c| c.ban(&id)).await,
            Command::Unban(id) => session.apply(|c| c.unban(&id).map(|()| Vec::new())).await,
            Command::Limit(mb) => session.apply(|c| c.set_file_limit(mb)).await,
            Command::Secondary(id) => session.apply(|c| c.request_secondary(&id)).await,
            Command::Accept => session.apply(|c| c.accept_secondary()).await,
            Command::Migrate => session.migrate().await,
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => {
                session.shutdown().await;
                return false;
            }
        };
        if let Err(e) = result {
            println!("! {e}");
        }
        true
    }

    async fn share_file(&self, path: &Path) -> bool {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                println!("! cannot read {}: {e}", path.display());
                return true;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        if let Err(e) = self
            .session
            .apply_paced(|c| c.send_file(&name, &data), FILE_PACING)
            .await
        {
            println!("! {e}");
        }
        true
    }

    async fn toggle_stream(&self) -> Result<(), SessionError> {
        let on = !self.session.with_core(|c| c.is_streaming()).await;
        self.session.apply(|c| c.set_streaming(on)).await?;
        if on {
            self.video
                .start(self.session.clone(), self.media.clone(), self.stream_fps)
                .await;
            println!("* streaming started");
        } else {
            self.video.stop().await;
            println!("* streaming stopped");
        }
        Ok(())
    }

    /// Returns false when the session is over.
    async fn render(&self, event: HubEvent) -> bool {
        match event {
            HubEvent::Chat { nickname, text, .. } => println!("{nickname}: {text}"),
            HubEvent::Notice(text) => println!("* {text}"),
            HubEvent::Roster(entries) => {
                debug!(participants = entries.len(), "roster updated");
            }
            HubEvent::Frame { streamer, jpeg } => {
                let name = format!("live_{}.jpg", streamer.short());
                if let Err(e) = save_download(&self.downloads, &name, &jpeg).await {
                    debug!(error = %e, "frame not written");
                }
            }
            HubEvent::Audio { sender, data } => {
                self.media.lock().await.play_audio(&sender, &data);
            }
            HubEvent::Speaking(id) => debug!(speaker = %id, "speaking"),
            HubEvent::RoomAccepted { code, name } => {
                println!("* Room '{name}' (code {code}). Type /help for commands.");
            }
            HubEvent::HostPrompt(_) => {
                println!("* The host asks you to be the Secondary Host. Type /accept to agree.");
            }
            HubEvent::FileReceived {
                nickname,
                filename,
                data,
                ..
            } => match save_download(&self.downloads, &filename, &data).await {
                Ok(path) => println!("* {nickname} shared '{filename}' -> {}", path.display()),
                Err(e) => warn!(filename = %filename, error = %e, "could not save download"),
            },
            HubEvent::RoleChanged(role) => info!(%role, "role changed"),
            HubEvent::Closed(reason) => {
                info!(%reason, "session ended");
                return false;
            }
        }
        true
    }
}

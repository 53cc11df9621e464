// hub-node: host or join a peer-hosted chat/voice/video room over UDP.

mod config;
mod console;
mod history;
mod media;
mod session;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hub_core::HubCore;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::console::Console;
use crate::history::JsonHistory;
use crate::media::NullMedia;
use crate::session::{ChannelEvents, Session};

#[derive(Parser)]
#[command(name = "hub-node", version, about = "Peer-hosted chat, voice and video rooms")]
struct Cli {
    /// Config file (default: ~/.config/hub/config.toml, then /etc/hub/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a room on this machine
    Host {
        /// Room name shown to peers
        #[arg(long)]
        name: String,

        #[arg(long, default_value_t = 5000)]
        port: u16,

        #[arg(long, default_value = "")]
        password: String,

        /// Reuse a previous room code (and its chat log)
        #[arg(long)]
        room_code: Option<String>,
    },
    /// Join a room hosted elsewhere
    Join {
        /// Host IP address
        #[arg(long)]
        address: IpAddr,

        #[arg(long, default_value_t = 5000)]
        port: u16,

        #[arg(long, default_value = "")]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (mut cfg, cfg_path) = config::load(cli.config.as_deref())?;
    config::ensure_identity(&mut cfg, cfg_path.as_deref())?;
    let profile = cfg.profile()?;
    info!(identity = %profile.identity, nickname = %profile.nickname, "starting");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let core = HubCore::new(
        cfg.core_config(),
        profile,
        Box::new(ChannelEvents::new(events_tx)),
        Box::new(JsonHistory::new(cfg.storage.history_dir.clone())),
    );

    let session = match cli.command {
        Command::Host {
            name,
            port,
            password,
            room_code,
        } => Session::host(core, &name, port, &password, room_code).await?,
        Command::Join {
            address,
            port,
            password,
        } => Session::join(core, SocketAddr::new(address, port), &password).await?,
    };

    info!(addr = %session.local_addr()?, "session started");

    let media = media::shared(NullMedia);
    media::spawn_audio_sender(session.clone(), media.clone());
    let console = Console::new(
        session.clone(),
        media,
        cfg.storage.downloads_dir.clone(),
        cfg.timing.stream_fps,
    );

    tokio::select! {
        res = console.run(events_rx) => res?,
        res = shutdown_signal() => {
            res?;
            info!("signal received, leaving room");
            session.shutdown().await;
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "hub_node=debug,hub_core=debug"
    } else {
        "hub_node=info,hub_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

//! UDP session runtime: one socket, a listener task and a heartbeat task around a shared
//! `HubCore`. Teardown flips a watch flag that every task checks at its next wake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hub_core::{HubCore, HubEvent, OutboundAction, SessionError, SessionEvents};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Gap between consecutive FILE datagrams.
pub const FILE_PACING: Duration = Duration::from_millis(10);

/// Time the MIGRATE broadcast gets before the old host leaves.
pub const MIGRATE_GRACE: Duration = Duration::from_millis(300);

const RECV_BUFFER: usize = 65_535;

/// Forwards core events to the front end over a channel.
pub struct ChannelEvents(mpsc::UnboundedSender<HubEvent>);

impl ChannelEvents {
    pub fn new(tx: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self(tx)
    }
}

impl SessionEvents for ChannelEvents {
    fn emit(&mut self, event: HubEvent) {
        // Receiver gone means the front end is shutting down.
        let _ = self.0.send(event);
    }
}

/// Handle to a running session. Cheap to clone; all clones drive the same core and socket.
#[derive(Clone)]
pub struct Session {
    core: Arc<Mutex<HubCore>>,
    socket: Arc<UdpSocket>,
    stop: Arc<watch::Sender<bool>>,
}

impl Session {
    /// Bind `port` on all interfaces and open a room there.
    pub async fn host(
        mut core: HubCore,
        name: &str,
        port: u16,
        password: &str,
        room_code: Option<String>,
    ) -> Result<Session> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding UDP port {port}"))?;
        let local_port = socket.local_addr()?.port();
        let actions = core.start_host(name, password, room_code, local_port, Instant::now())?;
        Ok(Self::launch(core, socket, actions).await)
    }

    /// Bind an ephemeral port and send JOIN to `target`.
    pub async fn join(mut core: HubCore, target: SocketAddr, password: &str) -> Result<Session> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("binding UDP socket")?;
        let local_port = socket.local_addr()?.port();
        let actions = core.start_peer(target, password, local_port)?;
        Ok(Self::launch(core, socket, actions).await)
    }

    async fn launch(core: HubCore, socket: UdpSocket, actions: Vec<OutboundAction>) -> Session {
        let interval = core.config().heartbeat_interval;
        let (stop, _) = watch::channel(false);
        let session = Session {
            core: Arc::new(Mutex::new(core)),
            socket: Arc::new(socket),
            stop: Arc::new(stop),
        };
        tokio::spawn(listen_loop(session.clone()));
        tokio::spawn(heartbeat_loop(session.clone(), interval));
        session.perform(actions, Duration::ZERO).await;
        session
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Resolves once the session has ended, locally or remotely.
    pub async fn closed(&self) {
        let mut rx = self.stop.subscribe();
        // The sender lives as long as `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        *self.stop.borrow()
    }

    /// Run a core operation and send what it produced.
    pub async fn apply<F>(&self, op: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut HubCore) -> Result<Vec<OutboundAction>, SessionError>,
    {
        self.apply_paced(op, Duration::ZERO).await
    }

    /// Like `apply`, with `pace` between datagrams. The core is not held while sending.
    pub async fn apply_paced<F>(&self, op: F, pace: Duration) -> Result<(), SessionError>
    where
        F: FnOnce(&mut HubCore) -> Result<Vec<OutboundAction>, SessionError>,
    {
        let actions = {
            let mut core = self.core.lock().await;
            op(&mut core)?
        };
        self.perform(actions, pace).await;
        Ok(())
    }

    /// Read or tweak the core without sending anything.
    pub async fn with_core<R>(&self, f: impl FnOnce(&mut HubCore) -> R) -> R {
        let mut core = self.core.lock().await;
        f(&mut core)
    }

    /// Hand the room to the secondary host, give MIGRATE time to land, then leave.
    pub async fn migrate(&self) -> Result<(), SessionError> {
        self.apply(|core| core.migrate()).await?;
        tokio::time::sleep(MIGRATE_GRACE).await;
        self.shutdown().await;
        Ok(())
    }

    /// Send LEAVE and stop every task.
    pub async fn shutdown(&self) {
        let actions = self.core.lock().await.shutdown();
        self.perform(actions, Duration::ZERO).await;
        self.stop.send_replace(true);
    }

    /// Stop the tasks without telling anyone, as if the process died.
    #[cfg(test)]
    pub(crate) fn halt(&self) {
        self.stop.send_replace(true);
    }

    async fn perform(&self, actions: Vec<OutboundAction>, pace: Duration) {
        for action in actions {
            match action {
                OutboundAction::Send(to, bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, to).await {
                        debug!(%to, error = %e, "send failed");
                    }
                    if !pace.is_zero() {
                        tokio::time::sleep(pace).await;
                    }
                }
                OutboundAction::Closed => {
                    info!("session closed");
                    self.stop.send_replace(true);
                }
            }
        }
    }
}

async fn listen_loop(session: Session) {
    let mut stop = session.stop.subscribe();
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        tokio::select! {
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            received = session.socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    let actions = session
                        .core
                        .lock()
                        .await
                        .on_datagram(from, &buf[..n], Instant::now());
                    session.perform(actions, Duration::ZERO).await;
                }
                // ICMP unreachable from a vanished peer surfaces here on some platforms.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!(error = %e, "ignoring reset");
                }
                Err(e) => {
                    warn!(error = %e, "receive failed, stopping listener");
                    break;
                }
            },
        }
    }
    debug!("listener stopped");
}

async fn heartbeat_loop(session: Session, interval: Duration) {
    let mut stop = session.stop.subscribe();
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; the session was just started.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            _ = ticker.tick() => {
                let actions = session.core.lock().await.tick(Instant::now());
                session.perform(actions, Duration::ZERO).await;
            }
        }
    }
    debug!("heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::{Config, MemoryHistory, ParticipantId, Profile, SessionRole};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn node(name: &str, config: Config) -> (HubCore, mpsc::UnboundedReceiver<HubEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let profile = Profile {
            identity: ParticipantId::new(format!("{name}-id")),
            nickname: name.to_owned(),
            bio: String::new(),
            avatar: String::new(),
        };
        let core = HubCore::new(
            config,
            profile,
            Box::new(ChannelEvents::new(tx)),
            Box::new(MemoryHistory::default()),
        );
        (core, rx)
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<HubEvent>,
        mut pred: impl FnMut(&HubEvent) -> bool,
    ) -> HubEvent {
        timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn loopback(session: &Session) -> SocketAddr {
        let port = session.local_addr().unwrap().port();
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn fast() -> Config {
        Config {
            heartbeat_interval: Duration::from_millis(20),
            timeout_limit: Duration::from_millis(100),
            host_loss_margin: Duration::from_millis(20),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn peer_joins_and_chats_over_udp() {
        let (host_core, mut host_rx) = node("host", Config::default());
        let host = Session::host(host_core, "lounge", 0, "pw", None).await.unwrap();

        let (peer_core, mut peer_rx) = node("alice", Config::default());
        let peer = Session::join(peer_core, loopback(&host), "pw").await.unwrap();

        let accepted = wait_for(&mut peer_rx, |e| matches!(e, HubEvent::RoomAccepted { .. })).await;
        let HubEvent::RoomAccepted { name, .. } = accepted else {
            unreachable!()
        };
        assert_eq!(name, "lounge");
        wait_for(&mut host_rx, |e| matches!(e, HubEvent::Notice(n) if n == "alice joined.")).await;

        peer.apply(|c| c.send_text("hello")).await.unwrap();
        wait_for(&mut host_rx, |e| {
            matches!(e, HubEvent::Chat { text, nickname, .. } if text == "hello" && nickname == "alice")
        })
        .await;

        host.shutdown().await;
        wait_for(&mut peer_rx, |e| matches!(e, HubEvent::Closed(r) if r == "Host closed the room.")).await;
        timeout(WAIT, peer.closed()).await.unwrap();
        assert!(host.is_closed());
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_and_closes_peer() {
        let (host_core, _host_rx) = node("host", Config::default());
        let host = Session::host(host_core, "lounge", 0, "secret", None).await.unwrap();

        let (peer_core, mut peer_rx) = node("mallory", Config::default());
        let peer = Session::join(peer_core, loopback(&host), "guess").await.unwrap();

        wait_for(&mut peer_rx, |e| {
            matches!(e, HubEvent::Notice(n) if n.starts_with("Connection rejected"))
        })
        .await;
        timeout(WAIT, peer.closed()).await.unwrap();
        assert_eq!(host.with_core(|c| c.registry().len()).await, 1);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn secondary_takes_over_when_host_dies() {
        let (host_core, mut host_rx) = node("host", fast());
        let host = Session::host(host_core, "lounge", 0, "", None).await.unwrap();
        let host_addr = loopback(&host);

        let (a_core, mut a_rx) = node("alice", fast());
        let a = Session::join(a_core, host_addr, "").await.unwrap();
        wait_for(&mut a_rx, |e| matches!(e, HubEvent::RoomAccepted { .. })).await;

        let (c_core, mut c_rx) = node("carol", fast());
        let c = Session::join(c_core, host_addr, "").await.unwrap();
        wait_for(&mut c_rx, |e| matches!(e, HubEvent::RoomAccepted { .. })).await;

        let alice = ParticipantId::new("alice-id");
        host.apply(|core| core.request_secondary(&alice)).await.unwrap();
        wait_for(&mut a_rx, |e| matches!(e, HubEvent::HostPrompt(_))).await;
        a.apply(|core| core.accept_secondary()).await.unwrap();
        wait_for(&mut host_rx, |e| {
            matches!(e, HubEvent::Notice(n) if n == "alice is now the Secondary Host.")
        })
        .await;
        timeout(WAIT, async {
            while c.with_core(|core| core.secondary().is_none()).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("designation never reached carol");

        host.halt();

        wait_for(&mut a_rx, |e| matches!(e, HubEvent::RoleChanged(SessionRole::PromotedHost))).await;
        let carol = ParticipantId::new("carol-id");
        timeout(WAIT, async {
            while !a.with_core(|core| core.registry().contains(&carol)).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("carol never rejoined alice");
        assert_eq!(c.with_core(|core| core.target()).await, Some(loopback(&a)));

        a.shutdown().await;
        c.shutdown().await;
    }
}

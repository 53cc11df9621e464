//! Capture and playback seam, plus the paced audio and video sender tasks.

use std::sync::Arc;
use std::time::Duration;

use hub_core::ParticipantId;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::Session;

/// How often the audio sender polls the capture device.
pub const AUDIO_PACING: Duration = Duration::from_millis(10);

/// Audio/video hardware. Implementations must not block for long; the sender tasks
/// poll them on a timer.
pub trait MediaDevice: Send {
    /// Whether `next_audio_chunk` can ever produce anything.
    fn captures_audio(&self) -> bool {
        false
    }

    /// One captured audio chunk, if the microphone has one ready.
    fn next_audio_chunk(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn play_audio(&mut self, _sender: &ParticipantId, _data: &[u8]) {}

    /// One encoded frame of the screen or camera.
    fn capture_frame_jpeg(&mut self) -> Option<Vec<u8>> {
        None
    }
}

pub type SharedMedia = Arc<Mutex<Box<dyn MediaDevice>>>;

pub fn shared(device: impl MediaDevice + 'static) -> SharedMedia {
    Arc::new(Mutex::new(Box::new(device)))
}

/// No capture hardware. Received audio is discarded.
#[derive(Debug, Default)]
pub struct NullMedia;

impl MediaDevice for NullMedia {}

/// Start forwarding microphone chunks to the room, if the device has a microphone.
pub fn spawn_audio_sender(session: Session, device: SharedMedia) -> JoinHandle<()> {
    tokio::spawn(audio_loop(session, device))
}

async fn audio_loop(session: Session, device: SharedMedia) {
    if !device.lock().await.captures_audio() {
        return;
    }
    let mut ticker = tokio::time::interval(AUDIO_PACING);
    loop {
        tokio::select! {
            _ = session.closed() => break,
            _ = ticker.tick() => {}
        }
        let Some(chunk) = device.lock().await.next_audio_chunk() else {
            continue;
        };
        if let Err(e) = session.apply(|core| core.send_audio(&chunk)).await {
            debug!(error = %e, "audio sender stopped");
            break;
        }
    }
}

/// Stream frames at `fps` for as long as the core reports streaming.
pub fn spawn_video_sender(session: Session, device: SharedMedia, fps: u32) -> JoinHandle<()> {
    tokio::spawn(video_loop(session, device, fps))
}

/// Owns the node's video sender. Starting again replaces the running task.
#[derive(Debug, Default)]
pub struct VideoSender {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VideoSender {
    pub async fn start(&self, session: Session, device: SharedMedia, fps: u32) {
        let mut task = self.task.lock().await;
        if let Some(old) = task.replace(spawn_video_sender(session, device, fps)) {
            old.abort();
        }
    }

    pub async fn stop(&self) {
        if let Some(old) = self.task.lock().await.take() {
            old.abort();
        }
    }
}

async fn video_loop(session: Session, device: SharedMedia, fps: u32) {
    let period = Duration::from_secs(1) / fps.max(1);
    let mut ticker = tokio::time::interval(period);
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = session.closed() => break,
            _ = ticker.tick() => {}
        }
        if !session.with_core(|core| core.is_streaming()).await {
            break;
        }
        let Some(jpeg) = device.lock().await.capture_frame_jpeg() else {
            continue;
        };
        if let Err(e) = session.apply(|core| core.send_video_frame(&jpeg)).await {
            debug!(error = %e, "video sender stopped");
            break;
        }
        sent += 1;
    }
    debug!(frames = sent, "video sender finished");
}

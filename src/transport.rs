// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio::{
    sync::{broadcast, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, span, Level, Span};

use crate::audio::{self, decode, source::BufferSource, Controls, Progress};
use crate::playsync::CancelHandle;
use crate::track::Track;

/// Transport lifecycle events, published so the coordinator can react to
/// starts it didn't issue and to natural track end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Audible playback started (either a fresh load or a resume).
    Started(String),
    /// The loaded track played to its natural end.
    Finished(String),
    /// Playback was explicitly stopped and the session reset.
    Stopped,
    /// The resource couldn't be loaded; playback never started.
    LoadFailed(String),
}

/// The outcome of a render, reported by the render thread on exit.
enum RenderOutcome {
    /// The source played until it ran out.
    Completed,
    /// The resource couldn't be loaded or decoded.
    LoadFailed(String),
}

struct RenderHandles {
    join: JoinHandle<()>,
    cancel: CancelHandle,
}

/// The app-wide audio player. Owns a single render at a time; every consumer
/// reads "what is playing" from here.
pub struct Transport {
    /// The device to render audio through.
    device: Arc<dyn audio::Device>,
    /// Shared controls between this transport and the device.
    controls: Arc<Controls>,
    /// The currently loaded track.
    current: Arc<RwLock<Option<Arc<Track>>>>,
    /// True while a render is mounted (playing or paused).
    active: Arc<AtomicBool>,
    /// The last load error, cleared on the next successful load.
    last_error: Arc<RwLock<Option<String>>>,
    /// Keeps track of the render joins. There should only be one at a time.
    join: Arc<Mutex<Option<RenderHandles>>>,
    /// Lifecycle event subscribers.
    events: broadcast::Sender<Event>,
    /// The volume restored on stop.
    default_volume: f32,
    /// The logging span.
    span: Span,
}

impl Transport {
    /// Creates a new transport on the given device.
    pub fn new(device: Arc<dyn audio::Device>, default_volume: f32) -> Transport {
        let (events, _) = broadcast::channel(16);
        Transport {
            device,
            controls: Arc::new(Controls::new(default_volume)),
            current: Arc::new(RwLock::new(None)),
            active: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(RwLock::new(None)),
            join: Arc::new(Mutex::new(None)),
            events,
            default_volume,
            span: span!(Level::INFO, "transport"),
        }
    }

    /// Plays the given track. If the track is already loaded this toggles
    /// pause/resume; otherwise the resource is loaded, elapsed resets to 0
    /// and playback begins. Load failures are non-fatal: they are logged and
    /// recorded, and playback simply does not start.
    pub async fn play(&self, track: Arc<Track>) -> Result<(), Box<dyn Error>> {
        let mut join = self.join.lock().await;

        if join.is_some() {
            let same = self
                .current
                .read()
                .as_ref()
                .is_some_and(|current| current.id == track.id);
            if same {
                let pause = !self.controls.is_paused();
                self.controls.set_paused(pause);
                info!(track = track.id, paused = pause, "Toggled playback.");
                if !pause {
                    let _ = self.events.send(Event::Started(track.id.clone()));
                }
                return Ok(());
            }

            // A different track: the running render loses.
            if let Some(handles) = join.take() {
                handles.cancel.cancel();
                if let Err(e) = handles.join.await {
                    error!(err = e.to_string(), "Error joining cancelled render");
                }
            }
        }

        info!(track = track.id, title = track.title, "Loading track.");
        *self.current.write() = Some(track.clone());
        *self.last_error.write() = None;
        self.controls.set_paused(false);
        self.controls.set_position(0);
        self.controls.publish(Progress {
            elapsed: Duration::ZERO,
            duration: track.duration(),
        });
        self.active.store(true, Ordering::Release);

        let cancel_handle = CancelHandle::new();
        let (render_tx, render_rx) = oneshot::channel::<RenderOutcome>();

        let join_handle = {
            let device = self.device.clone();
            let controls = self.controls.clone();
            let events = self.events.clone();
            let track = track.clone();
            let cancel_handle = cancel_handle.clone();
            tokio::task::spawn_blocking(move || {
                Transport::render_track(device, controls, events, track, cancel_handle, render_tx);
            })
        };
        *join = Some(RenderHandles {
            join: join_handle,
            cancel: cancel_handle,
        });

        // Clean up after the render finishes on its own. The task checks its
        // own render's cancel handle: anyone replacing the mounted render
        // cancels it first under the join lock, so an uncancelled handle
        // means the slot is still ours.
        let join_mutex = self.join.clone();
        let current = self.current.clone();
        let active = self.active.clone();
        let last_error = self.last_error.clone();
        let events = self.events.clone();
        let track_id = track.id.clone();
        let cancel_for_cleanup = {
            let handles = join.as_ref().expect("render handles must be present");
            handles.cancel.clone()
        };
        tokio::spawn(async move {
            let outcome = match render_rx.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(err = e.to_string(), "Error receiving render outcome");
                    return;
                }
            };

            let mut join = join_mutex.lock().await;
            if cancel_for_cleanup.is_cancelled() {
                // Whoever cancelled the render owns the state transition.
                return;
            }

            *current.write() = None;
            active.store(false, Ordering::Release);
            *join = None;

            match outcome {
                RenderOutcome::LoadFailed(message) => {
                    *last_error.write() = Some(message.clone());
                    let _ = events.send(Event::LoadFailed(message));
                }
                RenderOutcome::Completed => {
                    info!(track = track_id, "Track finished playing.");
                    let _ = events.send(Event::Finished(track_id));
                }
            }
        });

        Ok(())
    }

    /// Decodes and renders a track on the calling (blocking) thread.
    fn render_track(
        device: Arc<dyn audio::Device>,
        controls: Arc<Controls>,
        events: broadcast::Sender<Event>,
        track: Arc<Track>,
        cancel_handle: CancelHandle,
        render_tx: oneshot::Sender<RenderOutcome>,
    ) {
        let decoded = match decode::decode_file(track.file()) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(track = track.id, err = e.to_string(), "Unable to load track");
                if render_tx.send(RenderOutcome::LoadFailed(e.to_string())).is_err() {
                    error!("Error while sending to the outcome channel.");
                }
                return;
            }
        };

        // A cancel can arrive while decoding; don't start the render if so.
        if !cancel_handle.is_cancelled() {
            let step = decoded.sample_rate() as f64 / device.sample_rate() as f64;
            let source = BufferSource::new(decoded, step);
            let _ = events.send(Event::Started(track.id.clone()));

            if let Err(e) = device.render(source, controls, cancel_handle) {
                error!(err = e.as_ref(), track = track.id, "Error while rendering track");
            }
        }

        if render_tx.send(RenderOutcome::Completed).is_err() {
            error!("Error while sending to the outcome channel.");
        }
    }

    /// Waits until the device reports no audible output. Returns immediately
    /// when nothing is rendering. Used for the stop-before-start handoff when
    /// another engine takes over the output.
    pub async fn await_quiescent(&self) {
        while !self.controls.is_quiescent() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Pauses playback, retaining the position.
    pub fn pause(&self) {
        let _enter = self.span.enter();
        if self.active.load(Ordering::Acquire) {
            info!("Pausing playback.");
            self.controls.set_paused(true);
        }
    }

    /// Resumes paused playback.
    pub fn resume(&self) {
        let _enter = self.span.enter();
        if self.active.load(Ordering::Acquire) && self.controls.is_paused() {
            info!("Resuming playback.");
            self.controls.set_paused(false);
            if let Some(track) = self.current.read().as_ref() {
                let _ = self.events.send(Event::Started(track.id.clone()));
            }
        }
    }

    /// Seeks to the given position, clamped to the track duration. No-op when
    /// nothing is loaded.
    pub fn seek(&self, position: Duration) {
        let _enter = self.span.enter();
        let duration = match self.current.read().as_ref() {
            Some(track) => track.duration(),
            None => return,
        };
        let position = position.min(duration);
        info!(position = format!("{:?}", position), "Seeking.");
        self.controls.request_seek(position);
    }

    /// Sets the volume, clamped to [0, 1].
    pub fn set_volume(&self, volume: f32) {
        self.controls.set_volume(volume);
    }

    /// The current volume.
    pub fn volume(&self) -> f32 {
        self.controls.volume()
    }

    /// Stops playback, unloads the track and resets the session to its
    /// initial state.
    pub async fn stop(&self) {
        let mut join = self.join.lock().await;
        if let Some(handles) = join.take() {
            info!("Stopping playback.");
            handles.cancel.cancel();
            if let Err(e) = handles.join.await {
                error!(err = e.to_string(), "Error joining stopped render");
            }
        }

        *self.current.write() = None;
        *self.last_error.write() = None;
        self.active.store(false, Ordering::Release);
        self.controls.set_paused(false);
        self.controls.set_position(0);
        self.controls.set_volume(self.default_volume);
        self.controls.publish(Progress::default());
        let _ = self.events.send(Event::Stopped);
    }

    /// The currently loaded track, if any.
    pub fn current(&self) -> Option<Arc<Track>> {
        self.current.read().clone()
    }

    /// Returns true if the given track is loaded and not paused.
    pub fn is_track_playing(&self, track_id: &str) -> bool {
        self.active.load(Ordering::Acquire)
            && !self.controls.is_paused()
            && self
                .current
                .read()
                .as_ref()
                .is_some_and(|current| current.id == track_id)
    }

    /// Returns true while a render is mounted, playing or paused.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The last load error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// The shared render controls.
    pub fn controls(&self) -> &Arc<Controls> {
        &self.controls
    }

    /// Subscribes to pushed progress updates.
    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.controls.subscribe()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, sync::Arc, time::Duration};

    use crate::audio;
    use crate::test::test::{eventually, test_track};
    use crate::track::Track;

    use super::{Event, Transport};

    fn test_transport(dir: &std::path::Path) -> (Transport, Arc<audio::mock::Device>, Arc<Track>) {
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let transport = Transport::new(device.clone(), 1.0);
        // A minute of audio so playback outlives the test's observations.
        let track = test_track(dir, "beat-1", "First Beat", 44100 * 60);
        (transport, device, track)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_play_pause_resume() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (transport, device, track) = test_transport(dir.path());

        transport.play(track.clone()).await?;
        eventually(|| device.is_playing(), "Track never started playing");
        assert!(transport.is_track_playing(&track.id));

        // Playing the same track toggles to paused, not a restart.
        transport.play(track.clone()).await?;
        eventually(|| !device.is_playing(), "Track never paused");
        assert!(transport.is_active());
        assert!(!transport.is_track_playing(&track.id));

        // And toggles back to playing.
        transport.play(track.clone()).await?;
        eventually(|| device.is_playing(), "Track never resumed");

        transport.stop().await;
        assert!(!transport.is_active());
        assert!(transport.current().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_play_different_track_restarts() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (transport, device, track_a) = test_transport(dir.path());
        let track_b = test_track(dir.path(), "beat-2", "Second Beat", 44100 * 60);

        transport.play(track_a.clone()).await?;
        eventually(|| device.is_playing(), "Track A never started playing");

        transport.play(track_b.clone()).await?;
        eventually(
            || transport.is_track_playing(&track_b.id),
            "Track B never started playing",
        );
        assert!(!transport.is_track_playing(&track_a.id));
        // Playback starts from the beginning of track B.
        assert!(transport.controls().position() < 44100);

        transport.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_failure_is_non_fatal() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (transport, device, _) = test_transport(dir.path());
        let missing = Arc::new(Track::new(
            "missing".to_string(),
            "Missing".to_string(),
            dir.path().join("missing.wav"),
            "C".to_string(),
            120,
            Duration::from_secs(10),
            None,
            None,
            None,
        )?);

        let mut events = transport.subscribe_events();
        transport.play(missing.clone()).await?;
        eventually(
            || transport.last_error().is_some(),
            "Load error never surfaced",
        );
        eventually(|| !transport.is_active(), "Transport never cleared");
        assert!(!device.is_playing());

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::LoadFailed(_)) {
                failed = true;
            }
        }
        assert!(failed, "LoadFailed event never emitted");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_natural_end_emits_finished() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let transport = Transport::new(device.clone(), 1.0);
        // A very short track so the mock finishes quickly.
        let track = test_track(dir.path(), "short", "Short", 4410);
        let mut events = transport.subscribe_events();

        transport.play(track.clone()).await?;
        eventually(|| !transport.is_active(), "Track never finished");

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            if event == Event::Finished(track.id.clone()) {
                finished = true;
            }
        }
        assert!(finished, "Finished event never emitted");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_seek_and_volume() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (transport, device, track) = test_transport(dir.path());

        // Seek with nothing loaded is a no-op.
        transport.seek(Duration::from_secs(1));
        assert!(transport.controls().take_seek().is_none());

        transport.play(track.clone()).await?;
        eventually(|| device.is_playing(), "Track never started playing");

        transport.set_volume(1.4);
        assert_eq!(1.0, transport.volume());
        transport.set_volume(0.25);
        assert!((transport.volume() - 0.25).abs() < 1e-6);

        // Seeks past the end clamp to the duration.
        transport.seek(Duration::from_secs(3600));
        eventually(|| !transport.is_active(), "Clamped seek never ended track");

        transport.stop().await;
        assert_eq!(1.0, transport.volume());
        Ok(())
    }
}

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

//! The pitch-shift engine.
//!
//! Plays a transposed rendition of a track from a fully decoded in-memory
//! buffer. Transposition is a plain rate change: the render steps through the
//! buffer `2^(semitones/12)` source frames per output frame, so pitch and
//! speed move together and the rendition is proportionally shorter. The
//! source file is never modified.

use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex as StateMutex, RwLock};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::audio::{self, decode, source::BufferSource, Controls};
use crate::keys;
use crate::playsync::{CancelHandle, Generation};
use crate::track::Track;

/// Returned when transposed playback is requested before a successful
/// prepare.
#[derive(Debug, thiserror::Error)]
#[error("the pitch-shift engine has no prepared buffer")]
pub struct NotReady;

/// A decoded buffer bound to the track it came from.
struct Prepared {
    track: Arc<Track>,
    decoded: decode::DecodedTrack,
}

/// The buffer lifecycle state of the engine.
#[derive(Default)]
struct EngineState {
    /// The decoded buffer, present after a successful prepare.
    prepared: Option<Prepared>,
    /// The track currently being decoded, if any.
    preparing: Option<Arc<Track>>,
    /// The last decode error, cleared on the next prepare.
    last_error: Option<String>,
}

struct RenderHandles {
    join: JoinHandle<()>,
    cancel: CancelHandle,
}

/// Plays transposed renditions of a prepared track.
pub struct PitchShifter {
    /// The device to render audio through.
    device: Arc<dyn audio::Device>,
    /// The buffer lifecycle state.
    state: Arc<StateMutex<EngineState>>,
    /// Detects decodes that complete after the engine has moved on.
    generation: Generation,
    /// Keeps track of the render joins. There should only be one at a time.
    join: Arc<Mutex<Option<RenderHandles>>>,
    /// True while a transposed render is mounted.
    active: Arc<AtomicBool>,
    /// The id of the track currently being rendered.
    playing: Arc<RwLock<Option<String>>>,
    /// Published when a transposed render plays to its natural end.
    finished: broadcast::Sender<String>,
}

impl PitchShifter {
    /// Creates a new pitch-shift engine on the given device.
    pub fn new(device: Arc<dyn audio::Device>) -> PitchShifter {
        let (finished, _) = broadcast::channel(16);
        PitchShifter {
            device,
            state: Arc::new(StateMutex::new(EngineState::default())),
            generation: Generation::new(),
            join: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
            playing: Arc::new(RwLock::new(None)),
            finished,
        }
    }

    /// Asynchronously decodes the track into the engine's buffer. Any
    /// in-flight decode or playing render is cancelled first; a decode that
    /// completes after a later prepare or discard is detected and dropped.
    /// Returns immediately; readiness is observable via [`Self::ready_track`].
    pub async fn prepare(&self, track: Arc<Track>) {
        // A new prepare supersedes whatever render is in progress.
        self.stop().await;

        let captured = {
            let mut state = self.state.lock();

            let already_ready = state
                .prepared
                .as_ref()
                .is_some_and(|prepared| prepared.track.id == track.id);
            if already_ready {
                debug!(track = track.id, "Buffer already prepared");
                return;
            }
            let already_preparing = state
                .preparing
                .as_ref()
                .is_some_and(|preparing| preparing.id == track.id);
            if already_preparing {
                debug!(track = track.id, "Decode already in flight");
                return;
            }

            let captured = self.generation.advance();
            state.prepared = None;
            state.preparing = Some(track.clone());
            state.last_error = None;
            captured
        };

        info!(track = track.id, "Preparing transposition buffer.");

        let state = self.state.clone();
        let generation = self.generation.clone();
        let file = track.file().to_path_buf();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || decode::decode_file(&file)).await;

            let mut state = state.lock();
            if !generation.is_current(captured) {
                debug!(track = track.id, "Discarding stale decode");
                return;
            }
            state.preparing = None;

            match result {
                Ok(Ok(decoded)) => {
                    info!(
                        track = track.id,
                        memory_kb = decoded.memory_size() / 1024,
                        "Transposition buffer ready"
                    );
                    state.prepared = Some(Prepared { track, decoded });
                }
                Ok(Err(e)) => {
                    error!(track = track.id, err = e.to_string(), "Unable to prepare buffer");
                    state.last_error = Some(e.to_string());
                }
                Err(e) => {
                    error!(track = track.id, err = e.to_string(), "Decode task failed");
                    state.last_error = Some(e.to_string());
                }
            }
        });
    }

    /// Starts a transposed render of the prepared buffer at the given
    /// semitone offset. Any previous render is stopped first. Refused with
    /// [`NotReady`] until a prepare has completed successfully.
    pub async fn play_at_offset(&self, semitones: i32, volume: f32) -> Result<(), NotReady> {
        let mut join = self.join.lock().await;
        if let Some(handles) = join.take() {
            handles.cancel.cancel();
            if let Err(e) = handles.join.await {
                error!(err = e.to_string(), "Error joining superseded render");
            }
        }

        let (track, decoded) = {
            let state = self.state.lock();
            match state.prepared.as_ref() {
                Some(prepared) => (prepared.track.clone(), prepared.decoded.clone()),
                None => return Err(NotReady),
            }
        };

        let ratio = keys::pitch_ratio(semitones);
        let step = decoded.sample_rate() as f64 / self.device.sample_rate() as f64 * ratio;
        info!(
            track = track.id,
            semitones,
            ratio,
            "Starting transposed render."
        );

        self.active.store(true, Ordering::Release);
        *self.playing.write() = Some(track.id.clone());

        let cancel_handle = CancelHandle::new();
        let (render_tx, render_rx) = oneshot::channel::<()>();
        let join_handle = {
            let device = self.device.clone();
            let controls = Arc::new(Controls::new(volume));
            let cancel_handle = cancel_handle.clone();
            let track_id = track.id.clone();
            tokio::task::spawn_blocking(move || {
                let source = BufferSource::new(decoded, step);
                if let Err(e) = device.render(source, controls, cancel_handle) {
                    error!(err = e.as_ref(), track = track_id, "Error while rendering");
                }
                if render_tx.send(()).is_err() {
                    error!("Error while sending to the render channel.");
                }
            })
        };
        let cancel_for_cleanup = cancel_handle.clone();
        *join = Some(RenderHandles {
            join: join_handle,
            cancel: cancel_handle,
        });

        let join_mutex = self.join.clone();
        let active = self.active.clone();
        let playing = self.playing.clone();
        let finished = self.finished.clone();
        let track_id = track.id.clone();
        tokio::spawn(async move {
            if render_rx.await.is_err() {
                return;
            }
            let mut join = join_mutex.lock().await;
            if cancel_for_cleanup.is_cancelled() {
                return;
            }
            *join = None;
            active.store(false, Ordering::Release);
            *playing.write() = None;
            let _ = finished.send(track_id);
        });

        Ok(())
    }

    /// Halts and releases the active render. Safe to call when nothing is
    /// playing.
    pub async fn stop(&self) {
        let mut join = self.join.lock().await;
        if let Some(handles) = join.take() {
            handles.cancel.cancel();
            if let Err(e) = handles.join.await {
                error!(err = e.to_string(), "Error joining stopped render");
            }
        }
        self.active.store(false, Ordering::Release);
        *self.playing.write() = None;
    }

    /// Drops the decoded buffer and stops any render. Called when the
    /// transposition surface closes.
    pub async fn discard(&self) {
        self.stop().await;

        let mut state = self.state.lock();
        self.generation.advance();
        if let Some(prepared) = state.prepared.take() {
            info!(track = prepared.track.id, "Discarding transposition buffer.");
        }
        state.preparing = None;
        state.last_error = None;
    }

    /// The track whose buffer is ready for transposed playback, if any.
    pub fn ready_track(&self) -> Option<Arc<Track>> {
        self.state
            .lock()
            .prepared
            .as_ref()
            .map(|prepared| prepared.track.clone())
    }

    /// Returns true if the buffer for the given track is ready.
    pub fn is_ready(&self, track_id: &str) -> bool {
        self.ready_track()
            .is_some_and(|track| track.id == track_id)
    }

    /// Returns true while a decode is in flight.
    pub fn is_preparing(&self) -> bool {
        self.state.lock().preparing.is_some()
    }

    /// The track the engine is preparing or has prepared, if any.
    pub fn engaged_track(&self) -> Option<Arc<Track>> {
        let state = self.state.lock();
        state
            .preparing
            .clone()
            .or_else(|| state.prepared.as_ref().map(|prepared| prepared.track.clone()))
    }

    /// Returns true while a transposed render is mounted.
    pub fn is_playing(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns true if the given track is being rendered.
    pub fn is_track_playing(&self, track_id: &str) -> bool {
        self.is_playing()
            && self
                .playing
                .read()
                .as_ref()
                .is_some_and(|playing| playing == track_id)
    }

    /// The last decode error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Subscribes to natural-end notifications for transposed renders.
    pub fn subscribe_finished(&self) -> broadcast::Receiver<String> {
        self.finished.subscribe()
    }
}

impl std::fmt::Debug for PitchShifter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PitchShifter")
            .field("ready", &state.prepared.is_some())
            .field("preparing", &state.preparing.is_some())
            .field("playing", &self.is_playing())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, sync::Arc, time::Duration};

    use crate::audio;
    use crate::test::test::{eventually, test_track};
    use crate::track::Track;

    use super::PitchShifter;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_play_before_prepare_is_refused() {
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let pitch = PitchShifter::new(device.clone());

        assert!(pitch.play_at_offset(2, 1.0).await.is_err());
        assert!(!pitch.is_playing());
        assert!(!device.is_playing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prepare_and_play_at_ratio() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let pitch = PitchShifter::new(device.clone());
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        pitch.prepare(track.clone()).await;
        eventually(|| pitch.is_ready(&track.id), "Buffer never became ready");
        assert!(!pitch.is_preparing());

        pitch.play_at_offset(2, 1.0).await?;
        eventually(|| device.is_playing(), "Render never became audible");
        assert!(pitch.is_track_playing(&track.id));

        // The source and mock rates match, so the step is the pitch ratio.
        let expected = 2f64.powf(2.0 / 12.0);
        let step = device.last_step().expect("expected a recorded step");
        assert!((step - expected).abs() < 1e-9);

        pitch.stop().await;
        assert!(!pitch.is_playing());
        assert!(!device.is_playing());
        // Stopping again is safe.
        pitch.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prepare_failure_leaves_not_ready() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let pitch = PitchShifter::new(device);
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

        pitch.prepare(missing.clone()).await;
        eventually(|| pitch.last_error().is_some(), "Decode error never surfaced");
        assert!(!pitch.is_ready(&missing.id));
        assert!(pitch.play_at_offset(1, 1.0).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_prepare_supersedes_old() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let pitch = PitchShifter::new(device);
        let track_a = test_track(dir.path(), "beat-a", "Beat A", 44100);
        let track_b = test_track(dir.path(), "beat-b", "Beat B", 44100);

        // Issue two prepares back to back; only the later one may win.
        pitch.prepare(track_a.clone()).await;
        pitch.prepare(track_b.clone()).await;

        eventually(|| pitch.is_ready(&track_b.id), "Buffer never became ready");
        assert!(!pitch.is_ready(&track_a.id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discard_drops_buffer() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let pitch = PitchShifter::new(device.clone());
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        pitch.prepare(track.clone()).await;
        eventually(|| pitch.is_ready(&track.id), "Buffer never became ready");

        pitch.play_at_offset(-2, 1.0).await?;
        eventually(|| device.is_playing(), "Render never became audible");

        pitch.discard().await;
        assert!(!pitch.is_playing());
        assert!(!device.is_playing());
        assert!(pitch.ready_track().is_none());
        assert!(pitch.play_at_offset(1, 1.0).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_natural_end_notifies() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let pitch = PitchShifter::new(device);
        // Short enough for the mock to finish almost immediately.
        let track = test_track(dir.path(), "short", "Short", 4410);
        let mut finished = pitch.subscribe_finished();

        pitch.prepare(track.clone()).await;
        eventually(|| pitch.is_ready(&track.id), "Buffer never became ready");

        pitch.play_at_offset(2, 1.0).await?;
        eventually(|| !pitch.is_playing(), "Render never finished");
        assert_eq!(track.id, finished.recv().await?);
        Ok(())
    }
}

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

//! The playback coordinator.
//!
//! Exactly one session exists per player. It arbitrates between the transport
//! (original-speed playback) and the pitch-shift engine so that at most one of
//! them is audible at any instant: whichever engine is commanded last wins,
//! and the loser is stopped before the winner starts. The session is the
//! single writer of the coordinator state; every other component only reads.

use std::{
    error::Error,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

use crate::audio::Progress;
use crate::keys::{self, TransposedMetadata};
use crate::pitch::PitchShifter;
use crate::track::Track;
use crate::transport::{self, Transport};

/// The lowest semitone offset the transposer accepts.
pub const MIN_OFFSET: i32 = -2;
/// The highest semitone offset the transposer accepts.
pub const MAX_OFFSET: i32 = 2;

/// Which engine owns playback right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing is audible.
    Idle,
    /// The transport owns playback (playing or paused at its position).
    PlayingOriginal,
    /// The pitch-shift engine owns playback.
    PlayingTransposed,
    /// Transient state while an offset change hands the output from one
    /// engine to the other.
    Transposing,
}

/// The direction of a single-semitone transpose step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Session command failures. All are recovered locally; the session is left
/// in a safe state and no command is retried.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested offset is outside the accepted range. Rejected before
    /// any state mutation.
    #[error("semitone offset {0} is outside [-2, 2]")]
    InvalidOffset(i32),

    /// Transposed playback was requested before the decode finished (or
    /// after it failed). The offset is left unchanged.
    #[error("the transposition buffer is not ready")]
    EngineNotReady,
}

/// Engine notifications the coordinator reacts to.
enum EngineEvent {
    Transport(transport::Event),
    TransposedFinished(String),
}

/// The app-wide playback session: the coordinator state machine plus the
/// facade consumers drive.
pub struct Session {
    /// The transport playing tracks at their original speed.
    transport: Arc<Transport>,
    /// The engine playing transposed renditions.
    pitch: Arc<PitchShifter>,
    /// The coordinator state. Written only by command methods and the engine
    /// event watcher.
    state: RwLock<State>,
    /// The semitone offset, always within [MIN_OFFSET, MAX_OFFSET].
    offset: AtomicI32,
    /// The track the transposition surface is open for, if any.
    transposer: RwLock<Option<Arc<Track>>>,
    /// Serializes commands so they apply in the order issued.
    commands: Mutex<()>,
}

impl Session {
    /// Creates a new session coordinating the given engines.
    pub fn new(transport: Arc<Transport>, pitch: Arc<PitchShifter>) -> Arc<Session> {
        let transport_events = transport.subscribe_events();
        let transposed_finished = pitch.subscribe_finished();

        let session = Arc::new(Session {
            transport,
            pitch,
            state: RwLock::new(State::Idle),
            offset: AtomicI32::new(0),
            transposer: RwLock::new(None),
            commands: Mutex::new(()),
        });

        tokio::spawn(Session::watch_engines(
            Arc::downgrade(&session),
            transport_events,
            transposed_finished,
        ));

        session
    }

    /// Reacts to engine notifications: external transport starts while a
    /// transposed render is audible, and natural track end on either engine.
    async fn watch_engines(
        session: Weak<Session>,
        mut transport_events: broadcast::Receiver<transport::Event>,
        mut transposed_finished: broadcast::Receiver<String>,
    ) {
        loop {
            let event = tokio::select! {
                event = transport_events.recv() => match event {
                    Ok(event) => EngineEvent::Transport(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                finished = transposed_finished.recv() => match finished {
                    Ok(track_id) => EngineEvent::TransposedFinished(track_id),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };

            let Some(session) = session.upgrade() else {
                return;
            };
            session.on_engine_event(event).await;
        }
    }

    async fn on_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Transport(transport::Event::Started(track_id)) => {
                // A start notification the transport has already moved past
                // (a resume that was re-paused before this task observed it)
                // carries no authority.
                if !self.transport.is_track_playing(&track_id) {
                    return;
                }
                let state = *self.state.read();
                if state == State::PlayingTransposed {
                    // A transport start the coordinator didn't issue:
                    // commanded-last wins, so the transposed render yields.
                    warn!(
                        track = track_id,
                        "External transport start; stopping transposed render."
                    );
                    self.pitch.stop().await;
                    *self.state.write() = State::PlayingOriginal;
                } else if state == State::Idle {
                    *self.state.write() = State::PlayingOriginal;
                }
            }
            EngineEvent::Transport(transport::Event::Finished(_))
            | EngineEvent::Transport(transport::Event::Stopped)
            | EngineEvent::Transport(transport::Event::LoadFailed(_)) => {
                let mut state = self.state.write();
                if *state == State::PlayingOriginal {
                    *state = State::Idle;
                }
            }
            EngineEvent::TransposedFinished(_) => {
                let mut state = self.state.write();
                if *state == State::PlayingTransposed {
                    *state = State::Idle;
                }
            }
        }
    }

    /// Plays the given track. With a zero offset (or no open transposer for
    /// the track) this delegates to the transport: same track toggles
    /// pause/resume, a different track loads fresh from the start. With a
    /// non-zero offset and the transposer open for this track, the transposed
    /// rendition plays instead; the transport is paused first so only one
    /// engine is audible.
    pub async fn play_track(&self, track: Arc<Track>) -> Result<(), Box<dyn Error>> {
        let _commands = self.commands.lock().await;

        let offset = self.offset.load(Ordering::Acquire);
        let transposed_route = offset != 0
            && self
                .transposer
                .read()
                .as_ref()
                .is_some_and(|open| open.id == track.id);

        if transposed_route {
            if !self.pitch.is_ready(&track.id) {
                return Err(SessionError::EngineNotReady.into());
            }

            *self.state.write() = State::Transposing;
            // The transport loses: silence it and wait before starting the
            // transposed render.
            self.transport.pause();
            self.transport.await_quiescent().await;
            if self
                .pitch
                .play_at_offset(offset, self.transport.volume())
                .await
                .is_err()
            {
                *self.state.write() = State::Idle;
                return Err(SessionError::EngineNotReady.into());
            }
            *self.state.write() = State::PlayingTransposed;
            return Ok(());
        }

        // The original route. An audible transposed render loses to a direct
        // play request.
        if *self.state.read() == State::PlayingTransposed {
            self.pitch.stop().await;
        }
        self.transport.play(track).await?;
        *self.state.write() = State::PlayingOriginal;
        Ok(())
    }

    /// Pauses playback. The transport retains its position; a transposed
    /// render has no pause and is stopped instead.
    pub async fn pause_track(&self) {
        let _commands = self.commands.lock().await;
        let state = *self.state.read();
        match state {
            State::PlayingOriginal => self.transport.pause(),
            State::PlayingTransposed => {
                self.pitch.stop().await;
                *self.state.write() = State::Idle;
            }
            _ => {}
        }
    }

    /// Seeks the transport to the given position, clamped to the track
    /// duration. No-op when nothing is loaded or while transposed.
    pub async fn seek_to(&self, position: Duration) {
        let _commands = self.commands.lock().await;
        self.transport.seek(position);
    }

    /// Sets the volume, clamped to [0, 1]. A playing transposed render keeps
    /// the volume it started with; the next render picks up the new value.
    pub async fn change_volume(&self, volume: f32) {
        let _commands = self.commands.lock().await;
        self.transport.set_volume(volume);
    }

    /// Stops both engines and resets the session to its initial state.
    pub async fn stop_track(&self) {
        let _commands = self.commands.lock().await;
        info!("Stopping session.");

        self.pitch.stop().await;
        self.transport.stop().await;
        self.offset.store(0, Ordering::Release);
        *self.state.write() = State::Idle;
    }

    /// Steps the semitone offset by one in the given direction. Offsets
    /// outside [MIN_OFFSET, MAX_OFFSET] are rejected without touching any
    /// state. While the track is audible, the output is handed to the engine
    /// the new offset calls for: the active engine is stopped first, then the
    /// other one starts.
    pub async fn transpose(&self, direction: Direction) -> Result<(), SessionError> {
        let _commands = self.commands.lock().await;

        let current = self.offset.load(Ordering::Acquire);
        let requested = match direction {
            Direction::Up => current + 1,
            Direction::Down => current - 1,
        };
        if !(MIN_OFFSET..=MAX_OFFSET).contains(&requested) {
            return Err(SessionError::InvalidOffset(requested));
        }

        let track = match self.transposer.read().clone() {
            Some(track) => track,
            None => return Err(SessionError::EngineNotReady),
        };
        if requested != 0 && !self.pitch.is_ready(&track.id) {
            return Err(SessionError::EngineNotReady);
        }

        info!(track = track.id, offset = requested, "Applying offset.");
        self.offset.store(requested, Ordering::Release);

        let state = *self.state.read();
        match state {
            State::PlayingOriginal if requested != 0 && self.transport.is_track_playing(&track.id) => {
                *self.state.write() = State::Transposing;
                self.transport.pause();
                self.transport.await_quiescent().await;
                if self
                    .pitch
                    .play_at_offset(requested, self.transport.volume())
                    .await
                    .is_err()
                {
                    // The buffer vanished between the check and the start;
                    // put everything back the way it was.
                    self.offset.store(current, Ordering::Release);
                    self.transport.resume();
                    *self.state.write() = State::PlayingOriginal;
                    return Err(SessionError::EngineNotReady);
                }
                *self.state.write() = State::PlayingTransposed;
            }
            State::PlayingTransposed if self.pitch.is_track_playing(&track.id) => {
                *self.state.write() = State::Transposing;
                if requested == 0 {
                    self.pitch.stop().await;
                    // Hand the output back: resume from the retained position
                    // when the transport still holds the track, otherwise
                    // start it fresh.
                    let mounted = self
                        .transport
                        .current()
                        .is_some_and(|loaded| loaded.id == track.id);
                    if mounted {
                        self.transport.resume();
                    } else if let Err(e) = self.transport.play(track.clone()).await {
                        error!(err = e.to_string(), "Unable to start the transport");
                        *self.state.write() = State::Idle;
                        return Ok(());
                    }
                    *self.state.write() = State::PlayingOriginal;
                } else {
                    // play_at_offset stops the previous render before the new
                    // one starts.
                    if self
                        .pitch
                        .play_at_offset(requested, self.transport.volume())
                        .await
                        .is_err()
                    {
                        self.offset.store(current, Ordering::Release);
                        *self.state.write() = State::Idle;
                        return Err(SessionError::EngineNotReady);
                    }
                    *self.state.write() = State::PlayingTransposed;
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Opens the transposition surface for the given track and starts
    /// decoding its buffer. Opening for a different track resets the offset.
    pub async fn open_transposer(&self, track: Arc<Track>) {
        let _commands = self.commands.lock().await;

        let reopened = self
            .transposer
            .read()
            .as_ref()
            .is_some_and(|open| open.id == track.id);
        if !reopened {
            self.offset.store(0, Ordering::Release);
        }
        *self.transposer.write() = Some(track.clone());

        if self.pitch.is_ready(&track.id) {
            return;
        }

        // A prepare for a new buffer supersedes any transposed render.
        if *self.state.read() == State::PlayingTransposed {
            *self.state.write() = State::Idle;
        }
        self.pitch.prepare(track).await;
    }

    /// Closes the transposition surface: stops any transposed render, drops
    /// the decoded buffer and resets the offset.
    pub async fn close_transposer(&self) {
        let _commands = self.commands.lock().await;

        if *self.state.read() == State::PlayingTransposed {
            *self.state.write() = State::Idle;
        }
        self.pitch.discard().await;
        *self.transposer.write() = None;
        self.offset.store(0, Ordering::Release);
    }

    /// Returns true if the given track is audible on either engine.
    pub fn is_beat_playing(&self, track_id: &str) -> bool {
        self.transport.is_track_playing(track_id) || self.pitch.is_track_playing(track_id)
    }

    /// The current coordinator state.
    pub fn state(&self) -> State {
        *self.state.read()
    }

    /// The current semitone offset.
    pub fn current_offset(&self) -> i32 {
        self.offset.load(Ordering::Acquire)
    }

    /// True while the transposition buffer decode is in flight.
    pub fn is_loading(&self) -> bool {
        self.pitch.is_preparing()
    }

    /// The current volume.
    pub fn volume(&self) -> f32 {
        self.transport.volume()
    }

    /// The displayed metadata for the open transposer track at the current
    /// offset. None when no transposer is open.
    pub fn transposed_metadata(&self) -> Option<TransposedMetadata> {
        let track = self.transposer.read().clone()?;
        Some(keys::transpose_metadata(
            track.key(),
            track.bpm(),
            track.duration(),
            self.offset.load(Ordering::Acquire),
        ))
    }

    /// The track owning playback right now, if any.
    pub fn current_track(&self) -> Option<Arc<Track>> {
        match *self.state.read() {
            State::PlayingTransposed => self.transposer.read().clone(),
            _ => self.transport.current(),
        }
    }

    /// The last load or decode error from either engine, if any.
    pub fn last_error(&self) -> Option<String> {
        self.pitch.last_error().or_else(|| self.transport.last_error())
    }

    /// Subscribes to pushed transport progress updates.
    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.transport.subscribe_progress()
    }

    /// A one-line human readable description of the session.
    pub fn describe(&self) -> String {
        let state = *self.state.read();
        let offset = self.current_offset();
        match self.current_track() {
            Some(track) => format!("{:?}: {} (offset {:+})", state, track, offset),
            None => format!("{:?} (offset {:+})", state, offset),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, sync::Arc};

    use crate::audio;
    use crate::pitch::PitchShifter;
    use crate::test::test::{eventually, test_track};
    use crate::track::Track;
    use crate::transport::Transport;

    use super::{Direction, Session, SessionError, State};

    fn test_session() -> (
        Arc<Session>,
        Arc<Transport>,
        Arc<audio::mock::Device>,
    ) {
        let device = Arc::new(audio::mock::Device::get("mock-device"));
        let transport = Arc::new(Transport::new(device.clone(), 1.0));
        let pitch = Arc::new(PitchShifter::new(device.clone()));
        let session = Session::new(transport.clone(), pitch);
        (session, transport, device)
    }

    /// Opens the transposer and waits for the decode to finish.
    async fn open_and_wait(session: &Session, track: &Arc<Track>) {
        session.open_transposer(track.clone()).await;
        eventually(|| !session.is_loading(), "Buffer never became ready");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_offset_routes_to_transport() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, _, device) = test_session();
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        assert_eq!(State::Idle, session.state());
        session.play_track(track.clone()).await?;
        eventually(|| device.is_playing(), "Track never started playing");
        assert_eq!(State::PlayingOriginal, session.state());
        assert!(session.is_beat_playing(&track.id));

        // The same track toggles to paused; the coordinator still considers
        // the transport the owner of playback.
        session.play_track(track.clone()).await?;
        eventually(|| !device.is_playing(), "Track never paused");
        assert_eq!(State::PlayingOriginal, session.state());
        assert!(!session.is_beat_playing(&track.id));

        session.play_track(track.clone()).await?;
        eventually(|| device.is_playing(), "Track never resumed");

        session.stop_track().await;
        assert_eq!(State::Idle, session.state());
        assert!(!session.is_beat_playing(&track.id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offset_bounds_reject_without_mutation() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, _, device) = test_session();
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        open_and_wait(&session, &track).await;

        session.transpose(Direction::Up).await?;
        session.transpose(Direction::Up).await?;
        assert_eq!(2, session.current_offset());

        // One step past the limit is rejected and nothing changes.
        let result = session.transpose(Direction::Up).await;
        assert!(matches!(result, Err(SessionError::InvalidOffset(3))));
        assert_eq!(2, session.current_offset());
        assert_eq!(State::Idle, session.state());
        assert!(!device.is_playing());

        for _ in 0..4 {
            session.transpose(Direction::Down).await?;
        }
        assert_eq!(-2, session.current_offset());
        let result = session.transpose(Direction::Down).await;
        assert!(matches!(result, Err(SessionError::InvalidOffset(-3))));
        assert_eq!(-2, session.current_offset());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transpose_flips_engines_exclusively() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, transport, device) = test_session();
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        session.play_track(track.clone()).await?;
        eventually(|| device.is_playing(), "Track never started playing");
        open_and_wait(&session, &track).await;

        // Flip to the transposed rendition.
        session.transpose(Direction::Up).await?;
        assert_eq!(State::PlayingTransposed, session.state());
        eventually(|| device.is_playing(), "Transposed render never started");
        assert!(session.is_beat_playing(&track.id));

        // The render steps a semitone faster than the original.
        let expected = 2f64.powf(1.0 / 12.0);
        let step = device.last_step().expect("expected a recorded step");
        assert!((step - expected).abs() < 1e-9);

        let paused_position = transport.controls().position();
        assert!(paused_position > 0);

        // Flip back: the transposed render stops and the transport resumes
        // from its retained position.
        session.transpose(Direction::Down).await?;
        assert_eq!(0, session.current_offset());
        assert_eq!(State::PlayingOriginal, session.state());
        eventually(
            || transport.is_track_playing(&track.id),
            "Transport never resumed",
        );
        assert!(transport.controls().position() >= paused_position);

        // At no point were both engines audible at once.
        assert_eq!(1, device.max_audible());

        session.stop_track().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transpose_before_ready_is_refused() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, _, _) = test_session();
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        // The decode is still in flight when the transpose arrives.
        session.open_transposer(track.clone()).await;
        assert!(session.is_loading());
        let result = session.transpose(Direction::Up).await;
        assert!(matches!(result, Err(SessionError::EngineNotReady)));
        assert_eq!(0, session.current_offset());
        assert_eq!(State::Idle, session.state());

        // Once the decode finishes the same request succeeds.
        eventually(|| !session.is_loading(), "Buffer never became ready");
        session.transpose(Direction::Up).await?;
        assert_eq!(1, session.current_offset());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_play_with_offset_starts_transposed() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, _, device) = test_session();
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        open_and_wait(&session, &track).await;
        session.transpose(Direction::Down).await?;

        session.play_track(track.clone()).await?;
        assert_eq!(State::PlayingTransposed, session.state());
        eventually(|| device.is_playing(), "Transposed render never started");

        let expected = 2f64.powf(-1.0 / 12.0);
        let step = device.last_step().expect("expected a recorded step");
        assert!((step - expected).abs() < 1e-9);

        // Flipping back to zero with no retained transport position starts
        // the original from the top.
        session.transpose(Direction::Up).await?;
        assert_eq!(State::PlayingOriginal, session.state());
        eventually(
            || session.is_beat_playing(&track.id),
            "Original render never started",
        );
        assert_eq!(1, device.max_audible());

        session.stop_track().await;
        assert_eq!(0, session.current_offset());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_play_different_track_stops_transposed() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, transport, device) = test_session();
        let track_a = test_track(dir.path(), "beat-a", "Beat A", 44100 * 60);
        let track_b = test_track(dir.path(), "beat-b", "Beat B", 44100 * 60);

        open_and_wait(&session, &track_a).await;
        session.transpose(Direction::Up).await?;
        session.play_track(track_a.clone()).await?;
        eventually(|| device.is_playing(), "Transposed render never started");

        // A direct play request for another track wins over the transposed
        // render, whatever engine track A was on.
        session.play_track(track_b.clone()).await?;
        eventually(
            || transport.is_track_playing(&track_b.id),
            "Track B never started playing",
        );
        assert_eq!(State::PlayingOriginal, session.state());
        assert!(!session.is_beat_playing(&track_a.id));
        assert_eq!(1, device.max_audible());

        session.stop_track().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_external_transport_start_overrides() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, transport, device) = test_session();
        let track_a = test_track(dir.path(), "beat-a", "Beat A", 44100 * 60);
        let track_b = test_track(dir.path(), "beat-b", "Beat B", 44100 * 60);

        open_and_wait(&session, &track_a).await;
        session.transpose(Direction::Up).await?;
        session.play_track(track_a.clone()).await?;
        eventually(|| device.is_playing(), "Transposed render never started");

        // Another surface starts the transport directly, bypassing the
        // session. The coordinator detects the mismatch and yields.
        transport.play(track_b.clone()).await?;
        eventually(
            || session.state() == State::PlayingOriginal,
            "Coordinator never yielded to the transport",
        );
        eventually(
            || session.is_beat_playing(&track_b.id),
            "Track B never became audible",
        );
        assert!(!session.is_beat_playing(&track_a.id));

        session.stop_track().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_metadata_follows_offset() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, _, _) = test_session();
        // One minute at 120 BPM in C.
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        assert!(session.transposed_metadata().is_none());
        open_and_wait(&session, &track).await;

        let meta = session.transposed_metadata().expect("expected metadata");
        assert_eq!("C", meta.key);
        assert_eq!(120, meta.bpm);
        assert_eq!(1.0, meta.pitch_ratio);

        session.transpose(Direction::Up).await?;
        session.transpose(Direction::Up).await?;
        let meta = session.transposed_metadata().expect("expected metadata");
        assert_eq!("D", meta.key);
        assert_eq!(135, meta.bpm);
        assert!((meta.duration.as_secs_f64() - 60.0 / meta.pitch_ratio).abs() < 1e-6);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_transposer_resets() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (session, _, device) = test_session();
        let track = test_track(dir.path(), "beat-1", "First Beat", 44100 * 60);

        open_and_wait(&session, &track).await;
        session.transpose(Direction::Up).await?;
        session.play_track(track.clone()).await?;
        eventually(|| device.is_playing(), "Transposed render never started");

        session.close_transposer().await;
        assert_eq!(State::Idle, session.state());
        assert_eq!(0, session.current_offset());
        assert!(session.transposed_metadata().is_none());
        eventually(|| !device.is_playing(), "Render never stopped on close");

        // With the surface closed, transposing is refused again.
        assert!(session.transpose(Direction::Up).await.is_err());
        Ok(())
    }
}

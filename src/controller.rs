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
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{error, info, span, Level};

use crate::session::{Direction, Session};
use crate::track::Catalog;

pub mod keyboard;

/// Controller events that will trigger behavior in the playback session.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Plays the track with the given catalog id. If the track is already
    /// loaded, toggles pause/resume.
    Play(String),

    /// Pauses playback. If nothing is playing, does nothing.
    Pause,

    /// Seeks to the given position in the current track.
    Seek(Duration),

    /// Sets the playback volume.
    Volume(f32),

    /// Raises the semitone offset by one.
    TransposeUp,

    /// Lowers the semitone offset by one.
    TransposeDown,

    /// Opens the transposition surface for the track with the given catalog
    /// id and starts decoding its buffer.
    Open(String),

    /// Closes the transposition surface and drops the decoded buffer.
    Close,

    /// Stops playback and resets the session.
    Stop,

    /// Prints the current session state.
    Status,
}

pub trait Driver: Send + Sync + 'static {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>>;
}

/// Drives a playback session from a stream of events.
pub struct Controller {
    handle: JoinHandle<()>,
}

impl Controller {
    /// Creates a new controller with the given driver.
    pub fn new(
        session: Arc<Session>,
        catalog: Arc<Catalog>,
        driver: Arc<dyn Driver>,
    ) -> Result<Controller, Box<dyn Error>> {
        Ok(Controller {
            handle: tokio::spawn(async move {
                Controller::trigger_events(session, catalog, driver).await
            }),
        })
    }

    /// Join will block until the controller finishes.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.handle).await
    }

    /// Triggers session commands by watching the driver and getting events
    /// from it. Events are applied in the order received.
    async fn trigger_events(session: Arc<Session>, catalog: Arc<Catalog>, driver: Arc<dyn Driver>) {
        let span = span!(Level::INFO, "controller");
        let _enter = span.enter();

        let (events_tx, mut events_rx) = mpsc::channel(1);
        let join_handle = driver.monitor_events(events_tx);

        info!(tracks = catalog.len(), "Controller started.");

        loop {
            if let Some(event) = events_rx.recv().await {
                info!(event = format!("{:?}", event), "Received event.");

                if let Err(e) = match event {
                    Event::Play(track_id) => match catalog.get(&track_id) {
                        Ok(track) => session.play_track(track).await,
                        Err(e) => Err(e),
                    },
                    Event::Pause => {
                        session.pause_track().await;
                        Ok(())
                    }
                    Event::Seek(position) => {
                        session.seek_to(position).await;
                        Ok(())
                    }
                    Event::Volume(volume) => {
                        session.change_volume(volume).await;
                        Ok(())
                    }
                    Event::TransposeUp => session
                        .transpose(Direction::Up)
                        .await
                        .map_err(|e| e.into()),
                    Event::TransposeDown => session
                        .transpose(Direction::Down)
                        .await
                        .map_err(|e| e.into()),
                    Event::Open(track_id) => match catalog.get(&track_id) {
                        Ok(track) => {
                            session.open_transposer(track).await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    Event::Close => {
                        session.close_transposer().await;
                        Ok(())
                    }
                    Event::Stop => {
                        session.stop_track().await;
                        Ok(())
                    }
                    Event::Status => {
                        println!("{}", session.describe());
                        Ok(())
                    }
                } {
                    error!("Error talking to session: {}", e);
                }
            } else {
                info!("Controller closing.");
                if let Err(e) = join_handle.await {
                    error!("Error waiting for event monitor to stop: {}", e);
                }
                return;
            }
        }
    }
}

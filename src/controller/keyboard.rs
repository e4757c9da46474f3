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
use std::io;
use std::time::Duration;

use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{info, span, warn, Level};

use super::Event;

const PLAY: &str = "play";
const PAUSE: &str = "pause";
const SEEK: &str = "seek";
const VOLUME: &str = "vol";
const UP: &str = "up";
const DOWN: &str = "down";
const OPEN: &str = "open";
const CLOSE: &str = "close";
const STOP: &str = "stop";
const STATUS: &str = "status";
const QUIT: &str = "quit";

/// A controller that drives a playback session using the keyboard.
pub struct Driver {}

impl Driver {
    pub fn new() -> Driver {
        Driver {}
    }

    /// Reads and dispatches one command line. Returns false when the input
    /// ends or the user quits.
    fn monitor_io<R, W>(
        events_tx: &Sender<Event>,
        mut reader: R,
        mut writer: W,
    ) -> Result<bool, io::Error>
    where
        R: io::BufRead,
        W: io::Write,
    {
        write!(
            writer,
            "Command ({} <id>, {}, {} <secs>, {} <volume>, {}, {}, {} <id>, {}, {}, {}, {}): ",
            PLAY, PAUSE, SEEK, VOLUME, UP, DOWN, OPEN, CLOSE, STOP, STATUS, QUIT,
        )?;
        writer.flush()?;
        let mut input: String = String::default();
        if reader.read_line(&mut input)? == 0 {
            return Ok(false);
        }

        let input = input.trim();
        let (command, arg) = match input.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, Some(arg.trim())),
            None => (input, None),
        };

        let event = match (command.to_lowercase().as_str(), arg) {
            (PLAY, Some(track_id)) => Some(Event::Play(track_id.to_string())),
            (PAUSE, None) => Some(Event::Pause),
            (SEEK, Some(seconds)) => match seconds.parse::<f64>() {
                Ok(seconds) if seconds >= 0.0 && seconds.is_finite() => {
                    Some(Event::Seek(Duration::from_secs_f64(seconds)))
                }
                _ => {
                    warn!(input = seconds, "Unrecognized seek position");
                    None
                }
            },
            (VOLUME, Some(volume)) => match volume.parse::<f32>() {
                Ok(volume) => Some(Event::Volume(volume)),
                Err(_) => {
                    warn!(input = volume, "Unrecognized volume");
                    None
                }
            },
            (UP, None) => Some(Event::TransposeUp),
            (DOWN, None) => Some(Event::TransposeDown),
            (OPEN, Some(track_id)) => Some(Event::Open(track_id.to_string())),
            (CLOSE, None) => Some(Event::Close),
            (STOP, None) => Some(Event::Stop),
            (STATUS, None) => Some(Event::Status),
            (QUIT, None) => return Ok(false),
            _ => {
                warn!(input = input, "Unrecognized input");
                None
            }
        };

        if let Some(event) = event {
            events_tx
                .blocking_send(event)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(true)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Driver for Driver {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>> {
        tokio::task::spawn_blocking(move || {
            let span = span!(Level::INFO, "keyboard driver");
            let _enter = span.enter();

            info!("Keyboard driver started.");

            while Self::monitor_io(&events_tx, io::stdin().lock(), io::stdout())? {}
            Ok(())
        })
    }
}

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
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use duration_string::DurationString;
use serde::Deserialize;

use crate::audio;
use crate::controller::{keyboard, Controller};
use crate::pitch::PitchShifter;
use crate::session::Session;
use crate::track::{Catalog, Track};
use crate::transport::Transport;

const DEFAULT_AUDIO_PLAYBACK_DELAY: Duration = Duration::ZERO;
const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_VOLUME: f32 = 1.0;

/// Typed error for config load/parse failures so callers can distinguish
/// file-not-found from parse errors without string matching.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Error parsing file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yml::Error,
    },
}

/// A YAML representation of the audio configuration.
#[derive(Deserialize, Clone)]
pub struct Audio {
    /// The audio device.
    device: String,

    /// Controls how long to wait before playback of an audio resource starts.
    playback_delay: Option<String>,

    /// Target sample rate in Hz (default: 44100).
    sample_rate: Option<u32>,
}

impl Audio {
    /// New will create a new Audio configuration.
    pub fn new(device: &str) -> Audio {
        Audio {
            device: device.to_string(),
            playback_delay: None,
            sample_rate: None,
        }
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the playback delay from the configuration.
    pub fn playback_delay(&self) -> Result<Duration, Box<dyn Error>> {
        match &self.playback_delay {
            Some(playback_delay) => Ok(DurationString::from_string(playback_delay.clone())?.into()),
            None => Ok(DEFAULT_AUDIO_PLAYBACK_DELAY),
        }
    }

    /// Returns the target sample rate (default: 44100).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }
}

/// A YAML representation of a catalog track.
#[derive(Deserialize)]
struct RawTrack {
    /// The catalog identifier of the track.
    id: String,
    /// The display title of the track.
    title: String,
    /// The audio resource, relative to the catalog file or absolute.
    file: String,
    /// The musical key as written by the producer.
    key: String,
    /// The tempo in beats per minute.
    bpm: u32,
    /// The duration of the track in seconds.
    duration_seconds: f64,
    /// The cover image resource.
    cover_image: Option<String>,
    /// The producer name.
    producer: Option<String>,
    /// The listing price.
    price: Option<f64>,
}

impl RawTrack {
    /// Converts the YAML representation into a catalog track. Relative file
    /// paths resolve against the catalog file's directory.
    fn to_track(self, base: &Path) -> Result<Track, Box<dyn Error>> {
        let file = PathBuf::from(&self.file);
        let file = if file.is_absolute() {
            file
        } else {
            base.join(file)
        };

        Track::new(
            self.id,
            self.title,
            file,
            self.key,
            self.bpm,
            Duration::from_secs_f64(self.duration_seconds),
            self.cover_image,
            self.producer,
            self.price,
        )
    }
}

/// The configuration for the preview player.
#[derive(Deserialize)]
struct Player {
    /// The audio configuration.
    audio: Audio,
    /// The path to the track catalog, relative to this file or absolute.
    catalog: String,
    /// The initial volume, in [0, 1].
    default_volume: Option<f32>,
}

/// Parses a track catalog from a YAML file. Each document in the file is one
/// track.
pub fn parse_catalog(file: &PathBuf) -> Result<Arc<Catalog>, Box<dyn Error>> {
    let contents = fs::read_to_string(file).map_err(|e| ConfigError::Read {
        path: file.clone(),
        source: e,
    })?;
    let base = file
        .canonicalize()?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut tracks: HashMap<String, Arc<Track>> = HashMap::new();
    for document in serde_yml::Deserializer::from_str(&contents) {
        let raw = RawTrack::deserialize(document).map_err(|e| ConfigError::Parse {
            path: file.clone(),
            source: e,
        })?;
        let track = raw.to_track(&base)?;
        tracks.insert(track.id.clone(), Arc::new(track));
    }

    Ok(Arc::new(Catalog::new(tracks)))
}

/// Initializes the playback session and controller from the given config file
/// and returns the controller. The controller owns the session and can be
/// waited on until the interactive driver exits.
pub fn init_session_and_controller(config_path: &PathBuf) -> Result<Controller, Box<dyn Error>> {
    let contents = fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
        path: config_path.clone(),
        source: e,
    })?;
    let player: Player = serde_yml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: config_path.clone(),
        source: e,
    })?;

    let base = config_path
        .canonicalize()?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let catalog_path = PathBuf::from(&player.catalog);
    let catalog_path = if catalog_path.is_absolute() {
        catalog_path
    } else {
        base.join(catalog_path)
    };
    let catalog = parse_catalog(&catalog_path)?;

    let device = audio::get_device(Some(&player.audio))?;
    let volume = player
        .default_volume
        .unwrap_or(DEFAULT_VOLUME)
        .clamp(0.0, 1.0);

    let transport = Arc::new(Transport::new(device.clone(), volume));
    let pitch = Arc::new(PitchShifter::new(device));
    let session = Session::new(transport, pitch);

    Controller::new(session, catalog, Arc::new(keyboard::Driver::new()))
}

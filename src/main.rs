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
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};

use beatdeck::audio;
use beatdeck::config::{self, Audio};
use beatdeck::keys;
use beatdeck::pitch::PitchShifter;
use beatdeck::session::{self, Direction, Session, MAX_OFFSET, MIN_OFFSET};
use beatdeck::track::Track;
use beatdeck::transport::Transport;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A beat preview player with semitone transposition."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists and verifies all tracks in the given catalog.
    Tracks {
        /// The path to the track catalog.
        catalog_path: String,
    },
    /// Lists the available audio output devices.
    Devices {},
    /// Prints the transposition metadata for a track.
    Meta {
        /// The path to the track catalog.
        catalog_path: String,
        /// The id of the track.
        track_id: String,
        /// A single semitone offset. All offsets are shown when absent.
        #[arg(short, long)]
        semitones: Option<i32>,
    },
    /// Plays a track through the audio interface.
    Play {
        /// The device name to play through.
        device_name: String,
        /// The path to the track catalog.
        catalog_path: String,
        /// The id of the track to play.
        track_id: String,
        /// The semitone offset to play at.
        #[arg(short, long, default_value_t = 0)]
        semitones: i32,
    },
    /// Start will start the interactive preview session.
    Start {
        /// The path to the player config.
        config_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tracks { catalog_path } => {
            let catalog = config::parse_catalog(&PathBuf::from(&catalog_path))?;

            if catalog.is_empty() {
                println!("No tracks found in {}.", catalog_path.as_str());
                return Ok(());
            }

            println!("Tracks (count: {}):", catalog.len());
            for track in catalog.sorted_list() {
                if track.verify() {
                    println!("- {}", track);
                } else {
                    println!("- {} [missing audio: {}]", track, track.file().display());
                }
            }
        }
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Meta {
            catalog_path,
            track_id,
            semitones,
        } => {
            let catalog = config::parse_catalog(&PathBuf::from(&catalog_path))?;
            let track = catalog.get(&track_id)?;

            println!("{}", track);
            println!("{:>7}  {:<4} {:>4}  {:>8}  {:>7}", "offset", "key", "bpm", "duration", "ratio");
            let offsets = match semitones {
                Some(semitones) => semitones..=semitones,
                None => MIN_OFFSET..=MAX_OFFSET,
            };
            for offset in offsets {
                let meta =
                    keys::transpose_metadata(track.key(), track.bpm(), track.duration(), offset);
                println!(
                    "{:>+7}  {:<4} {:>4}  {:>8}  {:>7.4}",
                    offset,
                    meta.key,
                    meta.bpm,
                    format_duration(meta.duration),
                    meta.pitch_ratio,
                );
            }
        }
        Commands::Play {
            device_name,
            catalog_path,
            track_id,
            semitones,
        } => {
            let catalog = config::parse_catalog(&PathBuf::from(&catalog_path))?;
            let track = catalog.get(&track_id)?;

            let device = audio::get_device(Some(&Audio::new(&device_name)))?;
            let transport = Arc::new(Transport::new(device.clone(), 1.0));
            let pitch = Arc::new(PitchShifter::new(device));
            let session = Session::new(transport, pitch);

            play(&session, track, semitones).await?;
        }
        Commands::Start { config_path } => {
            config::init_session_and_controller(&PathBuf::from(config_path))?
                .join()
                .await?;
        }
    }

    Ok(())
}

/// Plays a single track, printing progress until playback ends.
async fn play(session: &Session, track: Arc<Track>, semitones: i32) -> Result<(), Box<dyn Error>> {
    if semitones != 0 {
        session.open_transposer(track.clone()).await;
        while session.is_loading() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let direction = if semitones > 0 {
            Direction::Up
        } else {
            Direction::Down
        };
        for _ in 0..semitones.abs() {
            session.transpose(direction).await?;
        }

        if let Some(meta) = session.transposed_metadata() {
            println!(
                "Transposed {:+}: {} {} BPM {}",
                semitones,
                meta.key,
                meta.bpm,
                format_duration(meta.duration),
            );
        }
    }

    session.play_track(track.clone()).await?;

    let mut progress = session.subscribe_progress();
    loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let progress = *progress.borrow_and_update();
                print!(
                    "\r{} / {}",
                    format_duration(progress.elapsed),
                    format_duration(progress.duration),
                );
                std::io::stdout().flush()?;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if session.state() == session::State::Idle {
                    break;
                }
            }
        }
    }
    println!();

    if let Some(error) = session.last_error() {
        return Err(error.into());
    }
    Ok(())
}

/// Formats a duration as minutes:seconds.
fn format_duration(duration: Duration) -> String {
    let minutes = duration.as_secs() / 60;
    let secs = duration.as_secs() - minutes * 60;
    format!("{}:{:02}", minutes, secs)
}

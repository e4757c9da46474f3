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
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use std::{error::Error, fmt, sync::Arc};

use tokio::sync::watch;

use crate::config;
use crate::playsync::CancelHandle;

pub mod cpal;
pub mod decode;
pub mod mock;
pub mod source;

/// A pending-seek sentinel meaning "no seek requested".
const NO_SEEK: u64 = u64::MAX;

/// A progress update pushed by the rendering device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    /// The elapsed position in source time.
    pub elapsed: Duration,
    /// The total duration of the loaded resource.
    pub duration: Duration,
}

/// Shared transport controls between a render owner and the device doing the
/// rendering. The owner flips flags; the device honors them at each chunk
/// boundary and pushes position updates back on its own cadence.
pub struct Controls {
    /// When set, the device renders silence and holds position.
    paused: AtomicBool,
    /// True whenever the device is not actively producing audible output.
    /// Used to hand the output over to another engine without overlap.
    quiescent: AtomicBool,
    /// The volume in [0, 1], stored as f32 bits.
    volume: AtomicU32,
    /// A pending seek target in source-time nanoseconds. NO_SEEK when empty.
    seek_nanos: AtomicU64,
    /// The current position in source frames.
    position_frames: AtomicU64,
    /// Pushed progress updates.
    progress: watch::Sender<Progress>,
}

impl Controls {
    /// Creates new controls at the given initial volume.
    pub fn new(volume: f32) -> Controls {
        let (progress, _) = watch::channel(Progress::default());
        Controls {
            paused: AtomicBool::new(false),
            quiescent: AtomicBool::new(true),
            volume: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            seek_nanos: AtomicU64::new(NO_SEEK),
            position_frames: AtomicU64::new(0),
            progress,
        }
    }

    /// Pauses or unpauses the render.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Returns true if the render is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Marks whether the device is currently producing audible output.
    /// Devices call this; owners only read it.
    pub fn set_quiescent(&self, quiescent: bool) {
        self.quiescent.store(quiescent, Ordering::Release);
    }

    /// Returns true when no audible output is being produced.
    pub fn is_quiescent(&self) -> bool {
        self.quiescent.load(Ordering::Acquire)
    }

    /// Sets the volume, clamped to [0, 1].
    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    /// Returns the current volume.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    /// Requests a seek to the given position in source time.
    pub fn request_seek(&self, position: Duration) {
        self.seek_nanos
            .store(position.as_nanos().min(NO_SEEK as u128 - 1) as u64, Ordering::Release);
    }

    /// Takes a pending seek request, if any.
    pub fn take_seek(&self) -> Option<Duration> {
        let nanos = self.seek_nanos.swap(NO_SEEK, Ordering::AcqRel);
        if nanos == NO_SEEK {
            None
        } else {
            Some(Duration::from_nanos(nanos))
        }
    }

    /// Records the current position in source frames.
    pub fn set_position(&self, frames: u64) {
        self.position_frames.store(frames, Ordering::Release);
    }

    /// Returns the current position in source frames.
    pub fn position(&self) -> u64 {
        self.position_frames.load(Ordering::Acquire)
    }

    /// Pushes a progress update to subscribers.
    pub fn publish(&self, progress: Progress) {
        self.progress.send_replace(progress);
    }

    /// Subscribes to pushed progress updates.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }
}

pub trait Device: Any + fmt::Display + Send + Sync {
    /// Renders the source until it is exhausted or the handle is cancelled,
    /// honoring the shared controls throughout. Blocks for the lifetime of
    /// the render.
    fn render(
        &self,
        source: source::BufferSource,
        controls: Arc<Controls>,
        cancel_handle: CancelHandle,
    ) -> Result<(), Box<dyn Error>>;

    /// The output sample rate of the device. Render sources are stepped by
    /// `source_rate / device_rate` to play at the original speed.
    fn sample_rate(&self) -> u32;
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, Box<dyn Error>> {
    cpal::Device::list()
}

/// Gets a device with the given name.
pub fn get_device(config: Option<&config::Audio>) -> Result<Arc<dyn Device>, Box<dyn Error>> {
    let config = match config {
        Some(config) => config,
        None => return Err("there must be an audio device specified".into()),
    };

    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(device)));
    };

    Ok(Arc::new(cpal::Device::get(config)?))
}

#[cfg(test)]
pub use mock as test;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controls_volume_clamps() {
        let controls = Controls::new(0.8);
        assert!((controls.volume() - 0.8).abs() < 1e-6);

        controls.set_volume(1.7);
        assert_eq!(1.0, controls.volume());

        controls.set_volume(-0.3);
        assert_eq!(0.0, controls.volume());
    }

    #[test]
    fn test_controls_seek_handoff() {
        let controls = Controls::new(1.0);
        assert!(controls.take_seek().is_none());

        controls.request_seek(Duration::from_secs(42));
        assert_eq!(Some(Duration::from_secs(42)), controls.take_seek());
        assert!(controls.take_seek().is_none());
    }

    #[test]
    fn test_controls_progress_pushes() {
        let controls = Controls::new(1.0);
        let rx = controls.subscribe();

        let progress = Progress {
            elapsed: Duration::from_secs(3),
            duration: Duration::from_secs(10),
        };
        controls.publish(progress);
        assert_eq!(progress, *rx.borrow());
    }

    #[test]
    fn test_get_device_mock_prefix() {
        let config = config::Audio::new("mock-device");
        assert!(get_device(Some(&config)).is_ok());
        assert!(get_device(None).is_err());
    }
}

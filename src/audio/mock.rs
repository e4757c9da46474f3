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
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{info, span, Level};

use crate::audio::{source::BufferSource, Controls, Progress};
use crate::playsync::CancelHandle;

/// How many output frames the mock consumes per tick.
const CHUNK_FRAMES: usize = 441;

/// A mock device. Doesn't produce any real audio, but honors the controls
/// the way a real device would, at an accelerated pace.
#[derive(Clone)]
pub struct Device {
    name: String,
    /// The number of renders currently producing audible output.
    audible: Arc<AtomicUsize>,
    /// The most renders ever observed audible at once.
    max_audible: Arc<AtomicUsize>,
    /// The step of the most recently started render.
    last_step: Arc<Mutex<Option<f64>>>,
    /// How much faster than real time the mock consumes audio.
    time_scale: u32,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            audible: Arc::new(AtomicUsize::new(0)),
            max_audible: Arc::new(AtomicUsize::new(0)),
            last_step: Arc::new(Mutex::new(None)),
            time_scale: 50,
        }
    }

    /// Returns true if the device is currently rendering audible output.
    pub fn is_playing(&self) -> bool {
        self.audible.load(Ordering::Acquire) > 0
    }

    /// The most renders ever observed audible at once.
    pub fn max_audible(&self) -> usize {
        self.max_audible.load(Ordering::Acquire)
    }

    /// Resets the audible high-water mark.
    pub fn reset_max_audible(&self) {
        self.max_audible.store(0, Ordering::Release);
    }

    /// The step of the most recently started render, if any.
    pub fn last_step(&self) -> Option<f64> {
        *self.last_step.lock()
    }

    fn mark_audible(&self, counted: &mut bool, controls: &Controls) {
        if !*counted {
            let now = self.audible.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_audible.fetch_max(now, Ordering::AcqRel);
            controls.set_quiescent(false);
            *counted = true;
        }
    }

    fn mark_quiescent(&self, counted: &mut bool, controls: &Controls) {
        if *counted {
            self.audible.fetch_sub(1, Ordering::AcqRel);
            *counted = false;
        }
        controls.set_quiescent(true);
    }
}

impl crate::audio::Device for Device {
    /// Consumes the source at an accelerated pace, honoring pause, seek,
    /// volume and cancellation at every chunk boundary.
    fn render(
        &self,
        mut source: BufferSource,
        controls: Arc<Controls>,
        cancel_handle: CancelHandle,
    ) -> Result<(), Box<dyn Error>> {
        let span = span!(Level::INFO, "render (mock)");
        let _enter = span.enter();

        let duration = source.decoded().duration();
        info!(
            device = self.name,
            step = source.step(),
            duration = format!("{:?}", duration),
            "Rendering source."
        );

        *self.last_step.lock() = Some(source.step());

        let tick = Duration::from_millis(10) / self.time_scale;
        let mut buffer = vec![0.0f32; CHUNK_FRAMES * 2];
        let mut counted = false;

        loop {
            if cancel_handle.is_cancelled() {
                break;
            }

            if let Some(position) = controls.take_seek() {
                let rate = source.decoded().sample_rate() as f64;
                source.seek_to_frame((position.as_secs_f64() * rate) as u64);
                controls.set_position(source.position_frames());
                controls.publish(Progress {
                    elapsed: source.position(),
                    duration,
                });
            }

            if controls.is_paused() {
                self.mark_quiescent(&mut counted, &controls);
                thread::sleep(tick);
                continue;
            }

            self.mark_audible(&mut counted, &controls);
            let written = source.fill_stereo(&mut buffer, controls.volume());
            controls.set_position(source.position_frames());
            controls.publish(Progress {
                elapsed: source.position(),
                duration,
            });

            if written < CHUNK_FRAMES {
                break;
            }
            thread::sleep(tick);
        }

        self.mark_quiescent(&mut counted, &controls);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        44100
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

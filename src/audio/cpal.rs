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
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info, span, Level};

use crate::audio::{source::BufferSource, Controls, Device as AudioDevice, Progress};
use crate::config;
use crate::playsync::CancelHandle;

/// A small wrapper around a cpal::Device. Renders decoded buffers as a
/// stereo f32 output stream.
pub struct Device {
    /// The name of the device.
    name: String,
    /// Controls how long to wait before a render starts.
    playback_delay: Duration,
    /// The stream sample rate.
    sample_rate: u32,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.host_id.name())
    }
}

impl Device {
    /// Lists cpal devices and produces the Device trait.
    pub fn list() -> Result<Vec<Box<dyn AudioDevice>>, Box<dyn Error>> {
        Ok(Device::list_cpal_devices()?
            .into_iter()
            .map(|device| {
                let device: Box<dyn AudioDevice> = Box::new(device);
                device
            })
            .collect())
    }

    /// Lists cpal devices that have at least one output configuration.
    fn list_cpal_devices() -> Result<Vec<Device>, Box<dyn Error>> {
        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host_devices = match cpal::host_from_id(host_id)?.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let has_output = device
                    .supported_output_configs()
                    .map(|mut configs| configs.next().is_some())
                    .unwrap_or(false);
                if !has_output {
                    continue;
                }

                devices.push(Device {
                    name: device.name()?,
                    playback_delay: Duration::ZERO,
                    sample_rate: 44100,
                    host_id,
                    device,
                });
            }
        }

        Ok(devices)
    }

    /// Gets the device with the name in the given configuration.
    pub fn get(config: &config::Audio) -> Result<Device, Box<dyn Error>> {
        let name = config.device();
        let mut device = Device::list_cpal_devices()?
            .into_iter()
            .find(|device| device.name == name)
            .ok_or_else(|| format!("unable to find audio device {}", name))?;

        device.playback_delay = config.playback_delay()?;
        device.sample_rate = config.sample_rate();
        Ok(device)
    }
}

impl AudioDevice for Device {
    /// Renders the source through a stereo f32 output stream. The stream
    /// callback honors the controls; this call blocks until the source is
    /// exhausted or the handle is cancelled.
    fn render(
        &self,
        mut source: BufferSource,
        controls: Arc<Controls>,
        cancel_handle: CancelHandle,
    ) -> Result<(), Box<dyn Error>> {
        let span = span!(Level::INFO, "render (cpal)");
        let _enter = span.enter();

        if !self.playback_delay.is_zero() {
            info!(
                delay = format!("{:?}", self.playback_delay),
                "Delaying render start."
            );
            thread::sleep(self.playback_delay);
        }

        let duration = source.decoded().duration();
        info!(
            device = self.name,
            step = source.step(),
            duration = format!("{:?}", duration),
            "Rendering source."
        );

        let stream_config = cpal::StreamConfig {
            channels: 2,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let finished = Arc::new(AtomicBool::new(false));
        let callback = {
            let controls = controls.clone();
            let cancel_handle = cancel_handle.clone();
            let finished = finished.clone();
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if cancel_handle.is_cancelled() || finished.load(Ordering::Acquire) {
                    data.fill(0.0);
                    controls.set_quiescent(true);
                    return;
                }

                if let Some(position) = controls.take_seek() {
                    let rate = source.decoded().sample_rate() as f64;
                    source.seek_to_frame((position.as_secs_f64() * rate) as u64);
                }

                if controls.is_paused() {
                    data.fill(0.0);
                    controls.set_quiescent(true);
                    return;
                }

                controls.set_quiescent(false);
                let frames = data.len() / 2;
                let written = source.fill_stereo(data, controls.volume());
                controls.set_position(source.position_frames());
                controls.publish(Progress {
                    elapsed: source.position(),
                    duration,
                });

                if written < frames {
                    controls.set_quiescent(true);
                    finished.store(true, Ordering::Release);
                    cancel_handle.notify();
                }
            }
        };

        let stream = self.device.build_output_stream(
            &stream_config,
            callback,
            |err| error!("cpal output stream error: {}", err),
            None,
        )?;
        stream.play()?;

        // Block until the source runs out or the render is cancelled.
        cancel_handle.wait(finished);
        drop(stream);
        controls.set_quiescent(true);

        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

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

//! Whole-file decoding into memory.
//!
//! Preview tracks are short, so the entire resource is decoded up front into
//! interleaved f32 samples. Both render paths (original speed and the rate
//! changed transposer) read from the same shared buffer.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::info;

/// Decode failures, split so callers can distinguish a missing resource from
/// a corrupt one. Neither is fatal and neither is retried.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Audio resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Failed to decode audio: {0}")]
    DecodeFailure(String),
}

/// A fully decoded audio resource. The sample data is stored in an Arc so
/// render sources can share it without copying.
#[derive(Clone)]
pub struct DecodedTrack {
    /// Interleaved f32 samples.
    samples: Arc<Vec<f32>>,
    /// Number of channels in the decoded data.
    channels: u16,
    /// Sample rate of the decoded data.
    sample_rate: u32,
}

impl DecodedTrack {
    /// Creates a decoded track from interleaved samples. Mostly useful for
    /// tests; real data comes from [`decode_file`].
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> DecodedTrack {
        DecodedTrack {
            samples: Arc::new(samples),
            channels,
            sample_rate,
        }
    }

    /// The interleaved sample data.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// The number of channels.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// The sample rate of the decoded data.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// The duration of the decoded data.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// The memory size of the sample data in bytes.
    pub fn memory_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

/// Decodes an entire audio file (WAV, MP3, FLAC, and whatever else symphonia
/// recognizes) into an interleaved f32 buffer.
pub fn decode_file<P: AsRef<Path>>(path: P) -> Result<DecodedTrack, DecodeError> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| DecodeError::ResourceUnavailable(format!("{}: {}", path.display(), e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    // A hint from the extension helps the probe guess the format.
    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();
    let probed = get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(|e| DecodeError::DecodeFailure(format!("'{}': {}", path.display(), e)))?;
    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::DecodeFailure("No audio track found".to_string()))?;
    let track_id = track.id;
    let params = &track.codec_params;

    let sample_rate = params
        .sample_rate
        .ok_or_else(|| DecodeError::DecodeFailure("Sample rate not specified".to_string()))?;
    // The channel count may be absent from the container; in that case it's
    // derived from the first decoded buffer.
    let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);

    let decoder_opts: DecoderOptions = Default::default();
    let mut decoder = get_codecs()
        .make(params, &decoder_opts)
        .map_err(|e| DecodeError::DecodeFailure(format!("'{}': {}", path.display(), e)))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            // Some decoders report EOF as a decode error.
            Err(SymphoniaError::DecodeError(_)) => break,
            Err(e) => return Err(DecodeError::DecodeFailure(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                decoder
                    .decode(&packet)
                    .map_err(|e| DecodeError::DecodeFailure(e.to_string()))?
            }
            Err(e) => return Err(DecodeError::DecodeFailure(e.to_string())),
        };

        let (packet_samples, packet_channels) = buffer_to_f32(decoded);
        if packet_channels > 0 && channels == 0 {
            channels = packet_channels as u16;
        }
        samples.extend_from_slice(&packet_samples);
    }

    if samples.is_empty() || channels == 0 {
        return Err(DecodeError::DecodeFailure(format!(
            "'{}': no audio data",
            path.display()
        )));
    }

    let decoded = DecodedTrack::new(samples, channels, sample_rate);
    info!(
        path = ?path,
        channels,
        sample_rate,
        duration_ms = decoded.duration().as_millis(),
        memory_kb = decoded.memory_size() / 1024,
        "Decoded audio resource"
    );
    Ok(decoded)
}

/// Converts a decoded buffer to interleaved f32 samples, returning the
/// channel count as observed in the buffer.
fn buffer_to_f32(decoded: AudioBufferRef) -> (Vec<f32>, usize) {
    match decoded {
        AudioBufferRef::F32(buf) => interleave(&buf, |sample| sample),
        AudioBufferRef::F64(buf) => interleave(&buf, |sample| sample as f32),
        AudioBufferRef::S8(buf) => interleave(&buf, scale_s8),
        AudioBufferRef::S16(buf) => interleave(&buf, scale_s16),
        AudioBufferRef::S24(buf) => interleave(&buf, |sample| scale_s24(sample.inner())),
        AudioBufferRef::S32(buf) => interleave(&buf, scale_s32),
        AudioBufferRef::U8(buf) => interleave(&buf, scale_u8),
        AudioBufferRef::U16(buf) => interleave(&buf, scale_u16),
        AudioBufferRef::U24(buf) => interleave(&buf, |sample| scale_u24(sample.inner())),
        AudioBufferRef::U32(buf) => interleave(&buf, scale_u32),
    }
}

/// Interleaves planar samples from a generic AudioBuffer. The closure
/// converts a single sample value to f32.
fn interleave<T, F>(buf: &AudioBuffer<T>, convert: F) -> (Vec<f32>, usize)
where
    T: symphonia::core::sample::Sample,
    F: Fn(T) -> f32,
{
    let frames = buf.frames();
    let channels = buf.spec().channels.count();
    let planes = buf.planes();
    let mut samples = Vec::with_capacity(frames * channels);
    for frame_idx in 0..frames {
        for ch_idx in 0..channels {
            samples.push(convert(planes.planes()[ch_idx][frame_idx]));
        }
    }
    (samples, channels)
}

// Scaling helpers for the integer formats.

#[inline]
fn scale_s8(sample: i8) -> f32 {
    sample as f32 / (1i64 << 7) as f32
}

#[inline]
fn scale_s16(sample: i16) -> f32 {
    sample as f32 / (1i64 << 15) as f32
}

#[inline]
fn scale_s24(sample: i32) -> f32 {
    sample as f32 / (1i64 << 23) as f32
}

#[inline]
fn scale_s32(sample: i32) -> f32 {
    sample as f32 / (1i64 << 31) as f32
}

#[inline]
fn scale_u8(sample: u8) -> f32 {
    (sample as f32 / u8::MAX as f32) * 2.0 - 1.0
}

#[inline]
fn scale_u16(sample: u16) -> f32 {
    (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
}

#[inline]
fn scale_u24(sample: u32) -> f32 {
    let max = (1u32 << 24) - 1;
    (sample as f32 / max as f32) * 2.0 - 1.0
}

#[inline]
fn scale_u32(sample: u32) -> f32 {
    (sample as f32 / u32::MAX as f32) * 2.0 - 1.0
}

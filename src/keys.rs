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

//! Key normalization and transposition metadata.
//!
//! Everything in here is pure. Key names are canonicalized to `{Letter}[#][m]`
//! (sharp spelling, `m` suffix for natural minor) before rotating through the
//! chromatic scale.

use std::time::Duration;

/// The chromatic scale with sharp spelling, used as the canonical progression
/// for every recognized key.
const CHROMATIC: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A key name after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedKey {
    /// A recognized major or natural-minor key, reduced to its pitch class.
    Recognized {
        /// Semitone index into the chromatic scale (0 = C).
        semitone: usize,
        /// True for minor keys.
        minor: bool,
    },
    /// Anything that couldn't be read as a key. Callers pass the original
    /// string through unchanged rather than treating this as an error.
    Unrecognized,
}

impl NormalizedKey {
    /// Renders the canonical `{Letter}[#][m]` spelling, or None when the key
    /// was unrecognized.
    pub fn canonical(&self) -> Option<String> {
        match self {
            NormalizedKey::Recognized { semitone, minor } => {
                let mut name = CHROMATIC[*semitone].to_string();
                if *minor {
                    name.push('m');
                }
                Some(name)
            }
            NormalizedKey::Unrecognized => None,
        }
    }
}

/// Normalizes a key string. Accepts sharp/flat ASCII and Unicode accidentals
/// and the usual mode suffixes: `Am`, `A min`, `A minor`, `Bb major`, `E♭`.
pub fn normalize_key(key: &str) -> NormalizedKey {
    let key = key.trim();
    let mut chars = key.chars();

    let letter = match chars.next() {
        Some(c) => c.to_ascii_uppercase(),
        None => return NormalizedKey::Unrecognized,
    };
    let base: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return NormalizedKey::Unrecognized,
    };

    let mut rest = chars.clone();
    let accidental = match rest.next() {
        Some('#') | Some('♯') => 1,
        Some('b') | Some('♭') => -1,
        _ => {
            rest = chars;
            0
        }
    };

    let suffix: String = rest.collect();
    let minor = match suffix.trim().to_lowercase().as_str() {
        "" | "maj" | "major" => false,
        "m" | "min" | "minor" => true,
        _ => return NormalizedKey::Unrecognized,
    };

    NormalizedKey::Recognized {
        semitone: (base + accidental).rem_euclid(12) as usize,
        minor,
    }
}

/// Returns the pitch ratio for a semitone offset: `2^(semitones/12)`.
/// Exactly 1 at zero.
pub fn pitch_ratio(semitones: i32) -> f64 {
    if semitones == 0 {
        return 1.0;
    }
    2f64.powf(semitones as f64 / 12.0)
}

/// Transposes a key name by the given number of semitones. Unrecognized keys
/// are returned unchanged.
pub fn transpose_key(key: &str, semitones: i32) -> String {
    match normalize_key(key) {
        NormalizedKey::Recognized { semitone, minor } => {
            let rotated = (semitone as i32 + semitones).rem_euclid(12) as usize;
            let mut name = CHROMATIC[rotated].to_string();
            if minor {
                name.push('m');
            }
            name
        }
        NormalizedKey::Unrecognized => key.to_string(),
    }
}

/// The displayed metadata for a track at a given semitone offset.
#[derive(Debug, Clone, PartialEq)]
pub struct TransposedMetadata {
    /// The transposed key name, or the original string if it wasn't readable.
    pub key: String,
    /// The tempo after the rate change, rounded to the nearest BPM.
    pub bpm: u32,
    /// The playback duration after the rate change.
    pub duration: Duration,
    /// The applied pitch ratio.
    pub pitch_ratio: f64,
}

/// Computes the metadata shown for a transposed rendition. Resampling-based
/// transposition changes speed along with pitch, so tempo scales up and
/// duration scales down by the same ratio.
pub fn transpose_metadata(
    key: &str,
    bpm: u32,
    duration: Duration,
    semitones: i32,
) -> TransposedMetadata {
    if semitones == 0 {
        return TransposedMetadata {
            key: key.to_string(),
            bpm,
            duration,
            pitch_ratio: 1.0,
        };
    }

    let ratio = pitch_ratio(semitones);
    TransposedMetadata {
        key: transpose_key(key, semitones),
        bpm: (bpm as f64 * ratio).round() as u32,
        duration: Duration::from_secs_f64(duration.as_secs_f64() / ratio),
        pitch_ratio: ratio,
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_pitch_ratio() {
        assert_eq!(1.0, pitch_ratio(0));
        for semitones in -2..=2 {
            let expected = 2f64.powf(semitones as f64 / 12.0);
            assert!((pitch_ratio(semitones) - expected).abs() < 1e-12);
        }
        // An octave doubles the rate.
        assert!((pitch_ratio(12) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(
            NormalizedKey::Recognized {
                semitone: 0,
                minor: false
            },
            normalize_key("C")
        );
        assert_eq!(Some("C#".to_string()), normalize_key("Db").canonical());
        assert_eq!(Some("A#".to_string()), normalize_key("Bb major").canonical());
        assert_eq!(Some("Am".to_string()), normalize_key("A minor").canonical());
        assert_eq!(Some("F#m".to_string()), normalize_key("f# min").canonical());
        assert_eq!(Some("D#".to_string()), normalize_key("E♭").canonical());
        assert_eq!(Some("C#m".to_string()), normalize_key("C♯m").canonical());
        assert_eq!(NormalizedKey::Unrecognized, normalize_key(""));
        assert_eq!(NormalizedKey::Unrecognized, normalize_key("H"));
        assert_eq!(NormalizedKey::Unrecognized, normalize_key("C mixolydian"));
    }

    #[test]
    fn test_transpose_key() {
        assert_eq!("D", transpose_key("C", 2));
        assert_eq!("A#", transpose_key("C", -2));
        assert_eq!("Bm", transpose_key("Am", 2));
        assert_eq!("C", transpose_key("B", 1));
        assert_eq!("B", transpose_key("C", -1));
        assert_eq!("D", transpose_key("C", 14));
        // Unrecognized keys pass through untouched.
        assert_eq!("dorian", transpose_key("dorian", 2));
    }

    #[test]
    fn test_transpose_metadata_identity() {
        let meta = transpose_metadata("C", 120, Duration::from_secs(180), 0);
        assert_eq!("C", meta.key);
        assert_eq!(120, meta.bpm);
        assert_eq!(Duration::from_secs(180), meta.duration);
        assert_eq!(1.0, meta.pitch_ratio);
    }

    #[test]
    fn test_transpose_metadata_up_two() {
        let meta = transpose_metadata("C", 120, Duration::from_secs(180), 2);
        assert_eq!("D", meta.key);
        // round(120 * 2^(2/12)) = round(134.67...) = 135.
        assert_eq!(135, meta.bpm);
        assert!((meta.duration.as_secs_f64() - 160.4).abs() < 0.1);
    }

    #[test]
    fn test_duration_round_trip() {
        for semitones in -2..=2 {
            let duration = Duration::from_secs_f64(213.7);
            let meta = transpose_metadata("G#m", 98, duration, semitones);
            let restored = meta.duration.as_secs_f64() * meta.pitch_ratio;
            assert!((restored - duration.as_secs_f64()).abs() < 1e-6);
        }
    }
}

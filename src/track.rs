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
use core::fmt;
use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A beat as supplied by the catalog: a single audio resource plus the
/// metadata shown on its card. Immutable once loaded.
pub struct Track {
    /// The catalog identifier of the track.
    pub id: String,
    /// The display title of the track.
    pub title: String,
    /// The audio resource on disk.
    file: PathBuf,
    /// The musical key as written by the producer, e.g. "C#" or "Am".
    key: String,
    /// The tempo in beats per minute.
    bpm: u32,
    /// The total duration of the track.
    duration: Duration,
    /// The cover image resource, if any.
    cover_image: Option<String>,
    /// The producer name, if any.
    producer: Option<String>,
    /// The listing price, if any.
    price: Option<f64>,
}

impl Track {
    /// Creates a new track, validating the metadata the catalog handed us.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        title: String,
        file: PathBuf,
        key: String,
        bpm: u32,
        duration: Duration,
        cover_image: Option<String>,
        producer: Option<String>,
        price: Option<f64>,
    ) -> Result<Track, Box<dyn Error>> {
        if id.is_empty() {
            return Err("track id must not be empty".into());
        }
        if bpm == 0 {
            return Err(format!("track {} has a zero BPM", id).into());
        }
        if duration.is_zero() {
            return Err(format!("track {} has a zero duration", id).into());
        }

        Ok(Track {
            id,
            title,
            file,
            key,
            bpm,
            duration,
            cover_image,
            producer,
            price,
        })
    }

    /// The audio resource path.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// The musical key as supplied by the catalog.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tempo in beats per minute.
    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    /// The total duration of the track.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The duration in a minutes:seconds format.
    pub fn duration_string(&self) -> String {
        let minutes = self.duration.as_secs() / 60;
        let secs = self.duration.as_secs() - minutes * 60;
        format!("{}:{:02}", minutes, secs)
    }

    /// The cover image resource, if any.
    pub fn cover_image(&self) -> Option<&str> {
        self.cover_image.as_deref()
    }

    /// The producer name, if any.
    pub fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }

    /// The listing price, if any.
    pub fn price(&self) -> Option<f64> {
        self.price
    }

    /// Returns true when the audio resource exists on disk. Used by catalog
    /// verification; playback reports its own errors.
    pub fn verify(&self) -> bool {
        self.file.is_file()
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) [{} {} BPM {}]",
            self.title,
            self.id,
            self.key,
            self.bpm,
            self.duration_string(),
        )?;
        if let Some(producer) = &self.producer {
            write!(f, " by {}", producer)?;
        }
        Ok(())
    }
}

/// Catalog is a registry of tracks keyed by id.
pub struct Catalog {
    tracks: HashMap<String, Arc<Track>>,
}

impl Catalog {
    /// Creates a new track catalog.
    pub fn new(tracks: HashMap<String, Arc<Track>>) -> Catalog {
        Catalog { tracks }
    }

    /// Returns true if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Gets a track from the catalog.
    pub fn get(&self, id: &str) -> Result<Arc<Track>, Box<dyn Error>> {
        match self.tracks.get(id) {
            Some(track) => Ok(Arc::clone(track)),
            None => Err(format!("unable to find track {}", id).into()),
        }
    }

    /// Returns an unsorted list of tracks in the catalog.
    pub fn list(&self) -> Vec<Arc<Track>> {
        self.tracks.values().cloned().collect()
    }

    /// Returns a list of tracks sorted by title.
    pub fn sorted_list(&self) -> Vec<Arc<Track>> {
        let mut sorted = self.list();
        sorted.sort_by_key(|track| track.title.clone());
        sorted
    }

    /// Returns the number of tracks in the catalog.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

    use super::{Catalog, Track};

    fn track(id: &str, title: &str) -> Track {
        Track::new(
            id.to_string(),
            title.to_string(),
            PathBuf::from(format!("{}.wav", id)),
            "C".to_string(),
            120,
            Duration::from_secs(185),
            None,
            Some("prod".to_string()),
            Some(19.99),
        )
        .expect("expected valid track")
    }

    #[test]
    fn test_track_validation() {
        assert!(Track::new(
            String::new(),
            "title".to_string(),
            PathBuf::from("a.wav"),
            "C".to_string(),
            120,
            Duration::from_secs(10),
            None,
            None,
            None,
        )
        .is_err());
        assert!(Track::new(
            "id".to_string(),
            "title".to_string(),
            PathBuf::from("a.wav"),
            "C".to_string(),
            0,
            Duration::from_secs(10),
            None,
            None,
            None,
        )
        .is_err());
    }

    #[test]
    fn test_duration_string() {
        assert_eq!("3:05", track("a", "A").duration_string());
    }

    #[test]
    fn test_catalog() {
        let mut tracks = HashMap::new();
        tracks.insert("b".to_string(), Arc::new(track("b", "Beta")));
        tracks.insert("a".to_string(), Arc::new(track("a", "Alpha")));
        let catalog = Catalog::new(tracks);

        assert_eq!(2, catalog.len());
        assert!(!catalog.is_empty());
        assert_eq!("Alpha", catalog.get("a").expect("expected track").title);
        assert!(catalog.get("missing").is_err());

        let sorted = catalog.sorted_list();
        assert_eq!("Alpha", sorted[0].title);
        assert_eq!("Beta", sorted[1].title);
    }
}

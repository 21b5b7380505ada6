//! Track identity and download information.
//!
//! A [`Track`] names a piece of music independent of how it is being played.
//! Its identity is the pair of [`Source`] and id: two tracks with the same
//! identity are the same track, even if their advisory metadata differs.
//!
//! The duration is only used to check whether two sources agree on what is
//! playing; it is never used for timing.

use std::{
    fmt,
    hash::{Hash, Hasher},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;

/// Where a track is known from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Source {
    Youtube,
    Yandex,
    Spotify,
    /// Whatever the local media session reports; no global id exists.
    Local,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Youtube => "Youtube",
            Self::Yandex => "Yandex",
            Self::Spotify => "Spotify",
            Self::Local => "Local",
        };
        write!(f, "{name}")
    }
}

/// An identified piece of music.
///
/// Immutable once constructed. Equality and hashing consider only the
/// identity (`source`, `id`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    pub source: Source,
    pub id: String,
    pub title: String,
    pub artist: String,
    pub duration_ms: u64,
}

impl Track {
    /// Builds a track for the local media session.
    ///
    /// Local sessions have no catalog id, so the id is derived from the
    /// artist and title.
    #[must_use]
    pub fn local(artist: &str, title: &str, duration: Option<Duration>) -> Self {
        Self {
            source: Source::Local,
            id: format!("{artist} - {title}"),
            title: title.to_owned(),
            artist: artist.to_owned(),
            duration_ms: duration.map_or(0, crate::util::as_millis_u64),
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Whether both durations are within `tolerance` of each other.
    #[must_use]
    pub fn duration_agrees(&self, other: &Track, tolerance: Duration) -> bool {
        self.duration_ms.abs_diff(other.duration_ms) < crate::util::as_millis_u64(tolerance)
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.id == other.id
    }
}

impl Eq for Track {}

impl Hash for Track {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.id.hash(state);
    }
}

/// Formats as "artist - title".
impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// Where to fetch a track's audio from, and how to decrypt it.
///
/// `decryption_key` is a hex-encoded stream cipher key. Without a key the
/// stream is not encrypted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: Url,
    #[serde(default)]
    pub decryption_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(source: Source, id: &str, title: &str, duration_ms: u64) -> Track {
        Track {
            source,
            id: id.to_owned(),
            title: title.to_owned(),
            artist: "Artist".to_owned(),
            duration_ms,
        }
    }

    #[test]
    fn identity_ignores_metadata() {
        let a = track(Source::Yandex, "42", "Song", 180_000);
        let b = track(Source::Yandex, "42", "Song (Remastered)", 181_000);
        let c = track(Source::Local, "42", "Song", 180_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn duration_agreement_is_strict_at_tolerance() {
        let tolerance = Duration::from_millis(200);
        let a = track(Source::Yandex, "1", "A", 180_000);
        assert!(a.duration_agrees(&track(Source::Local, "x", "A", 180_199), tolerance));
        assert!(a.duration_agrees(&track(Source::Local, "x", "A", 179_801), tolerance));
        assert!(!a.duration_agrees(&track(Source::Local, "x", "A", 180_200), tolerance));
    }

    #[test]
    fn local_tracks_derive_id() {
        let t = Track::local("Band", "Tune", Some(Duration::from_secs(200)));
        assert_eq!(t.source, Source::Local);
        assert_eq!(t.id, "Band - Tune");
        assert_eq!(t.duration_ms, 200_000);
        assert_eq!(t.to_string(), "Band - Tune");
    }

    #[test]
    fn download_info_key_is_optional() {
        let info: DownloadInfo =
            serde_json::from_str(r#"{"url":"https://example.com/a.mp3"}"#).unwrap();
        assert!(info.decryption_key.is_none());
    }
}

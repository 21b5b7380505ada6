//! Transport state, timestamped positions and the published snapshots.
//!
//! # Position model
//!
//! A [`Playback`] says where a track was *as of* `updated_at`. It must never
//! be read as "where the track is now" without extrapolating:
//!
//! * `started_at = updated_at - position`
//! * `position_at(now) = position + (now - updated_at)` while playing,
//!   `position` unchanged otherwise.
//!
//! Every component that carries a position forward in time (the local
//! observer, the reconciliation engine and the output alignment) goes through
//! [`Playback::position_at`], so there is exactly one definition of it.
//!
//! # Equality
//!
//! Equality is semantic: two playing snapshots whose inferred start instants
//! lie within one second of each other describe the same timeline, even
//! though their positions and timestamps differ. This is what suppresses
//! redundant publishes.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSecondsWithFrac};
use time::{macros::format_description, OffsetDateTime};

use crate::{
    clock::{abs_diff, elapsed_since},
    track::Track,
    util::as_millis_u64,
};

/// Transport state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum State {
    Playing,
    Paused,
    #[default]
    Stopped,
}

impl State {
    #[must_use]
    pub fn is_playing(self) -> bool {
        self == Self::Playing
    }
}

/// A transport state plus a timestamped position.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Playback {
    pub state: State,
    pub position_ms: u64,
    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub updated_at: SystemTime,
}

impl Playback {
    /// Two playing snapshots whose start instants are closer than this are
    /// considered equal.
    pub const START_TOLERANCE: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(state: State, position: Duration, updated_at: SystemTime) -> Self {
        Self {
            state,
            position_ms: as_millis_u64(position),
            updated_at,
        }
    }

    #[must_use]
    pub fn playing(position: Duration, updated_at: SystemTime) -> Self {
        Self::new(State::Playing, position, updated_at)
    }

    #[must_use]
    pub fn paused(position: Duration, updated_at: SystemTime) -> Self {
        Self::new(State::Paused, position, updated_at)
    }

    #[must_use]
    pub fn stopped(updated_at: SystemTime) -> Self {
        Self::new(State::Stopped, Duration::ZERO, updated_at)
    }

    #[must_use]
    pub fn position(&self) -> Duration {
        Duration::from_millis(self.position_ms)
    }

    /// The instant at which position zero played (or would have played).
    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        self.updated_at
            .checked_sub(self.position())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// The position at `now`.
    ///
    /// Extrapolates only while playing. For `now` before `updated_at` the
    /// position is rewound accordingly, saturating at zero.
    #[must_use]
    pub fn position_at(&self, now: SystemTime) -> Duration {
        let position = self.position();
        if !self.state.is_playing() {
            return position;
        }

        match now.duration_since(self.updated_at) {
            Ok(ahead) => position.saturating_add(ahead),
            Err(e) => position.saturating_sub(e.duration()),
        }
    }

    /// Re-expresses this snapshot as of `now` without changing its meaning.
    #[must_use]
    pub fn at(&self, now: SystemTime) -> Self {
        Self::new(self.state, self.position_at(now), now)
    }

    /// How long ago this snapshot was taken.
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        elapsed_since(now, self.updated_at)
    }
}

impl PartialEq for Playback {
    fn eq(&self, other: &Self) -> bool {
        if self.state != other.state {
            return false;
        }

        if self.state.is_playing()
            && abs_diff(self.started_at(), other.started_at()) < Self::START_TOLERANCE
        {
            return true;
        }

        self.position_ms == other.position_ms
    }
}

/// The canonical (track, playback) pair published by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub track: Track,
    pub playback: Playback,
}

impl Update {
    #[must_use]
    pub fn new(track: Track, playback: Playback) -> Self {
        Self { track, playback }
    }
}

/// Formats like "Now playing: Artist - Title [12.3 / 180], started at 12:34:56".
impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.playback.state.is_playing() {
            "playing"
        } else {
            "paused"
        };

        let position = self.playback.position().as_secs_f32();
        let duration = self.track.duration().as_secs_f32();

        let started = OffsetDateTime::from(self.playback.started_at())
            .format(format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;

        write!(
            f,
            "Now {verb}: {} [{position:.1} / {duration}], started at {started}",
            self.track
        )
    }
}

/// What the sync server holds for a room.
///
/// The track is absent until the host published something. `host_recv_ts`
/// is when the server received the last update, which lets clients bound
/// staleness.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub uid: String,
    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub expires_at: SystemTime,

    pub track: Option<Track>,
    pub playback: Playback,
    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub host_recv_ts: SystemTime,
}

impl Instance {
    /// A room with nothing playing yet.
    #[must_use]
    pub fn new(uid: impl Into<String>, expires_at: SystemTime, now: SystemTime) -> Self {
        Self {
            uid: uid.into(),
            expires_at,
            track: None,
            playback: Playback::stopped(now),
            host_recv_ts: now,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// The published update, if there is one.
    #[must_use]
    pub fn update(&self) -> Option<Update> {
        self.track
            .as_ref()
            .map(|track| Update::new(track.clone(), self.playback.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Source;

    fn at(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_000 + ms)
    }

    #[test]
    fn started_at_subtracts_position() {
        let p = Playback::playing(Duration::from_millis(2_500), at(10_000));
        assert_eq!(p.started_at(), at(7_500));
    }

    #[test]
    fn position_is_stable_at_update_time() {
        for state in [State::Playing, State::Paused, State::Stopped] {
            let p = Playback::new(state, Duration::from_millis(1_234), at(0));
            assert_eq!(p.position_at(at(0)), Duration::from_millis(1_234));
        }
    }

    #[test]
    fn position_strictly_increases_while_playing() {
        let p = Playback::playing(Duration::from_millis(500), at(0));
        let mut last = p.position_at(at(0));
        for ms in [1, 2, 10, 999, 1_000, 60_000] {
            let next = p.position_at(at(ms));
            assert!(next > last, "{next:?} should exceed {last:?}");
            last = next;
        }
        assert_eq!(p.position_at(at(60_000)), Duration::from_millis(60_500));
    }

    #[test]
    fn position_does_not_move_when_paused_or_stopped() {
        let paused = Playback::paused(Duration::from_millis(500), at(0));
        assert_eq!(paused.position_at(at(30_000)), Duration::from_millis(500));
        let stopped = Playback::stopped(at(0));
        assert_eq!(stopped.position_at(at(30_000)), Duration::ZERO);
    }

    #[test]
    fn playing_equality_uses_start_instant() {
        let a = Playback::playing(Duration::from_millis(10_000), at(20_000));
        // Started 999ms later.
        let b = Playback::playing(Duration::from_millis(30_000), at(40_999));
        // Started 1000ms later.
        let c = Playback::playing(Duration::from_millis(30_000), at(41_000));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn playing_equality_falls_back_to_position() {
        let a = Playback::playing(Duration::from_millis(5_000), at(0));
        let b = Playback::playing(Duration::from_millis(5_000), at(10_000));
        assert_eq!(a, b);
    }

    #[test]
    fn paused_equality_requires_exact_position() {
        let a = Playback::paused(Duration::from_millis(5_000), at(0));
        let b = Playback::paused(Duration::from_millis(5_000), at(60_000));
        let c = Playback::paused(Duration::from_millis(5_001), at(0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(
            Playback::stopped(at(0)),
            Playback::paused(Duration::ZERO, at(0))
        );
    }

    #[test]
    fn update_display() {
        let track = Track {
            source: Source::Yandex,
            id: "1".to_owned(),
            title: "Title".to_owned(),
            artist: "Artist".to_owned(),
            duration_ms: 180_000,
        };
        let update = Update::new(
            track,
            Playback::playing(
                Duration::from_millis(12_345),
                SystemTime::UNIX_EPOCH + Duration::from_millis(3_612_345),
            ),
        );
        assert_eq!(
            update.to_string(),
            "Now playing: Artist - Title [12.3 / 180], started at 01:00:00"
        );
    }

    #[test]
    fn instance_round_trips_fractional_timestamps() {
        let recv = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        let mut instance = Instance::new("room", recv + Duration::from_secs(3_600), recv);
        assert!(instance.update().is_none());

        instance.track = Some(Track::local("A", "B", Some(Duration::from_secs(10))));
        instance.playback = Playback::playing(Duration::from_millis(1_500), recv);

        let json = serde_json::to_string(&instance).unwrap();
        let parsed: Instance = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.track, instance.track);
        assert_eq!(parsed.playback.position_ms, 1_500);
        assert_eq!(parsed.playback.state, State::Playing);
        assert_eq!(parsed.host_recv_ts, recv);
        assert!(!parsed.is_expired(recv));
        assert!(parsed.is_expired(recv + Duration::from_secs(3_600)));
    }
}

//! The local media session and the play/pause inference state machine.
//!
//! A platform binding (for example the OS media transport controls) reports
//! raw [`SessionEvent`]s together with a [`Snapshot`] of what the session
//! exposes at that moment. Most sessions report a trustworthy transport
//! status, which is taken as is. Some never do: they report
//! [`TransportStatus::Closed`] throughout, and pausing or resuming only shows
//! up as a particular *ordering* of timeline and playback events. For those,
//! the status is inferred:
//!
//! * Status, then timeline (`P, P, T` on resume): the timeline event follows a
//!   recent playback event, so the status flips right away.
//! * Timeline, then status (`T, P, P` on pause): the timeline event arms a
//!   deferred flip, which the next playback event commits if it arrives
//!   within [`SessionObserver::ARMED_TIMEOUT`].
//! * A timeline event right after new metadata, or right after a seek to a
//!   whole second, always means playing.
//!
//! All mutable session state lives in one [`SessionState`] behind one mutex,
//! so events delivered from several callback threads are applied in arrival
//! order. Subscribers are notified after the lock is released.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use crate::{
    clock::{elapsed_since, SharedClock},
    events::{Callback, Event, SessionEvent, Subscribers},
    playback::{Playback, State},
    track::Track,
};

/// Transport status as reported by a media session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// No trustworthy status; it must be inferred from event ordering.
    Closed,
    Opened,
    Changing,
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl TransportStatus {
    /// The opposite of playing or paused.
    #[must_use]
    pub fn toggled(self) -> Option<Self> {
        match self {
            Self::Playing => Some(Self::Paused),
            Self::Paused => Some(Self::Playing),
            _ => None,
        }
    }
}

impl From<TransportStatus> for State {
    fn from(status: TransportStatus) -> Self {
        match status {
            TransportStatus::Playing => State::Playing,
            TransportStatus::Paused => State::Paused,
            _ => State::Stopped,
        }
    }
}

/// The local session capability consumed by the reconciliation engine.
///
/// Implementations must tolerate having no active session, in which case
/// [`current_track`](Self::current_track) returns `None`.
pub trait LocalObserver: Send + Sync {
    /// The track of the active session, if any.
    fn current_track(&self) -> Option<Track>;

    /// The current transport status.
    fn status(&self) -> TransportStatus;

    /// The position right now, extrapolated while playing.
    fn position(&self) -> Duration;

    /// Status and position as one timestamped snapshot.
    fn playback(&self) -> Playback;

    /// Subscribes to changes.
    fn on_update(&self, callback: Callback);

    /// Removes all subscriptions.
    fn clear_callbacks(&self);
}

/// What a session exposes when it delivers an event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub artist: String,
    pub title: String,

    /// Track length, if the session knows it.
    pub end_time: Option<Duration>,

    /// Transport status as reported; `Closed` when it cannot be trusted.
    pub status: TransportStatus,

    /// Position as of `position_updated_at`.
    pub position: Duration,

    /// When the session last updated the timeline. `None` for sessions that
    /// never report timeline updates at all.
    pub position_updated_at: Option<SystemTime>,
}

impl SessionEvent {
    /// Classifies a timeline event: seeks land on whole seconds.
    #[must_use]
    pub fn from_timeline(position: Duration) -> Self {
        if position.subsec_micros() == 0 {
            Self::Seek
        } else {
            Self::Timeline
        }
    }
}

/// A deferred play/pause decision awaiting confirmation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Arm {
    target: TransportStatus,
    at: SystemTime,
}

/// Mutable state of one observed session.
#[derive(Clone, Debug)]
pub struct SessionState {
    track: Option<Track>,
    status: TransportStatus,
    position: Duration,
    position_updated_at: SystemTime,

    /// Most recent event that was not a playback event.
    last_meaningful: SessionEvent,
    armed: Option<Arm>,
    last_playback_event: Option<SystemTime>,
}

impl SessionState {
    fn new(now: SystemTime) -> Self {
        Self {
            track: None,
            status: TransportStatus::Stopped,
            position: Duration::ZERO,
            position_updated_at: now,
            last_meaningful: SessionEvent::Metadata,
            armed: None,
            last_playback_event: None,
        }
    }

    fn playback(&self, now: SystemTime) -> Playback {
        let reference = Playback::new(
            self.status.into(),
            self.position,
            self.position_updated_at,
        );
        reference.at(now)
    }

    /// The transport status after `event`, per the inference rules.
    fn infer(&mut self, event: SessionEvent, reported: TransportStatus, now: SystemTime) -> TransportStatus {
        if reported != TransportStatus::Closed {
            return reported;
        }

        let timeout = SessionObserver::ARMED_TIMEOUT;
        let old = self.status;

        match event {
            SessionEvent::Playback => {
                if let Some(arm) = self.armed.take() {
                    if elapsed_since(now, arm.at) < timeout {
                        trace!("armed toggle confirmed: {:?} -> {:?}", old, arm.target);
                        return arm.target;
                    }
                    trace!("armed toggle expired");
                }
                old
            }

            SessionEvent::Timeline => {
                let after_seek = self.last_meaningful == SessionEvent::Seek
                    && elapsed_since(now, self.position_updated_at) < Duration::from_millis(1);
                if after_seek || self.last_meaningful == SessionEvent::Metadata {
                    return TransportStatus::Playing;
                }

                let recent_playback = self
                    .last_playback_event
                    .is_some_and(|at| elapsed_since(now, at) < timeout);
                if recent_playback {
                    return old.toggled().unwrap_or(old);
                }

                if let Some(target) = old.toggled() {
                    trace!("arming toggle: {old:?} -> {target:?}");
                    self.armed = Some(Arm { target, at: now });
                }
                old
            }

            SessionEvent::Seek | SessionEvent::Metadata => old,
        }
    }

    fn apply(&mut self, event: SessionEvent, snapshot: &Snapshot, now: SystemTime) {
        if event == SessionEvent::Playback {
            self.last_playback_event = Some(now);
        }

        self.track = Some(Track::local(
            &snapshot.artist,
            &snapshot.title,
            snapshot.end_time,
        ));

        let old = self.status;
        let new = self.infer(event, snapshot.status, now);

        match snapshot.position_updated_at {
            None => {
                // Keep extrapolating from our own reference.
                self.position = self.playback(now).position();
                self.position_updated_at = now;
            }
            Some(updated_at) => {
                // Timeline events can arrive late on resume.
                self.position_updated_at =
                    if old == TransportStatus::Paused && new == TransportStatus::Playing {
                        now
                    } else {
                        updated_at
                    };
                self.position = snapshot.position;
            }
        }

        if new != old {
            debug!("local session {old:?} -> {new:?} on {event} event");
        }
        self.status = new;

        if event != SessionEvent::Playback {
            self.last_meaningful = event;
        }
    }
}

/// A [`LocalObserver`] fed by a platform binding.
pub struct SessionObserver {
    state: Mutex<SessionState>,
    subscribers: Subscribers,
    clock: SharedClock,
}

impl SessionObserver {
    /// How long an armed toggle waits for its confirming playback event, and
    /// how recent a playback event must be to flip on a timeline event.
    pub const ARMED_TIMEOUT: Duration = Duration::from_millis(2_500);

    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(SessionState::new(now)),
            subscribers: Subscribers::default(),
            clock,
        }
    }

    /// Applies one raw event and notifies subscribers.
    pub fn handle(&self, event: SessionEvent, snapshot: &Snapshot) {
        {
            let now = self.clock.now();
            let mut state = self.lock();
            state.apply(event, snapshot, now);
        }

        self.subscribers.notify(Event::Session(event));
    }

    /// Drops the observed session; there is no track until the next event.
    pub fn detach(&self) {
        let now = self.clock.now();
        *self.lock() = SessionState::new(now);
    }

    /// A copy of the session state, for diagnostics.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().clone()
    }

    /// Whether a deferred toggle is waiting for confirmation.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.lock().armed.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocalObserver for SessionObserver {
    fn current_track(&self) -> Option<Track> {
        self.lock().track.clone()
    }

    fn status(&self) -> TransportStatus {
        self.lock().status
    }

    fn position(&self) -> Duration {
        self.playback().position()
    }

    fn playback(&self) -> Playback {
        let now = self.clock.now();
        self.lock().playback(now)
    }

    fn on_update(&self, callback: Callback) {
        self.subscribers.subscribe(callback);
    }

    fn clear_callbacks(&self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        events::callback,
    };

    struct Fixture {
        clock: ManualClock,
        observer: SessionObserver,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::at_epoch_offset(1_700_000_000);
            let observer = SessionObserver::new(clock.shared());
            Self { clock, observer }
        }

        fn snapshot(&self, status: TransportStatus, position_ms: u64) -> Snapshot {
            Snapshot {
                artist: "Artist".to_owned(),
                title: "Title".to_owned(),
                end_time: Some(Duration::from_secs(180)),
                status,
                position: Duration::from_millis(position_ms),
                position_updated_at: Some(self.clock.now()),
            }
        }

        fn event(&self, event: SessionEvent) {
            let snapshot = self.snapshot(TransportStatus::Closed, 10_250);
            self.observer.handle(event, &snapshot);
        }

        fn wait(&self, ms: u64) {
            self.clock.advance(Duration::from_millis(ms));
        }

        /// Puts the observer into a settled state without pending arms and
        /// without a recent playback event.
        fn settle(&self, status: TransportStatus) {
            let snapshot = self.snapshot(status, 10_000);
            self.observer.handle(SessionEvent::Timeline, &snapshot);
            self.wait(10_000);
        }
    }

    #[test]
    fn trusted_status_is_taken_directly() {
        let f = Fixture::new();
        let snapshot = f.snapshot(TransportStatus::Paused, 42_000);
        f.observer.handle(SessionEvent::Playback, &snapshot);
        assert_eq!(f.observer.status(), TransportStatus::Paused);
        assert_eq!(f.observer.position(), Duration::from_millis(42_000));
        assert_eq!(
            f.observer.current_track(),
            Some(Track::local("Artist", "Title", None))
        );
    }

    #[test]
    fn timeline_then_playback_commits_on_confirmation() {
        for (from, to) in [
            (TransportStatus::Playing, TransportStatus::Paused),
            (TransportStatus::Paused, TransportStatus::Playing),
        ] {
            let f = Fixture::new();
            f.settle(from);

            f.event(SessionEvent::Timeline);
            assert_eq!(f.observer.status(), from, "never flips on the timeline event");
            assert!(f.observer.is_armed());

            f.wait(300);
            f.event(SessionEvent::Playback);
            assert_eq!(f.observer.status(), to);
            assert!(!f.observer.is_armed());

            f.wait(50);
            f.event(SessionEvent::Playback);
            assert_eq!(f.observer.status(), to, "second playback event does not flip back");
        }
    }

    #[test]
    fn playback_then_timeline_flips_immediately() {
        for (from, to) in [
            (TransportStatus::Paused, TransportStatus::Playing),
            (TransportStatus::Playing, TransportStatus::Paused),
        ] {
            let f = Fixture::new();
            f.settle(from);

            f.event(SessionEvent::Playback);
            f.wait(20);
            f.event(SessionEvent::Playback);
            assert_eq!(f.observer.status(), from);

            f.wait(100);
            f.event(SessionEvent::Timeline);
            assert_eq!(f.observer.status(), to);
            assert!(!f.observer.is_armed());
        }
    }

    #[test]
    fn armed_toggle_expires() {
        let f = Fixture::new();
        f.settle(TransportStatus::Playing);

        f.event(SessionEvent::Timeline);
        assert!(f.observer.is_armed());

        f.wait(2_500);
        f.event(SessionEvent::Playback);
        assert_eq!(f.observer.status(), TransportStatus::Playing);
        assert!(!f.observer.is_armed());
    }

    #[test]
    fn armed_toggle_confirmed_just_inside_timeout() {
        let f = Fixture::new();
        f.settle(TransportStatus::Playing);

        f.event(SessionEvent::Timeline);
        f.wait(2_499);
        f.event(SessionEvent::Playback);
        assert_eq!(f.observer.status(), TransportStatus::Paused);
    }

    #[test]
    fn timeline_after_metadata_means_playing() {
        let f = Fixture::new();
        f.settle(TransportStatus::Paused);

        f.event(SessionEvent::Metadata);
        f.wait(10_000);
        f.event(SessionEvent::Timeline);
        assert_eq!(f.observer.status(), TransportStatus::Playing);
        assert!(!f.observer.is_armed());
    }

    #[test]
    fn timeline_right_after_seek_means_playing() {
        let f = Fixture::new();
        f.settle(TransportStatus::Paused);

        f.event(SessionEvent::Seek);
        f.event(SessionEvent::Timeline);
        assert_eq!(f.observer.status(), TransportStatus::Playing);
    }

    #[test]
    fn resume_resets_position_reference_to_now() {
        let f = Fixture::new();
        f.settle(TransportStatus::Paused);

        // The session's timeline timestamp is stale by five seconds.
        let mut snapshot = f.snapshot(TransportStatus::Playing, 10_000);
        snapshot.position_updated_at = Some(f.clock.now() - Duration::from_secs(5));
        f.observer.handle(SessionEvent::Playback, &snapshot);

        assert_eq!(f.observer.position(), Duration::from_millis(10_000));
        f.wait(1_000);
        assert_eq!(f.observer.position(), Duration::from_millis(11_000));
    }

    #[test]
    fn sessions_without_timeline_keep_extrapolating() {
        let f = Fixture::new();
        let mut snapshot = f.snapshot(TransportStatus::Playing, 0);
        snapshot.position_updated_at = None;

        f.observer.handle(SessionEvent::Metadata, &snapshot);
        f.wait(4_000);
        assert_eq!(f.observer.position(), Duration::from_secs(4));

        // A repeated event must not lose the elapsed time.
        f.observer.handle(SessionEvent::Playback, &snapshot);
        f.wait(1_000);
        assert_eq!(f.observer.position(), Duration::from_secs(5));

        snapshot.status = TransportStatus::Paused;
        f.observer.handle(SessionEvent::Playback, &snapshot);
        f.wait(3_000);
        assert_eq!(f.observer.position(), Duration::from_secs(5));
        assert_eq!(f.observer.playback().state, State::Paused);
    }

    #[test]
    fn detach_forgets_the_session() {
        let f = Fixture::new();
        f.settle(TransportStatus::Playing);
        f.observer.detach();
        assert!(f.observer.current_track().is_none());
        assert_eq!(f.observer.status(), TransportStatus::Stopped);
    }

    #[test]
    fn subscribers_are_notified_after_state_update() {
        let f = Arc::new(Fixture::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let fixture = Arc::clone(&f);
        let counter = Arc::clone(&seen);
        f.observer.on_update(callback(move |event| {
            // Re-entering the observer must not deadlock.
            assert!(fixture.observer.current_track().is_some());
            assert_eq!(event, Event::Session(SessionEvent::Metadata));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        f.event(SessionEvent::Metadata);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        f.observer.clear_callbacks();
        f.event(SessionEvent::Metadata);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn seek_classification() {
        assert_eq!(
            SessionEvent::from_timeline(Duration::from_secs(12)),
            SessionEvent::Seek
        );
        assert_eq!(
            SessionEvent::from_timeline(Duration::from_millis(12_345)),
            SessionEvent::Timeline
        );
    }
}

//! The reconciliation engine.
//!
//! [`Discovery`] merges the local session observer and the remote poller
//! into one canonical [`Update`]. Each source is imperfect on its own:
//!
//! * The local session knows transport state and position, but often only a
//!   title and an artist.
//! * The remote provider knows the exact track, but not whether or where it
//!   is playing.
//!
//! When both report durations within [`Discovery::DURATION_TOLERANCE`] of
//! each other they are taken to describe the same track, and the update
//! combines the remote identity with the local timing. After such an
//! agreement a grace window of [`Discovery::GRACE_PERIOD`] bridges the
//! moment the remote side lags behind a track change: the remote identity is
//! kept with a position counted from the start of the disagreement. After
//! that the engine falls back to the local session.
//!
//! Remote-only updates keep the timeline continuous: while the same track is
//! reported, the previous position is extrapolated instead of restarting at
//! zero, and the state becomes `Stopped` once the track must have ended.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

use crate::{
    clock::{elapsed_since, SharedClock},
    error::{Error, Result},
    events::{callback, Callback, Subscribers},
    observer::LocalObserver,
    playback::{Playback, State, Update},
    remote::{PollHandle, PollMode, Poller, RemoteProvider},
    track::Track,
};

/// A source of "what is playing".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Remote,
    Local,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    /// Set after the sources last agreed.
    grace_armed: bool,

    /// When the sources started to disagree after agreeing.
    grace_diverge_time: Option<SystemTime>,

    last_update: Option<Update>,
}

/// Builds a [`Discovery`].
pub struct Builder {
    clock: SharedClock,
    local: Option<Arc<dyn LocalObserver>>,
    remote: Option<Arc<dyn RemoteProvider>>,
    prefer: Option<DiscoverySource>,
    require: Vec<DiscoverySource>,
    poll_mode: Option<PollMode>,
}

impl Builder {
    #[must_use]
    pub fn local(mut self, observer: Arc<dyn LocalObserver>) -> Self {
        self.local = Some(observer);
        self
    }

    #[must_use]
    pub fn remote(mut self, provider: Arc<dyn RemoteProvider>) -> Self {
        self.remote = Some(provider);
        self
    }

    /// Uses `source` exclusively instead of arbitrating.
    #[must_use]
    pub fn prefer(mut self, source: Option<DiscoverySource>) -> Self {
        self.prefer = source;
        self
    }

    /// Overrides the remote poll mode chosen from the available sources.
    #[must_use]
    pub fn poll_mode(mut self, mode: Option<PollMode>) -> Self {
        self.poll_mode = mode;
        self
    }

    /// Fails the build if `source` is not available.
    #[must_use]
    pub fn require(mut self, source: DiscoverySource) -> Self {
        if !self.require.contains(&source) {
            self.require.push(source);
        }
        self
    }

    /// Checks the available sources and wires them up.
    ///
    /// Unless overridden, the remote poll mode is `Update` when a local
    /// observer exists, since its events trigger remote refreshes, and
    /// `Lazy` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when a required source is missing, when
    /// there is no source at all, or when `Update` polling is requested
    /// without a local observer.
    pub fn build(self) -> Result<Discovery> {
        for source in &self.require {
            let available = match source {
                DiscoverySource::Remote => self.remote.is_some(),
                DiscoverySource::Local => self.local.is_some(),
            };
            if !available {
                return Err(Error::failed_precondition(format!(
                    "{source} source is required but not available"
                )));
            }
        }

        if self.local.is_none() && self.remote.is_none() {
            return Err(Error::failed_precondition(
                "at least one of the local and remote sources must be available",
            ));
        }

        let subscribers = Arc::new(Subscribers::default());
        let mode = match (self.poll_mode, self.local.is_some()) {
            (Some(PollMode::Update), false) => {
                return Err(Error::failed_precondition(
                    "update polling requires a local source",
                ));
            }
            (Some(mode), _) => mode,
            (None, true) => PollMode::Update,
            (None, false) => PollMode::Lazy,
        };
        let poller = self.remote.map(|provider| {
            Arc::new(Poller::new(
                provider,
                mode,
                Arc::clone(&subscribers),
                Arc::clone(&self.clock),
            ))
        });

        let discovery = Discovery {
            local: self.local,
            poller,
            prefer: self.prefer,
            subscribers,
            state: Mutex::new(EngineState::default()),
            clock: self.clock,
            poll_handle: Mutex::new(None),
        };
        discovery.hook_poller();

        info!(
            "discovering from {}",
            match (&discovery.local, &discovery.poller) {
                (Some(_), Some(poller)) => {
                    format!("local and remote ({:?} polling)", poller.mode())
                }
                (Some(_), None) => "local only".to_owned(),
                (None, _) => format!("remote only ({mode:?} polling)"),
            }
        );

        Ok(discovery)
    }
}

/// Merges the local observer and the remote poller.
pub struct Discovery {
    local: Option<Arc<dyn LocalObserver>>,
    poller: Option<Arc<Poller>>,
    prefer: Option<DiscoverySource>,
    subscribers: Arc<Subscribers>,
    state: Mutex<EngineState>,
    clock: SharedClock,
    poll_handle: Mutex<Option<PollHandle>>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("prefer", &self.prefer)
            .finish_non_exhaustive()
    }
}

impl Discovery {
    /// Local and remote durations closer than this identify the same track.
    pub const DURATION_TOLERANCE: Duration = Duration::from_millis(200);

    /// How long the remote identity is trusted after the sources diverge.
    pub const GRACE_PERIOD: Duration = Duration::from_secs(15);

    #[must_use]
    pub fn builder(clock: SharedClock) -> Builder {
        Builder {
            clock,
            local: None,
            remote: None,
            prefer: None,
            require: Vec::new(),
            poll_mode: None,
        }
    }

    /// Starts the remote polling thread, if the poll mode has one.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        if let Some(poller) = &self.poller {
            let handle = poller.spawn()?;
            *self.poll_handle.lock().unwrap_or_else(PoisonError::into_inner) = handle;
        }
        Ok(())
    }

    /// Stops the remote polling thread.
    pub fn stop(&self) {
        let handle = self
            .poll_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    #[must_use]
    pub fn poller(&self) -> Option<&Arc<Poller>> {
        self.poller.as_ref()
    }

    /// Subscribes to changes of either source.
    pub fn on_update(&self, callback: Callback) {
        self.subscribers.subscribe(Arc::clone(&callback));
        if let Some(local) = &self.local {
            local.on_update(callback);
        }
    }

    /// Removes all subscriptions, keeping the internal remote refresh hook.
    pub fn clear_callbacks(&self) {
        self.subscribers.clear();
        if let Some(local) = &self.local {
            local.clear_callbacks();
        }
        self.hook_poller();
    }

    /// Refreshes the remote track on every local event, before any other
    /// subscriber sees the event.
    fn hook_poller(&self) {
        if let (Some(local), Some(poller)) = (&self.local, &self.poller) {
            let poller = Arc::clone(poller);
            local.on_update(callback(move |_| {
                poller.update()?;
                Ok(())
            }));
        }
    }

    /// Reconciles both sources into the current update.
    ///
    /// Returns `None` when nothing is playing.
    pub fn current(&self) -> Option<Update> {
        self.fetch_initial();

        let now = self.clock.now();
        let mut state = self.lock();
        let update = self.reconcile(&mut state, now);
        state.last_update.clone_from(&update);
        update
    }

    #[must_use]
    pub fn current_track(&self) -> Option<Track> {
        self.current().map(|update| update.track)
    }

    #[must_use]
    pub fn playback(&self) -> Option<Playback> {
        self.current().map(|update| update.playback)
    }

    #[must_use]
    pub fn position(&self) -> Duration {
        self.playback()
            .map_or(Duration::ZERO, |playback| playback.position())
    }

    /// The last reconciled update, without reconciling again.
    #[must_use]
    pub fn last_update(&self) -> Option<Update> {
        self.lock().last_update.clone()
    }

    fn reconcile(&self, state: &mut EngineState, now: SystemTime) -> Option<Update> {
        match self.prefer {
            Some(DiscoverySource::Remote) => return self.remote_update(state, now, true),
            None => {
                if let Some(update) = self.remote_update(state, now, false) {
                    return Some(update);
                }
            }
            Some(DiscoverySource::Local) => {}
        }

        if let Some(update) = self.local_update() {
            return Some(update);
        }

        if self.prefer.is_none() {
            return self.remote_update(state, now, true);
        }

        None
    }

    /// Fetches the first remote track if nothing was polled yet.
    ///
    /// Runs outside the engine lock, since the provider may block.
    fn fetch_initial(&self) {
        if self.prefer == Some(DiscoverySource::Local) {
            return;
        }
        let Some(poller) = &self.poller else {
            return;
        };
        if poller.is_startup() && poller.last_track().is_none() {
            if let Err(e) = poller.refresh() {
                warn!("initial remote fetch failed: {e}");
            }
        }
    }

    fn local_update(&self) -> Option<Update> {
        let local = self.local.as_ref()?;
        let track = local.current_track()?;
        Some(Update::new(track, local.playback()))
    }

    /// The remote track combined with the best available timing.
    ///
    /// Unless `forced`, gives way to the local session when the sources
    /// disagree outside of the grace window.
    fn remote_update(
        &self,
        state: &mut EngineState,
        now: SystemTime,
        forced: bool,
    ) -> Option<Update> {
        let poller = self.poller.as_ref()?;
        let remote = poller.current_track()?;

        let local = self
            .local
            .as_ref()
            .and_then(|local| local.current_track().map(|track| (local, track)));
        if let Some((local, local_track)) = local {
            if remote.duration_agrees(&local_track, Self::DURATION_TOLERANCE) {
                state.grace_armed = true;
                state.grace_diverge_time = None;
                return Some(Update::new(remote, local.playback()));
            }

            debug!(
                "durations differ: local {} ms, remote {} ms",
                local_track.duration_ms, remote.duration_ms
            );

            if state.grace_armed {
                let diverged_at = *state.grace_diverge_time.get_or_insert(now);
                let elapsed = elapsed_since(now, diverged_at);
                if elapsed < Self::GRACE_PERIOD {
                    return Some(Update::new(remote, Playback::playing(elapsed, now)));
                }

                debug!("grace period expired");
                state.grace_armed = false;
            }

            if !forced {
                return None;
            }
        }

        let position = state
            .last_update
            .as_ref()
            .filter(|last| last.track == remote)
            .map_or(Duration::ZERO, |last| last.playback.position_at(now));
        let playback_state = if position > remote.duration() {
            State::Stopped
        } else {
            State::Playing
        };

        Some(Update::new(
            remote,
            Playback::new(playback_state, position, now),
        ))
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        events::SessionEvent,
        observer::{SessionObserver, Snapshot, TransportStatus},
        remote::RemoteTrack,
        track::Source,
    };

    struct Fixed(Mutex<Option<RemoteTrack>>);

    impl Fixed {
        fn new(duration_ms: u64) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Some(RemoteTrack {
                id: "r1".to_owned(),
                title: Some("Song".to_owned()),
                artists: Vec::new(),
                duration_ms: Some(duration_ms),
            }))))
        }
    }

    impl RemoteProvider for Fixed {
        fn source(&self) -> Source {
            Source::Yandex
        }

        fn current_track(&self) -> Result<RemoteTrack> {
            self.0
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::not_found("nothing playing"))
        }
    }

    fn observer(
        clock: &ManualClock,
        duration_ms: u64,
        status: TransportStatus,
    ) -> Arc<SessionObserver> {
        let observer = Arc::new(SessionObserver::new(clock.shared()));
        observer.handle(
            SessionEvent::Metadata,
            &Snapshot {
                artist: "Artist".to_owned(),
                title: "Song".to_owned(),
                end_time: Some(Duration::from_millis(duration_ms)),
                status,
                position: Duration::from_secs(3),
                position_updated_at: Some(clock.now()),
            },
        );
        observer
    }

    #[test]
    fn requires_a_source() {
        let clock = ManualClock::at_epoch_offset(0);
        let err = Discovery::builder(clock.shared()).build().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FailedPrecondition);

        let err = Discovery::builder(clock.shared())
            .remote(Fixed::new(1_000))
            .require(DiscoverySource::Local)
            .build()
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn poll_mode_depends_on_local_observer() {
        let clock = ManualClock::at_epoch_offset(1_000);
        let remote_only = Discovery::builder(clock.shared())
            .remote(Fixed::new(1_000))
            .build()
            .unwrap();
        assert_eq!(remote_only.poller().unwrap().mode(), PollMode::Lazy);

        let both = Discovery::builder(clock.shared())
            .local(observer(&clock, 1_000, TransportStatus::Playing))
            .remote(Fixed::new(1_000))
            .build()
            .unwrap();
        assert_eq!(both.poller().unwrap().mode(), PollMode::Update);
    }

    #[test]
    fn poll_mode_can_be_overridden() {
        let clock = ManualClock::at_epoch_offset(1_000);
        let polling = Discovery::builder(clock.shared())
            .local(observer(&clock, 1_000, TransportStatus::Playing))
            .remote(Fixed::new(1_000))
            .poll_mode(Some(PollMode::Poll))
            .build()
            .unwrap();
        assert_eq!(polling.poller().unwrap().mode(), PollMode::Poll);

        let err = Discovery::builder(clock.shared())
            .remote(Fixed::new(1_000))
            .poll_mode(Some(PollMode::Update))
            .build()
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn preferred_local_never_asks_remote() {
        let clock = ManualClock::at_epoch_offset(1_000);
        let discovery = Discovery::builder(clock.shared())
            .local(observer(&clock, 100_000, TransportStatus::Paused))
            .remote(Fixed::new(100_000))
            .prefer(Some(DiscoverySource::Local))
            .build()
            .unwrap();

        let update = discovery.current().unwrap();
        assert_eq!(update.track.source, Source::Local);
        assert_eq!(update.playback.state, State::Paused);
        assert!(discovery.poller().unwrap().last_track().is_none());
    }

    #[test]
    fn preferred_remote_ignores_local() {
        let clock = ManualClock::at_epoch_offset(1_000);
        let discovery = Discovery::builder(clock.shared())
            .local(observer(&clock, 50_000, TransportStatus::Paused))
            .remote(Fixed::new(100_000))
            .prefer(Some(DiscoverySource::Remote))
            .build()
            .unwrap();

        let update = discovery.current().unwrap();
        assert_eq!(update.track.source, Source::Yandex);
        assert_eq!(update.playback.state, State::Playing);
        assert_eq!(update.playback.position(), Duration::ZERO);
    }

    #[test]
    fn remote_only_position_continues_and_stops() {
        let clock = ManualClock::at_epoch_offset(1_000);
        let discovery = Discovery::builder(clock.shared())
            .remote(Fixed::new(10_000))
            .build()
            .unwrap();

        let first = discovery.current().unwrap();
        assert_eq!(first.playback.position(), Duration::ZERO);

        clock.advance(Duration::from_secs(4));
        let second = discovery.current().unwrap();
        assert_eq!(second.playback.position(), Duration::from_secs(4));
        assert_eq!(second.playback.state, State::Playing);
        assert_eq!(first, second, "same timeline");

        clock.advance(Duration::from_secs(7));
        let third = discovery.current().unwrap();
        assert_eq!(third.playback.state, State::Stopped);
    }

    #[test]
    fn slow_initial_fetch_does_not_hold_the_engine() {
        struct Slow;

        impl RemoteProvider for Slow {
            fn source(&self) -> Source {
                Source::Yandex
            }

            fn current_track(&self) -> Result<RemoteTrack> {
                std::thread::sleep(Duration::from_millis(500));
                Err(Error::unavailable("provider is slow"))
            }
        }

        let clock = ManualClock::at_epoch_offset(1_000);
        let discovery = Arc::new(
            Discovery::builder(clock.shared())
                .remote(Arc::new(Slow))
                .build()
                .unwrap(),
        );

        let fetching = {
            let discovery = Arc::clone(&discovery);
            std::thread::spawn(move || discovery.current())
        };
        std::thread::sleep(Duration::from_millis(100));

        let started = std::time::Instant::now();
        assert!(discovery.last_update().is_none());
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(fetching.join().unwrap().is_none());
    }

    #[test]
    fn remote_only_continues_from_paused_position() {
        let clock = ManualClock::at_epoch_offset(1_000);
        let local = observer(&clock, 100_000, TransportStatus::Paused);
        let discovery = Discovery::builder(clock.shared())
            .local(Arc::clone(&local) as Arc<dyn LocalObserver>)
            .remote(Fixed::new(100_000))
            .build()
            .unwrap();

        let paused = discovery.current().unwrap();
        assert_eq!(paused.playback.state, State::Paused);
        assert_eq!(paused.playback.position(), Duration::from_secs(3));

        clock.advance(Duration::from_secs(10));
        local.detach();
        let update = discovery.current().unwrap();
        assert_eq!(update.track.source, Source::Yandex);
        assert_eq!(update.playback.state, State::Playing);
        assert_eq!(update.playback.position(), Duration::from_secs(3));
    }

    #[test]
    fn nothing_playing() {
        let clock = ManualClock::at_epoch_offset(1_000);
        let provider = Fixed::new(10_000);
        *provider.0.lock().unwrap() = None;
        let discovery = Discovery::builder(clock.shared())
            .remote(provider)
            .build()
            .unwrap();
        assert!(discovery.current().is_none());
        assert_eq!(discovery.position(), Duration::ZERO);
    }
}

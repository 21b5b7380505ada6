//! The remote provider and its poller.
//!
//! A [`RemoteProvider`] answers one question: which track is the account
//! playing right now? It knows nothing about transport state or position.
//!
//! The [`Poller`] caches the last answer and decides when to ask again. The
//! cadence is fixed at construction ([`PollMode`]):
//!
//! * `Update`: no timer at all; the local observer's events trigger refreshes.
//! * `Poll`: every [`Poller::POLL_INTERVAL`].
//! * `Lazy`: after a track change, sleep for the rest of the track minus
//!   [`Poller::LEAD_TIME`]; otherwise, and during startup, poll at the fixed
//!   interval.

use std::{
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

use reqwest::{
    header::{HeaderValue, AUTHORIZATION},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use url::Url;

use crate::{
    clock::SharedClock,
    error::{Error, Result},
    events::{Event, Subscribers},
    http::Client,
    secrets::Token,
    track::{Source, Track},
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    #[serde(default)]
    pub name: Option<String>,
}

/// A track as the remote provider describes it.
///
/// Everything but the id is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl RemoteTrack {
    /// Converts into a [`Track`] of `source`.
    ///
    /// Only the first artist is kept. Missing fields become empty strings and
    /// a zero duration.
    #[must_use]
    pub fn to_track(&self, source: Source) -> Track {
        let artist = self
            .artists
            .first()
            .and_then(|artist| artist.name.clone())
            .unwrap_or_default();

        Track {
            source,
            id: self.id.clone(),
            title: self.title.clone().unwrap_or_default(),
            artist,
            duration_ms: self.duration_ms.unwrap_or_default(),
        }
    }
}

/// Reports what the remote account is playing.
pub trait RemoteProvider: Send + Sync {
    /// The source that resolved tracks belong to.
    fn source(&self) -> Source;

    /// Fetches the current track.
    ///
    /// # Errors
    ///
    /// Fails when no track can be resolved; `NotFound` when nothing plays.
    fn current_track(&self) -> Result<RemoteTrack>;
}

/// A provider behind an HTTP endpoint returning a [`RemoteTrack`] as JSON.
///
/// An empty `204 No Content` response means that nothing is playing. Calls
/// block on `runtime`, so they must not be made from within async code.
pub struct HttpProvider {
    client: Arc<Client>,
    endpoint: Url,
    source: Source,
    token: Option<Token>,
    runtime: Handle,
}

impl HttpProvider {
    #[must_use]
    pub fn new(
        client: Arc<Client>,
        endpoint: Url,
        source: Source,
        token: Option<Token>,
        runtime: Handle,
    ) -> Self {
        Self {
            client,
            endpoint,
            source,
            token,
            runtime,
        }
    }

    async fn fetch(&self) -> Result<RemoteTrack> {
        let mut request = self.client.get(self.endpoint.clone());
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("OAuth {}", token.expose()))
                .map_err(|e| Error::invalid_argument(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let response = self.client.execute(request).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(Error::not_found("nothing is playing remotely"));
        }

        let body = response.text().await?;
        let track: RemoteTrack = serde_json::from_str(&body)?;
        if track.id.is_empty() {
            return Err(Error::not_found("remote track has no id"));
        }

        Ok(track)
    }
}

impl RemoteProvider for HttpProvider {
    fn source(&self) -> Source {
        self.source
    }

    fn current_track(&self) -> Result<RemoteTrack> {
        self.runtime.block_on(self.fetch())
    }
}

/// How the poller schedules its fetches.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// Refreshed by local observer events only.
    Update,
    /// Fixed interval.
    Poll,
    /// Sleep until shortly before the current track ends.
    Lazy,
}

#[derive(Debug)]
struct PollerState {
    last_track: Option<RemoteTrack>,

    /// Set until the first track change after the initial fetch.
    startup: bool,
    last_update: SystemTime,
}

/// Caches the remote provider's current track.
pub struct Poller {
    provider: Arc<dyn RemoteProvider>,
    mode: PollMode,
    state: Mutex<PollerState>,
    subscribers: Arc<Subscribers>,
    clock: SharedClock,
}

impl Poller {
    /// Fixed polling interval.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// How long before the end of a track lazy polling wakes up.
    pub const LEAD_TIME: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        mode: PollMode,
        subscribers: Arc<Subscribers>,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        Self {
            provider,
            mode,
            state: Mutex::new(PollerState {
                last_track: None,
                startup: true,
                last_update: now,
            }),
            subscribers,
            clock,
        }
    }

    #[must_use]
    pub fn mode(&self) -> PollMode {
        self.mode
    }

    #[must_use]
    pub fn source(&self) -> Source {
        self.provider.source()
    }

    /// Fetches and caches the current track, notifying subscribers on a
    /// change unless the local observer already does.
    ///
    /// Returns whether the track changed.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the cached track is kept.
    pub fn update(&self) -> Result<bool> {
        self.fetch(self.mode != PollMode::Update)
    }

    /// Like [`update`](Self::update), but never notifies.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the cached track is kept.
    pub fn refresh(&self) -> Result<bool> {
        self.fetch(false)
    }

    fn fetch(&self, notify: bool) -> Result<bool> {
        let track = self.provider.current_track()?;

        {
            let mut state = self.lock();
            if state
                .last_track
                .as_ref()
                .is_some_and(|last| last.id == track.id)
            {
                return Ok(false);
            }

            if state.last_track.is_some() {
                state.startup = false;
            }
            debug!(
                "remote track changed to {}",
                track.to_track(self.provider.source())
            );
            state.last_track = Some(track);
            state.last_update = self.clock.now();
        }

        if notify {
            self.subscribers.notify(Event::RemoteTrack);
        }
        Ok(true)
    }

    /// The cached track.
    #[must_use]
    pub fn last_track(&self) -> Option<RemoteTrack> {
        self.lock().last_track.clone()
    }

    /// The cached track, converted.
    #[must_use]
    pub fn current_track(&self) -> Option<Track> {
        self.last_track()
            .map(|track| track.to_track(self.provider.source()))
    }

    /// Whether no track change has been seen since the first fetch.
    #[must_use]
    pub fn is_startup(&self) -> bool {
        self.lock().startup
    }

    /// When the cached track last changed.
    #[must_use]
    pub fn last_update(&self) -> SystemTime {
        self.lock().last_update
    }

    /// How long to sleep after a poll cycle.
    ///
    /// In lazy mode a track change outside of startup sleeps until
    /// [`LEAD_TIME`](Self::LEAD_TIME) before the end of the new track. This
    /// may be zero for short tracks, in which case the next cycle follows
    /// immediately.
    #[must_use]
    pub fn next_delay(&self, changed: bool) -> Duration {
        if self.mode == PollMode::Lazy && changed && !self.is_startup() {
            let duration = self
                .last_track()
                .and_then(|track| track.duration_ms)
                .map_or(Duration::ZERO, Duration::from_millis);
            return duration.saturating_sub(Self::LEAD_TIME);
        }

        Self::POLL_INTERVAL
    }

    /// Runs one poll cycle and returns the delay until the next one.
    pub fn cycle(&self) -> Duration {
        let changed = self.update().unwrap_or_else(|e| {
            warn!("remote poll failed: {e}");
            false
        });
        self.next_delay(changed)
    }

    /// Starts the polling thread. Nothing is started in `Update` mode.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>) -> Result<Option<PollHandle>> {
        if self.mode == PollMode::Update {
            return Ok(None);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let poller = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("remote-poller".to_owned())
            .spawn(move || {
                debug!("remote poller started in {:?} mode", poller.mode);
                loop {
                    let delay = poller.cycle();
                    trace!("next remote poll in {:.1}s", delay.as_secs_f32());
                    match stop_rx.recv_timeout(delay) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("remote poller stopped");
            })?;

        Ok(Some(PollHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stops the polling thread when dropped.
pub struct PollHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// Stops the thread and waits for the current cycle to finish.
    pub fn stop(mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("remote poller panicked");
            }
        }
    }

    fn signal(&mut self) {
        // Dropping the sender wakes the thread.
        self.stop_tx.take();
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{clock::ManualClock, events::callback};

    #[derive(Default)]
    struct Scripted {
        answers: Mutex<Vec<Result<RemoteTrack>>>,
    }

    impl Scripted {
        fn push(&self, answer: Result<RemoteTrack>) {
            self.answers.lock().unwrap().insert(0, answer);
        }
    }

    impl RemoteProvider for Scripted {
        fn source(&self) -> Source {
            Source::Yandex
        }

        fn current_track(&self) -> Result<RemoteTrack> {
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(Error::unavailable("script exhausted")))
        }
    }

    fn remote(id: &str, duration_ms: u64) -> RemoteTrack {
        RemoteTrack {
            id: id.to_owned(),
            title: Some(format!("Title {id}")),
            artists: vec![
                Artist {
                    name: Some("First".to_owned()),
                },
                Artist {
                    name: Some("Second".to_owned()),
                },
            ],
            duration_ms: Some(duration_ms),
        }
    }

    fn poller(mode: PollMode) -> (Arc<Scripted>, Poller, Arc<AtomicUsize>) {
        let provider = Arc::new(Scripted::default());
        let subscribers = Arc::new(Subscribers::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        subscribers.subscribe(callback(move |event| {
            assert_eq!(event, Event::RemoteTrack);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let clock = ManualClock::at_epoch_offset(1_700_000_000);
        let poller = Poller::new(
            Arc::clone(&provider) as Arc<dyn RemoteProvider>,
            mode,
            subscribers,
            clock.shared(),
        );
        (provider, poller, calls)
    }

    #[test]
    fn converts_first_artist() {
        let track = remote("7", 1_000).to_track(Source::Yandex);
        assert_eq!(track.artist, "First");
        assert_eq!(track.title, "Title 7");
        assert_eq!(track.duration_ms, 1_000);

        let bare = RemoteTrack {
            id: "8".to_owned(),
            ..RemoteTrack::default()
        }
        .to_track(Source::Yandex);
        assert_eq!(bare.artist, "");
        assert_eq!(bare.title, "");
        assert_eq!(bare.duration_ms, 0);
    }

    #[test]
    fn deserializes_partial_tracks() {
        let track: RemoteTrack = serde_json::from_str(r#"{"id":"42"}"#).unwrap();
        assert_eq!(track.id, "42");
        assert!(track.artists.is_empty());
        assert!(track.duration_ms.is_none());
    }

    #[test]
    fn notifies_only_on_change() {
        let (provider, poller, calls) = poller(PollMode::Poll);
        provider.push(Ok(remote("1", 200_000)));
        provider.push(Ok(remote("1", 200_000)));
        provider.push(Ok(remote("2", 180_000)));

        assert!(poller.update().unwrap());
        assert!(!poller.update().unwrap());
        assert!(poller.update().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(poller.current_track().unwrap().id, "2");
    }

    #[test]
    fn update_mode_leaves_notification_to_observer() {
        let (provider, poller, calls) = poller(PollMode::Update);
        provider.push(Ok(remote("1", 200_000)));
        assert!(poller.update().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(Arc::new(poller).spawn().unwrap().is_none());
    }

    #[test]
    fn failures_keep_cached_track() {
        let (provider, poller, _) = poller(PollMode::Poll);
        provider.push(Ok(remote("1", 200_000)));
        provider.push(Err(Error::unavailable("network hiccup")));

        poller.update().unwrap();
        assert!(poller.update().is_err());
        assert_eq!(poller.current_track().unwrap().id, "1");
        assert_eq!(poller.cycle(), Poller::POLL_INTERVAL);
    }

    #[test]
    fn lazy_delay_after_track_change() {
        let (provider, poller, _) = poller(PollMode::Lazy);
        provider.push(Ok(remote("1", 200_000)));
        provider.push(Ok(remote("2", 180_000)));
        provider.push(Ok(remote("3", 5_000)));

        // The first track is still startup.
        assert_eq!(poller.cycle(), Poller::POLL_INTERVAL);
        assert!(poller.is_startup());

        assert_eq!(poller.cycle(), Duration::from_secs(170));
        assert!(!poller.is_startup());

        // Shorter than the lead time.
        assert_eq!(poller.cycle(), Duration::ZERO);

        // No change.
        provider.push(Ok(remote("3", 5_000)));
        assert_eq!(poller.cycle(), Poller::POLL_INTERVAL);
    }

    #[test]
    fn poll_mode_ignores_durations() {
        let (provider, poller, _) = poller(PollMode::Poll);
        provider.push(Ok(remote("1", 200_000)));
        provider.push(Ok(remote("2", 180_000)));
        poller.cycle();
        assert_eq!(poller.cycle(), Poller::POLL_INTERVAL);
    }

    #[test]
    fn poll_thread_stops() {
        let (provider, poller, _) = poller(PollMode::Poll);
        provider.push(Ok(remote("1", 200_000)));
        let handle = Arc::new(poller).spawn().unwrap().unwrap();
        handle.stop();
    }
}

//! Reconciliation scenarios driven through the public API with a manual clock.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use lockstep::{
    clock::{Clock, ManualClock},
    discovery::Discovery,
    error::{Error, Result},
    events::SessionEvent,
    observer::{LocalObserver, SessionObserver, Snapshot, TransportStatus},
    playback::State,
    remote::{RemoteProvider, RemoteTrack},
    track::Source,
};

/// A remote provider whose answer the test swaps at will.
#[derive(Default)]
struct Switchable(Mutex<Option<RemoteTrack>>);

impl Switchable {
    fn playing(id: &str, duration_ms: u64) -> Arc<Self> {
        let provider = Arc::new(Self::default());
        provider.switch(id, duration_ms);
        provider
    }

    fn switch(&self, id: &str, duration_ms: u64) {
        *self.0.lock().unwrap() = Some(RemoteTrack {
            id: id.to_owned(),
            title: Some(id.to_owned()),
            artists: Vec::new(),
            duration_ms: Some(duration_ms),
        });
    }
}

impl RemoteProvider for Switchable {
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

/// A local session that started playing `title` at the clock's current time.
fn session(clock: &ManualClock, title: &str, duration_ms: u64) -> Arc<SessionObserver> {
    let observer = Arc::new(SessionObserver::new(clock.shared()));
    observer.handle(
        SessionEvent::Metadata,
        &Snapshot {
            artist: "Artist".to_owned(),
            title: title.to_owned(),
            end_time: Some(Duration::from_millis(duration_ms)),
            status: TransportStatus::Playing,
            position: Duration::ZERO,
            position_updated_at: Some(clock.now()),
        },
    );
    observer
}

/// Two sources that agree on track "a" at the clock's current time.
fn agreeing(clock: &ManualClock) -> (Discovery, Arc<SessionObserver>, Arc<Switchable>) {
    let local = session(clock, "A", 200_000);
    let remote = Switchable::playing("a", 200_050);
    let discovery = Discovery::builder(clock.shared())
        .local(Arc::clone(&local) as Arc<dyn LocalObserver>)
        .remote(Arc::clone(&remote) as Arc<dyn RemoteProvider>)
        .build()
        .unwrap();

    let update = discovery.current().unwrap();
    assert_eq!(update.track.source, Source::Yandex);
    (discovery, local, remote)
}

/// Makes the remote side report track "b", which disagrees with the session.
fn diverge(discovery: &Discovery, remote: &Switchable) {
    remote.switch("b", 180_000);
    assert!(discovery.poller().unwrap().refresh().unwrap());
}

#[test]
fn agreeing_durations_prefer_remote_identity() {
    for delta in 0..200 {
        let clock = ManualClock::at_epoch_offset(1_000);
        let discovery = Discovery::builder(clock.shared())
            .local(session(&clock, "A", 200_000))
            .remote(Switchable::playing("a", 200_000 + delta))
            .build()
            .unwrap();

        let update = discovery.current().unwrap();
        assert_eq!(update.track.source, Source::Yandex, "delta {delta} ms");
        assert_eq!(update.track.id, "a", "delta {delta} ms");
    }
}

#[test]
fn disagreeing_durations_without_agreement_prefer_local() {
    let clock = ManualClock::at_epoch_offset(1_000);
    let discovery = Discovery::builder(clock.shared())
        .local(session(&clock, "A", 200_000))
        .remote(Switchable::playing("a", 200_200))
        .build()
        .unwrap();

    let update = discovery.current().unwrap();
    assert_eq!(update.track.source, Source::Local);
    assert_eq!(update.track.id, "Artist - A");
}

#[test]
fn agreement_uses_local_timing() {
    let clock = ManualClock::at_epoch_offset(1_000);
    let (discovery, local, _remote) = agreeing(&clock);

    clock.advance(Duration::from_secs(3));
    let update = discovery.current().unwrap();
    assert_eq!(update.track.id, "a");
    assert_eq!(update.playback.state, State::Playing);
    assert_eq!(update.playback, local.playback());
    assert_eq!(update.playback.position(), Duration::from_secs(3));
}

#[test]
fn grace_window_holds_until_fifteen_seconds() {
    let clock = ManualClock::at_epoch_offset(1_000);
    let (discovery, _local, remote) = agreeing(&clock);
    diverge(&discovery, &remote);

    let update = discovery.current().unwrap();
    assert_eq!(update.track.id, "b");
    assert_eq!(update.playback.position(), Duration::ZERO);

    clock.advance(Duration::from_millis(14_900));
    let update = discovery.current().unwrap();
    assert_eq!(update.track.id, "b");
    assert_eq!(update.playback.position(), Duration::from_millis(14_900));

    clock.advance(Duration::from_millis(200));
    let update = discovery.current().unwrap();
    assert_eq!(update.track.source, Source::Local);
}

#[test]
fn remote_change_is_bridged_then_falls_back_to_local() {
    let clock = ManualClock::at_epoch_offset(1_000);
    let (discovery, _local, remote) = agreeing(&clock);
    diverge(&discovery, &remote);
    assert_eq!(discovery.current().unwrap().track.id, "b");

    clock.advance(Duration::from_secs(5));
    let update = discovery.current().unwrap();
    assert_eq!(update.track.id, "b");
    assert_eq!(update.playback.state, State::Playing);
    assert_eq!(update.playback.position(), Duration::from_secs(5));

    clock.advance(Duration::from_secs(15));
    let update = discovery.current().unwrap();
    assert_eq!(update.track.source, Source::Local);
    assert_eq!(update.track.id, "Artist - A");
    assert_eq!(update.playback.position(), Duration::from_secs(20));
}

#[test]
fn agreement_again_rearms_grace() {
    let clock = ManualClock::at_epoch_offset(1_000);
    let (discovery, _local, remote) = agreeing(&clock);
    diverge(&discovery, &remote);
    discovery.current();

    clock.advance(Duration::from_secs(20));
    assert_eq!(discovery.current().unwrap().track.source, Source::Local);

    remote.switch("a", 200_000);
    discovery.poller().unwrap().refresh().unwrap();
    assert_eq!(discovery.current().unwrap().track.id, "a");

    diverge(&discovery, &remote);
    assert_eq!(discovery.current().unwrap().track.id, "b");
}

#[test]
fn session_events_refresh_the_remote_track() {
    let clock = ManualClock::at_epoch_offset(1_000);
    let (discovery, local, remote) = agreeing(&clock);

    remote.switch("c", 200_100);
    clock.advance(Duration::from_secs(1));
    local.handle(
        SessionEvent::Playback,
        &Snapshot {
            artist: "Artist".to_owned(),
            title: "A".to_owned(),
            end_time: Some(Duration::from_millis(200_000)),
            status: TransportStatus::Playing,
            position: Duration::from_secs(1),
            position_updated_at: Some(clock.now()),
        },
    );

    assert_eq!(discovery.current().unwrap().track.id, "c");
}

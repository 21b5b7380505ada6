//! The listening side.
//!
//! A [`Client`] polls its room on the sync server and keeps the local
//! [`Player`] in lock-step with what the host reports. Each poll maps the
//! room's [`Instance`] onto at most one transport [`Action`]:
//!
//! | Room                                  | Action                          |
//! |---------------------------------------|---------------------------------|
//! | no track, expired or stopped          | stop                            |
//! | another track                         | resolve, load and download      |
//! | same track, other state               | pause or resume                 |
//! | same track and state, other timeline  | reload at the host's position   |
//!
//! Audio is downloaded in a background task that feeds the pipeline chunk by
//! chunk. Loading another track or stopping cancels the download.

use std::{
    pin::pin,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use url::Url;

use crate::{
    clock::SharedClock,
    decrypt::Key,
    error::{Error, ErrorKind, Result},
    http::{self, SyncServer},
    pipeline::Feed,
    playback::{Instance, State, Update},
    player::Player,
    resolver::Resolver,
};

/// What to do with the player after a poll.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Nothing changed.
    Keep,
    Stop,
    Pause(Update),
    Resume(Update),
    /// Load the track and start at the update's position.
    Load(Update),
}

/// Decides how to bring the player from `applied`, the update it last
/// followed, to what `instance` reports at `now`.
#[must_use]
pub fn plan(applied: Option<&Update>, instance: &Instance, now: SystemTime) -> Action {
    let stop = || {
        if applied.is_some() {
            Action::Stop
        } else {
            Action::Keep
        }
    };

    if instance.is_expired(now) {
        return stop();
    }
    let Some(update) = instance.update() else {
        return stop();
    };
    if update.playback.state == State::Stopped {
        return stop();
    }

    let Some(applied) = applied else {
        return Action::Load(update);
    };
    if applied.track != update.track {
        return Action::Load(update);
    }

    match (applied.playback.state, update.playback.state) {
        (State::Playing, State::Paused) => Action::Pause(update),
        (State::Paused, State::Playing) => Action::Resume(update),
        (before, after) if before == after && applied.playback != update.playback => {
            Action::Load(update)
        }
        _ => Action::Keep,
    }
}

/// Commands for a running client.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Set the output gain.
    Volume(f32),
    /// Reload the current track at the host's position.
    Resync,
}

impl Command {
    /// Parses a line of user input.
    ///
    /// `vol N` sets the volume to `N` within `0..=1`; values above 1 are read
    /// as a percentage.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        match words.next()? {
            "vol" | "volume" => {
                let value: f32 = words.next()?.parse().ok()?;
                if !value.is_finite() || value < 0.0 {
                    return None;
                }
                let value = if value > 1.0 { value / 100.0 } else { value };
                Some(Self::Volume(value.clamp(0.0, 1.0)))
            }
            "resync" => Some(Self::Resync),
            _ => None,
        }
    }
}

pub struct Client {
    server: SyncServer,
    resolver: Resolver,
    player: Player,
    room: String,
    poll_interval: Duration,
    clock: SharedClock,
    applied: Option<Update>,
    download: Option<JoinHandle<()>>,
}

impl Client {
    #[must_use]
    pub fn new(
        server: SyncServer,
        resolver: Resolver,
        player: Player,
        room: impl Into<String>,
        poll_interval: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            server,
            resolver,
            player,
            room: room.into(),
            poll_interval,
            clock,
            applied: None,
            download: None,
        }
    }

    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Polls the room until cancelled, applying commands in between.
    ///
    /// Poll failures are logged and retried on the next tick.
    pub async fn run(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll().await,
                Some(command) = commands.recv() => self.command(command),
            }
        }
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::Volume(volume) => self.player.set_volume(volume),
            Command::Resync => {
                info!("resynchronizing with host");
                self.applied = None;
            }
        }
    }

    async fn poll(&mut self) {
        let instance = match self.server.instance(&self.room).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!("failed to poll room {}: {e}", self.room);
                return;
            }
        };

        let now = self.clock.now();
        match plan(self.applied.as_ref(), &instance, now) {
            Action::Keep => {}
            Action::Stop => self.stop(),
            Action::Pause(update) => {
                debug!("host paused at {:.1}s", update.playback.position().as_secs_f32());
                self.player.pause();
                self.applied = Some(update);
            }
            Action::Resume(update) => {
                debug!("host resumed at {:.1}s", update.playback.position_at(now).as_secs_f32());
                self.player.resume();
                self.applied = Some(update);
            }
            Action::Load(update) => {
                if let Err(e) = self.load(&update).await {
                    error!("failed to load {}: {e}", update.track);
                    self.stop();
                }
                // Failed tracks are not retried until the host moves on.
                self.applied = Some(update);
            }
        }
    }

    async fn load(&mut self, update: &Update) -> Result<()> {
        self.cancel_download();

        let info = self.resolver.resolve(&update.track).await?;
        let key = info
            .decryption_key
            .as_deref()
            .map(str::parse::<Key>)
            .transpose()?;

        let track = update.track.clone();
        let feed = tokio::task::block_in_place(|| {
            self.player.load(track, key.as_ref(), &update.playback)
        })?;

        let client = Arc::clone(self.server.client());
        self.download = Some(tokio::spawn(async move {
            match download(&client, info.url, &feed).await {
                Ok(()) => debug!("download complete"),
                Err(e) if e.kind == ErrorKind::Cancelled => debug!("download cancelled"),
                Err(e) => error!("download failed: {e}"),
            }
        }));

        Ok(())
    }

    fn cancel_download(&mut self) {
        if let Some(download) = self.download.take() {
            download.abort();
        }
    }

    /// Stops playback and forgets the followed update.
    pub fn stop(&mut self) {
        self.cancel_download();
        tokio::task::block_in_place(|| self.player.stop());
        self.applied = None;
    }

    /// Stops playback and closes the player.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if the player did not close in time.
    pub fn close(&mut self) -> Result<()> {
        self.cancel_download();
        self.applied = None;
        tokio::task::block_in_place(|| self.player.close())
    }
}

/// Streams `url` into `feed` in arrival order.
async fn download(client: &http::Client, url: Url, feed: &Feed) -> Result<()> {
    let response = client.download(url).await?;
    let mut chunks = pin!(response.bytes_stream());

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let feed = feed.clone();
        // Writes block while the transcoder is full.
        tokio::task::spawn_blocking(move || feed.write(&chunk)).await??;
    }

    if !feed.is_current() {
        return Err(Error::cancelled("stream was replaced"));
    }
    feed.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        playback::Playback,
        track::{Source, Track},
    };

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn track(id: &str) -> Track {
        Track {
            source: Source::Yandex,
            id: id.to_owned(),
            title: "Title".to_owned(),
            artist: "Artist".to_owned(),
            duration_ms: 200_000,
        }
    }

    fn instance(track: Option<Track>, playback: Playback) -> Instance {
        Instance {
            uid: "room".to_owned(),
            expires_at: at(10_000),
            track,
            playback,
            host_recv_ts: at(1_000),
        }
    }

    fn playing(position: u64, updated_at: u64) -> Playback {
        Playback::playing(Duration::from_secs(position), at(updated_at))
    }

    #[test]
    fn empty_room_keeps_or_stops() {
        let room = instance(None, Playback::stopped(at(1_000)));
        assert_eq!(plan(None, &room, at(1_000)), Action::Keep);

        let applied = Update::new(track("a"), playing(0, 1_000));
        assert_eq!(plan(Some(&applied), &room, at(1_000)), Action::Stop);
    }

    #[test]
    fn expired_room_stops() {
        let applied = Update::new(track("a"), playing(0, 1_000));
        let room = instance(Some(track("a")), playing(0, 1_000));
        assert_eq!(plan(Some(&applied), &room, at(10_000)), Action::Stop);
    }

    #[test]
    fn new_track_loads() {
        let room = instance(Some(track("a")), playing(10, 1_000));
        assert_eq!(
            plan(None, &room, at(1_001)),
            Action::Load(Update::new(track("a"), playing(10, 1_000)))
        );

        let applied = Update::new(track("b"), playing(0, 900));
        assert!(matches!(
            plan(Some(&applied), &room, at(1_001)),
            Action::Load(_)
        ));
    }

    #[test]
    fn transport_changes_pause_and_resume() {
        let applied = Update::new(track("a"), playing(10, 1_000));
        let paused = instance(
            Some(track("a")),
            Playback::paused(Duration::from_secs(15), at(1_005)),
        );
        let Action::Pause(update) = plan(Some(&applied), &paused, at(1_006)) else {
            panic!("expected pause");
        };

        let resumed = instance(Some(track("a")), playing(15, 1_020));
        assert!(matches!(
            plan(Some(&update), &resumed, at(1_021)),
            Action::Resume(_)
        ));
    }

    #[test]
    fn same_timeline_keeps_playing() {
        let applied = Update::new(track("a"), playing(10, 1_000));
        // Published later, but describing the same start instant.
        let room = instance(Some(track("a")), playing(30, 1_020));
        assert_eq!(plan(Some(&applied), &room, at(1_021)), Action::Keep);
    }

    #[test]
    fn host_seek_reloads() {
        let applied = Update::new(track("a"), playing(10, 1_000));
        let room = instance(Some(track("a")), playing(90, 1_020));
        assert!(matches!(
            plan(Some(&applied), &room, at(1_021)),
            Action::Load(_)
        ));
    }

    #[test]
    fn host_stop_stops() {
        let applied = Update::new(track("a"), playing(10, 1_000));
        let room = instance(Some(track("a")), Playback::stopped(at(1_200)));
        assert_eq!(plan(Some(&applied), &room, at(1_200)), Action::Stop);
    }

    #[test]
    fn parses_volume_commands() {
        assert_eq!(Command::parse("vol 0.5"), Some(Command::Volume(0.5)));
        assert_eq!(Command::parse("vol 30"), Some(Command::Volume(0.3)));
        assert_eq!(Command::parse("  vol 1 "), Some(Command::Volume(1.0)));
        assert_eq!(Command::parse("vol 250"), Some(Command::Volume(1.0)));
        assert_eq!(Command::parse("vol -1"), None);
        assert_eq!(Command::parse("vol loud"), None);
        assert_eq!(Command::parse("vol"), None);
        assert_eq!(Command::parse("resync"), Some(Command::Resync));
        assert_eq!(Command::parse("play"), None);
    }
}

//! The publishing side.
//!
//! A [`Host`] owns a room on the sync server. Whenever the reconciliation
//! engine reports a change, and at a slow fixed interval besides, it asks
//! the engine for the current [`Update`] and posts it to the room. Updates
//! that equal the last published one are skipped, so a steadily playing
//! track is published once rather than on every event.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};

use crate::{
    discovery::Discovery,
    error::{Error, Result},
    events::{callback, Event},
    http::SyncServer,
    playback::Update,
};

pub struct Host {
    server: SyncServer,
    discovery: Arc<Discovery>,
    room: String,
    last: Option<Update>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
}

impl Host {
    /// Republish interval when no events arrive.
    ///
    /// Remote-only tracks only become stopped when asked for, so this also
    /// bounds how long a finished track stays published as playing.
    pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

    /// Creates a room, or reclaims `uid`, for `discovery` to publish to.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync server refuses or cannot be reached.
    pub async fn create(
        server: SyncServer,
        discovery: Arc<Discovery>,
        uid: Option<&str>,
    ) -> Result<Self> {
        let room = server.create_room(uid).await?;
        info!("hosting room {room}");

        Ok(Self {
            server,
            discovery,
            room,
            last: None,
            events: None,
        })
    }

    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Subscribes to the engine and starts its sources.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be started.
    pub fn start(&mut self) -> Result<()> {
        if self.events.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.discovery.on_update(callback(move |event| {
            tx.send(event)
                .map_err(|_| Error::cancelled("host is no longer publishing"))
        }));
        self.events = Some(rx);
        self.discovery.start()
    }

    /// Publishes updates until cancelled. Cancelling and running again
    /// resumes where it left off.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be started.
    pub async fn run(&mut self) -> Result<()> {
        self.start()?;

        let mut refresh = time::interval(Self::REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let events = self
                .events
                .as_mut()
                .ok_or_else(|| Error::internal("host is not subscribed"))?;
            tokio::select! {
                Some(event) = events.recv() => {
                    trace!("{event}");
                    // Coalesce bursts of events into one publish.
                    while events.try_recv().is_ok() {}
                }
                _ = refresh.tick() => {}
            }
            self.publish().await;
        }
    }

    /// Publishes the engine's current update unless it was published last.
    pub async fn publish(&mut self) {
        let discovery = Arc::clone(&self.discovery);
        // The engine may block on the remote provider.
        let update = match tokio::task::spawn_blocking(move || discovery.current()).await {
            Ok(update) => update,
            Err(e) => {
                error!("failed to reconcile sources: {e}");
                return;
            }
        };

        let Some(update) = update else {
            trace!("nothing playing");
            return;
        };
        if self.last.as_ref() == Some(&update) {
            debug!("Skipped: {update}");
            return;
        }

        match self.server.publish(&self.room, &update).await {
            Ok(()) => {
                info!("{update}");
                self.last = Some(update);
            }
            Err(e) if e.is_transient() => warn!("failed to publish update: {e}"),
            Err(e) => error!("failed to publish update: {e}"),
        }
    }

    /// Forgets the last published update, so the next one is always sent.
    pub fn resync(&mut self) {
        self.last = None;
    }

    /// Stops the engine and drops the host's subscription.
    pub fn stop(&mut self) {
        self.discovery.clear_callbacks();
        self.events = None;
        self.discovery.stop();
        info!("stopped hosting room {}", self.room);
    }
}

//! Change notifications and their subscribers.
//!
//! Sources announce that "something about what is playing changed" by
//! notifying a [`Subscribers`] list. Subscribers then pull the current state;
//! the [`Event`] only says where the change came from.
//!
//! A failing subscriber never affects the emitter or the other subscribers:
//! errors and panics are caught and logged per callback, and the callback
//! stays subscribed.
//!
//! # Example
//!
//! ```rust
//! use lockstep::events::{callback, Event, Subscribers};
//!
//! let subscribers = Subscribers::default();
//! subscribers.subscribe(callback(|event| {
//!     println!("{event} changed");
//!     Ok(())
//! }));
//! subscribers.notify(Event::RemoteTrack);
//! ```

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

use crate::error::Result;

/// Classes of raw events delivered by a local media session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The timeline (position) changed.
    Timeline,

    /// The timeline changed to a whole-second position, as happens on seeks
    /// and track starts.
    Seek,

    /// The playback info (transport status) changed.
    Playback,

    /// The track metadata changed.
    Metadata,
}

/// Origin of a change notification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The local media session delivered an event.
    Session(SessionEvent),

    /// The remote provider reports a different track.
    RemoteTrack,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeline => write!(f, "timeline"),
            Self::Seek => write!(f, "seek"),
            Self::Playback => write!(f, "playback"),
            Self::Metadata => write!(f, "metadata"),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(kind) => write!(f, "session {kind}"),
            Self::RemoteTrack => write!(f, "remote track"),
        }
    }
}

/// A change callback.
pub type Callback = Arc<dyn Fn(Event) -> Result<()> + Send + Sync>;

/// Wraps a closure into a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(Event) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An ordered list of callbacks with isolated failure handling.
#[derive(Default)]
pub struct Subscribers {
    callbacks: Mutex<Vec<Callback>>,
}

impl Subscribers {
    /// Appends a callback.
    pub fn subscribe(&self, callback: Callback) {
        self.lock().push(callback);
    }

    /// Removes all callbacks.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every callback in subscription order.
    ///
    /// The list is snapshotted first, so callbacks may subscribe or clear
    /// without deadlocking.
    pub fn notify(&self, event: Event) {
        let callbacks = self.lock().clone();
        for callback in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("error in {event} callback: {e}"),
                Err(_) => error!("{event} callback panicked"),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Callback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Error;

    #[test]
    fn failing_subscriber_does_not_stop_others() {
        let subscribers = Subscribers::default();
        let calls = Arc::new(AtomicUsize::new(0));

        subscribers.subscribe(callback(|_| Err(Error::unavailable("publish failed"))));
        subscribers.subscribe(callback(|_| panic!("subscriber bug")));
        let counter = Arc::clone(&calls);
        subscribers.subscribe(callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        subscribers.notify(Event::RemoteTrack);
        subscribers.notify(Event::Session(SessionEvent::Playback));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(subscribers.len(), 3, "failing callbacks stay subscribed");
    }

    #[test]
    fn clear_removes_all() {
        let subscribers = Subscribers::default();
        subscribers.subscribe(callback(|_| Ok(())));
        subscribers.clear();
        assert!(subscribers.is_empty());
    }
}

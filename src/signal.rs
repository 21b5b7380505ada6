//! System signals for graceful shutdown and resynchronization.
//!
//! * Ctrl-C and SIGTERM stop a host or client within its close timeout.
//! * SIGHUP makes a host republish its current update, and a client reload
//!   the current track at the host's position.
//!
//! Windows only has Ctrl-C.
//!
//! ```no_run
//! use lockstep::signal::Signals;
//!
//! # async fn example() -> lockstep::error::Result<()> {
//! let mut signals = Signals::new()?;
//! while !signals.recv().await.is_shutdown() {
//!     // resynchronize
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Signal {
    /// Ctrl-C or SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGHUP.
    Hangup,
}

impl Signal {
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        matches!(self, Self::Interrupt | Self::Terminate)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "Ctrl+C",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
        })
    }
}

/// Listens for the signals this process reacts to.
///
/// Handlers are installed on construction; until then the default
/// disposition applies.
pub struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be installed.
    pub fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: signal(SignalKind::terminate())?,
            #[cfg(unix)]
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> Signal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Signal::Interrupt,
                _ = self.terminate.recv() => Signal::Terminate,
                _ = self.hangup.recv() => Signal::Hangup,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            Signal::Interrupt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_hangup_keeps_running() {
        assert!(Signal::Interrupt.is_shutdown());
        assert!(Signal::Terminate.is_shutdown());
        assert!(!Signal::Hangup.is_shutdown());
        assert_eq!(Signal::Hangup.to_string(), "SIGHUP");
    }
}

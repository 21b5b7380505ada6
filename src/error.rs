//! Error handling for lockstep.
//!
//! All fallible operations return [`Result`] with an [`Error`] that carries
//! an [`ErrorKind`] based on gRPC status codes. The kind tells callers how to
//! react:
//!
//! * Transient source failures (`Unavailable`, `DeadlineExceeded`, `Unknown`)
//!   are logged and retried on the next cycle.
//! * Configuration failures (`FailedPrecondition`, `InvalidArgument`) abort
//!   startup.
//! * Pipeline failures (`Aborted`, `DataLoss`) end the current stream until
//!   the next track change.
//!
//! # Example
//!
//! ```rust
//! use lockstep::error::{Error, ErrorKind, Result};
//!
//! fn resolve(source: &str) -> Result<()> {
//!     if source != "Yandex" {
//!         return Err(Error::unimplemented(format!("{source} tracks cannot be resolved")));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether a failed cycle should simply be retried on the next one.
    ///
    /// Sources that fail with one of these kinds keep their previous state.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Unavailable
                | ErrorKind::DeadlineExceeded
                | ErrorKind::Unknown
                | ErrorKind::NotFound
                | ErrorKind::ResourceExhausted
                | ErrorKind::Cancelled
        )
    }
}

/// Standard result type for lockstep operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// HTTP Mapping: 499 Client Closed Request
    #[error("operation was cancelled")]
    Cancelled = 1,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("unknown error")]
    Unknown = 2,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    /// HTTP Mapping: 504 Gateway Timeout
    #[error("operation timed out")]
    DeadlineExceeded = 4,

    /// HTTP Mapping: 404 Not Found
    #[error("not found")]
    NotFound = 5,

    /// HTTP Mapping: 403 Forbidden
    #[error("permission denied")]
    PermissionDenied = 7,

    /// HTTP Mapping: 401 Unauthorized
    #[error("no valid authentication credentials")]
    Unauthenticated = 16,

    /// HTTP Mapping: 429 Too Many Requests
    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid state")]
    FailedPrecondition = 9,

    /// HTTP Mapping: 409 Conflict
    #[error("operation aborted")]
    Aborted = 10,

    /// HTTP Mapping: 400 Bad Request
    #[error("out of range")]
    OutOfRange = 11,

    /// HTTP Mapping: 501 Not Implemented
    #[error("not implemented")]
    Unimplemented = 12,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("internal error")]
    Internal = 13,

    /// HTTP Mapping: 503 Service Unavailable
    #[error("service unavailable")]
    Unavailable = 14,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

macro_rules! constructor {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        pub fn $name<E>(error: E) -> Self
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            Self::new(ErrorKind::$kind, error)
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    constructor!(
        /// A stream or subprocess was torn down while in use.
        aborted => Aborted
    );
    constructor!(
        /// An operation was cancelled before completion, e.g. on shutdown.
        cancelled => Cancelled
    );
    constructor!(
        /// Data was lost in an unrecoverable way, e.g. a failed decryption.
        data_loss => DataLoss
    );
    constructor!(
        /// A time-bound operation exceeded its limit.
        deadline_exceeded => DeadlineExceeded
    );
    constructor!(
        /// The system is not in a state that allows the operation, e.g. a
        /// required playback source is missing at startup.
        failed_precondition => FailedPrecondition
    );
    constructor!(
        /// Something that should never happen did.
        internal => Internal
    );
    constructor!(
        /// Provided arguments don't meet validation requirements.
        invalid_argument => InvalidArgument
    );
    constructor!(
        /// A requested resource doesn't exist, e.g. nothing is playing remotely.
        not_found => NotFound
    );
    constructor!(
        /// A value exceeds its allowed bounds.
        out_of_range => OutOfRange
    );
    constructor!(
        /// The caller lacks the necessary permissions.
        permission_denied => PermissionDenied
    );
    constructor!(
        /// A resource limit has been reached.
        resource_exhausted => ResourceExhausted
    );
    constructor!(
        /// Credentials are missing, invalid or expired.
        unauthenticated => Unauthenticated
    );
    constructor!(
        /// A service or device is temporarily unavailable.
        unavailable => Unavailable
    );
    constructor!(
        /// The requested operation isn't implemented.
        unimplemented => Unimplemented
    );
    constructor!(
        /// The error doesn't fit any other category.
        unknown => Unknown
    );
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as "{kind}: {details}".
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Subprocess pipes surface most pipeline failures as IO errors:
/// * `BrokenPipe` -> `Aborted` (decoder exited)
/// * `UnexpectedEof` -> `DataLoss`
/// * `TimedOut` -> `DeadlineExceeded`
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrNotAvailable | ConnectionRefused | NotConnected | AddrInUse => {
                Self::unavailable(err)
            }
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_connect() {
            return Self::unavailable(err);
        }

        if err.is_redirect() {
            return Self::resource_exhausted(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 => Self::unauthenticated(err),
                403 => Self::permission_denied(err),
                404 => Self::not_found(err),
                429 => Self::resource_exhausted(err),
                500..=599 => Self::unavailable(err),
                _ => Self::failed_precondition(err),
            };
        }

        Self::unknown(err)
    }
}

/// Converts JSON errors through IO error mapping.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

/// Converts configuration parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts time formatting errors to `Internal`.
impl From<time::error::Format> for Error {
    fn from(e: time::error::Format) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts blocking task failures to `Internal`.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::cancelled(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts audio device enumeration errors to `Unavailable`.
impl From<cpal::DevicesError> for Error {
    fn from(e: cpal::DevicesError) -> Self {
        Self::unavailable(e.to_string())
    }
}

/// Converts default stream configuration errors.
///
/// * `DeviceNotAvailable` -> `Unavailable`
/// * `StreamTypeNotSupported` -> `Unimplemented`
/// * others -> `Unknown`
impl From<cpal::DefaultStreamConfigError> for Error {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        use cpal::DefaultStreamConfigError::*;
        match e {
            DeviceNotAvailable => Self::unavailable(e),
            StreamTypeNotSupported => Self::unimplemented(e),
            BackendSpecific { err } => Self::unknown(err),
        }
    }
}

/// Converts stream build errors.
///
/// * `DeviceNotAvailable` -> `Unavailable`
/// * `StreamConfigNotSupported` / `InvalidArgument` -> `InvalidArgument`
/// * others -> `Unknown`
impl From<cpal::BuildStreamError> for Error {
    fn from(e: cpal::BuildStreamError) -> Self {
        use cpal::BuildStreamError::*;
        match e {
            DeviceNotAvailable => Self::unavailable(e),
            StreamConfigNotSupported | InvalidArgument => Self::invalid_argument(e),
            StreamIdOverflow => Self::resource_exhausted(e),
            BackendSpecific { err } => Self::unknown(err),
        }
    }
}

/// Converts stream start errors to `Unavailable`.
impl From<cpal::PlayStreamError> for Error {
    fn from(e: cpal::PlayStreamError) -> Self {
        Self::unavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_kind_and_details() {
        let err = Error::not_found("nothing is playing");
        assert_eq!(err.to_string(), "not found: nothing is playing");
    }

    #[test]
    fn io_errors_map_to_pipeline_kinds() {
        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "decoder exited");
        assert_eq!(Error::from(broken).kind, ErrorKind::Aborted);

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        assert_eq!(Error::from(eof).kind, ErrorKind::DataLoss);
    }

    #[test]
    fn transient_kinds() {
        assert!(Error::unavailable("network hiccup").is_transient());
        assert!(Error::not_found("empty response").is_transient());
        assert!(!Error::failed_precondition("no source").is_transient());
        assert!(!Error::aborted("decoder died").is_transient());
    }
}

//! Runtime configuration.
//!
//! Configuration is layered, from lowest to highest precedence:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables and command line flags (applied by the binary)
//!
//! ```toml
//! server = "http://localhost:5400"
//! volume = 0.2
//! prefer = "remote"
//! require = ["local"]
//! poll_mode = "poll"
//!
//! [remote]
//! endpoint = "http://localhost:5500/current"
//! source = "Yandex"
//!
//! [resolver]
//! endpoint = "http://localhost:5500/download-info"
//! source = "Yandex"
//! ```

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use url::Url;

use crate::{
    discovery::DiscoverySource,
    error::{Error, Result},
    remote::PollMode,
    track::Source,
};

/// An HTTP service that speaks for one track source.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub endpoint: Url,
    pub source: Source,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the sync server.
    pub server: Url,

    /// Room to host or join. Hosts get a fresh room when unset.
    pub room: Option<String>,

    /// Initial linear output gain in `0.0..=1.0`.
    pub volume: f32,

    /// Upper bound for every stop and close path.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub close_timeout: Duration,

    /// How often a client polls the sync server.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub poll_interval: Duration,

    /// Remote provider reporting what the account is playing.
    pub remote: Option<Endpoint>,

    /// Track resolver returning download information.
    pub resolver: Option<Endpoint>,

    /// Use this source exclusively instead of arbitrating.
    pub prefer: Option<DiscoverySource>,

    /// Fail at startup if any of these sources is unavailable.
    pub require: Vec<DiscoverySource>,

    /// Remote poll mode. Chosen from the available sources when unset.
    pub poll_mode: Option<PollMode>,

    /// Decoder program, invoked with ffmpeg-compatible arguments.
    pub decoder: String,

    pub sample_rate: u32,
    pub channels: u16,

    #[serde(skip, default = "Config::user_agent")]
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: Url::parse(Self::DEFAULT_SERVER).expect("default server is a valid URL"),
            room: None,
            volume: 0.2,
            close_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            remote: None,
            resolver: None,
            prefer: None,
            require: Vec::new(),
            poll_mode: None,
            decoder: "ffmpeg".to_owned(),
            sample_rate: 44_100,
            channels: 2,
            user_agent: Self::user_agent(),
        }
    }
}

impl Config {
    pub const DEFAULT_SERVER: &'static str = "http://localhost:5400";

    /// Configuration files larger than this are rejected without reading.
    pub const MAX_SIZE: u64 = 64 * 1024;

    /// Loads configuration from a TOML file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, is
    /// malformed or contains invalid values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Checks values that deserialization cannot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for out of range values.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::invalid_argument(format!(
                "volume {} is not within 0.0 and 1.0",
                self.volume
            )));
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(Error::invalid_argument(
                "sample rate and channels must be positive",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_argument("poll interval must be positive"));
        }
        if self.decoder.trim().is_empty() {
            return Err(Error::invalid_argument("decoder program is empty"));
        }
        if let Some(prefer) = self.prefer {
            if !self.require.is_empty() && !self.require.contains(&prefer) {
                warn!("preferring {prefer} although it is not required");
            }
        }

        Ok(())
    }

    /// Builds the `User-Agent` header value.
    ///
    /// # Panics
    ///
    /// Panics when the package name or version contain characters that are
    /// not allowed in a product token.
    #[must_use]
    pub fn user_agent() -> String {
        let app_name = env!("CARGO_PKG_NAME");
        let app_version = env!("CARGO_PKG_VERSION");

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr: char| chr == '/' || chr == ';';
        assert!(
            !(app_name.is_empty()
                || app_name.contains(illegal_chars)
                || app_version.is_empty()
                || app_version.contains(illegal_chars)),
            "application name and/or version invalid (\"{app_name}\"; \"{app_version}\")"
        );

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version()
            .filter(|version| !version.is_empty() && !version.contains(illegal_chars))
            .unwrap_or_else(|| String::from("0"));

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");
        user_agent
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.as_str(), "http://localhost:5400/");
        assert!((config.volume - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.decoder, "ffmpeg");
        assert!(config.user_agent.starts_with("lockstep/"));
        config.validate().unwrap();
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_sources() {
        let config: Config = r#"
            server = "http://sync.example.com:5400"
            room = "abc"
            close_timeout = 2.5
            prefer = "remote"
            require = ["local"]
            poll_mode = "poll"

            [remote]
            endpoint = "http://localhost:5500/current"
            source = "Yandex"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.room.as_deref(), Some("abc"));
        assert_eq!(config.close_timeout, Duration::from_millis(2_500));
        assert_eq!(config.prefer, Some(DiscoverySource::Remote));
        assert_eq!(config.require, vec![DiscoverySource::Local]);
        assert_eq!(config.poll_mode, Some(PollMode::Poll));
        assert_eq!(config.remote.map(|remote| remote.source), Some(Source::Yandex));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = "volume = 1.5".parse::<Config>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = "colume = 0.5".parse::<Config>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "volume = 0.5").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert!((config.volume - 0.5).abs() < f32::EPSILON);
    }
}

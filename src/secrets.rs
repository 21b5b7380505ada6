//! Credentials for the remote provider and track resolver.
//!
//! Secrets are kept out of the main configuration in their own TOML file:
//!
//! ```toml
//! token = "y0_AgAAAA..."
//! ```
//!
//! The token is redacted from `Debug` output so it never ends up in logs.

use std::{fs, path::Path};

use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// An OAuth token for the remote provider.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
#[redact(all)]
pub struct Token(String);

impl Token {
    /// Wraps a token.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the token is empty or contains
    /// characters that cannot be sent in an HTTP header.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::invalid_argument("token is empty"));
        }
        if !token.chars().all(|c| c.is_ascii_graphic()) {
            return Err(Error::invalid_argument(
                "token contains whitespace or non-ASCII characters",
            ));
        }

        Ok(Self(token.to_owned()))
    }

    /// The token in clear text, for use in an `Authorization` header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

/// Contents of the secrets file.
#[derive(Clone, Default, PartialEq, Eq, Redact)]
pub struct Secrets {
    #[redact]
    pub token: Option<Token>,
}

impl Secrets {
    /// Secrets files larger than this are rejected without reading them.
    pub const MAX_SIZE: u64 = 4 * 1024;

    /// Loads secrets from a TOML file.
    ///
    /// # Errors
    ///
    /// * `NotFound` when the file does not exist
    /// * `OutOfRange` when the file is implausibly large
    /// * `InvalidArgument` when the file is malformed or the token invalid
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: the file should be small.
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
}

impl std::str::FromStr for Secrets {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        #[derive(Deserialize)]
        struct Raw {
            token: Option<String>,
        }

        let raw: Raw = toml::from_str(s)?;
        let token = raw.token.map(Token::new).transpose()?;
        Ok(Self { token })
    }
}

//! Stream decryption for protected audio downloads.
//!
//! Tracks are delivered as one continuous AES-CTR stream:
//! * 128, 192 or 256 bit key, hex-encoded by the resolver
//! * 96-bit all-zero nonce followed by a 32-bit big-endian block counter
//! * Keystream position carries over between chunks, so chunks must be
//!   applied in arrival order and exactly once
//!
//! A new track always gets a new [`Decrypt`], which resets the counter.
//!
//! # Example
//!
//! ```rust
//! use lockstep::decrypt::{Decrypt, Key};
//!
//! let key: Key = "000102030405060708090a0b0c0d0e0f".parse()?;
//! let mut decrypt = Decrypt::new(&key)?;
//!
//! let mut chunk = vec![0_u8; 4096];
//! decrypt.apply(&mut chunk)?;
//! # Ok::<(), lockstep::error::Error>(())
//! ```

use std::{fmt, str::FromStr};

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr32BE<Aes128>;
type Aes192Ctr = ctr::Ctr32BE<Aes192>;
type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Validated decryption key.
///
/// Parsed from a hex string of 32, 48 or 64 digits. The key bytes are not
/// printed by `Debug`.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    /// Accepted key lengths in bytes.
    pub const LENGTHS: [usize; 3] = [16, 24, 32];

    /// Key length in bits.
    #[must_use]
    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }
}

impl FromStr for Key {
    type Err = Error;

    /// Parses a hex-encoded key.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` for non-hex characters or an odd number of digits
    /// * `OutOfRange` when the key is not 128, 192 or 256 bits long
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() % 2 != 0 {
            return Err(Error::invalid_argument(
                "key has an odd number of hex digits",
            ));
        }

        let key = s
            .as_bytes()
            .chunks_exact(2)
            .map(|pair| {
                let high = hex_digit(pair[0])?;
                let low = hex_digit(pair[1])?;
                Ok((high << 4) | low)
            })
            .collect::<Result<Vec<u8>>>()?;

        let len = key.len();
        if !Self::LENGTHS.contains(&len) {
            return Err(Error::out_of_range(format!(
                "key length is {len} bytes but should be one of {:?}",
                Self::LENGTHS
            )));
        }

        Ok(Self(key))
    }
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::invalid_argument(format!(
            "invalid hex digit {:?} in key",
            char::from(c)
        ))),
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(AES-{})", self.bits())
    }
}

/// Stateful stream decryptor for a single track.
pub struct Decrypt {
    cipher: Cipher,
}

enum Cipher {
    Aes128(Box<Aes128Ctr>),
    Aes192(Box<Aes192Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl Decrypt {
    /// Initial counter block: zero nonce, counter starting at zero.
    const IV: [u8; 16] = [0; 16];

    /// Creates a decryptor positioned at the start of the stream.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the cipher rejects the key length.
    pub fn new(key: &Key) -> Result<Self> {
        let invalid = |e: ctr::cipher::InvalidLength| {
            Error::invalid_argument(format!("cannot initialize cipher: {e}"))
        };
        let cipher = match key.0.len() {
            16 => Cipher::Aes128(Box::new(
                Aes128Ctr::new_from_slices(&key.0, &Self::IV).map_err(invalid)?,
            )),
            24 => Cipher::Aes192(Box::new(
                Aes192Ctr::new_from_slices(&key.0, &Self::IV).map_err(invalid)?,
            )),
            _ => Cipher::Aes256(Box::new(
                Aes256Ctr::new_from_slices(&key.0, &Self::IV).map_err(invalid)?,
            )),
        };

        Ok(Self { cipher })
    }

    /// Decrypts `buf` in place and advances the keystream.
    ///
    /// # Errors
    ///
    /// Returns `DataLoss` when the keystream is exhausted. The stream cannot
    /// continue after that.
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = match &mut self.cipher {
            Cipher::Aes128(cipher) => cipher.try_apply_keystream(buf),
            Cipher::Aes192(cipher) => cipher.try_apply_keystream(buf),
            Cipher::Aes256(cipher) => cipher.try_apply_keystream(buf),
        };

        result.map_err(|e| Error::data_loss(format!("decryption failed: {e}")))
    }
}

impl fmt::Debug for Decrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self.cipher {
            Cipher::Aes128(_) => 128,
            Cipher::Aes192(_) => 192,
            Cipher::Aes256(_) => 256,
        };
        write!(f, "Decrypt(AES-{bits}-CTR)")
    }
}

//! Client identity derivation.
//!
//! A [`ClientId`] is the lowercase hex SHA-256 of the broker host, port,
//! nickname and an optional salt, concatenated in that order. Sessions draw
//! a random salt when they start so that two clients with identical
//! parameters still get distinct ids. A rename derives the new id without a
//! salt, so post-rename ids are a pure function of host, port and nickname.

use std::fmt;

use rand::Rng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

/// Length of generated salts and nicknames.
pub const TOKEN_LEN: usize = 8;

/// Opaque broker-facing identifier of a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Wraps an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this client id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives a client id from connection parameters and the nickname.
///
/// Deterministic in its inputs; `None` and `Some("")` hash identically.
#[must_use]
pub fn generate(host: &str, port: u16, nickname: &str, salt: Option<&str>) -> ClientId {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(port.to_string().as_bytes());
    hasher.update(nickname.as_bytes());
    if let Some(salt) = salt {
        hasher.update(salt.as_bytes());
    }
    ClientId(format!("{:x}", hasher.finalize()))
}

/// Draws a random lowercase token of [`TOKEN_LEN`] letters.
#[must_use]
pub fn random_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| char::from(b'a' + rng.random_range(0..26u8)))
        .collect()
}

/// Picks a random nickname of [`TOKEN_LEN`] distinct lowercase letters.
#[must_use]
pub fn random_nickname() -> String {
    let mut letters: Vec<char> = ('a'..='z').collect();
    letters.shuffle(&mut rand::rng());
    letters.into_iter().take(TOKEN_LEN).collect()
}

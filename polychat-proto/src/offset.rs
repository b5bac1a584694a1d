//! Starting-position policy for newly opened cursors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a freshly opened cursor starts reading a channel.
///
/// The policy is a deployment choice: a client fixes it once when its
/// session is built and every cursor it opens afterwards uses it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OffsetPolicy {
    /// Only messages published after the cursor was opened.
    #[default]
    Latest,
    /// Every message the broker still retains for the channel.
    Earliest,
}

/// Error returned when parsing an unknown policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown offset policy '{0}' (expected 'latest' or 'earliest')")]
pub struct ParseOffsetPolicyError(String);

impl FromStr for OffsetPolicy {
    type Err = ParseOffsetPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "earliest" => Ok(Self::Earliest),
            _ => Err(ParseOffsetPolicyError(s.to_string())),
        }
    }
}

impl fmt::Display for OffsetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Earliest => write!(f, "earliest"),
        }
    }
}

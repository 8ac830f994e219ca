//! Change-feed positions.
//!
//! A position answers "everything up to here has been seen". It is either an
//! opaque [`ResumeToken`] handed out by a change source, or a [`Timestamp`]
//! on the source's logical clock.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque, totally ordered change-feed position.
///
/// Tokens are produced by a change source and must be handed back to the
/// same source unmodified. Ordering follows the feed order of the source
/// that produced them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Wraps a token string.
    pub fn new(token: impl Into<String>) -> ProtocolResult<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(ProtocolError::InvalidToken("token is empty".into()));
        }
        Ok(Self(token))
    }

    /// Returns the token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the token, returning its string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical clock value of a change source: `(seconds, ordinal)`.
///
/// The ordinal orders events committed within the same second. Ordering is
/// lexicographic, so the clock is monotonically non-decreasing per source.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Ordinal within the second.
    pub ordinal: u32,
}

impl Timestamp {
    /// The zero timestamp, earlier than any real event.
    pub const ZERO: Timestamp = Timestamp {
        seconds: 0,
        ordinal: 0,
    };

    /// Creates a timestamp.
    pub const fn new(seconds: u32, ordinal: u32) -> Self {
        Self { seconds, ordinal }
    }

    /// The smallest timestamp ordered after this one.
    #[must_use]
    pub fn successor(self) -> Self {
        match self.ordinal.checked_add(1) {
            Some(ordinal) => Self::new(self.seconds, ordinal),
            None => Self::new(self.seconds.saturating_add(1), 0),
        }
    }

    /// Returns a timestamp `secs` seconds earlier, saturating at zero.
    #[must_use]
    pub fn saturating_sub_secs(self, secs: u32) -> Self {
        Self::new(self.seconds.saturating_sub(secs), 0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seconds, self.ordinal)
    }
}

impl FromStr for Timestamp {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, ord) = s.split_once('.').unwrap_or((s, "0"));
        let seconds = secs
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidTimestamp(s.to_string()))?;
        let ordinal = ord
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidTimestamp(s.to_string()))?;
        Ok(Self { seconds, ordinal })
    }
}

/// Where a tailing session begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAt {
    /// Strictly after the event that produced the token.
    Token(ResumeToken),
    /// No event earlier than the timestamp (inclusive).
    Time(Timestamp),
}

impl fmt::Display for StartAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartAt::Token(token) => write!(f, "token {token}"),
            StartAt::Time(ts) => write!(f, "time {ts}"),
        }
    }
}

/// A concrete position in a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPosition {
    /// Token resuming immediately after this position.
    pub token: ResumeToken,
    /// Cluster time of this position.
    pub cluster_time: Timestamp,
}

/// What a resume token store reports at watch start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPoint {
    /// Last durably handled token.
    pub token: Option<ResumeToken>,
    /// Cluster time of the event that produced `token`.
    pub token_time: Option<Timestamp>,
    /// "Start no earlier than" entry written by fatal-error recovery.
    pub start_at_time: Option<Timestamp>,
}

impl StartPoint {
    /// A start point with nothing stored.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if neither a token nor a start time is stored.
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.start_at_time.is_none()
    }
}

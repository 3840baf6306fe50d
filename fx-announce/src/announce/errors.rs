use crate::announce::bencode::BencodeError;
use crate::announce::CompactError;
use std::io;
use thiserror::Error;
use url::ParseError;

/// The result type of announce operations.
pub type Result<T> = std::result::Result<T, AnnounceError>;

/// Error type for tracker announce operations.
///
/// The variants separate malformed input, transport failures, tracker rejections and
/// cancellation, so callers can decide whether an announce is worth retrying.
#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("tracker url \"{0}\" is invalid")]
    InvalidUrl(String),
    #[error("tracker scheme \"{0}\" is not supported")]
    UnsupportedScheme(String),
    #[error("tracker {0} has no available addresses")]
    Unavailable(String),
    #[error("an io error occurred while communicating with the tracker, {0}")]
    Io(io::Error),
    #[error("the announcer socket has failed permanently, {0}")]
    Fatal(io::Error),
    #[error("timed out while waiting for the tracker response")]
    Timeout,
    #[error("tracker reported a failure, {0}")]
    TrackerFailure(String),
    #[error("tracker responded with invalid status code {0}")]
    InvalidStatus(u16),
    #[error("failed to parse tracker response, {0}")]
    Parse(String),
    #[error("the announce has been cancelled")]
    Cancelled,
}

impl AnnounceError {
    /// Returns true when the tracker didn't respond within the retransmission budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns true when the same announce might succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Io(_) | Self::Unavailable(_))
    }
}

impl PartialEq for AnnounceError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidUrl(_), Self::InvalidUrl(_)) => true,
            (Self::UnsupportedScheme(_), Self::UnsupportedScheme(_)) => true,
            (Self::Unavailable(_), Self::Unavailable(_)) => true,
            (Self::Io(_), Self::Io(_)) => true,
            (Self::Fatal(_), Self::Fatal(_)) => true,
            (Self::Timeout, Self::Timeout) => true,
            (Self::TrackerFailure(_), Self::TrackerFailure(_)) => true,
            (Self::InvalidStatus(_), Self::InvalidStatus(_)) => true,
            (Self::Parse(_), Self::Parse(_)) => true,
            (Self::Cancelled, Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for AnnounceError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for AnnounceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Io(io::Error::new(io::ErrorKind::TimedOut, err.to_string()));
        }

        Self::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

impl From<ParseError> for AnnounceError {
    fn from(error: ParseError) -> Self {
        Self::InvalidUrl(error.to_string())
    }
}

impl From<serde_bencode::Error> for AnnounceError {
    fn from(error: serde_bencode::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

impl From<BencodeError> for AnnounceError {
    fn from(error: BencodeError) -> Self {
        Self::Parse(error.to_string())
    }
}

impl From<CompactError> for AnnounceError {
    fn from(error: CompactError) -> Self {
        Self::Parse(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_eq() {
        assert_eq!(AnnounceError::Timeout, AnnounceError::Timeout);
        assert_eq!(
            AnnounceError::TrackerFailure("foo".to_string()),
            AnnounceError::TrackerFailure("bar".to_string())
        );
        assert_ne!(AnnounceError::Timeout, AnnounceError::Cancelled);
        assert_ne!(
            AnnounceError::Io(io::Error::from(io::ErrorKind::Other)),
            AnnounceError::Fatal(io::Error::from(io::ErrorKind::Other))
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(AnnounceError::Timeout.is_timeout());
        assert!(AnnounceError::Timeout.is_retryable());
        assert!(!AnnounceError::TrackerFailure("banned".to_string()).is_retryable());
        assert!(!AnnounceError::Cancelled.is_retryable());
        assert!(!AnnounceError::Fatal(io::Error::from(io::ErrorKind::Other)).is_retryable());
    }

    #[test]
    fn test_from_io() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "FooBar");

        let result = AnnounceError::from(err);

        assert_eq!(
            AnnounceError::Io(io::Error::from(io::ErrorKind::TimedOut)),
            result
        );
    }

    #[test]
    fn test_from_parse_error() {
        let result = AnnounceError::from(ParseError::EmptyHost);

        assert_eq!(AnnounceError::InvalidUrl(String::new()), result);
    }
}

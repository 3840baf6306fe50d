use std::{io, result};
use thiserror::Error;

/// The result type of the logger bootstrap.
pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("the logger has already been initialized")]
    AlreadyInitialized,
    #[error("logger configuration is invalid, {0}")]
    InvalidConfig(String),
    #[error("failed to prepare the log file, {0}")]
    Io(io::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        matches!(
            (self, other),
            (Error::AlreadyInitialized, Error::AlreadyInitialized)
                | (Error::InvalidConfig(_), Error::InvalidConfig(_))
                | (Error::Io(_), Error::Io(_))
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_eq() {
        assert_eq!(
            Error::InvalidConfig("lorem".to_string()),
            Error::InvalidConfig("ipsum".to_string())
        );
        assert_ne!(
            Error::AlreadyInitialized,
            Error::Io(io::Error::from(io::ErrorKind::NotFound))
        );
    }

    #[test]
    fn test_from_io() {
        let result = Error::from(io::Error::from(io::ErrorKind::PermissionDenied));

        assert_eq!(
            Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)),
            result
        );
    }
}

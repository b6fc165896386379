//! Error types for objsync

use thiserror::Error;

/// Result type alias for objsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for objsync
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (file system operations)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Storage backend errors not tied to a specific SDK
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Invalid URI format
    #[error("Invalid URI: {uri} - {reason}")]
    InvalidUri { uri: String, reason: String },

    /// AWS SDK error
    #[error("AWS error: {message}")]
    Aws { message: String },

    /// A store could not list its contents
    #[error("Enumeration of {store} failed: {source}")]
    Enumeration {
        store: String,
        #[source]
        source: Box<Error>,
    },

    /// A single copy or delete failed
    #[error("Transfer of {path} failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: Box<Error>,
    },

    /// Digest computation failed
    #[error("Checksum of {path} failed: {message}")]
    Checksum { path: String, message: String },

    /// A multipart part exhausted its retry budget
    #[error("Part {part_number} of upload {upload_id} failed after {attempts} attempts: {source}")]
    Session {
        upload_id: String,
        part_number: u32,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A multipart session outlived its deadline before completing
    #[error("Upload {upload_id} expired before completion")]
    SessionExpired { upload_id: String },

    /// Aborting an already-failed session failed as well
    #[error("{cause}; abort of upload {upload_id} also failed: {abort}")]
    Abort {
        upload_id: String,
        cause: Box<Error>,
        abort: Box<Error>,
    },

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an AWS error from anything displayable
    pub fn aws(err: impl std::fmt::Display) -> Self {
        Self::Aws {
            message: err.to_string(),
        }
    }

    /// Wrap an error as an enumeration failure of `store`
    pub fn enumeration(store: impl Into<String>, source: Error) -> Self {
        Self::Enumeration {
            store: store.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an error as the failure of the action targeting `path`
    pub fn transfer(path: impl Into<String>, source: Error) -> Self {
        match source {
            // already attributed
            Error::Transfer { .. } => source,
            other => Self::Transfer {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// Whether this error (or the error it wraps) is an exhausted multipart session
    pub fn is_session_failure(&self) -> bool {
        match self {
            Error::Session { .. } => true,
            Error::Transfer { source, .. } => source.is_session_failure(),
            Error::Abort { cause, .. } => cause.is_session_failure(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_does_not_double_wrap() {
        let inner = Error::transfer("a.txt", Error::storage("boom"));
        let outer = Error::transfer("a.txt", inner);
        match outer {
            Error::Transfer { source, .. } => assert!(matches!(*source, Error::Storage { .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_abort_error_reports_both() {
        let err = Error::Abort {
            upload_id: "u-1".into(),
            cause: Box::new(Error::storage("part failed")),
            abort: Box::new(Error::storage("abort refused")),
        };
        let msg = err.to_string();
        assert!(msg.contains("part failed"));
        assert!(msg.contains("abort refused"));
    }

    #[test]
    fn test_is_session_failure_through_wrappers() {
        let session = Error::Session {
            upload_id: "u".into(),
            part_number: 2,
            attempts: 3,
            source: Box::new(Error::storage("x")),
        };
        assert!(Error::transfer("big.bin", session).is_session_failure());
        assert!(!Error::config("nope").is_session_failure());
    }
}

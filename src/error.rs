use crate::parser::{ErrorKind, Status};
use std::{fmt, io};

/// Error type for [`ClusterGateway`](crate::ClusterGateway) operations.
#[derive(Debug)]
pub enum Error {
    /// The cluster configuration is unusable, e.g. it names no valid real server.
    ///
    /// Fatal to initialization and never retried.
    Configuration(String),
    /// I/O-related error while reading or writing the persisted server map, or while talking to
    /// an already connected backend.
    Io(io::Error),
    /// The persisted server map failed its integrity check.
    ///
    /// Handled internally by rebuilding the map; public operations never return it.
    CorruptState(String),
    /// No backend inside the probe window accepted a connection for the given key.
    BackendUnavailable {
        /// The logical key that could not be served.
        key: String,
        /// The `host:port` pairs that were tried, in probe order.
        attempted: Vec<String>,
    },
    /// Connect error.
    /// Useful for distinguishing between transitive I/O errors and connection errors.
    Connect(io::Error),
    /// A protocol-level error i.e. a failed operation or message that
    /// does not match the protocol specification.
    Protocol(Status),
    /// The key is empty after trimming, or longer than a backend accepts.
    InvalidKey(String),
}

impl Error {
    pub(crate) fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    /// Whether the failure means the backend connection itself is no longer usable.
    ///
    /// A reply the parser cannot frame leaves the stream out of step with the requests, so it
    /// counts as well.
    pub(crate) fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connect(_) | Error::Protocol(Status::Error(ErrorKind::Protocol(_)))
        )
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Configuration(m1), Self::Configuration(m2)) => m1 == m2,
            (Self::Io(e1), Self::Io(e2)) => e1.kind() == e2.kind(),
            (Self::CorruptState(m1), Self::CorruptState(m2)) => m1 == m2,
            (
                Self::BackendUnavailable {
                    key: k1,
                    attempted: a1,
                },
                Self::BackendUnavailable {
                    key: k2,
                    attempted: a2,
                },
            ) => k1 == k2 && a1 == a2,
            (Self::Connect(e1), Self::Connect(e2)) => e1.kind() == e2.kind(),
            (Self::Protocol(s1), Self::Protocol(s2)) => s1 == s2,
            (Self::InvalidKey(k1), Self::InvalidKey(k2)) => k1 == k2,
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(ref e) | Self::Connect(ref e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration: {}", msg),
            Self::Io(e) => write!(f, "io: {}", e),
            Self::CorruptState(msg) => write!(f, "corrupt state: {}", msg),
            Self::BackendUnavailable { key, attempted } => write!(
                f,
                "no backend available for key `{}` (tried {})",
                key,
                attempted.join(", ")
            ),
            Self::Connect(e) => write!(f, "connect: {}", e),
            Self::Protocol(e) => write!(f, "protocol: {}", e),
            Self::InvalidKey(key) => write!(f, "invalid key: `{}`", key),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        Error::Protocol(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_names_key_and_attempts() {
        let err = Error::BackendUnavailable {
            key: "session:42".to_string(),
            attempted: vec!["10.0.0.1:11211".to_string(), "10.0.0.2:11211".to_string()],
        };

        assert_eq!(
            err.to_string(),
            "no backend available for key `session:42` (tried 10.0.0.1:11211, 10.0.0.2:11211)"
        );
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(Error::Io(io::ErrorKind::BrokenPipe.into()).is_connection_loss());
        assert!(Error::Connect(io::ErrorKind::ConnectionRefused.into()).is_connection_loss());
        assert!(Error::Protocol(Status::Error(ErrorKind::Protocol(None))).is_connection_loss());
        assert!(!Error::Protocol(Status::NotStored).is_connection_loss());
        assert!(!Error::Protocol(Status::Error(ErrorKind::NonexistentCommand)).is_connection_loss());
        assert!(!Error::InvalidKey(String::new()).is_connection_loss());
    }
}

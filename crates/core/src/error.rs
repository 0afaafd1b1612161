//! Error types for the Conflux storage core.
//!
//! One error enum serves the whole workspace. Variants follow the failure
//! taxonomy of the cluster layer:
//!
//! - `Transient`: I/O, timeout, unreachable peer. Absorbed by the
//!   retry/quorum layer and surfaced only inside `Exhausted`.
//! - `Malformed`: framing or codec failure on incoming data. Never
//!   retried; the session is torn down.
//! - `Conflict`: a caller violated a precondition. Immediate.
//! - `Exhausted`: the replication policy could not be satisfied. Carries
//!   the attempted partitions and their sub-errors.
//! - `Fatal`: requires operator action (disk full on the WAL, corrupted
//!   id-generator state).
//! - `Shutdown`: the node is stopping; outstanding operations fail with
//!   this kind.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for Conflux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One partition's contribution to a quorum failure.
#[derive(Debug)]
pub struct PartitionFailure {
    /// Display form of the partition identifier.
    pub partition: String,
    /// The error that partition produced.
    pub cause: Box<Error>,
}

impl fmt::Display for PartitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.partition, self.cause)
    }
}

/// Error type for the Conflux storage core.
#[derive(Debug, Error)]
pub enum Error {
    /// Recoverable failure: I/O, timeout, DNS, or a peer currently marked
    /// dead. The cluster layer retries these; they reach a caller only
    /// wrapped inside [`Error::Exhausted`].
    #[error("transient: {message}")]
    Transient {
        /// What failed.
        message: String,
        /// Underlying cause, when one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Framing or codec failure on incoming data. Not retried.
    #[error("malformed: {message}")]
    Malformed {
        /// What could not be decoded.
        message: String,
        /// Underlying cause, when one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A caller violated an operation precondition.
    #[error("conflict: {message}")]
    Conflict {
        /// Which precondition was violated.
        message: String,
    },

    /// Quorum not reachable within the replication policy.
    #[error("quorum not reached: {acked} of {required} required acks")]
    Exhausted {
        /// Acks required by the quorum policy.
        required: usize,
        /// Acks actually observed.
        acked: usize,
        /// The partitions that failed, with their sub-errors.
        failures: Vec<PartitionFailure>,
    },

    /// Unrecoverable condition requiring operator action.
    #[error("fatal: {message}")]
    Fatal {
        /// What went wrong.
        message: String,
        /// Underlying cause, when one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The node is stopping; the operation was failed, not attempted.
    #[error("shutting down")]
    Shutdown,
}

impl Error {
    /// Transient failure with a message only.
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Transient failure wrapping an underlying error.
    pub fn transient_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Timeout on the named operation. Timeouts are transient.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Error::Transient {
            message: format!("{} timed out", operation.into()),
            source: None,
        }
    }

    /// Malformed input with a message only.
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::Malformed {
            message: message.into(),
            source: None,
        }
    }

    /// Malformed input wrapping an underlying error.
    pub fn malformed_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Malformed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Precondition violation.
    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
        }
    }

    /// Quorum failure carrying the per-partition sub-errors.
    pub fn exhausted(required: usize, acked: usize, failures: Vec<PartitionFailure>) -> Self {
        Error::Exhausted {
            required,
            acked,
            failures,
        }
    }

    /// Unrecoverable failure with a message only.
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Fatal {
            message: message.into(),
            source: None,
        }
    }

    /// Unrecoverable failure wrapping an underlying error.
    pub fn fatal_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Fatal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for failures the quorum layer may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// True for framing/codec failures.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed { .. })
    }

    /// True when the replication policy could not be satisfied.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::Exhausted { .. })
    }

    /// True for conditions that must stop the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }

    /// True when the operation was refused because the node is stopping.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }

    /// The failed partitions of an `Exhausted` error, empty otherwise.
    pub fn failed_partitions(&self) -> Vec<&str> {
        match self {
            Error::Exhausted { failures, .. } => {
                failures.iter().map(|f| f.partition.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transient {
            message: format!("I/O error: {e}"),
            source: Some(Box::new(e)),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Malformed {
            message: "codec failure".to_string(),
            source: Some(Box::new(e)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed {
            message: "command envelope failure".to_string(),
            source: Some(Box::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::transient("io").is_transient());
        assert!(Error::malformed("bad frame").is_malformed());
        assert!(Error::fatal("disk full").is_fatal());
        assert!(Error::Shutdown.is_shutdown());
        assert!(!Error::conflict("body on body-less op").is_transient());
    }

    #[test]
    fn exhausted_carries_partitions() {
        let failures = vec![
            PartitionFailure {
                partition: "p1".to_string(),
                cause: Box::new(Error::transient("connection refused")),
            },
            PartitionFailure {
                partition: "p3".to_string(),
                cause: Box::new(Error::timeout("upload")),
            },
        ];
        let err = Error::exhausted(3, 1, failures);
        assert!(err.is_exhausted());
        assert_eq!(err.failed_partitions(), vec!["p1", "p3"]);
        let msg = err.to_string();
        assert!(msg.contains("1 of 3"));
    }

    #[test]
    fn io_error_is_transient_with_cause() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err: Error = io_err.into();
        assert!(err.is_transient());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn codec_error_is_malformed() {
        let bad = vec![0xFFu8; 2];
        let result: std::result::Result<String, bincode::Error> = bincode::deserialize(&bad);
        let err: Error = result.unwrap_err().into();
        assert!(err.is_malformed());
    }
}

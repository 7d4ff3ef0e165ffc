//! Shared error types for the Realm layer.

use thiserror::Error;

/// Top-level error type for Realm operations.
///
/// Variants carry string payloads so a single failure can be cloned out to
/// every caller waiting on the same peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealmError {
    /// The peer could not be reached over any transport.
    #[error("Peer unreachable: {call_sign} ({reason})")]
    PeerUnreachable {
        /// The call sign that was addressed.
        call_sign: String,
        /// Why the attempt failed.
        reason: String,
    },

    /// A query did not receive a response in time.
    #[error("Query {request_id} timed out after {timeout_ms}ms")]
    QueryTimeout {
        /// Correlation id of the query.
        request_id: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The query was cancelled before a response arrived.
    #[error("Query {0} was cancelled")]
    Cancelled(String),

    /// The remote query handler returned an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The outbound queue for a peer is full.
    #[error("Outbound queue for {call_sign} is full ({capacity} frames)")]
    QueueFull {
        /// The peer whose queue overflowed.
        call_sign: String,
        /// Configured capacity.
        capacity: usize,
    },

    /// Too many queries are outstanding.
    #[error("Too many pending queries (max {0})")]
    TooManyPending(usize),

    /// The call sign is empty or otherwise unusable.
    #[error("Invalid call sign: {0:?}")]
    InvalidCallSign(String),

    /// The Realm has not been started or was already shut down.
    #[error("Realm is not running")]
    NotRunning,

    /// A malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The discovery service rejected or failed a request.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Negotiated channel setup failed.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl RealmError {
    /// Shorthand for [`RealmError::PeerUnreachable`].
    pub fn unreachable(call_sign: &str, reason: impl Into<String>) -> Self {
        Self::PeerUnreachable {
            call_sign: call_sign.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a query timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::QueryTimeout { .. })
    }
}

impl From<std::io::Error> for RealmError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Alias for Realm results.
pub type RealmResult<T> = Result<T, RealmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_display() {
        let err = RealmError::unreachable("bravo", "negotiation timed out");
        assert_eq!(
            err.to_string(),
            "Peer unreachable: bravo (negotiation timed out)"
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_distinct_from_unreachable() {
        let err = RealmError::QueryTimeout {
            request_id: "q-1".to_string(),
            timeout_ms: 250,
        };
        assert!(err.is_timeout());
        assert_ne!(err, RealmError::unreachable("bravo", "offline"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: RealmError = io.into();
        assert!(matches!(err, RealmError::Io(ref m) if m.contains("reset")));
    }
}

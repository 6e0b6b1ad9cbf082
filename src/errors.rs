use crate::types::VenueId;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::pubsub_client::PubsubClientError;
use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeSet;
use thiserror::Error;

/// Router error taxonomy
///
/// Clone is required: a single contender outcome may be delivered to
/// several race waiters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// Network or RPC failure
    #[error("Transport error: {message} (endpoint: {endpoint})")]
    Transport { endpoint: String, message: String },

    /// A delegated venue has no registered transport
    #[error("Unknown venue: {0}")]
    UnknownVenue(VenueId),

    /// Transaction write-set spans more than one venue
    #[error("Routing conflict: write-set spans {} venues ({})", venues.len(), format_venues(venues))]
    Conflict { venues: BTreeSet<VenueId> },

    /// Programming error on the caller side
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller-initiated cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Deadline elapsed without the awaited event
    #[error("Timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    /// Delegation-program-owned record that cannot be decoded
    #[error("Malformed delegation record {address}: {reason}")]
    MalformedRecord { address: Pubkey, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RouterResult<T> = Result<T, RouterError>;

fn format_venues(venues: &BTreeSet<VenueId>) -> String {
    venues
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl RouterError {
    /// Check if the failed operation is worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::Transport { .. } => true,
            RouterError::TimedOut { .. } => true,

            RouterError::UnknownVenue(_) => false,
            RouterError::Conflict { .. } => false,
            RouterError::InvalidArgument(_) => false,
            RouterError::Cancelled => false,
            RouterError::MalformedRecord { .. } => false,
            RouterError::Configuration(_) => false,
            RouterError::Internal(_) => false,
        }
    }

    /// Get the endpoint associated with this error, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            RouterError::Transport { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    pub fn transport(endpoint: &str, message: impl Into<String>) -> Self {
        RouterError::Transport {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Create from ClientError with context.
    ///
    /// RPC timeouts stay transport failures; `TimedOut` is reserved for
    /// confirmation deadlines.
    pub fn from_client_error(err: ClientError, endpoint: &str) -> Self {
        let err_str = err.to_string();
        let lowered = err_str.to_lowercase();

        if lowered.contains("timeout") || lowered.contains("timed out") {
            RouterError::transport(endpoint, format!("timeout: {}", err_str))
        } else {
            RouterError::transport(endpoint, err_str)
        }
    }

    pub fn from_pubsub_error(err: PubsubClientError, endpoint: &str) -> Self {
        RouterError::transport(endpoint, format!("pubsub: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_client::client_error::ClientErrorKind;

    #[test]
    fn test_error_is_retryable() {
        assert!(RouterError::transport("https://test.com", "connection reset").is_retryable());
        assert!(RouterError::TimedOut { timeout_ms: 5000 }.is_retryable());

        assert!(!RouterError::Cancelled.is_retryable());
        assert!(!RouterError::Conflict {
            venues: BTreeSet::new()
        }
        .is_retryable());
        assert!(!RouterError::UnknownVenue(VenueId(Pubkey::new_unique())).is_retryable());
    }

    #[test]
    fn test_conflict_message_lists_venues() {
        let a = VenueId(Pubkey::new_unique());
        let b = VenueId(Pubkey::new_unique());
        let err = RouterError::Conflict {
            venues: [a, b].into_iter().collect(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 venues"));
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
    }

    #[test]
    fn test_rpc_timeout_is_transport_error() {
        let err = RouterError::from_client_error(
            ClientError::from(ClientErrorKind::Custom("request timed out".to_string())),
            "https://test.com",
        );

        assert!(matches!(err, RouterError::Transport { .. }));
        assert!(err.to_string().contains("timeout"));
        assert_eq!(err.endpoint(), Some("https://test.com"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_error_keeps_message() {
        let err = RouterError::from_client_error(
            ClientError::from(ClientErrorKind::Custom("connection refused".to_string())),
            "https://test.com",
        );
        assert_eq!(
            err,
            RouterError::transport("https://test.com", "connection refused")
        );
    }

    #[test]
    fn test_error_endpoint() {
        let err = RouterError::transport("https://test.com", "boom");
        assert_eq!(err.endpoint(), Some("https://test.com"));
        assert_eq!(RouterError::Cancelled.endpoint(), None);
    }
}

//! Error types for the publish path.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A failure reported by the broker transport.
///
/// Stored as a message so that one failed connect attempt can be handed to
/// every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Step of topology provisioning that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyStep {
    DeclareDeadLetterExchange,
    DeclareDeadLetterQueue,
    BindDeadLetterQueue,
    DeclareQueue,
}

impl fmt::Display for TopologyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            TopologyStep::DeclareDeadLetterExchange => "declare dead-letter exchange",
            TopologyStep::DeclareDeadLetterQueue => "declare dead-letter queue",
            TopologyStep::BindDeadLetterQueue => "bind dead-letter queue",
            TopologyStep::DeclareQueue => "declare main queue",
        };
        f.write_str(step)
    }
}

/// Errors returned by [`Publisher::publish`](super::Publisher::publish).
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// Broker URL missing or unusable. No connection was attempted.
    #[error("broker connection not configured: {0}")]
    Connection(String),

    /// Connecting, opening the channel, or writing failed.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[source] TransportError),

    /// Topology provisioning failed on a fresh connection.
    #[error("failed to {step}: {source}")]
    Topology {
        step: TopologyStep,
        #[source]
        source: TransportError,
    },

    /// Payload could not be encoded as JSON.
    #[error("failed to serialize payload: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl PublishError {
    /// True for every failure caused by the broker side, topology included.
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(
            self,
            PublishError::BrokerUnavailable(_) | PublishError::Topology { .. }
        )
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(err: serde_json::Error) -> Self {
        PublishError::Serialization(Arc::new(err))
    }
}

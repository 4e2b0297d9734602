//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The update envelope published for downstream consumers
//! - A lifecycle-managed publisher with backpressure
//! - Topology provisioning (main queue plus dead-letter exchange and queue)
//! - The transport seam and its lapin implementation
//!
//! ## Topology
//!
//! ```text
//! publish → telegram.updates ──dead-letter──▶ telegram.dlx ──telegram.dlq──▶ telegram.dlq
//! ```

pub mod amqp;
pub mod error;
pub mod publisher;
pub mod topology;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use amqp::AmqpTransport;
pub use error::{PublishError, TopologyStep, TransportError};
pub use publisher::{LifecycleState, Publisher, ShutdownOutcome};
pub use topology::Topology;
pub use transport::{BrokerChannel, BrokerConnection, ConnectionEvent, Transport};
pub use types::{UpdateEnvelope, CONTENT_TYPE_JSON};

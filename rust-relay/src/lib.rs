//! Telegram relay - durable hand-off of webhook updates to RabbitMQ.
//!
//! The HTTP layer receiving webhooks calls [`Publisher::publish`] with each
//! update; the publisher owns the broker connection, provisions the queue
//! topology, applies backpressure, and closes everything on shutdown.
//!
//! ## Architecture
//!
//! ```text
//! Webhook handler → Publisher → telegram.updates → consumers
//!                                    │
//!                                    └─(dead-lettered)→ telegram.dlx → telegram.dlq
//! ```

pub mod config;
pub mod logging;
pub mod queue;
pub mod signals;

// Re-export commonly used types
pub use config::Config;
pub use queue::{
    LifecycleState, PublishError, Publisher, ShutdownOutcome, Topology, UpdateEnvelope,
};
pub use signals::install_shutdown_handler;

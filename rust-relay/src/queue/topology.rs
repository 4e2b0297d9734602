//! Durable queue topology: main queue with a dead-letter exchange and queue.

use tracing::info;

use super::error::{PublishError, TopologyStep};
use super::transport::{BrokerChannel, DeadLetter, QueueSpec};
use crate::Config;

/// Names of everything declared on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Topology {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue.clone(),
            dead_letter_exchange: config.dead_letter_exchange.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
        }
    }

    /// Dead-letter routing for the main queue. The routing key is the DLQ name.
    pub fn dead_letter(&self) -> DeadLetter {
        DeadLetter {
            exchange: self.dead_letter_exchange.clone(),
            routing_key: self.dead_letter_queue.clone(),
        }
    }

    /// Declare the topology on `channel`.
    ///
    /// Runs on every new connection; the broker treats identical declarations
    /// as no-ops. Stops at the first failing step.
    pub async fn provision(&self, channel: &dyn BrokerChannel) -> Result<(), PublishError> {
        channel
            .declare_direct_exchange(&self.dead_letter_exchange)
            .await
            .map_err(|source| PublishError::Topology {
                step: TopologyStep::DeclareDeadLetterExchange,
                source,
            })?;

        channel
            .declare_queue(QueueSpec {
                name: &self.dead_letter_queue,
                dead_letter: None,
            })
            .await
            .map_err(|source| PublishError::Topology {
                step: TopologyStep::DeclareDeadLetterQueue,
                source,
            })?;

        channel
            .bind_queue(
                &self.dead_letter_queue,
                &self.dead_letter_exchange,
                &self.dead_letter_queue,
            )
            .await
            .map_err(|source| PublishError::Topology {
                step: TopologyStep::BindDeadLetterQueue,
                source,
            })?;

        channel
            .declare_queue(QueueSpec {
                name: &self.queue,
                dead_letter: Some(self.dead_letter()),
            })
            .await
            .map_err(|source| PublishError::Topology {
                step: TopologyStep::DeclareQueue,
                source,
            })?;

        info!(
            queue = %self.queue,
            dead_letter_exchange = %self.dead_letter_exchange,
            dead_letter_queue = %self.dead_letter_queue,
            "rabbitmq_topology_declared"
        );

        Ok(())
    }
}

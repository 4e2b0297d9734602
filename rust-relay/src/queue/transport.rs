//! Transport abstraction between the publisher lifecycle and the wire.
//!
//! The [`Publisher`](super::Publisher) only talks to these traits. The AMQP
//! implementation lives in [`super::amqp`]; tests drive the lifecycle with a
//! recording double.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use super::error::TransportError;

pub type TransportResult<T> = Result<T, TransportError>;

/// Connection-level notifications pushed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection reported an error. A `Closed` event follows if fatal.
    Error(TransportError),
    /// The connection is gone.
    Closed,
}

/// Sender half handed to [`Transport::connect`].
pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// Validated connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub url: Url,
    pub heartbeat_secs: u16,
    pub frame_max: u32,
}

/// Where a dead-lettered message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

/// Durable queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec<'a> {
    pub name: &'a str,
    pub dead_letter: Option<DeadLetter>,
}

/// A message ready to be written.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    /// Target queue, routed through the default exchange.
    pub routing_key: &'a str,
    pub body: &'a [u8],
    pub content_type: &'a str,
    /// Survive a broker restart once enqueued.
    pub persistent: bool,
}

/// Opens connections to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection. Connection-level events are reported on `events`.
    async fn connect(
        &self,
        params: &ConnectParams,
        events: EventSink,
    ) -> TransportResult<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> TransportResult<Box<dyn BrokerChannel>>;

    async fn close(&self) -> TransportResult<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;

    /// Declare a durable direct exchange.
    async fn declare_direct_exchange(&self, name: &str) -> TransportResult<()>;

    async fn declare_queue(&self, spec: QueueSpec<'_>) -> TransportResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> TransportResult<()>;

    /// Write a message. Returns `false` when the outbound buffer is saturated
    /// and the caller should wait for [`BrokerChannel::drained`].
    async fn publish(&self, message: OutboundMessage<'_>) -> TransportResult<bool>;

    /// Resolve once the outbound buffer is back below its threshold.
    async fn drained(&self) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

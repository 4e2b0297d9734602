//! RabbitMQ transport built on lapin.
//!
//! Backpressure is measured as the window of publisher confirms the broker has
//! not answered yet. Confirms that already resolved are dropped from the
//! window before it is measured. A write that fills the window reports
//! saturation, and draining awaits confirms until the window is back at half
//! capacity.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::transport::{
    BrokerChannel, BrokerConnection, ConnectParams, ConnectionEvent, EventSink, OutboundMessage,
    QueueSpec, Transport, TransportResult,
};

/// Opens lapin connections.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    publish_window: usize,
}

impl AmqpTransport {
    /// `publish_window` is the number of unconfirmed publishes allowed before
    /// a write reports saturation.
    pub fn new(publish_window: usize) -> Self {
        Self {
            publish_window: publish_window.max(1),
        }
    }
}

/// Build the connection URI, adding heartbeat and frame size unless the
/// configured URL already sets them.
fn connection_uri(params: &ConnectParams) -> String {
    let mut url = params.url.clone();
    let has = |key: &str| url.query_pairs().any(|(k, _)| k == key);
    let missing_heartbeat = !has("heartbeat");
    let missing_frame_max = !has("frame_max");

    if missing_heartbeat || missing_frame_max {
        let mut query = url.query_pairs_mut();
        if missing_heartbeat {
            query.append_pair("heartbeat", &params.heartbeat_secs.to_string());
        }
        if missing_frame_max {
            query.append_pair("frame_max", &params.frame_max.to_string());
        }
    }

    url.into()
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        params: &ConnectParams,
        events: EventSink,
    ) -> TransportResult<Box<dyn BrokerConnection>> {
        let uri = connection_uri(params);
        let connection = Connection::connect(&uri, ConnectionProperties::default()).await?;

        connection.on_error(move |err| {
            // lapin only reports fatal errors here; the connection is gone.
            let _ = events.send(ConnectionEvent::Error(err.into()));
            let _ = events.send(ConnectionEvent::Closed);
        });

        Ok(Box::new(AmqpConnection {
            connection,
            publish_window: self.publish_window,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    publish_window: usize,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> TransportResult<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!(
            channel_id = channel.id(),
            publish_window = self.publish_window,
            "rabbitmq_channel_created"
        );

        Ok(Box::new(AmqpChannel {
            channel,
            confirms: Mutex::new(ConfirmWindow::new(self.publish_window)),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        self.connection.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

type PendingConfirm = BoxFuture<'static, lapin::Result<Confirmation>>;

/// Publisher confirms the broker has not answered yet.
struct ConfirmWindow {
    capacity: usize,
    pending: VecDeque<PendingConfirm>,
}

impl ConfirmWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: VecDeque::new(),
        }
    }

    fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Track a new confirm. Returns `false` when the window is full.
    fn push(&mut self, confirm: PendingConfirm) -> bool {
        self.pending.push_back(confirm);
        self.prune();
        self.pending.len() < self.capacity
    }

    /// Drop every confirm that has already resolved, logging nacks and errors.
    fn prune(&mut self) {
        self.pending
            .retain_mut(|confirm| match confirm.as_mut().now_or_never() {
                None => true,
                Some(result) => {
                    log_confirmation(result);
                    false
                }
            });
    }

    /// Await confirms in publish order until at most half the window is
    /// outstanding.
    async fn drain(&mut self) -> TransportResult<()> {
        self.prune();
        let low_water = self.capacity / 2;

        while self.pending.len() > low_water {
            let Some(confirm) = self.pending.pop_front() else {
                break;
            };
            let confirmation = confirm.await?;
            if confirmation.is_nack() {
                warn!("rabbitmq_publish_nacked");
            }
        }

        Ok(())
    }
}

fn log_confirmation(result: lapin::Result<Confirmation>) {
    match result {
        Ok(confirmation) if confirmation.is_nack() => warn!("rabbitmq_publish_nacked"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "rabbitmq_publish_confirm_failed"),
    }
}

struct AmqpChannel {
    channel: Channel,
    confirms: Mutex<ConfirmWindow>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_direct_exchange(&self, name: &str) -> TransportResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec<'_>) -> TransportResult<()> {
        let mut arguments = FieldTable::default();
        if let Some(dead_letter) = &spec.dead_letter {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dead_letter.exchange.as_str().into()),
            );
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dead_letter.routing_key.as_str().into()),
            );
        }

        self.channel
            .queue_declare(
                spec.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> TransportResult<bool> {
        let delivery_mode = if message.persistent { 2 } else { 1 };

        let confirm = self
            .channel
            .basic_publish(
                "",
                message.routing_key,
                BasicPublishOptions::default(),
                message.body,
                BasicProperties::default()
                    .with_delivery_mode(delivery_mode)
                    .with_content_type(message.content_type.into()),
            )
            .await?;

        Ok(self.confirms.lock().await.push(confirm.boxed()))
    }

    async fn drained(&self) -> TransportResult<()> {
        let mut confirms = self.confirms.lock().await;
        confirms.drain().await?;
        info!(
            channel_id = self.channel.id(),
            outstanding = confirms.outstanding(),
            "rabbitmq_publish_drained"
        );
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.channel.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

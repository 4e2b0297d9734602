//! Broker publisher with an explicit connection lifecycle.
//!
//! The publisher connects lazily on the first `publish`, provisions the queue
//! topology on every new connection, and tears everything down once on
//! shutdown.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──publish──▶ Connecting ──ok──▶ Ready ──shutdown──▶ ShuttingDown
//!       ▲                        │                │                      │
//!       └────────failure─────────┘                │                      │
//!       └────────────broker closed────────────────┘                      │
//!       └────────────────────────────closed──────────────────────────────┘
//! ```
//!
//! Concurrent callers that find the publisher `Connecting` wait on the same
//! attempt and see the same result. The attempt runs as its own task, so it
//! finishes even if every waiting caller gives up.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use url::Url;

use super::amqp::AmqpTransport;
use super::error::{PublishError, TransportError};
use super::topology::Topology;
use super::transport::{
    BrokerChannel, BrokerConnection, ConnectParams, ConnectionEvent, EventSink, OutboundMessage,
    Transport,
};
use super::types::CONTENT_TYPE_JSON;
use crate::Config;

type ConnectAttempt = Shared<BoxFuture<'static, Attempt>>;
type ShutdownTask = Shared<BoxFuture<'static, ShutdownOutcome>>;

/// Observable lifecycle state of a [`Publisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Connecting,
    Ready,
    ShuttingDown,
}

/// Result of [`Publisher::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// No connection was open; nothing was closed.
    NothingToClose,
    /// The channel and connection were closed.
    Closed,
}

/// A live connection with its channel. Topology is provisioned before a
/// session is ever stored as `Ready`.
struct Session {
    generation: u64,
    connection: Box<dyn BrokerConnection>,
    channel: Box<dyn BrokerChannel>,
}

impl Session {
    /// Close the channel, then the connection. Errors are logged and dropped.
    async fn release(&self) {
        if let Err(e) = self.channel.close().await {
            warn!(generation = self.generation, error = %e, "rabbitmq_channel_close_error");
        }

        if let Err(e) = self.connection.close().await {
            warn!(generation = self.generation, error = %e, "rabbitmq_connection_close_error");
        }
    }
}

/// How a connect attempt ended.
#[derive(Clone)]
enum Attempt {
    Ready(Arc<Session>),
    Failed(PublishError),
    /// A shutdown took over while connecting; whatever was opened has been
    /// closed again.
    Superseded,
}

enum State {
    Uninitialized,
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
    },
    Ready(Arc<Session>),
    ShuttingDown(ShutdownTask),
}

/// Async RabbitMQ publisher with connection lifecycle management.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    config: Config,
    topology: Topology,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    generations: AtomicU64,
}

impl Publisher {
    /// Create a publisher over an arbitrary transport. Nothing connects yet.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                topology: Topology::from_config(&config),
                config,
                transport,
                state: Mutex::new(State::Uninitialized),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Create a publisher backed by lapin.
    pub fn amqp(config: Config) -> Self {
        let transport = AmqpTransport::new(config.publish_window);
        Self::new(config, Arc::new(transport))
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub async fn state(&self) -> LifecycleState {
        match &*self.inner.state.lock().await {
            State::Uninitialized => LifecycleState::Uninitialized,
            State::Connecting { .. } => LifecycleState::Connecting,
            State::Ready(_) => LifecycleState::Ready,
            State::ShuttingDown(_) => LifecycleState::ShuttingDown,
        }
    }

    /// Publish a JSON payload to the main queue as a persistent message.
    ///
    /// Connects and provisions topology first if needed. When the transport
    /// reports a full outbound buffer this waits for it to drain before
    /// returning. A write that races a broker disconnect fails with
    /// [`PublishError::BrokerUnavailable`]; retrying is up to the caller.
    pub async fn publish<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), PublishError> {
        let session = self.ready_session().await?;

        let body = serde_json::to_vec(payload)?;
        let queue = self.inner.topology.queue.as_str();

        let within_capacity = session
            .channel
            .publish(OutboundMessage {
                routing_key: queue,
                body: &body,
                content_type: CONTENT_TYPE_JSON,
                persistent: true,
            })
            .await
            .map_err(PublishError::BrokerUnavailable)?;

        if !within_capacity {
            info!(queue = %queue, generation = session.generation, "rabbitmq_publish_backpressure");
            session
                .channel
                .drained()
                .await
                .map_err(PublishError::BrokerUnavailable)?;
        }

        info!(queue = %queue, body_length = body.len(), "rabbitmq_update_published");

        Ok(())
    }

    /// Close the channel and connection, once.
    ///
    /// Calls that arrive while a shutdown is running wait for it and get the
    /// same outcome. A pending connect attempt is allowed to finish first and
    /// anything it opened is closed before this returns.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let task = {
            let mut state = self.inner.state.lock().await;
            match std::mem::replace(&mut *state, State::Uninitialized) {
                State::Uninitialized => return ShutdownOutcome::NothingToClose,
                State::Connecting {
                    generation,
                    attempt,
                } => {
                    info!(generation, "rabbitmq_shutdown_waiting_for_connect");
                    let task = spawn_shutdown(&self.inner, generation, async move {
                        match attempt.await {
                            Attempt::Superseded => ShutdownOutcome::Closed,
                            Attempt::Ready(session) => {
                                session.release().await;
                                ShutdownOutcome::Closed
                            }
                            Attempt::Failed(_) => ShutdownOutcome::NothingToClose,
                        }
                    });
                    *state = State::ShuttingDown(task.clone());
                    task
                }
                State::ShuttingDown(task) => {
                    *state = State::ShuttingDown(task.clone());
                    task
                }
                State::Ready(session) => {
                    let generation = session.generation;
                    let task = spawn_shutdown(&self.inner, generation, async move {
                        session.release().await;
                        ShutdownOutcome::Closed
                    });
                    *state = State::ShuttingDown(task.clone());
                    task
                }
            }
        };

        task.await
    }

    /// Return the live session, or join/start a connect attempt.
    async fn ready_session(&self) -> Result<Arc<Session>, PublishError> {
        let attempt = {
            let mut state = self.inner.state.lock().await;
            match std::mem::replace(&mut *state, State::Uninitialized) {
                State::Ready(session) if session.channel.is_open() => {
                    *state = State::Ready(Arc::clone(&session));
                    return Ok(session);
                }
                State::Connecting {
                    generation,
                    attempt,
                } => {
                    *state = State::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
                State::ShuttingDown(task) => {
                    *state = State::ShuttingDown(task);
                    return Err(PublishError::BrokerUnavailable(TransportError::new(
                        "publisher is shutting down",
                    )));
                }
                previous => {
                    if let State::Ready(stale) = previous {
                        warn!(generation = stale.generation, "rabbitmq_channel_lost");
                        tokio::spawn(async move { stale.release().await });
                    }

                    let params = self.connect_params()?;
                    let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    let attempt = start_connect(&self.inner, params, generation);
                    *state = State::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };

        match attempt.await {
            Attempt::Ready(session) => Ok(session),
            Attempt::Failed(e) => Err(e),
            Attempt::Superseded => Err(PublishError::BrokerUnavailable(TransportError::new(
                "publisher shut down while connecting",
            ))),
        }
    }

    fn connect_params(&self) -> Result<ConnectParams, PublishError> {
        let raw = self.inner.config.rabbitmq_url.trim();
        if raw.is_empty() {
            return Err(PublishError::Connection("RABBITMQ_URL is not set".to_string()));
        }

        let url = Url::parse(raw)
            .map_err(|e| PublishError::Connection(format!("invalid broker URL: {}", e)))?;

        if !matches!(url.scheme(), "amqp" | "amqps") {
            return Err(PublishError::Connection(format!(
                "unsupported broker URL scheme: {}",
                url.scheme()
            )));
        }

        Ok(ConnectParams {
            url,
            heartbeat_secs: self.inner.config.heartbeat_secs,
            frame_max: self.inner.config.frame_max,
        })
    }
}

fn start_connect(
    inner: &Arc<PublisherInner>,
    params: ConnectParams,
    generation: u64,
) -> ConnectAttempt {
    let handle = tokio::spawn(connect_and_provision(Arc::clone(inner), params, generation));

    let inner = Arc::clone(inner);
    async move {
        match handle.await {
            Ok(attempt) => attempt,
            Err(e) => {
                let mut state = inner.state.lock().await;
                if matches!(&*state, State::Connecting { generation: g, .. } if *g == generation) {
                    *state = State::Uninitialized;
                }
                Attempt::Failed(PublishError::BrokerUnavailable(TransportError::new(format!(
                    "connect task failed: {}",
                    e
                ))))
            }
        }
    }
    .boxed()
    .shared()
}

async fn connect_and_provision(
    inner: Arc<PublisherInner>,
    params: ConnectParams,
    generation: u64,
) -> Attempt {
    info!(
        generation,
        url_length = params.url.as_str().len(),
        "rabbitmq_publisher_connecting"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let result = establish(&inner, &params, events_tx, generation).await;

    let mut state = inner.state.lock().await;
    let current = matches!(&*state, State::Connecting { generation: g, .. } if *g == generation);

    match result {
        Ok(session) if current => {
            *state = State::Ready(Arc::clone(&session));
            drop(state);

            tokio::spawn(watch_connection(Arc::downgrade(&inner), generation, events_rx));
            info!(generation, queue = %inner.topology.queue, "rabbitmq_publisher_ready");
            Attempt::Ready(session)
        }
        Ok(session) => {
            drop(state);
            warn!(generation, "rabbitmq_connect_superseded");
            session.release().await;
            Attempt::Superseded
        }
        Err(e) => {
            if current {
                *state = State::Uninitialized;
            }
            warn!(generation, error = %e, "rabbitmq_publisher_connect_failed");
            Attempt::Failed(e)
        }
    }
}

/// Open connection and channel, then provision topology. Anything opened is
/// closed again if a later step fails.
async fn establish(
    inner: &PublisherInner,
    params: &ConnectParams,
    events: EventSink,
    generation: u64,
) -> Result<Arc<Session>, PublishError> {
    let connection = inner
        .transport
        .connect(params, events)
        .await
        .map_err(PublishError::BrokerUnavailable)?;

    info!(generation, "rabbitmq_publisher_connected");

    let channel = match connection.create_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                warn!(generation, error = %close_err, "rabbitmq_connection_close_error");
            }
            return Err(PublishError::BrokerUnavailable(e));
        }
    };

    let session = Session {
        generation,
        connection,
        channel,
    };

    if let Err(e) = inner.topology.provision(session.channel.as_ref()).await {
        session.release().await;
        return Err(e);
    }

    Ok(Arc::new(session))
}

/// Follow connection events for one generation. Errors are only logged; the
/// close event that follows a fatal error resets the state.
async fn watch_connection(
    inner: Weak<PublisherInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Error(e) => {
                warn!(generation, error = %e, "rabbitmq_connection_error");
            }
            ConnectionEvent::Closed => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };

                let mut state = inner.state.lock().await;
                if matches!(&*state, State::Ready(session) if session.generation == generation) {
                    *state = State::Uninitialized;
                    warn!(generation, "rabbitmq_connection_closed");
                }
                return;
            }
        }
    }
}

/// Run `close` as its own task, then reset to `Uninitialized`. The returned
/// future can be awaited by any number of callers.
fn spawn_shutdown<F>(inner: &Arc<PublisherInner>, generation: u64, close: F) -> ShutdownTask
where
    F: Future<Output = ShutdownOutcome> + Send + 'static,
{
    let task_inner = Arc::clone(inner);

    let handle = tokio::spawn(async move {
        info!(generation, "rabbitmq_publisher_shutting_down");
        let outcome = close.await;
        *task_inner.state.lock().await = State::Uninitialized;
        info!(generation, outcome = ?outcome, "rabbitmq_publisher_closed");
        outcome
    });

    let inner = Arc::clone(inner);
    async move {
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(generation, error = %e, "rabbitmq_shutdown_task_failed");
                *inner.state.lock().await = State::Uninitialized;
                ShutdownOutcome::Closed
            }
        }
    }
    .boxed()
    .shared()
}

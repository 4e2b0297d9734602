//! Recording transport double for lifecycle tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::error::TransportError;
use super::transport::{
    BrokerChannel, BrokerConnection, ConnectParams, ConnectionEvent, DeadLetter, EventSink,
    OutboundMessage, QueueSpec, Transport, TransportResult,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    CreateChannel,
    DeclareExchange(String),
    DeclareQueue(String, Option<DeadLetter>),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Publish {
        routing_key: String,
        body: Vec<u8>,
        content_type: String,
        persistent: bool,
    },
    WaitDrain,
    CloseChannel,
    CloseConnection,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    fail_connect: AtomicUsize,
    fail_bind: AtomicUsize,
    saturated: AtomicBool,
    current_channel: Mutex<Option<Arc<AtomicBool>>>,
    drain: Notify,
    events: Mutex<Option<EventSink>>,
}

impl Shared {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn open_channel(self: &Arc<Self>) -> MockChannel {
        let open = Arc::new(AtomicBool::new(true));
        *self.current_channel.lock().unwrap() = Some(open.clone());
        MockChannel {
            shared: self.clone(),
            open,
        }
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Publish { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn fail_connect_times(&self, n: usize) {
        self.shared.fail_connect.store(n, Ordering::SeqCst);
    }

    pub fn fail_bind_times(&self, n: usize) {
        self.shared.fail_bind.store(n, Ordering::SeqCst);
    }

    /// Make every subsequent write report a full outbound buffer.
    pub fn saturate(&self, saturated: bool) {
        self.shared.saturated.store(saturated, Ordering::SeqCst);
    }

    /// Deliver the drain signal to a waiting writer.
    pub fn release_drain(&self) {
        self.shared.drain.notify_one();
    }

    /// Push an event as if the broker had sent it.
    pub fn emit(&self, event: ConnectionEvent) {
        if let Some(sink) = self.shared.events.lock().unwrap().as_ref() {
            let _ = sink.send(event);
        }
    }

    /// Mark the newest channel closed without emitting any event.
    pub fn drop_channel(&self) {
        if let Some(open) = self.shared.current_channel.lock().unwrap().as_ref() {
            open.store(false, Ordering::SeqCst);
        }
    }

    /// An open channel that records into this transport's log.
    pub fn channel(&self) -> MockChannel {
        self.shared.open_channel()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _params: &ConnectParams,
        events: EventSink,
    ) -> TransportResult<Box<dyn BrokerConnection>> {
        self.shared.record(Call::Connect);
        tokio::task::yield_now().await;

        if take_failure(&self.shared.fail_connect) {
            return Err(TransportError::new("connection refused"));
        }

        *self.shared.events.lock().unwrap() = Some(events);
        Ok(Box::new(MockConnection {
            shared: self.shared.clone(),
        }))
    }
}

struct MockConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> TransportResult<Box<dyn BrokerChannel>> {
        self.shared.record(Call::CreateChannel);
        Ok(Box::new(self.shared.open_channel()))
    }

    async fn close(&self) -> TransportResult<()> {
        tokio::task::yield_now().await;
        self.shared.record(Call::CloseConnection);
        Ok(())
    }
}

pub struct MockChannel {
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_direct_exchange(&self, name: &str) -> TransportResult<()> {
        self.shared.record(Call::DeclareExchange(name.to_string()));
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec<'_>) -> TransportResult<()> {
        self.shared
            .record(Call::DeclareQueue(spec.name.to_string(), spec.dead_letter));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.shared.record(Call::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        if take_failure(&self.shared.fail_bind) {
            return Err(TransportError::new("PRECONDITION_FAILED"));
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> TransportResult<bool> {
        self.shared.record(Call::Publish {
            routing_key: message.routing_key.to_string(),
            body: message.body.to_vec(),
            content_type: message.content_type.to_string(),
            persistent: message.persistent,
        });
        Ok(!self.shared.saturated.load(Ordering::SeqCst))
    }

    async fn drained(&self) -> TransportResult<()> {
        self.shared.record(Call::WaitDrain);
        self.shared.drain.notified().await;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        tokio::task::yield_now().await;
        self.shared.record(Call::CloseChannel);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

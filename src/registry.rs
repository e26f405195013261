//! Consumer registrations.
//!
//! A registration binds a [`Handler`] to a [`Source`]: either a queue, or an
//! exchange plus routing key. Each registration runs a background task that
//! consumes deliveries, decodes them into [`Payload`]s, calls the handler,
//! settles the delivery and publishes the optional reply.
//!
//! Registrations are append-only. When the [`ConnectionManager`] replaces a
//! lost connection, every registration re-declares and re-binds its queue on
//! the new connection without caller intervention.
//!
//! ## Settlement
//!
//! Every delivery is settled exactly once, whatever the handler does:
//!
//! | Handler result                          | Settlement              |
//! |-----------------------------------------|-------------------------|
//! | `Ok(outcome)`, `outcome.acknowledge`    | ack                     |
//! | `Ok(outcome)`, `!outcome.acknowledge`   | reject, no requeue      |
//! | `Err(_)` or panic                       | ack, error logged       |

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::watch;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    ConnectionManager, DeliveryHeaders, Envelope, Payload,
    connection::Publisher,
    transport::{
        Broker, Delivery, DeliveryStream, ExchangeKind, QueueOptions, ToBytes, TransportError,
    },
};

/// Error a handler may fail with. It is logged and never reaches the broker.
pub type HandlerError = tower::BoxError;

/// Message as seen by a handler: delivery headers plus decoded payload.
pub type Message = Envelope<DeliveryHeaders, Payload>;

/// What to do with a delivery once its handler has run.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    /// Ack when true, reject without requeue when false.
    pub acknowledge: bool,
    /// Published to the delivery's reply-to queue, if it has one.
    pub reply: Option<Payload>,
    /// Expiration of the published reply.
    pub reply_ttl: Option<Duration>,
}

impl HandlerOutcome {
    pub fn ack() -> Self {
        Self {
            acknowledge: true,
            reply: None,
            reply_ttl: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            acknowledge: false,
            ..Self::ack()
        }
    }

    /// Acknowledge and answer with `payload`.
    pub fn reply(payload: impl Into<Payload>) -> Self {
        Self {
            reply: Some(payload.into()),
            ..Self::ack()
        }
    }

    pub fn with_reply_ttl(mut self, ttl: Duration) -> Self {
        self.reply_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }
}

/// Message handler.
///
/// Handlers are plain synchronous functions: they receive the decoded
/// message and describe the side effects in a [`HandlerOutcome`]; the
/// registry performs them. Closures become handlers through [`handler_fn`].
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> Result<HandlerOutcome, HandlerError>;
}

/// Wrap a closure into a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
{
    HandlerFn { f }
}

/// [`Handler`] returned by [`handler_fn`].
#[derive(Clone, Copy)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: Message) -> Result<HandlerOutcome, HandlerError> {
        (self.f)(message)
    }
}

/// Where a registration's messages come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A point-to-point queue.
    Queue { name: String, options: QueueOptions },
    /// A queue bound to an exchange. An empty queue name asks the broker for
    /// a fresh exclusive queue on every attach.
    Exchange {
        exchange: String,
        kind: ExchangeKind,
        routing_key: String,
        queue: String,
        options: QueueOptions,
    },
}

impl Source {
    /// Declare and bind the source on `broker`, returning the queue name.
    async fn declare(&self, broker: &dyn Broker) -> Result<String, tower::BoxError> {
        match self {
            Source::Queue { name, options } => broker.declare_queue(name, options).await,
            Source::Exchange {
                exchange,
                kind,
                routing_key,
                queue,
                options,
            } => {
                broker.declare_exchange(exchange, *kind).await?;
                let queue = broker.declare_queue(queue, options).await?;
                broker.bind_queue(&queue, exchange, routing_key).await?;
                Ok(queue)
            }
        }
    }
}

/// Registry of consumers on one [`ConnectionManager`].
#[derive(Clone)]
pub struct ConsumerRegistry {
    connection: ConnectionManager,
    publisher: Publisher,
    dead_letter_exchange: Option<String>,
    registrations: Arc<Mutex<Vec<Source>>>,
}

impl ConsumerRegistry {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            publisher: connection.publisher(),
            connection,
            dead_letter_exchange: None,
            registrations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Route messages expiring or rejected on request queues to `exchange`.
    ///
    /// Applies to queues declared by [`add_queue_consumer`] and
    /// [`declare_request_queue`]. Queues declared with explicit options and
    /// exchange consumers are left alone.
    ///
    /// [`add_queue_consumer`]: ConsumerRegistry::add_queue_consumer
    /// [`declare_request_queue`]: ConsumerRegistry::declare_request_queue
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Options of a durable request queue.
    pub fn request_queue_options(&self) -> QueueOptions {
        match &self.dead_letter_exchange {
            Some(exchange) => QueueOptions::durable().with_dead_letter_exchange(exchange.clone()),
            None => QueueOptions::durable(),
        }
    }

    /// Declare a request queue without consuming it, so requests published
    /// before any consumer attaches still expire into the dead-letter
    /// exchange.
    pub async fn declare_request_queue(&self, queue: &str) -> Result<String, TransportError> {
        self.connection
            .declare_queue(queue, &self.request_queue_options())
            .await
    }

    /// Consume a durable point-to-point request queue.
    ///
    /// Returns once the queue is declared and the consumer is attached.
    pub async fn add_queue_consumer(
        &self,
        queue: impl Into<String>,
        handler: impl Handler,
    ) -> Result<String, TransportError> {
        self.add_queue_consumer_with(queue, self.request_queue_options(), handler)
            .await
    }

    /// Consume a queue declared with explicit options.
    pub async fn add_queue_consumer_with(
        &self,
        queue: impl Into<String>,
        options: QueueOptions,
        handler: impl Handler,
    ) -> Result<String, TransportError> {
        let source = Source::Queue {
            name: queue.into(),
            options,
        };
        self.register(source, Arc::new(handler)).await
    }

    /// Consume every message routed by `exchange` with a key matching
    /// `routing_key`.
    ///
    /// With `queue` set, the queue is a durable queue shared by every process
    /// registering the same name. Without it, the broker generates an
    /// exclusive queue private to this connection. Returns the queue name.
    pub async fn add_exchange_consumer(
        &self,
        exchange: impl Into<String>,
        kind: ExchangeKind,
        routing_key: impl Into<String>,
        queue: Option<String>,
        handler: impl Handler,
    ) -> Result<String, TransportError> {
        let (queue, options) = match queue {
            Some(queue) => (queue, QueueOptions::durable()),
            None => (String::new(), QueueOptions::exclusive()),
        };
        let source = Source::Exchange {
            exchange: exchange.into(),
            kind,
            routing_key: routing_key.into(),
            queue,
            options,
        };
        self.register(source, Arc::new(handler)).await
    }

    /// Sources registered so far, in registration order.
    pub fn registrations(&self) -> Vec<Source> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[tracing::instrument(skip(self, handler))]
    async fn register(
        &self,
        source: Source,
        handler: Arc<dyn Handler>,
    ) -> Result<String, TransportError> {
        let mut generation = self.connection.generation();
        generation.borrow_and_update();
        let (queue, stream) = attach(&self.connection, &source)
            .await
            .map_err(TransportError::broker)?;
        tracing::info!(queue, "Consumer registered");

        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source.clone());

        let worker = Worker {
            connection: self.connection.clone(),
            publisher: self.publisher.clone(),
            source,
            handler,
            cancel: self.connection.cancellation(),
        };
        tokio::spawn(worker.run(queue.clone(), stream, generation));

        Ok(queue)
    }
}

async fn attach(
    connection: &ConnectionManager,
    source: &Source,
) -> Result<(String, DeliveryStream), tower::BoxError> {
    let broker = connection.broker().await;
    let queue = source.declare(broker.as_ref()).await?;
    let stream = broker.consume(&queue).await?;
    Ok((queue, stream))
}

struct Worker {
    connection: ConnectionManager,
    publisher: Publisher,
    source: Source,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(
        self,
        mut queue: String,
        mut stream: DeliveryStream,
        mut generation: watch::Receiver<u64>,
    ) {
        loop {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    next = stream.next() => match next {
                        Some(Ok(delivery)) => self.dispatch(&queue, delivery).await,
                        Some(Err(error)) => {
                            tracing::error!(?error, queue, "Consumer failed");
                            break;
                        }
                        None => break,
                    }
                }
            }

            tracing::warn!(queue, "Consumer detached, waiting for reconnection");
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = generation.changed() => if changed.is_err() {
                        return;
                    }
                }
                generation.borrow_and_update();

                match attach(&self.connection, &self.source).await {
                    Ok((name, next)) => {
                        tracing::info!(queue = name, "Consumer re-attached");
                        queue = name;
                        stream = next;
                        break;
                    }
                    Err(error) => {
                        tracing::error!(?error, source = ?self.source, "Failed to re-attach consumer");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, queue: &str, delivery: Delivery) {
        let Delivery { envelope, acker } = delivery;
        let headers = envelope.headers;
        let message = Envelope {
            headers: headers.clone(),
            message: Payload::decode(envelope.message.to_bytes()),
        };

        let outcome = match invoke(self.handler.as_ref(), message) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(
                    %error,
                    queue,
                    correlation_id = ?headers.correlation_id,
                    "Handler failed, acknowledging delivery"
                );
                HandlerOutcome::ack()
            }
        };

        let settled = if outcome.acknowledge {
            acker.ack().await
        } else {
            acker.reject(false).await
        };
        if let Err(error) = settled {
            tracing::error!(?error, queue, "Failed to settle delivery");
        }

        let Some(reply) = outcome.reply else {
            return;
        };
        let Some(reply_to) = headers.reply_to else {
            tracing::debug!(queue, "Delivery has no reply-to, dropping reply");
            return;
        };

        let mut reply_headers = DeliveryHeaders::to_queue(reply_to);
        reply_headers.correlation_id = headers.correlation_id;
        reply_headers.ttl = outcome.reply_ttl;
        let envelope = Envelope {
            headers: reply_headers,
            message: reply,
        };
        if let Err(error) = self.publisher.clone().send(envelope).await {
            tracing::error!(?error, queue, "Failed to publish reply");
        }
    }
}

fn invoke(handler: &dyn Handler, message: Message) -> Result<HandlerOutcome, HandlerError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
        Ok(result) => result,
        Err(_) => Err("handler panicked".into()),
    }
}

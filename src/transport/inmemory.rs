use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};
use tokio_stream::{StreamExt as _, wrappers::UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    Death, DeathReason, DeliveryHeaders, Envelope,
    transport::{
        Acker, Acknowledge, Broker, Connector, Delivery, DeliveryStream, ExchangeKind,
        QueueOptions, RawPayload,
    },
};

/// In-memory broker for testing or local pipelines.
///
/// `InMemory` is the broker "server": every connection opened through its
/// [`Connector`] implementation shares the same exchanges, queues and
/// bindings. It implements the parts of AMQP semantics the crate relies on:
///
/// - Default-exchange routing straight to a queue, and fanout, direct and
///   topic exchanges
/// - Round-robin delivery to consumers with explicit ack/reject
/// - Per-message TTL while a message waits in a queue, and dead-lettering of
///   expired or rejected messages to the queue's dead-letter exchange
/// - Exclusive queues that disappear with their connection
/// - Simulated connection loss through [`InMemory::drop_connections`]
///
/// Messages published to the default exchange for a queue that does not
/// exist are dropped, as a real broker would.
#[derive(Clone, Default)]
pub struct InMemory {
    state: Arc<Mutex<State>>,
}

struct State {
    reachable: bool,
    next_connection: u64,
    next_tag: u64,
    next_message: u64,
    connections: HashMap<u64, CancellationToken>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    published: Vec<Envelope<DeliveryHeaders, RawPayload>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            reachable: true,
            next_connection: 0,
            next_tag: 0,
            next_message: 0,
            connections: HashMap::new(),
            exchanges: HashMap::new(),
            bindings: Vec::new(),
            queues: HashMap::new(),
            published: Vec::new(),
        }
    }
}

#[derive(PartialEq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
}

struct ConsumerSlot {
    connection: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Stored {
    id: u64,
    headers: DeliveryHeaders,
    body: Vec<u8>,
    redelivered: bool,
    expires_at: Option<Instant>,
}

struct Unacked {
    connection: u64,
    message: Stored,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts succeed or fail.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Simulate a network failure: every open connection is closed, its
    /// consumers' streams end, its unacknowledged deliveries are requeued and
    /// its exclusive queues are deleted.
    pub async fn drop_connections(&self) {
        let ids: Vec<u64> = self.state.lock().await.connections.keys().copied().collect();
        self.disconnect(&ids).await;
    }

    /// Return every envelope published so far, in publish order.
    ///
    /// Messages produced by dead-lettering are not included.
    pub async fn published(&self) -> Vec<Envelope<DeliveryHeaders, RawPayload>> {
        self.state.lock().await.published.clone()
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }

    /// Number of messages waiting in `queue` to be delivered.
    pub async fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of messages delivered from `queue` and not yet settled.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    async fn disconnect(&self, ids: &[u64]) {
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(token) = state.connections.remove(id) {
                token.cancel();
            }
        }

        let mut orphaned = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            queue.consumers.retain(|c| !ids.contains(&c.connection));

            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| ids.contains(&u.connection))
                .map(|(tag, _)| *tag)
                .collect();
            let mut returned: Vec<Stored> = tags
                .into_iter()
                .filter_map(|tag| queue.unacked.remove(&tag))
                .map(|u| u.message)
                .collect();
            returned.sort_by_key(|m| m.id);
            for mut message in returned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }

            if queue.owner.is_some_and(|owner| ids.contains(&owner)) {
                orphaned.push(name.clone());
            }
        }

        for name in &orphaned {
            state.queues.remove(name);
            state.bindings.retain(|b| &b.queue != name);
            tracing::debug!(queue = %name, "Deleted exclusive queue of closed connection");
        }

        let now = Instant::now();
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            let mut overdue = Vec::new();
            let mut pending = Vec::new();
            if let Some(queue) = state.queues.get_mut(&name) {
                let mut kept = VecDeque::with_capacity(queue.ready.len());
                for message in queue.ready.drain(..) {
                    match message.expires_at {
                        Some(at) if at <= now => overdue.push(message),
                        Some(at) => {
                            pending.push((message.id, at));
                            kept.push_back(message);
                        }
                        None => kept.push_back(message),
                    }
                }
                queue.ready = kept;
            }
            for message in overdue {
                self.dead_letter(&mut state, &name, message, DeathReason::Expired);
            }
            for (id, at) in pending {
                self.schedule_expiry(&name, id, at);
            }
            self.dispatch(&mut state, &name);
        }
    }

    fn route(
        &self,
        state: &mut State,
        headers: DeliveryHeaders,
        body: Vec<u8>,
    ) -> Result<(), tower::BoxError> {
        let targets: Vec<String> = if headers.exchange.is_empty() {
            if state.queues.contains_key(&headers.destination) {
                vec![headers.destination.clone()]
            } else {
                Vec::new()
            }
        } else {
            let kind = *state
                .exchanges
                .get(&headers.exchange)
                .ok_or_else(|| format!("no exchange '{}'", headers.exchange))?;
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| {
                    b.exchange == headers.exchange && kind.matches(&b.routing_key, &headers.destination)
                })
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        if targets.is_empty() {
            tracing::debug!(
                exchange = %headers.exchange,
                destination = %headers.destination,
                "Message is unroutable, dropping"
            );
        }

        let expires_at = headers.ttl.map(|ttl| Instant::now() + ttl);
        for queue in targets {
            state.next_message += 1;
            let message = Stored {
                id: state.next_message,
                headers: headers.clone(),
                body: body.clone(),
                redelivered: false,
                expires_at,
            };
            self.enqueue(state, &queue, message);
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut State, queue: &str, message: Stored) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let expiry = message.expires_at.map(|at| (message.id, at));
        q.ready.push_back(message);
        self.dispatch(state, queue);
        if let Some((id, at)) = expiry {
            self.schedule_expiry(queue, id, at);
        }
    }

    fn dispatch(&self, state: &mut State, queue: &str) {
        let State {
            queues, next_tag, ..
        } = state;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while !q.consumers.is_empty() {
            let Some(message) = q.ready.pop_front() else {
                break;
            };
            let index = q.next_consumer % q.consumers.len();
            let connection = q.consumers[index].connection;
            *next_tag += 1;
            let tag = *next_tag;

            let mut headers = message.headers.clone();
            headers.redelivered = message.redelivered;
            let delivery = Delivery {
                envelope: Envelope {
                    headers,
                    message: RawPayload::from(message.body.clone()),
                },
                acker: Acker::new(InMemoryAcker {
                    cluster: self.clone(),
                    connection,
                    queue: queue.to_owned(),
                    tag,
                }),
            };

            if q.consumers[index].sender.send(delivery).is_ok() {
                q.unacked.insert(tag, Unacked { connection, message });
                q.next_consumer = index + 1;
            } else {
                q.consumers.remove(index);
                q.ready.push_front(message);
            }
        }
    }

    fn schedule_expiry(&self, queue: &str, id: u64, at: Instant) {
        let cluster = self.clone();
        let queue = queue.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            cluster.expire(&queue, id).await;
        });
    }

    async fn expire(&self, queue: &str, id: u64) {
        let mut state = self.state.lock().await;
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = q.ready.iter().position(|m| m.id == id) else {
            return;
        };
        if let Some(message) = q.ready.remove(position) {
            tracing::debug!(queue, "Message expired");
            self.dead_letter(&mut state, queue, message, DeathReason::Expired);
        }
    }

    fn dead_letter(&self, state: &mut State, queue: &str, message: Stored, reason: DeathReason) {
        let exchange = state
            .queues
            .get(queue)
            .and_then(|q| q.options.dead_letter_exchange.clone());
        let Some(exchange) = exchange else {
            tracing::debug!(queue, %reason, "Queue has no dead-letter exchange, dropping message");
            return;
        };

        let mut headers = message.headers;
        if headers.death.is_none() {
            headers.death = Some(Death {
                reason,
                queue: queue.to_owned(),
                exchange: headers.exchange.clone(),
            });
        }
        headers.exchange = exchange;
        headers.ttl = None;
        headers.redelivered = false;

        if let Err(error) = self.route(state, headers, message.body) {
            tracing::debug!(%error, queue, "Dead-letter exchange is missing, dropping message");
        }
    }

    fn settle(
        &self,
        state: &mut State,
        connection: u64,
        queue: &str,
        tag: u64,
    ) -> Result<Stored, tower::BoxError> {
        if !state.connections.contains_key(&connection) {
            return Err("channel closed".into());
        }
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| format!("no queue '{queue}'"))?;
        match q.unacked.remove(&tag) {
            Some(unacked) if unacked.connection == connection => Ok(unacked.message),
            Some(unacked) => {
                q.unacked.insert(tag, unacked);
                Err(format!("unknown delivery tag {tag}").into())
            }
            None => Err(format!("unknown delivery tag {tag}").into()),
        }
    }
}

#[async_trait::async_trait]
impl Connector for InMemory {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, tower::BoxError> {
        let mut state = self.state.lock().await;
        if !state.reachable {
            return Err(format!("broker unreachable at {url}").into());
        }
        state.next_connection += 1;
        let id = state.next_connection;
        let closed = CancellationToken::new();
        state.connections.insert(id, closed.clone());
        tracing::debug!(url, connection = id, "Opened in-memory connection");

        Ok(Arc::new(InMemoryConnection {
            cluster: self.clone(),
            id,
            closed,
        }))
    }
}

/// One connection to an [`InMemory`] broker.
struct InMemoryConnection {
    cluster: InMemory,
    id: u64,
    closed: CancellationToken,
}

impl InMemoryConnection {
    fn check(&self) -> Result<(), tower::BoxError> {
        if self.closed.is_cancelled() {
            Err("connection closed".into())
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryConnection {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), tower::BoxError> {
        self.check()?;
        if name.is_empty() {
            return Err("the default exchange cannot be declared".into());
        }
        let mut state = self.cluster.state.lock().await;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => {
                Err(format!("exchange '{name}' already declared as {existing:?}").into())
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, tower::BoxError> {
        self.check()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        let mut state = self.cluster.state.lock().await;
        match state.queues.get(&name) {
            Some(queue) if queue.owner.is_some_and(|owner| owner != self.id) => {
                Err(format!("queue '{name}' is locked by another connection").into())
            }
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        options: options.clone(),
                        owner: options.exclusive.then_some(self.id),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                        unacked: HashMap::new(),
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), tower::BoxError> {
        self.check()?;
        let mut state = self.cluster.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(format!("no queue '{queue}'").into());
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(format!("no exchange '{exchange}'").into());
        }
        let binding = Binding {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn publish(
        &self,
        envelope: Envelope<DeliveryHeaders, RawPayload>,
    ) -> Result<(), tower::BoxError> {
        self.check()?;
        let Envelope {
            mut headers,
            message,
        } = envelope;
        headers.redelivered = false;
        headers.death = None;

        let mut state = self.cluster.state.lock().await;
        state.published.push(Envelope {
            headers: headers.clone(),
            message: message.clone(),
        });
        tracing::debug!(
            exchange = %headers.exchange,
            destination = %headers.destination,
            correlation_id = ?headers.correlation_id,
            "Message published to in-memory broker",
        );
        self.cluster.route(&mut state, headers, message.into_bytes())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, tower::BoxError> {
        self.check()?;
        let mut state = self.cluster.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| format!("no queue '{queue}'"))?;
        if q.owner.is_some_and(|owner| owner != self.id) {
            return Err(format!("queue '{queue}' is locked by another connection").into());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            connection: self.id,
            sender,
        });
        self.cluster.dispatch(&mut state, queue);

        Ok(Box::pin(UnboundedReceiverStream::new(receiver).map(Ok)))
    }

    async fn close(&self) {
        self.cluster.disconnect(&[self.id]).await;
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

struct InMemoryAcker {
    cluster: InMemory,
    connection: u64,
    queue: String,
    tag: u64,
}

#[async_trait::async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(&self) -> Result<(), tower::BoxError> {
        let mut state = self.cluster.state.lock().await;
        self.cluster
            .settle(&mut state, self.connection, &self.queue, self.tag)?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), tower::BoxError> {
        let mut state = self.cluster.state.lock().await;
        let mut message = self
            .cluster
            .settle(&mut state, self.connection, &self.queue, self.tag)?;
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(message);
            }
            self.cluster.dispatch(&mut state, &self.queue);
        } else {
            self.cluster
                .dead_letter(&mut state, &self.queue, message, DeathReason::Rejected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::transport::ToBytes;

    fn envelope(headers: DeliveryHeaders, body: &str) -> Envelope<DeliveryHeaders, RawPayload> {
        Envelope {
            headers,
            message: RawPayload::from(body.as_bytes().to_vec()),
        }
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("delivery timed out")
            .expect("stream ended")
            .expect("delivery failed")
    }

    #[tokio::test]
    async fn default_exchange_routes_to_named_queue() {
        let cluster = InMemory::new();
        let broker = cluster.connect("memory://").await.unwrap();
        broker.declare_queue("jobs", &QueueOptions::durable()).await.unwrap();
        let mut stream = broker.consume("jobs").await.unwrap();

        broker
            .publish(envelope(
                DeliveryHeaders::to_queue("jobs").with_correlation_id("c-1"),
                "work",
            ))
            .await
            .unwrap();

        let delivery = next(&mut stream).await;
        assert_eq!(delivery.envelope.message.to_bytes(), b"work");
        assert_eq!(delivery.envelope.headers.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(cluster.unacked_count("jobs").await, 1);

        delivery.acker.ack().await.unwrap();
        assert_eq!(cluster.unacked_count("jobs").await, 0);
    }

    #[tokio::test]
    async fn publishing_to_a_missing_queue_drops_the_message() {
        let cluster = InMemory::new();
        let broker = cluster.connect("memory://").await.unwrap();

        broker
            .publish(envelope(DeliveryHeaders::to_queue("nowhere"), "lost"))
            .await
            .unwrap();

        assert!(!cluster.has_queue("nowhere").await);
        assert_eq!(cluster.published().await.len(), 1);
    }

    #[tokio::test]
    async fn fanout_copies_to_every_bound_queue() {
        let cluster = InMemory::new();
        let broker = cluster.connect("memory://").await.unwrap();
        broker
            .declare_exchange("events", ExchangeKind::Fanout)
            .await
            .unwrap();
        for queue in ["a", "b"] {
            broker.declare_queue(queue, &QueueOptions::durable()).await.unwrap();
            broker.bind_queue(queue, "events", "").await.unwrap();
        }

        broker
            .publish(envelope(DeliveryHeaders::to_exchange("events", "any"), "hello"))
            .await
            .unwrap();

        assert_eq!(cluster.ready_count("a").await, 1);
        assert_eq!(cluster.ready_count("b").await, 1);
    }

    #[tokio::test]
    async fn redeclaring_an_exchange_with_another_kind_fails() {
        let cluster = InMemory::new();
        let broker = cluster.connect("memory://").await.unwrap();
        broker
            .declare_exchange("events", ExchangeKind::Fanout)
            .await
            .unwrap();

        assert!(
            broker
                .declare_exchange("events", ExchangeKind::Topic)
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered_with_their_headers() {
        let cluster = InMemory::new();
        let broker = cluster.connect("memory://").await.unwrap();
        broker.declare_exchange("dlx", ExchangeKind::Fanout).await.unwrap();
        broker.declare_queue("dead", &QueueOptions::durable()).await.unwrap();
        broker.bind_queue("dead", "dlx", "").await.unwrap();
        broker
            .declare_queue("work", &QueueOptions::durable().with_dead_letter_exchange("dlx"))
            .await
            .unwrap();
        let mut dead = broker.consume("dead").await.unwrap();

        broker
            .publish(envelope(
                DeliveryHeaders::to_queue("work")
                    .with_reply_to("replies")
                    .with_correlation_id("c-9")
                    .with_ttl(Duration::from_millis(100)),
                "late",
            ))
            .await
            .unwrap();

        let delivery = next(&mut dead).await;
        let headers = &delivery.envelope.headers;
        assert_eq!(headers.reply_to.as_deref(), Some("replies"));
        assert_eq!(headers.correlation_id.as_deref(), Some("c-9"));
        assert_eq!(headers.ttl, None);
        let death = headers.death.as_ref().unwrap();
        assert_eq!(death.reason, DeathReason::Expired);
        assert_eq!(death.queue, "work");
        assert_eq!(cluster.ready_count("work").await, 0);
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered() {
        let cluster = InMemory::new();
        let broker = cluster.connect("memory://").await.unwrap();
        broker.declare_exchange("dlx", ExchangeKind::Fanout).await.unwrap();
        broker.declare_queue("dead", &QueueOptions::durable()).await.unwrap();
        broker.bind_queue("dead", "dlx", "").await.unwrap();
        broker
            .declare_queue("work", &QueueOptions::durable().with_dead_letter_exchange("dlx"))
            .await
            .unwrap();
        let mut work = broker.consume("work").await.unwrap();

        broker
            .publish(envelope(DeliveryHeaders::to_queue("work"), "nope"))
            .await
            .unwrap();
        next(&mut work).await.acker.reject(false).await.unwrap();

        assert_eq!(cluster.ready_count("dead").await, 1);
        assert_eq!(cluster.unacked_count("work").await, 0);
    }

    #[tokio::test]
    async fn dropping_connections_requeues_unacked_and_ends_streams() {
        let cluster = InMemory::new();
        let broker = cluster.connect("memory://").await.unwrap();
        broker.declare_queue("jobs", &QueueOptions::durable()).await.unwrap();
        broker
            .declare_queue("mine", &QueueOptions::exclusive())
            .await
            .unwrap();
        let mut stream = broker.consume("jobs").await.unwrap();
        broker
            .publish(envelope(DeliveryHeaders::to_queue("jobs"), "work"))
            .await
            .unwrap();
        let delivery = next(&mut stream).await;

        cluster.drop_connections().await;

        assert!(stream.next().await.is_none());
        assert!(delivery.acker.ack().await.is_err());
        assert_eq!(cluster.ready_count("jobs").await, 1);
        assert!(!cluster.has_queue("mine").await);
        assert_eq!(cluster.connection_count().await, 0);

        let broker = cluster.connect("memory://").await.unwrap();
        let mut stream = broker.consume("jobs").await.unwrap();
        let delivery = next(&mut stream).await;
        assert!(delivery.envelope.headers.redelivered);
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let cluster = InMemory::new();
        cluster.set_reachable(false).await;

        assert!(cluster.connect("memory://").await.is_err());
    }
}

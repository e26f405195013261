//! Request/reply over the broker.
//!
//! A [`Correlator`] publishes requests carrying a correlation id and a
//! reply-to address pointing at its private reply queue, then resolves the
//! caller once a message with the same correlation id lands on that queue.
//!
//! A request can be resolved from three independent sources:
//!
//! - a genuine reply,
//! - a timeout notification produced by the dead-letter recovery consumer
//!   once the broker expires the request (see [`crate::recovery`]),
//! - the local timer, which fires at the request's deadline.
//!
//! Whichever comes first wins; the others find no pending entry and are
//! discarded.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing_error::SpanTrace;

use crate::{
    ConnectionManager, ConsumerRegistry, DeliveryHeaders, Envelope, Payload,
    connection::Publisher,
    registry::{HandlerOutcome, handler_fn},
    transport::{QueueOptions, TransportError},
};

/// Bound applied to requests sent with a zero timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Tuning knobs for a [`Correlator`].
#[derive(Debug, Clone)]
pub struct CorrelatorOptions {
    /// Timeout used when a request is sent with `Duration::ZERO`.
    pub default_timeout: Duration,
    /// Delay added to a request's deadline before the local timer fires.
    /// Zero unless a deployment wants the dead-letter path to answer first.
    pub local_timeout_grace: Duration,
}

impl Default for CorrelatorOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            local_timeout_grace: Duration::ZERO,
        }
    }
}

/// Correlated request/reply client.
///
/// Cheap to clone; clones share the reply queue and the pending table.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

struct Inner {
    connection: ConnectionManager,
    publisher: Publisher,
    reply_queue: String,
    pending: Mutex<HashMap<String, PendingRequest>>,
    options: CorrelatorOptions,
}

struct PendingRequest {
    created: Instant,
    slot: oneshot::Sender<Result<Payload, ReplyError>>,
    timer: Option<JoinHandle<()>>,
}

impl Correlator {
    /// Declare a private reply queue and start consuming it.
    pub async fn start(
        connection: ConnectionManager,
        registry: &ConsumerRegistry,
    ) -> Result<Self, TransportError> {
        Self::start_with(connection, registry, CorrelatorOptions::default()).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn start_with(
        connection: ConnectionManager,
        registry: &ConsumerRegistry,
        options: CorrelatorOptions,
    ) -> Result<Self, TransportError> {
        let reply_queue = format!("reply.{}", uuid::Uuid::new_v4().simple());
        let inner = Arc::new(Inner {
            publisher: connection.publisher(),
            connection,
            reply_queue,
            pending: Mutex::new(HashMap::new()),
            options,
        });

        let weak = Arc::downgrade(&inner);
        registry
            .add_queue_consumer_with(
                inner.reply_queue.clone(),
                QueueOptions::exclusive(),
                handler_fn(move |message| {
                    if let Some(inner) = weak.upgrade() {
                        Correlator { inner }.on_reply(message);
                    }
                    Ok(HandlerOutcome::ack())
                }),
            )
            .await?;
        tracing::info!(reply_queue = %inner.reply_queue, "Correlator started");

        Ok(Self { inner })
    }

    /// Name of the queue replies are addressed to.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Number of requests still waiting for an outcome.
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Publish `payload` to `destination` on `exchange` and wait for the
    /// correlated reply.
    ///
    /// An empty `exchange` addresses the queue named `destination` directly.
    /// Without a `correlation_id` (or with an empty one) a random UUID is
    /// used. The request carries `timeout` as its broker expiration and the
    /// local timer fires once it elapses. A zero `timeout` is replaced by
    /// [`CorrelatorOptions::default_timeout`].
    ///
    /// A request that cannot be published fails right away with
    /// [`ReplyErrorKind::Undeliverable`].
    ///
    /// A dead-letter timeout notification resolves as `Ok` with a payload
    /// whose command is [`Command::Timeout`](crate::Command::Timeout). Only
    /// the local timer produces [`ReplyErrorKind::Timeout`].
    #[tracing::instrument(skip(self, payload, correlation_id), fields(correlation_id))]
    pub async fn send_with_reply(
        &self,
        exchange: &str,
        destination: &str,
        payload: impl Into<Payload>,
        timeout: Duration,
        correlation_id: Option<&str>,
    ) -> Result<Payload, ReplyError> {
        let correlation_id = match correlation_id {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let timeout = if timeout.is_zero() {
            self.inner.options.default_timeout
        } else {
            timeout
        };

        let (slot, outcome) = oneshot::channel();
        let created = Instant::now();
        {
            let mut pending = self.pending();
            if pending.contains_key(&correlation_id) {
                return Err(ReplyError::duplicate(&correlation_id));
            }
            pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    created,
                    slot,
                    timer: None,
                },
            );
        }
        self.arm_timer(
            &correlation_id,
            created + timeout + self.inner.options.local_timeout_grace,
        );

        let headers = DeliveryHeaders::to_exchange(exchange, destination)
            .with_reply_to(self.inner.reply_queue.clone())
            .with_correlation_id(correlation_id.clone())
            .with_ttl(timeout);
        let envelope = Envelope {
            headers,
            message: payload.into(),
        };
        if let Err(error) = self.inner.publisher.clone().send(envelope).await {
            tracing::error!(%error, "Failed to publish request");
            self.settle(&correlation_id, Err(ReplyError::undeliverable(error)));
        }

        outcome.await.unwrap_or_else(|_| Err(ReplyError::closed()))
    }

    /// Publish `payload` without expecting a reply.
    pub async fn publish(
        &self,
        exchange: &str,
        destination: &str,
        payload: impl Into<Payload>,
    ) -> Result<(), TransportError> {
        let envelope = Envelope {
            headers: DeliveryHeaders::to_exchange(exchange, destination),
            message: payload.into(),
        };
        self.inner.publisher.clone().send(envelope).await
    }

    /// Resolve the request waiting on `correlation_id` with `payload`.
    ///
    /// Returns `false` when no such request is pending: it was never sent,
    /// or it already has an outcome.
    pub fn resolve(&self, correlation_id: &str, payload: Payload) -> bool {
        self.settle(correlation_id, Ok(payload))
    }

    /// Reject every pending request with [`ReplyErrorKind::Closed`] and close
    /// the connection.
    pub async fn close(&self) {
        let pending: Vec<_> = self.pending().drain().collect();
        tracing::info!(pending = pending.len(), "Closing correlator");
        for (_, request) in pending {
            if let Some(timer) = request.timer {
                timer.abort();
            }
            let _ = request.slot.send(Err(ReplyError::closed()));
        }
        self.inner.connection.close().await;
    }

    fn on_reply(&self, message: Envelope<DeliveryHeaders, Payload>) {
        let Some(correlation_id) = message.headers.correlation_id else {
            tracing::debug!("Reply without correlation id, ignoring");
            return;
        };
        let timeout = message.message.is_timeout();
        if !self.resolve(&correlation_id, message.message) {
            tracing::debug!(correlation_id, timeout, "Late or unknown reply, ignoring");
        }
    }

    fn settle(&self, correlation_id: &str, result: Result<Payload, ReplyError>) -> bool {
        let Some(request) = self.pending().remove(correlation_id) else {
            return false;
        };
        if let Some(timer) = request.timer {
            timer.abort();
        }
        tracing::debug!(
            correlation_id,
            elapsed = ?request.created.elapsed(),
            "Request settled"
        );
        let _ = request.slot.send(result);
        true
    }

    fn arm_timer(&self, correlation_id: &str, at: Instant) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = correlation_id.to_owned();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(inner) = weak.upgrade() {
                let correlator = Correlator { inner };
                if correlator.settle(&id, Err(ReplyError::timeout(&id))) {
                    tracing::warn!(correlation_id = id, "Request timed out locally");
                }
            }
        });

        match self.pending().get_mut(correlation_id) {
            Some(request) => request.timer = Some(timer),
            None => timer.abort(),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Failure outcome of [`Correlator::send_with_reply`].
#[derive(Debug)]
pub struct ReplyError {
    context: SpanTrace,
    kind: ReplyErrorKind,
}

/// Reply error kind.
#[derive(Debug)]
pub enum ReplyErrorKind {
    /// No reply before the local deadline.
    Timeout { correlation_id: String },
    /// The correlator was closed while the request was pending.
    Closed,
    /// The request could not be published.
    Undeliverable(TransportError),
    /// Another request with the same correlation id is still pending.
    DuplicateCorrelationId(String),
}

impl ReplyError {
    fn timeout(correlation_id: &str) -> Self {
        Self::new(ReplyErrorKind::Timeout {
            correlation_id: correlation_id.to_owned(),
        })
    }

    fn closed() -> Self {
        Self::new(ReplyErrorKind::Closed)
    }

    fn undeliverable(error: TransportError) -> Self {
        Self::new(ReplyErrorKind::Undeliverable(error))
    }

    fn duplicate(correlation_id: &str) -> Self {
        Self::new(ReplyErrorKind::DuplicateCorrelationId(
            correlation_id.to_owned(),
        ))
    }

    fn new(kind: ReplyErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ReplyErrorKind {
        &self.kind
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ReplyErrorKind::Timeout { .. })
    }
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ReplyErrorKind::Timeout { correlation_id } => {
                writeln!(f, "Timeout waiting for reply to {correlation_id}")
            }
            ReplyErrorKind::Closed => writeln!(f, "Correlator closed"),
            ReplyErrorKind::Undeliverable(err) => writeln!(f, "Request undeliverable: {err}"),
            ReplyErrorKind::DuplicateCorrelationId(id) => {
                writeln!(f, "Correlation id {id} is already pending")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ReplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ReplyErrorKind::Undeliverable(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Command, Document, recovery,
        registry::handler_fn,
        transport::InMemory,
    };

    const DLX: &str = "test-dlx";

    struct Fixture {
        cluster: InMemory,
        connection: ConnectionManager,
        registry: ConsumerRegistry,
        correlator: Correlator,
    }

    async fn setup() -> Fixture {
        setup_with(CorrelatorOptions::default()).await
    }

    async fn setup_with(options: CorrelatorOptions) -> Fixture {
        let cluster = InMemory::new();
        let connection = ConnectionManager::connect("memory://", cluster.clone())
            .await
            .unwrap();
        let registry = ConsumerRegistry::new(connection.clone()).with_dead_letter_exchange(DLX);
        let correlator = Correlator::start_with(connection.clone(), &registry, options)
            .await
            .unwrap();
        Fixture {
            cluster,
            connection,
            registry,
            correlator,
        }
    }

    async fn request_queue(fixture: &Fixture, name: &str) {
        fixture.registry.declare_request_queue(name).await.unwrap();
    }

    async fn with_recovery(fixture: &Fixture) {
        recovery::register(
            &fixture.registry,
            DLX,
            None,
            recovery::TIMEOUT_NOTIFICATION_TTL,
        )
        .await
        .unwrap();
    }

    async fn until_pending(correlator: &Correlator, count: usize) {
        while correlator.pending_len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let fixture = setup().await;
        fixture
            .registry
            .add_queue_consumer(
                "q1",
                handler_fn(|message| {
                    assert_eq!(message.message.command(), Some(&Command::from("ping")));
                    Ok(HandlerOutcome::reply(Document::new("pong")))
                }),
            )
            .await
            .unwrap();

        let reply = fixture
            .correlator
            .send_with_reply(
                "",
                "q1",
                Document::new("ping"),
                Duration::from_millis(5000),
                Some(""),
            )
            .await
            .unwrap();

        assert_eq!(reply, Payload::from(Document::new("pong")));
        assert_eq!(fixture.correlator.pending_len(), 0);
        let request = &fixture.cluster.published().await[0];
        assert_eq!(request.headers.destination, "q1");
        assert_eq!(
            request.headers.reply_to.as_deref(),
            Some(fixture.correlator.reply_queue())
        );
        assert!(!request.headers.correlation_id.as_deref().unwrap().is_empty());
        assert_eq!(request.headers.ttl, Some(Duration::from_millis(5000)));
    }

    #[tokio::test(start_paused = true)]
    async fn unconsumed_request_resolves_with_timeout_notification() {
        // Expiry and the local timer share a deadline; the grace lets the
        // broker-side notification land first.
        let fixture = setup_with(CorrelatorOptions {
            local_timeout_grace: Duration::from_secs(1),
            ..CorrelatorOptions::default()
        })
        .await;
        with_recovery(&fixture).await;
        request_queue(&fixture, "q2").await;

        let started = Instant::now();
        let reply = fixture
            .correlator
            .send_with_reply(
                "",
                "q2",
                Document::new("ping"),
                Duration::from_millis(100),
                Some("cid-1"),
            )
            .await
            .unwrap();

        assert!(reply.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(1));

        let notification = fixture
            .cluster
            .published()
            .await
            .into_iter()
            .find(|envelope| envelope.headers.destination == fixture.correlator.reply_queue())
            .unwrap();
        assert_eq!(notification.headers.correlation_id.as_deref(), Some("cid-1"));
        assert_eq!(
            notification.headers.ttl,
            Some(recovery::TIMEOUT_NOTIFICATION_TTL)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_request_resolves_with_timeout_notification() {
        let fixture = setup().await;
        with_recovery(&fixture).await;
        fixture
            .registry
            .add_queue_consumer("svc", handler_fn(|_message| Ok(HandlerOutcome::reject())))
            .await
            .unwrap();

        let started = Instant::now();
        let reply = fixture
            .correlator
            .send_with_reply("", "svc", "hi", Duration::from_millis(100), Some("cid-x"))
            .await
            .unwrap();

        assert!(reply.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(100));
        let notifications = fixture
            .cluster
            .published()
            .await
            .into_iter()
            .filter(|envelope| envelope.headers.destination == fixture.correlator.reply_queue())
            .count();
        assert_eq!(notifications, 1);
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_own_callers() {
        let fixture = setup().await;
        request_queue(&fixture, "work").await;

        let a = tokio::spawn({
            let correlator = fixture.correlator.clone();
            async move {
                correlator
                    .send_with_reply("", "work", "A", Duration::from_secs(5), Some("a"))
                    .await
            }
        });
        let b = tokio::spawn({
            let correlator = fixture.correlator.clone();
            async move {
                correlator
                    .send_with_reply("", "work", "B", Duration::from_secs(5), Some("b"))
                    .await
            }
        });
        until_pending(&fixture.correlator, 2).await;

        let reply_queue = fixture.correlator.reply_queue().to_owned();
        for (id, body) in [("b", "reply-b"), ("a", "reply-a")] {
            fixture
                .connection
                .publisher()
                .send(Envelope {
                    headers: DeliveryHeaders::to_queue(reply_queue.clone()).with_correlation_id(id),
                    message: Payload::from(body),
                })
                .await
                .unwrap();
        }

        assert_eq!(b.await.unwrap().unwrap(), Payload::from("reply-b"));
        assert_eq!(a.await.unwrap().unwrap(), Payload::from("reply-a"));
    }

    #[tokio::test]
    async fn resolution_happens_at_most_once() {
        let fixture = setup().await;
        request_queue(&fixture, "work").await;

        let caller = tokio::spawn({
            let correlator = fixture.correlator.clone();
            async move {
                correlator
                    .send_with_reply("", "work", "hello", Duration::from_secs(5), Some("once"))
                    .await
            }
        });
        until_pending(&fixture.correlator, 1).await;

        assert!(fixture.correlator.resolve("once", Payload::from("first")));
        assert!(!fixture.correlator.resolve("once", Payload::from("second")));
        assert!(!fixture.correlator.resolve("never-sent", Payload::from("x")));
        assert_eq!(caller.await.unwrap().unwrap(), Payload::from("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn local_timer_fires_without_dead_letter_wiring() {
        let fixture = setup().await;
        request_queue(&fixture, "silent").await;

        let started = Instant::now();
        let err = fixture
            .correlator
            .send_with_reply("", "silent", "hello", Duration::from_millis(100), None)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(fixture.correlator.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn real_reply_beats_timeout_notification() {
        let fixture = setup().await;
        let correlator = fixture.correlator.clone();
        fixture
            .registry
            .add_queue_consumer(
                "slow",
                handler_fn(move |message| {
                    let correlation_id = message.headers.correlation_id.unwrap();
                    let correlator = correlator.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        correlator.resolve(&correlation_id, Payload::from("real"));
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        correlator.resolve(&correlation_id, Payload::from("late").into_timeout());
                    });
                    Ok(HandlerOutcome::ack())
                }),
            )
            .await
            .unwrap();

        let reply = fixture
            .correlator
            .send_with_reply("", "slow", "hello", Duration::from_millis(1000), None)
            .await
            .unwrap();

        assert_eq!(reply, Payload::from("real"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fixture.correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn raw_payloads_round_trip_byte_for_byte() {
        let fixture = setup().await;
        fixture
            .registry
            .add_queue_consumer(
                "echo",
                handler_fn(|message| Ok(HandlerOutcome::reply(message.message))),
            )
            .await
            .unwrap();

        let body = vec![0xde, 0xad, b'{', 0xbe, 0xef];
        let reply = fixture
            .correlator
            .send_with_reply("", "echo", body.clone(), Duration::from_secs(5), None)
            .await
            .unwrap();

        assert_eq!(reply, Payload::Raw(body));
    }

    #[tokio::test]
    async fn zero_timeout_uses_the_default_bound() {
        let fixture = setup().await;
        fixture
            .registry
            .add_queue_consumer(
                "echo",
                handler_fn(|message| Ok(HandlerOutcome::reply(message.message))),
            )
            .await
            .unwrap();

        let reply = fixture
            .correlator
            .send_with_reply("", "echo", "hello", Duration::ZERO, None)
            .await
            .unwrap();

        assert_eq!(reply, Payload::from("hello"));
        assert_eq!(
            fixture.cluster.published().await[0].headers.ttl,
            Some(DEFAULT_REQUEST_TIMEOUT)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_request_without_consumer_still_resolves() {
        let fixture = setup().await;
        with_recovery(&fixture).await;
        request_queue(&fixture, "q0").await;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(24 * 60 * 60),
            fixture
                .correlator
                .send_with_reply("", "q0", "hi", Duration::ZERO, None),
        )
        .await
        .expect("request never resolved");

        let timed_out = match outcome {
            Ok(payload) => payload.is_timeout(),
            Err(err) => err.is_timeout(),
        };
        assert!(timed_out);
        assert!(started.elapsed() >= DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(fixture.correlator.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_request_survives_reconnection() {
        let fixture = setup().await;
        request_queue(&fixture, "work").await;
        let caller = tokio::spawn({
            let correlator = fixture.correlator.clone();
            async move {
                correlator
                    .send_with_reply("", "work", "hello", Duration::from_secs(5), Some("kept"))
                    .await
            }
        });
        until_pending(&fixture.correlator, 1).await;

        let mut generation = fixture.connection.generation();
        fixture.cluster.drop_connections().await;
        generation.changed().await.unwrap();
        let reply_queue = fixture.correlator.reply_queue().to_owned();
        while !fixture.cluster.has_queue(&reply_queue).await {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(fixture.correlator.pending_len(), 1);

        fixture
            .connection
            .publisher()
            .send(Envelope {
                headers: DeliveryHeaders::to_queue(reply_queue).with_correlation_id("kept"),
                message: Payload::from("after reconnect"),
            })
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), Payload::from("after reconnect"));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_lost_during_reconnection_still_resolves() {
        let fixture = setup().await;
        request_queue(&fixture, "work").await;
        let caller = tokio::spawn({
            let correlator = fixture.correlator.clone();
            async move {
                correlator
                    .send_with_reply("", "work", "hello", Duration::from_secs(2), Some("lost"))
                    .await
            }
        });
        until_pending(&fixture.correlator, 1).await;

        fixture.cluster.drop_connections().await;
        let lost = fixture
            .connection
            .publisher()
            .send(Envelope {
                headers: DeliveryHeaders::to_queue(fixture.correlator.reply_queue())
                    .with_correlation_id("lost"),
                message: Payload::from("into the void"),
            })
            .await;
        assert!(lost.is_err());

        let err = caller.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(fixture.correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_refused() {
        let fixture = setup().await;
        request_queue(&fixture, "work").await;

        let first = tokio::spawn({
            let correlator = fixture.correlator.clone();
            async move {
                correlator
                    .send_with_reply("", "work", "one", Duration::from_secs(5), Some("dup"))
                    .await
            }
        });
        until_pending(&fixture.correlator, 1).await;

        let err = fixture
            .correlator
            .send_with_reply("", "work", "two", Duration::from_secs(5), Some("dup"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ReplyErrorKind::DuplicateCorrelationId(id) if id == "dup"
        ));
        assert_eq!(fixture.cluster.ready_count("work").await, 1);

        fixture.correlator.resolve("dup", Payload::from("done"));
        assert_eq!(first.await.unwrap().unwrap(), Payload::from("done"));
    }

    #[tokio::test]
    async fn close_rejects_pending_requests() {
        let fixture = setup().await;
        request_queue(&fixture, "work").await;

        let caller = tokio::spawn({
            let correlator = fixture.correlator.clone();
            async move {
                correlator
                    .send_with_reply("", "work", "hello", Duration::ZERO, None)
                    .await
            }
        });
        until_pending(&fixture.correlator, 1).await;

        fixture.correlator.close().await;

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), ReplyErrorKind::Closed));
        assert_eq!(fixture.correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn unpublishable_request_fails_immediately() {
        let fixture = setup().await;
        fixture.cluster.set_reachable(false).await;
        fixture.cluster.drop_connections().await;

        let err = fixture
            .correlator
            .send_with_reply("", "work", "hello", Duration::from_secs(60), None)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ReplyErrorKind::Undeliverable(_)));
        assert_eq!(fixture.correlator.pending_len(), 0);
    }
}

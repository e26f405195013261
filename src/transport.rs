//! Transport abstractions and broker backends.
//!
//! This module defines the broker primitive the rest of the crate is built
//! on, plus a Tower-compatible publish pipeline used to send [`Envelope`]s.
//!
//! The publish side is built around Tower's `Service` abstraction, enabling
//! middleware composition (payload encoding, tracing, buffering) while
//! keeping sender implementations backend-agnostic.
//!
//! ## Key components
//!
//! - [`Broker`]: one live broker connection (declare, bind, publish, consume)
//! - [`Connector`]: opens [`Broker`] connections from a URL
//! - [`Transport`]: Public-facing publish wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by publish backends
//! - [`TransportError`]: Unified error type with tracing context
//!
//! Backends: [`InMemory`] (an in-process broker) and, behind the `rabbitmq`
//! feature, [`rabbitmq::RabbitMq`].

mod inmemory;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::stream::BoxStream;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{DeliveryHeaders, Envelope};

pub use inmemory::InMemory;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for publishing envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_box(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::from_box(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Transport<S> {
    /// Send an [`Envelope`] through the transport.
    ///
    /// This is a convenience method for users that do not need direct access
    /// to the `tower::Service` API.
    pub async fn send<H, M>(&mut self, envelope: Envelope<H, M>) -> Result<(), TransportError>
    where
        M: Send + 'static,
        S: Service<Envelope<H, M>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::from_box(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
    /// Errors declaring, binding or consuming broker resources.
    Broker(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    /// Create a topology or consume related transport error.
    pub fn broker(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Broker(err),
        }
    }

    /// Classify a boxed service error, keeping transport errors produced by
    /// inner layers as they are.
    fn from_box(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::sender(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            TransportErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
            TransportErrorKind::Broker(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower's `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<H, M, D> Service<Envelope<H, M>> for SenderService<D>
where
    H: Send + 'static,
    M: Send + 'static,
    D: Sender<H, M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope<H, M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by publish backends.
///
/// A sender is responsible for delivering an [`Envelope`] to an external
/// system (e.g. a broker connection).
#[async_trait::async_trait]
pub trait Sender<H, M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send an envelope using the underlying transport.
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error>;
}

/// Exchange routing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Every bound queue receives a copy.
    Fanout,
    /// Queues whose binding key equals the routing key.
    Direct,
    /// Queues whose binding pattern matches the routing key. `*` matches one
    /// dot-separated word, `#` matches zero or more.
    Topic,
}

impl ExchangeKind {
    /// Whether a binding with `binding_key` receives a message published with
    /// `routing_key`.
    pub fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Topic => {
                let pattern: Vec<&str> = binding_key.split('.').collect();
                let key: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &key)
            }
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && topic_matches(rest, key_rest)
        }
        _ => false,
    }
}

/// Queue declaration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Exchange that receives messages expiring or rejected on this queue.
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    /// A durable, shared queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// A connection-scoped queue, deleted when the connection goes away.
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// A message handed out by [`Broker::consume`].
pub struct Delivery {
    pub envelope: Envelope<DeliveryHeaders, RawPayload>,
    pub acker: Acker,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Settles a single delivery.
///
/// Consuming methods guarantee a delivery is acknowledged or rejected at
/// most once.
pub struct Acker(Box<dyn Acknowledge>);

impl Acker {
    pub fn new(inner: impl Acknowledge + 'static) -> Self {
        Self(Box::new(inner))
    }

    /// Acknowledge the delivery; the broker forgets the message.
    pub async fn ack(self) -> Result<(), tower::BoxError> {
        self.0.ack().await
    }

    /// Reject the delivery. Without `requeue` the message is dead-lettered
    /// when its queue has a dead-letter exchange, and dropped otherwise.
    pub async fn reject(self, requeue: bool) -> Result<(), tower::BoxError> {
        self.0.reject(requeue).await
    }
}

/// Backend side of [`Acker`].
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), tower::BoxError>;
    async fn reject(&self, requeue: bool) -> Result<(), tower::BoxError>;
}

/// Stream of deliveries for one consumer. It ends when the consumer's
/// connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, tower::BoxError>>;

/// One live broker connection.
///
/// This is the transport primitive the crate is built on. It is object safe
/// so connections can be swapped at runtime by the
/// [`ConnectionManager`](crate::ConnectionManager).
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange. Declaring an existing exchange with the same kind
    /// is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind)
    -> Result<(), tower::BoxError>;

    /// Declare a queue and return its name. An empty name asks the broker to
    /// generate one.
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, tower::BoxError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), tower::BoxError>;

    async fn publish(
        &self,
        envelope: Envelope<DeliveryHeaders, RawPayload>,
    ) -> Result<(), tower::BoxError>;

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, tower::BoxError>;

    /// Close the connection.
    async fn close(&self);

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);
}

/// Opens broker connections.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, tower::BoxError>;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handling payloads.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for [u8] {
    fn to_bytes(&self) -> &[u8] {
        self
    }
}

impl ToBytes for str {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for String {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<T: ToBytes + ?Sized> ToBytes for &T {
    fn to_bytes(&self) -> &[u8] {
        (*self).to_bytes()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        self.0.to_bytes()
    }
}

use std::time::Duration;

/// Message container used by the publish and consume pipelines.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is intentionally generic and transport-agnostic.
///
/// ## Design
///
/// - `H` represents message metadata, in practice [`DeliveryHeaders`]
/// - `M` represents the actual message payload, either a decoded
///   [`Payload`](crate::Payload) or the wire bytes in a
///   [`RawPayload`](crate::transport::RawPayload)
///
/// Keeping headers and payload separated lets the same routing metadata be
/// reused while the payload moves between its decoded and encoded forms.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use courier::{DeliveryHeaders, Envelope, Payload};
///
/// let envelope = Envelope {
///     headers: DeliveryHeaders::to_queue("jobs"),
///     message: Payload::from("hello"),
/// };
///
/// // or, equivalently
/// let envelope: Envelope<_, _> = (DeliveryHeaders::to_queue("jobs"), Payload::from("hello")).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Routing and correlation metadata carried by every message.
///
/// The same structure describes an outgoing publish and an incoming delivery.
/// Fields that only the broker can fill (`redelivered`, `death`) are ignored
/// when publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryHeaders {
    /// Exchange name. Empty means the default exchange, which routes directly
    /// to the queue named by `destination`.
    pub exchange: String,
    /// Queue name (default exchange) or routing key (named exchange).
    pub destination: String,
    /// Queue awaiting the answer. `None` means fire-and-forget.
    pub reply_to: Option<String>,
    /// Token linking a request to its reply.
    pub correlation_id: Option<String>,
    /// Per-message expiration. `None` means the message never expires.
    pub ttl: Option<Duration>,
    /// Set on deliveries the broker has handed out before.
    pub redelivered: bool,
    /// Set on deliveries that were rerouted through a dead-letter exchange.
    pub death: Option<Death>,
}

impl DeliveryHeaders {
    /// Headers addressing `queue` through the default exchange.
    pub fn to_queue(queue: impl Into<String>) -> Self {
        Self {
            destination: queue.into(),
            ..Self::default()
        }
    }

    /// Headers addressing `exchange` with the given routing key.
    pub fn to_exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            destination: routing_key.into(),
            ..Self::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the per-message expiration. A zero duration clears it.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }
}

/// Why and where a message was dead-lettered.
///
/// Mirrors the broker's first-death headers: only the first dead-lettering of
/// a message is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Death {
    pub reason: DeathReason,
    /// Queue the message was dead-lettered from.
    pub queue: String,
    /// Exchange the message was originally published to.
    pub exchange: String,
}

/// Reason reported by the broker for a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// The per-message or per-queue TTL elapsed.
    Expired,
    /// A consumer rejected the message without requeueing it.
    Rejected,
    /// The queue length limit was exceeded.
    MaxLength,
    /// Any reason this crate does not model.
    Other(String),
}

impl DeathReason {
    pub fn as_str(&self) -> &str {
        match self {
            DeathReason::Expired => "expired",
            DeathReason::Rejected => "rejected",
            DeathReason::MaxLength => "maxlen",
            DeathReason::Other(reason) => reason,
        }
    }
}

impl From<&str> for DeathReason {
    fn from(value: &str) -> Self {
        match value {
            "expired" => DeathReason::Expired,
            "rejected" => DeathReason::Rejected,
            "maxlen" => DeathReason::MaxLength,
            other => DeathReason::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for DeathReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

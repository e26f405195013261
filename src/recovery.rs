//! Dead-letter timeout recovery.
//!
//! Requests are published with a per-message expiration on queues that
//! dead-letter to a shared exchange. Once a request expires unanswered the
//! broker routes it there; this consumer turns it into a timeout notification
//! and sends it back to the requester's reply queue, so the waiting
//! [`Correlator`](crate::Correlator) resolves immediately instead of waiting
//! for its local timer.

use std::time::Duration;

use crate::{
    ConsumerRegistry, Envelope,
    registry::{Handler, HandlerError, HandlerOutcome, Message},
    transport::{ExchangeKind, TransportError},
};

/// Expiration of timeout notifications. Notifications are not replied to,
/// so once expired they are dropped rather than dead-lettered again.
pub const TIMEOUT_NOTIFICATION_TTL: Duration = Duration::from_secs(20);

/// Handler converting dead-lettered requests into timeout notifications.
#[derive(Debug, Clone)]
pub struct DeadLetterRecovery {
    notification_ttl: Duration,
}

impl DeadLetterRecovery {
    pub fn new(notification_ttl: Duration) -> Self {
        Self { notification_ttl }
    }
}

impl Default for DeadLetterRecovery {
    fn default() -> Self {
        Self::new(TIMEOUT_NOTIFICATION_TTL)
    }
}

impl Handler for DeadLetterRecovery {
    fn handle(&self, message: Message) -> Result<HandlerOutcome, HandlerError> {
        let Envelope { headers, message } = message;
        let Some(reply_to) = headers.reply_to.as_deref() else {
            tracing::debug!(
                exchange = %headers.exchange,
                "Dead-lettered message has no reply-to, dropping"
            );
            return Ok(HandlerOutcome::ack());
        };

        tracing::info!(
            exchange = %headers.exchange,
            reply_to,
            correlation_id = ?headers.correlation_id,
            reason = ?headers.death.as_ref().map(|death| death.reason.as_str()),
            "Sending timeout notification"
        );
        Ok(HandlerOutcome::reply(message.into_timeout()).with_reply_ttl(self.notification_ttl))
    }
}

/// Consume the dead-letter exchange `dlx` with a [`DeadLetterRecovery`]
/// handler.
///
/// `queue` names a durable queue shared by every process of the deployment;
/// `None` gives this process its own exclusive queue.
pub async fn register(
    registry: &ConsumerRegistry,
    dlx: &str,
    queue: Option<String>,
    notification_ttl: Duration,
) -> Result<String, TransportError> {
    registry
        .add_exchange_consumer(
            dlx,
            ExchangeKind::Fanout,
            "",
            queue,
            DeadLetterRecovery::new(notification_ttl),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Command, ConnectionManager, DeliveryHeaders, Document, Payload,
        transport::{InMemory, QueueOptions},
    };
    use serde_json::json;

    fn dead_lettered(payload: Payload) -> Message {
        Envelope {
            headers: DeliveryHeaders::to_exchange("dlx", "requests")
                .with_reply_to("reply.1")
                .with_correlation_id("cid-1"),
            message: payload,
        }
    }

    #[test]
    fn documents_get_the_timeout_command() {
        let outcome = DeadLetterRecovery::default()
            .handle(dead_lettered(Document::new("ping").with("n", 7).into()))
            .unwrap();

        assert!(outcome.acknowledge);
        assert_eq!(outcome.reply_ttl, Some(TIMEOUT_NOTIFICATION_TTL));
        let Some(Payload::Structured(document)) = outcome.reply else {
            panic!("expected a document reply");
        };
        assert_eq!(document.command, Some(Command::Timeout));
        assert_eq!(document.data.get("n"), Some(&json!(7)));
    }

    #[test]
    fn raw_bodies_are_wrapped() {
        let outcome = DeadLetterRecovery::new(Duration::from_secs(5))
            .handle(dead_lettered(Payload::from("Hi mom")))
            .unwrap();

        assert_eq!(outcome.reply_ttl, Some(Duration::from_secs(5)));
        assert!(outcome.reply.unwrap().is_timeout());
    }

    #[test]
    fn messages_without_reply_to_are_dropped() {
        let mut message = dead_lettered(Document::new("ping").into());
        message.headers.reply_to = None;

        let outcome = DeadLetterRecovery::default().handle(message).unwrap();

        assert_eq!(outcome, HandlerOutcome::ack());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_requests_come_back_as_timeouts() {
        let cluster = InMemory::new();
        let connection = ConnectionManager::connect("memory://", cluster.clone())
            .await
            .unwrap();
        let registry = ConsumerRegistry::new(connection.clone());
        let queue = register(
            &registry,
            "dlx",
            Some("dlx.timeouts".into()),
            TIMEOUT_NOTIFICATION_TTL,
        )
        .await
        .unwrap();
        assert_eq!(queue, "dlx.timeouts");

        connection
            .declare_queue("requests", &QueueOptions::durable().with_dead_letter_exchange("dlx"))
            .await
            .unwrap();
        connection.declare_queue("reply.1", &QueueOptions::durable()).await.unwrap();
        connection
            .publisher()
            .send(Envelope {
                headers: DeliveryHeaders::to_queue("requests")
                    .with_reply_to("reply.1")
                    .with_correlation_id("cid-1")
                    .with_ttl(Duration::from_millis(100)),
                message: Payload::from(Document::new("ping")),
            })
            .await
            .unwrap();

        while cluster.ready_count("reply.1").await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let notification = cluster.published().await.pop().unwrap();
        assert_eq!(notification.headers.destination, "reply.1");
        assert_eq!(notification.headers.correlation_id.as_deref(), Some("cid-1"));
        assert_eq!(notification.headers.reply_to, None);
        assert!(Payload::decode(&notification.message.into_bytes()).is_timeout());
        assert_eq!(cluster.unacked_count("dlx.timeouts").await, 0);
    }
}

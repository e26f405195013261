use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    DeliveryHeaders, Envelope,
    envelope::{Death, DeathReason},
    transport::{
        Acker, Acknowledge, Broker, Connector, Delivery, DeliveryStream, ExchangeKind,
        QueueOptions, RawPayload,
    },
};

/// RabbitMQ broker connection.
///
/// Wraps one `lapin::Connection` and a single channel in publisher-confirm
/// mode. Publishes wait for the broker confirmation.
///
/// ## Mapping
///
/// - `DeliveryHeaders.exchange` / `destination` → exchange / routing key
/// - `reply_to`, `correlation_id` → AMQP properties of the same name
/// - `ttl` → per-message `expiration`, in milliseconds
/// - `x-first-death-*` headers → `DeliveryHeaders.death`
///
/// The channel is wrapped in a `Mutex` because `lapin::Channel` is not
/// `Sync`; it is cloned out of the lock before each operation.
///
/// A channel closed by the broker (unknown exchange, conflicting queue
/// arguments) counts as a lost connection: [`Broker::closed`] resolves and
/// the connection manager opens a fresh one.
pub struct RabbitMq {
    connection: Mutex<Connection>,
    channel: Mutex<lapin::Channel>,
    closed: CancellationToken,
}

impl RabbitMq {
    /// Open a connection and a confirm-mode channel to `url`.
    #[tracing::instrument(skip_all)]
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let closed = CancellationToken::new();
        let on_error = closed.clone();
        connection.on_error(move |error| {
            tracing::warn!(%error, "RabbitMQ connection error");
            on_error.cancel();
        });

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(Self {
            connection: Mutex::new(connection),
            channel: Mutex::new(channel),
            closed,
        })
    }

    async fn channel(&self) -> lapin::Channel {
        self.channel.lock().await.clone()
    }

    fn check<T>(
        &self,
        channel: &lapin::Channel,
        result: Result<T, lapin::Error>,
    ) -> Result<T, tower::BoxError> {
        result.map_err(|error| {
            if !channel.status().connected() {
                tracing::warn!(%error, "RabbitMQ channel closed");
                self.closed.cancel();
            }
            error.into()
        })
    }
}

#[async_trait]
impl Broker for RabbitMq {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), tower::BoxError> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        let channel = self.channel().await;
        let result = channel
            .exchange_declare(name, kind, options, FieldTable::default())
            .await;
        self.check(&channel, result)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, tower::BoxError> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &options.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.exclusive,
            ..Default::default()
        };
        let channel = self.channel().await;
        let result = channel.queue_declare(name, declare, arguments).await;
        let queue = self.check(&channel, result)?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), tower::BoxError> {
        let channel = self.channel().await;
        let result = channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await;
        self.check(&channel, result)
    }

    #[tracing::instrument(skip_all)]
    async fn publish(
        &self,
        envelope: Envelope<DeliveryHeaders, RawPayload>,
    ) -> Result<(), tower::BoxError> {
        let Envelope { headers, message } = envelope;

        let mut properties = BasicProperties::default();
        if let Some(reply_to) = headers.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }
        if let Some(correlation_id) = headers.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(ttl) = headers.ttl {
            properties = properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }

        let channel = self.channel().await;
        let confirm = channel
            .basic_publish(
                &headers.exchange,
                &headers.destination,
                BasicPublishOptions::default(),
                &message.into_bytes(),
                properties,
            )
            .await;
        let confirm = self.check(&channel, confirm)?;
        let confirmation = self.check(&channel, confirm.await)?;
        confirmed(confirmation)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, tower::BoxError> {
        let channel = self.channel().await;
        let result = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await;
        let consumer = self.check(&channel, result)?;

        let closed = self.closed.clone();
        let stream = consumer.map(move |delivery| {
            delivery.map(into_delivery).map_err(|error| {
                if !channel.status().connected() {
                    closed.cancel();
                }
                tower::BoxError::from(error)
            })
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Err(error) = self.connection.lock().await.close(200, "closing").await {
            tracing::debug!(%error, "RabbitMQ connection already closed");
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

fn confirmed(confirmation: Confirmation) -> Result<(), tower::BoxError> {
    if confirmation.is_nack() {
        Err("publish negatively acknowledged by the broker".into())
    } else {
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let headers = DeliveryHeaders {
        exchange: delivery.exchange.as_str().to_owned(),
        destination: delivery.routing_key.as_str().to_owned(),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_owned()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        ttl: None,
        redelivered: delivery.redelivered,
        death: properties.headers().as_ref().and_then(first_death),
    };

    Delivery {
        envelope: Envelope {
            headers,
            message: RawPayload::from(delivery.data),
        },
        acker: Acker::new(RabbitMqAcker(delivery.acker)),
    }
}

fn first_death(headers: &FieldTable) -> Option<Death> {
    let field = |key: &str| {
        headers
            .inner()
            .get(&ShortString::from(key))
            .and_then(AMQPValue::as_long_string)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
    };
    Some(Death {
        reason: DeathReason::from(field("x-first-death-reason")?.as_str()),
        queue: field("x-first-death-queue").unwrap_or_default(),
        exchange: field("x-first-death-exchange").unwrap_or_default(),
    })
}

struct RabbitMqAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for RabbitMqAcker {
    async fn ack(&self) -> Result<(), tower::BoxError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), tower::BoxError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

/// [`Connector`] opening [`RabbitMq`] connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct RabbitMqConnector;

#[async_trait]
impl Connector for RabbitMqConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, tower::BoxError> {
        let broker = RabbitMq::connect(url).await?;
        Ok(Arc::new(broker))
    }
}

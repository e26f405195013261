//! Long-lived broker connection with transparent reconnection.
//!
//! The [`ConnectionManager`] owns the current [`Broker`] connection and a
//! supervisor task that replaces it when it is lost. Every replacement bumps
//! a generation counter; consumers watch it through
//! [`ConnectionManager::generation`] to re-declare and re-bind their queues.
//!
//! Publishing goes through a [`Publisher`], a [`Transport`] whose sender
//! always targets the connection that is current at send time.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    DeliveryHeaders, Envelope,
    transport::{
        Broker, Connector, QueueOptions, RawPayload, Sender, SenderService, Transport,
        TransportError,
        layers::{PayloadLayer, PayloadService},
    },
};

/// Publish pipeline bound to a [`ConnectionManager`].
pub type Publisher = Transport<PayloadService<SenderService<PublishChannel>>>;

/// Reconnection settings.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Pause between connection attempts after a loss.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }
}

/// Owner of the single shared broker connection.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    connector: Arc<dyn Connector>,
    current: RwLock<Arc<dyn Broker>>,
    generation: watch::Sender<u64>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ConnectionManager {
    /// Connect to the broker at `url` with the default reconnection policy.
    pub async fn connect(
        url: impl Into<String>,
        connector: impl Connector + 'static,
    ) -> Result<Self, ConnectionError> {
        Self::connect_with(url, connector, ReconnectPolicy::default()).await
    }

    /// Connect to the broker at `url`.
    ///
    /// Fails with a [`ConnectionError`] when the broker is unreachable. Once
    /// connected, losses are handled in the background: the manager keeps
    /// retrying every `policy.delay` until a new connection is established.
    #[tracing::instrument(skip_all, fields(url = tracing::field::Empty))]
    pub async fn connect_with(
        url: impl Into<String>,
        connector: impl Connector + 'static,
        policy: ReconnectPolicy,
    ) -> Result<Self, ConnectionError> {
        let url = url.into();
        tracing::Span::current().record("url", url.as_str());

        let connector: Arc<dyn Connector> = Arc::new(connector);
        let broker = connector
            .connect(&url)
            .await
            .map_err(|e| ConnectionError::unreachable(&url, e))?;
        tracing::info!("Connected to broker");

        let (generation, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            url,
            connector,
            current: RwLock::new(broker),
            generation,
            policy,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), inner.cancel.clone()));

        Ok(Self { inner })
    }

    /// The connection that is current right now.
    pub async fn broker(&self) -> Arc<dyn Broker> {
        self.inner.current.read().await.clone()
    }

    /// Receiver notified each time the connection is replaced.
    pub fn generation(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    /// Token cancelled when the manager is closed.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Build a publish pipeline encoding [`Payload`](crate::Payload)s onto
    /// the current connection.
    pub fn publisher(&self) -> Publisher {
        Transport::new(PublishChannel {
            manager: self.clone(),
        })
        .layer(PayloadLayer)
    }

    /// Declare a queue on the current connection.
    ///
    /// Useful for request queues that must exist (and dead-letter) before a
    /// consumer attaches.
    pub async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, TransportError> {
        self.broker()
            .await
            .declare_queue(name, options)
            .await
            .map_err(TransportError::broker)
    }

    /// Stop reconnecting and close the current connection.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.broker().await.close().await;
        tracing::info!(url = %self.inner.url, "Connection closed");
    }
}

async fn supervise(inner: Weak<Inner>, cancel: CancellationToken) {
    loop {
        let Some(manager) = inner.upgrade() else {
            return;
        };
        let broker = manager.current.read().await.clone();
        drop(manager);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = broker.closed() => {}
        }
        drop(broker);
        tracing::warn!("Broker connection lost, reconnecting");

        loop {
            let Some(manager) = inner.upgrade() else {
                return;
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(manager.policy.delay) => {}
            }

            match manager.connector.connect(&manager.url).await {
                Ok(broker) => {
                    *manager.current.write().await = broker;
                    manager.generation.send_modify(|generation| *generation += 1);
                    tracing::info!(
                        url = %manager.url,
                        generation = *manager.generation.borrow(),
                        "Broker connection restored"
                    );
                    break;
                }
                Err(error) => {
                    tracing::error!(?error, url = %manager.url, "Reconnection attempt failed");
                }
            }
        }
    }
}

/// [`Sender`] that publishes on whatever connection is current.
#[derive(Clone)]
pub struct PublishChannel {
    manager: ConnectionManager,
}

#[async_trait::async_trait]
impl Sender<DeliveryHeaders, RawPayload> for PublishChannel {
    type Error = tower::BoxError;

    async fn send(
        &mut self,
        envelope: Envelope<DeliveryHeaders, RawPayload>,
    ) -> Result<(), Self::Error> {
        self.manager.broker().await.publish(envelope).await
    }
}

/// Error returned when the broker cannot be reached.
#[derive(Debug)]
pub struct ConnectionError {
    context: SpanTrace,
    url: String,
    source: tower::BoxError,
}

impl ConnectionError {
    fn unreachable(url: &str, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            url: url.to_owned(),
            source,
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cannot connect to broker at {}: {}", self.url, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

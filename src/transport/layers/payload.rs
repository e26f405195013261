use crate::{
    Envelope, Payload,
    transport::{RawPayload, TransportError},
};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that encodes [`Payload`]s into wire bytes.
///
/// Documents are serialized to JSON; raw payloads pass through unchanged.
/// The inner service receives an envelope with the same headers and a
/// [`RawPayload`] body.
#[derive(Clone)]
pub struct PayloadService<T> {
    inner: T,
}

impl<T, H> Service<Envelope<H, Payload>> for PayloadService<T>
where
    H: Send + 'static,
    T: Service<Envelope<H, RawPayload>> + Clone + Send + 'static,
    <T as Service<Envelope<H, RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<H, Payload>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bytes = req
                .message
                .encode()
                .map_err(|e| TransportError::serde(Box::new(e)))?;
            let envelope = Envelope {
                headers: req.headers,
                message: bytes,
            };

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`PayloadService`] to a service stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct PayloadLayer;

impl<S> Layer<S> for PayloadLayer {
    type Service = PayloadService<S>;

    fn layer(&self, service: S) -> Self::Service {
        PayloadService { inner: service }
    }
}

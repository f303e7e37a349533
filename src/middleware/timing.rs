//! Request duration logging middleware

use axum::{body::Body, http::Request, response::Response};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::info;

use crate::metrics::Metrics;

/// Logs method, path, status and duration of every request, optionally
/// recording them into [`Metrics`]
#[derive(Clone, Default)]
pub struct RequestTimingLayer {
    metrics: Option<Arc<Metrics>>,
}

impl RequestTimingLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl<S> Layer<S> for RequestTimingLayer {
    type Service = RequestTiming<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestTiming {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

/// Request timing middleware service
#[derive(Clone)]
pub struct RequestTiming<S> {
    inner: S,
    metrics: Option<Arc<Metrics>>,
}

impl<S> Service<Request<Body>> for RequestTiming<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let started = Instant::now();
        let metrics = self.metrics.clone();
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            let elapsed = started.elapsed();
            if let Some(metrics) = &metrics {
                metrics.record_request(&path, response.status().as_u16(), elapsed);
            }
            info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                duration_ms = elapsed.as_millis() as u64,
                "Request to {} took {:.2} seconds",
                path,
                elapsed.as_secs_f64()
            );
            Ok(response)
        })
    }
}

//! Exclusive admission to the shared accelerator

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::error::{AppError, Result};
use crate::metrics::Metrics;

/// A pool of exactly one accelerator.
///
/// Waiters are admitted in FIFO order. With no timeout configured a caller waits
/// as long as it takes.
pub struct ResourceGate {
    semaphore: Arc<Semaphore>,
    acquire_timeout: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
}

/// Exclusive ownership of the accelerator, released on drop
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Return ownership of the accelerator
    pub fn release(self) {}
}

impl ResourceGate {
    pub fn new(acquire_timeout: Option<Duration>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            acquire_timeout,
            metrics: None,
        }
    }

    /// Report wait and inference times to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wait until the accelerator is free and take it
    pub async fn acquire(&self) -> Result<GatePermit> {
        let started = Instant::now();
        let acquire = self.semaphore.clone().acquire_owned();

        let permit = match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| {
                    AppError::Timeout(format!(
                        "accelerator still busy after {} ms",
                        timeout.as_millis()
                    ))
                })?,
            None => acquire.await,
        }
        .map_err(|_| AppError::Internal("resource gate is closed".to_string()))?;

        let waited = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_gate_wait(waited);
        }
        debug!(waited_ms = waited.as_millis() as u64, "Acquired resource gate");
        Ok(GatePermit { _permit: permit })
    }

    /// Run a blocking inference job while holding the accelerator.
    ///
    /// The permit moves into the blocking task, so the gate stays held until the job
    /// returns even when the awaiting request is dropped.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        let metrics = self.metrics.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = job();
            let elapsed = started.elapsed();
            if let Some(metrics) = &metrics {
                metrics.observe_inference(elapsed);
            }
            debug!(elapsed_ms = elapsed.as_millis() as u64, "Inference finished");
            permit.release();
            result
        })
        .await;

        if !matches!(outcome, Ok(Ok(_))) {
            if let Some(metrics) = &self.metrics {
                metrics.record_inference_failure();
            }
        }

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AppError::PipelineFailure(format!("{:#}", e))),
            Err(join_error) => {
                error!(error = %join_error, "Inference task panicked");
                Err(AppError::PipelineFailure(
                    "inference task terminated unexpectedly".to_string(),
                ))
            }
        }
    }

    /// Whether an inference job currently holds the accelerator
    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

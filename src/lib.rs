//! Diffusion Serving
//!
//! Serves pretrained text-to-image and image-to-image diffusion pipelines over
//! HTTP, admitting one inference at a time onto the shared accelerator.

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod response;
pub mod storage;

pub use error::{AppError, Result};

use std::sync::Arc;

use config::Settings;
use gate::ResourceGate;
use metrics::Metrics;
use pipeline::registry::PipelineRegistry;
use response::ResponseHandler;
use storage::ImageStore;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<PipelineRegistry>,
    pub gate: Arc<ResourceGate>,
    pub uploads: Arc<ImageStore>,
    pub outputs: Arc<ImageStore>,
    pub responses: Arc<ResponseHandler>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire the stores, gate, metrics and response handler described by `settings`
    pub fn new(settings: Settings, registry: PipelineRegistry) -> Self {
        let uploads = Arc::new(ImageStore::new(
            settings.storage.upload_dir.clone(),
            "/upload",
        ));
        let outputs = Arc::new(ImageStore::new(
            settings.storage.output_dir.clone(),
            settings.storage.output_url_prefix.clone(),
        ));
        let metrics = Arc::new(Metrics::new(settings.storage.output_url_prefix.clone()));
        let gate = Arc::new(
            ResourceGate::new(settings.gate.acquire_timeout()).with_metrics(metrics.clone()),
        );

        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            gate,
            uploads,
            responses: Arc::new(ResponseHandler::new(outputs.clone())),
            outputs,
            metrics,
        }
    }
}

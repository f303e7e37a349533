//! Registry of the inference pipelines loaded at startup

use hf_hub::api::tokio::Api;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{AppError, Result};
use crate::pipeline::device::{resolve_dtype, select_device};
use crate::pipeline::stable_diffusion::{
    StableDiffusion, StableDiffusionImageToImage, StableDiffusionTextToImage,
};
use crate::pipeline::{Capability, ImageToImage, TextToImage};

/// Loaded pipelines, keyed by capability.
///
/// Built once before the server starts accepting traffic and never mutated afterwards.
pub struct PipelineRegistry {
    model: String,
    device: String,
    text_to_image: Option<Arc<dyn TextToImage>>,
    image_to_image: Option<Arc<dyn ImageToImage>>,
}

impl PipelineRegistry {
    /// Create a registry with no pipelines loaded
    pub fn new(model: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            device: device.into(),
            text_to_image: None,
            image_to_image: None,
        }
    }

    /// Register a text-to-image pipeline
    pub fn with_text_to_image(mut self, pipeline: Arc<dyn TextToImage>) -> Self {
        self.text_to_image = Some(pipeline);
        self
    }

    /// Register an image-to-image pipeline
    pub fn with_image_to_image(mut self, pipeline: Arc<dyn ImageToImage>) -> Self {
        self.image_to_image = Some(pipeline);
        self
    }

    /// Load the pipelines enabled in `config`.
    ///
    /// Both modes share one set of weights. Any loading failure is a `StartupFailure`.
    pub async fn initialize(config: &PipelineConfig) -> Result<Self> {
        let selected = select_device(config.device, config.device_ordinal)
            .map_err(|e| AppError::StartupFailure(format!("{:#}", e)))?;
        info!(device = %selected.label, "Using device");

        let mut registry = Self::new(config.model.clone(), selected.label.clone());

        if !config.enable_txt2img && !config.enable_img2img {
            warn!("Both txt2img and img2img are disabled, no pipeline loaded");
            return Ok(registry);
        }

        let dtype = resolve_dtype(config.precision, &selected.device);
        let api = Api::new().map_err(|e| AppError::StartupFailure(e.to_string()))?;
        let model = StableDiffusion::load(
            &api,
            &config.model,
            selected.device,
            dtype,
            config.memory_efficient_attention,
        )
        .await
        .map_err(|e| {
            error!(error = ?e, model = %config.model, "Failed to load pipelines");
            AppError::StartupFailure(format!("{:#}", e))
        })?;
        let model = Arc::new(model);
        info!(model = %config.model, "Base pipeline loaded");

        if config.enable_txt2img {
            registry = registry.with_text_to_image(Arc::new(StableDiffusionTextToImage::new(
                model.clone(),
            )));
            info!("txt2img pipeline enabled");
        }

        if config.enable_img2img {
            registry =
                registry.with_image_to_image(Arc::new(StableDiffusionImageToImage::new(model)));
            info!("img2img pipeline enabled");
        }

        Ok(registry)
    }

    /// The text-to-image pipeline, if enabled
    pub fn text_to_image(&self) -> Result<Arc<dyn TextToImage>> {
        self.text_to_image
            .clone()
            .ok_or(AppError::CapabilityDisabled(Capability::TextToImage))
    }

    /// The image-to-image pipeline, if enabled
    pub fn image_to_image(&self) -> Result<Arc<dyn ImageToImage>> {
        self.image_to_image
            .clone()
            .ok_or(AppError::CapabilityDisabled(Capability::ImageToImage))
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        match capability {
            Capability::TextToImage => self.text_to_image.is_some(),
            Capability::ImageToImage => self.image_to_image.is_some(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

//! Pipeline module - Inference traits, registry and the Stable Diffusion implementation

pub mod device;
pub mod registry;
pub mod stable_diffusion;

use image::DynamicImage;
use std::fmt;

/// A generation mode the server can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    TextToImage,
    ImageToImage,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::TextToImage => f.write_str("txt2img"),
            Capability::ImageToImage => f.write_str("img2img"),
        }
    }
}

/// Parameters for a single pipeline invocation.
///
/// Numeric fields are forwarded as-is; range checking is left to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    /// How far an image-to-image run departs from the source, in `[0, 1]`
    pub strength: Option<f64>,
    pub num_images: usize,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            num_inference_steps: 4,
            guidance_scale: 7.5,
            strength: None,
            num_images: 1,
        }
    }

    /// Negative prompt, treating an empty string as absent
    pub fn negative_prompt(&self) -> &str {
        self.negative_prompt.as_deref().unwrap_or("")
    }
}

/// Text-to-image inference. Implementations block until all images are produced.
pub trait TextToImage: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<Vec<DynamicImage>>;
}

/// Image-to-image inference. Implementations block until all images are produced.
pub trait ImageToImage: Send + Sync {
    fn transform(
        &self,
        request: &GenerationRequest,
        source: &DynamicImage,
    ) -> anyhow::Result<Vec<DynamicImage>>;
}

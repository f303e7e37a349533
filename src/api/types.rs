//! Request and response bodies of the HTTP API

use serde::{Deserialize, Serialize};

use crate::pipeline::GenerationRequest;
use crate::response::GeneratedImage;

fn default_steps() -> usize {
    4
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_strength() -> f64 {
    0.5
}

fn default_n() -> usize {
    1
}

fn default_size() -> String {
    "512x512".to_string()
}

fn default_response_format() -> String {
    "url".to_string()
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Body of `POST /txt2img`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txt2ImgInput {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
}

impl From<Txt2ImgInput> for GenerationRequest {
    fn from(input: Txt2ImgInput) -> Self {
        Self {
            prompt: input.prompt,
            negative_prompt: non_empty(input.negative_prompt),
            num_inference_steps: input.num_inference_steps,
            guidance_scale: input.guidance_scale,
            strength: None,
            num_images: 1,
        }
    }
}

/// Body of `POST /img2img`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Img2ImgInput {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub file_id: String,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
}

impl From<Img2ImgInput> for GenerationRequest {
    fn from(input: Img2ImgInput) -> Self {
        Self {
            prompt: input.prompt,
            negative_prompt: non_empty(input.negative_prompt),
            num_inference_steps: input.num_inference_steps,
            guidance_scale: input.guidance_scale,
            strength: Some(input.strength),
            num_images: 1,
        }
    }
}

/// Body of `POST /v1/images/generations`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    #[serde(default = "default_n")]
    pub n: usize,
    /// Accepted for compatibility; generation always uses the model's default size
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_response_format")]
    pub response_format: String,
}

/// Response of `POST /upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: String,
}

/// Response of `POST /v1/images/generations`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesResponse {
    pub data: Vec<GeneratedImage>,
}

/// Response of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub model: String,
    pub enable_txt2img: bool,
    pub enable_img2img: bool,
}

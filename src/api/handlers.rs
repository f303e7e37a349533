//! Endpoint handlers

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::api::extract::ApiJson;
use crate::api::types::{
    HealthResponse, Img2ImgInput, ImageGenerationRequest, ImagesResponse, Txt2ImgInput,
    UploadResponse,
};
use crate::error::{AppError, Result};
use crate::pipeline::{Capability, GenerationRequest};
use crate::response::{png, ResponseFormat};
use crate::AppState;

/// Run `job` under the gate and PNG-encode the first image it returns
async fn first_png<F>(state: &AppState, job: F) -> Result<Vec<u8>>
where
    F: FnOnce() -> anyhow::Result<Vec<DynamicImage>> + Send + 'static,
{
    let images = state.gate.run(job).await?;
    let image = images
        .first()
        .ok_or_else(|| AppError::PipelineFailure("pipeline returned no images".to_string()))?;
    png::encode(image)
}

/// `POST /txt2img`: generate one image and stream it back as PNG
pub async fn txt2img(
    State(state): State<Arc<AppState>>,
    ApiJson(input): ApiJson<Txt2ImgInput>,
) -> Result<Response> {
    let pipeline = state.registry.text_to_image()?;
    let request = GenerationRequest::from(input);
    debug!(steps = request.num_inference_steps, "txt2img request");

    let png = first_png(&state, move || pipeline.generate(&request))
        .await
        .map_err(|e| {
            error!(error = %e, "Error in txt2img");
            e
        })?;

    Ok(png::stream_response(png))
}

/// `POST /upload`: persist the multipart `file` field
pub async fn upload(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>> {
    let mut multipart = multipart?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let data = field.bytes().await?;
        let file_id = state.uploads.store(&data).await.map_err(|e| {
            error!(error = %e, "Failed to upload image");
            e
        })?;

        info!(file_id = %file_id, size = data.len(), "Stored upload");
        return Ok(Json(UploadResponse { file_id }));
    }

    Err(AppError::InvalidRequest(
        "Multipart field 'file' is required".to_string(),
    ))
}

/// `POST /img2img`: transform a previously uploaded image and stream the result
pub async fn img2img(
    State(state): State<Arc<AppState>>,
    ApiJson(input): ApiJson<Img2ImgInput>,
) -> Result<Response> {
    let pipeline = state.registry.image_to_image()?;

    let bytes = state.uploads.retrieve(&input.file_id).await?;
    let source = image::load_from_memory(&bytes)
        .map_err(|e| AppError::InvalidRequest(format!("Uploaded file is not an image: {}", e)))?;
    let source = DynamicImage::ImageRgb8(source.to_rgb8());

    let request = GenerationRequest::from(input);
    let png = first_png(&state, move || pipeline.transform(&request, &source))
        .await
        .map_err(|e| {
            error!(error = %e, "Error in img2img");
            e
        })?;

    Ok(png::stream_response(png))
}

/// `POST /v1/images/generations`: OpenAI-style bulk generation
pub async fn generate_images(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<ImageGenerationRequest>,
) -> Result<Json<ImagesResponse>> {
    let pipeline = state.registry.text_to_image().map_err(|_| {
        AppError::Unavailable("Text-to-Image generation is unavailable.".to_string())
    })?;

    // The pipeline always renders at its default resolution.
    debug!(size = %body.size, "Ignoring requested size");

    let defaults = &state.settings.generation;
    let request = GenerationRequest {
        prompt: body.prompt,
        negative_prompt: None,
        num_inference_steps: defaults.num_inference_steps,
        guidance_scale: defaults.guidance_scale,
        strength: None,
        num_images: body.n,
    };
    let format = ResponseFormat::from_str(&body.response_format);

    let result = async {
        let images = state.gate.run(move || pipeline.generate(&request)).await?;
        state.responses.process_batch(&images, format).await
    }
    .await;

    match result {
        Ok(data) => Ok(Json(ImagesResponse { data })),
        Err(e) => {
            error!(error = %e, "Error generating images");
            Err(AppError::Internal("Internal server error.".to_string()))
        }
    }
}

/// `GET /health`: configuration summary, never touches a pipeline
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        device: state.registry.device().to_string(),
        model: state.registry.model().to_string(),
        enable_txt2img: state.registry.is_enabled(Capability::TextToImage),
        enable_img2img: state.registry.is_enabled(Capability::ImageToImage),
    })
}

/// `GET /metrics`: Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

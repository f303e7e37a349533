//! Functional tests for the HTTP endpoints, backed by a mock pipeline

#[path = "../common/mod.rs"]
mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::*;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

fn gradient() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(12, 10, |x, y| {
        Rgb([(x * 20) as u8, (y * 25) as u8, ((x + y) * 5) as u8])
    }))
}

#[tokio::test]
async fn test_txt2img_streams_png_attachment() {
    let app = test_app(true, false);

    let response = app
        .send(json_request("/txt2img", json!({ "prompt": "a lighthouse at dusk" })))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("attachment; filename="));
    assert!(disposition.ends_with(".png"));

    let image = image::load_from_memory(&body_bytes(response).await).unwrap();
    assert_eq!(image.to_rgb8(), rendered(0).to_rgb8());
    assert_eq!(app.pipeline.calls(), 1);
}

#[tokio::test]
async fn test_txt2img_forwards_parameters() {
    let app = test_app(true, false);

    let response = app
        .send(json_request(
            "/txt2img",
            json!({
                "prompt": "a fox",
                "negative_prompt": "",
                "num_inference_steps": 12,
                "guidance_scale": 2.0
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let request = app.pipeline.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.prompt, "a fox");
    assert_eq!(request.negative_prompt, None);
    assert_eq!(request.num_inference_steps, 12);
    assert_eq!(request.guidance_scale, 2.0);
    assert_eq!(request.num_images, 1);
}

#[tokio::test]
async fn test_txt2img_defaults() {
    let app = test_app(true, false);

    app.send(json_request(
        "/txt2img",
        json!({ "prompt": "a fox", "negative_prompt": "blurry" }),
    ))
    .await;

    let request = app.pipeline.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.negative_prompt.as_deref(), Some("blurry"));
    assert_eq!(request.num_inference_steps, 4);
    assert_eq!(request.guidance_scale, 7.5);
}

#[tokio::test]
async fn test_txt2img_disabled_is_rejected_without_inference() {
    let app = test_app(false, true);

    let response = app
        .send(json_request("/txt2img", json!({ "prompt": "a fox" })))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["detail"],
        "txt2img is disabled on this server."
    );
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_txt2img_pipeline_failure_is_server_error() {
    let app = test_app_with(MockPipeline::failing(), true, false, |_| {});

    let response = app
        .send(json_request("/txt2img", json!({ "prompt": "a fox" })))
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let detail = body_json(response).await["detail"].as_str().unwrap().to_string();
    assert!(detail.contains("CUDA out of memory"));
    assert!(!app.state.gate.is_busy());
}

#[tokio::test]
async fn test_upload_then_img2img_sees_uploaded_pixels() {
    let app = test_app(false, true);
    let source = gradient();
    let file_id = upload(&app, &source).await;

    let response = app
        .send(json_request(
            "/img2img",
            json!({ "prompt": "oil painting", "file_id": file_id, "strength": 0.8 }),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let output = image::load_from_memory(&body_bytes(response).await).unwrap();
    assert_eq!(output.to_rgb8(), rendered(0).to_rgb8());

    let seen = app.pipeline.last_source.lock().unwrap().clone().unwrap();
    assert_eq!(seen.to_rgb8(), source.to_rgb8());

    let request = app.pipeline.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.strength, Some(0.8));
    assert_eq!(request.num_inference_steps, 4);
}

#[tokio::test]
async fn test_img2img_converts_source_to_rgb() {
    let app = test_app(false, true);
    let rgba = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        4,
        4,
        image::Rgba([10, 20, 30, 128]),
    ));
    let file_id = upload(&app, &rgba).await;

    let response = app
        .send(json_request(
            "/img2img",
            json!({ "prompt": "p", "file_id": file_id }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let seen = app.pipeline.last_source.lock().unwrap().clone().unwrap();
    assert!(matches!(seen, DynamicImage::ImageRgb8(_)));
    assert_eq!(seen.to_rgb8().get_pixel(0, 0), &Rgb([10, 20, 30]));

    let request = app.pipeline.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.strength, Some(0.5));
}

#[tokio::test]
async fn test_img2img_unknown_file_is_not_found() {
    let app = test_app(false, true);

    for file_id in [uuid::Uuid::new_v4().to_string(), "../../etc/passwd".to_string()] {
        let response = app
            .send(json_request(
                "/img2img",
                json!({ "prompt": "p", "file_id": file_id }),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await["detail"],
            "Uploaded file not found on disk."
        );
    }
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_img2img_rejects_non_image_upload() {
    let app = test_app(false, true);
    let response = app.send(upload_request("file", b"not an image")).await;
    let file_id = body_json(response).await["file_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .send(json_request(
            "/img2img",
            json!({ "prompt": "p", "file_id": file_id }),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_img2img_disabled_is_rejected_without_inference() {
    let app = test_app(true, false);
    let file_id = upload(&app, &gradient()).await;

    let response = app
        .send(json_request(
            "/img2img",
            json!({ "prompt": "p", "file_id": file_id }),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["detail"],
        "img2img is disabled on this server."
    );
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_upload_works_with_everything_disabled() {
    let app = test_app(false, false);
    let file_id = upload(&app, &gradient()).await;

    let stored = app.state.uploads.retrieve(&file_id).await.unwrap();
    assert_eq!(stored, png_bytes(&gradient()));
}

#[tokio::test]
async fn test_generations_b64_json_batch() {
    let app = test_app(true, false);

    let response = app
        .send(json_request(
            "/v1/images/generations",
            json!({ "prompt": "three cats", "n": 3, "response_format": "b64_json" }),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);

    let ids: HashSet<_> = data.iter().map(|d| d["id"].as_str().unwrap()).collect();
    let created: HashSet<_> = data.iter().map(|d| d["created"].as_i64().unwrap()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(created.len(), 1);

    let mut payloads = HashSet::new();
    for (index, entry) in data.iter().enumerate() {
        assert_eq!(entry["object"], "image");
        assert!(entry.get("url").is_none());
        let b64 = entry["b64_json"].as_str().unwrap();
        let expected = diffusion_serving::response::base64::encode(&png_bytes(&rendered(index)));
        assert_eq!(b64, expected);
        payloads.insert(b64.to_string());
    }
    assert_eq!(payloads.len(), 3);
    assert_eq!(app.pipeline.calls(), 1);
}

#[tokio::test]
async fn test_generations_url_batch_is_served() {
    let app = test_app(true, false);

    let response = app
        .send(json_request(
            "/v1/images/generations",
            json!({ "prompt": "three cats", "n": 3, "size": "1024x1024" }),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);

    let urls: Vec<String> = data
        .iter()
        .map(|d| d["url"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(urls.iter().collect::<HashSet<_>>().len(), 3);

    for (index, url) in urls.iter().enumerate() {
        assert!(url.starts_with("/output_images/"));
        assert!(data[index].get("b64_json").is_none());

        let response = app.send(get_request(url)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let image = image::load_from_memory(&body_bytes(response).await).unwrap();
        assert_eq!(image.to_rgb8(), rendered(index).to_rgb8());
    }
}

#[tokio::test]
async fn test_generations_use_configured_defaults() {
    let app = test_app_with(MockPipeline::default(), true, false, |settings| {
        settings.generation.num_inference_steps = 20;
        settings.generation.guidance_scale = 3.0;
    });

    let response = app
        .send(json_request(
            "/v1/images/generations",
            json!({ "prompt": "a cat", "response_format": "B64_JSON" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"].as_array().unwrap().len(), 1);

    let request = app.pipeline.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.num_inference_steps, 20);
    assert_eq!(request.guidance_scale, 3.0);
    assert_eq!(request.num_images, 1);
    assert_eq!(request.negative_prompt, None);
}

#[tokio::test]
async fn test_generations_disabled_is_unavailable() {
    let app = test_app(false, true);

    let response = app
        .send(json_request("/v1/images/generations", json!({ "prompt": "a cat" })))
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await["detail"],
        "Text-to-Image generation is unavailable."
    );
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_generations_failure_hides_details() {
    let app = test_app_with(MockPipeline::failing(), true, false, |_| {});

    let response = app
        .send(json_request("/v1/images/generations", json!({ "prompt": "a cat" })))
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["detail"], "Internal server error.");
}

#[tokio::test]
async fn test_health_reports_configuration_without_inference() {
    let app = test_app(true, false);

    let response = app.send(get_request("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["device"], "cpu");
    assert_eq!(body["model"], "stabilityai/sdxl-turbo");
    assert_eq!(body["enable_txt2img"], true);
    assert_eq!(body["enable_img2img"], false);
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_health_answers_while_gate_is_held() {
    let app = test_app(true, true);
    let _permit = app.state.gate.acquire().await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(1), app.send(get_request("/health")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_gate_timeout_is_gateway_timeout() {
    let app = test_app_with(MockPipeline::default(), true, false, |settings| {
        settings.gate.acquire_timeout_ms = Some(20);
    });
    let _permit = app.state.gate.acquire().await.unwrap();

    let response = app
        .send(json_request("/txt2img", json!({ "prompt": "a fox" })))
        .await;

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(app.pipeline.calls(), 0);
}

async fn assert_detail(response: axum::response::Response, status: StatusCode) -> String {
    assert_eq!(response.status(), status);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    body_json(response).await["detail"]
        .as_str()
        .expect("detail should be a string")
        .to_string()
}

#[tokio::test]
async fn test_missing_field_is_json_error() {
    let app = test_app(true, false);

    let response = app
        .send(json_request("/txt2img", json!({ "negative_prompt": "no prompt" })))
        .await;

    let detail = assert_detail(response, StatusCode::UNPROCESSABLE_ENTITY).await;
    assert!(detail.contains("prompt"));
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_wrong_field_type_is_json_error() {
    let app = test_app(false, true);

    let response = app
        .send(json_request(
            "/img2img",
            json!({ "prompt": "p", "file_id": "x", "num_inference_steps": "x" }),
        ))
        .await;

    assert_detail(response, StatusCode::UNPROCESSABLE_ENTITY).await;
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_unparseable_body_is_json_error() {
    let app = test_app(true, false);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/images/generations")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"prompt\": "))
        .unwrap();
    assert_detail(app.send(request).await, StatusCode::BAD_REQUEST).await;

    let request = Request::builder()
        .method("POST")
        .uri("/txt2img")
        .body(Body::from(r#"{"prompt": "a fox"}"#))
        .unwrap();
    assert_detail(app.send(request).await, StatusCode::UNSUPPORTED_MEDIA_TYPE).await;
    assert_eq!(app.pipeline.calls(), 0);
}

#[tokio::test]
async fn test_non_multipart_upload_is_json_error() {
    let app = test_app(true, true);

    let response = app
        .send(json_request("/upload", json!({ "file": "abc" })))
        .await;

    let detail = assert_detail(response, StatusCode::BAD_REQUEST).await;
    assert!(!detail.is_empty());
}

#[tokio::test]
async fn test_missing_file_field_is_json_error() {
    let app = test_app(true, true);

    let response = app.send(upload_request("image", b"bytes")).await;

    assert_eq!(
        assert_detail(response, StatusCode::BAD_REQUEST).await,
        "Multipart field 'file' is required"
    );
}

#[tokio::test]
async fn test_metrics_expose_requests_and_inference() {
    let app = test_app(true, true);

    app.send(json_request("/txt2img", json!({ "prompt": "a fox" })))
        .await;
    app.send(json_request(
        "/img2img",
        json!({ "prompt": "p", "file_id": uuid::Uuid::new_v4().to_string() }),
    ))
    .await;

    let response = app.send(get_request("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(text.contains("diffusion_http_requests_total{path=\"/txt2img\",status=\"200\"} 1"));
    assert!(text.contains("diffusion_http_requests_total{path=\"/img2img\",status=\"404\"} 1"));
    assert!(text.contains("diffusion_gate_wait_seconds_count 1"));
    assert!(text.contains("diffusion_inference_duration_seconds_count 1"));
    assert!(text.contains("diffusion_inference_failures_total 0"));
    assert_eq!(app.pipeline.calls(), 1);
}

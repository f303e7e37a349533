//! PNG encoding and chunked streaming of generated images

use axum::{
    body::{Body, Bytes},
    http::header,
    response::{IntoResponse, Response},
};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use uuid::Uuid;

use crate::error::Result;

/// Size of each body frame when streaming an image
pub const CHUNK_SIZE: usize = 1024;

/// Encode an image as PNG bytes
pub fn encode(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// Split encoded bytes into `CHUNK_SIZE` frames without copying
pub fn chunks(data: Bytes) -> Vec<Bytes> {
    (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(|start| data.slice(start..(start + CHUNK_SIZE).min(data.len())))
        .collect()
}

/// Stream PNG bytes as a downloadable attachment
pub fn stream_response(png: Vec<u8>) -> Response {
    let frames = chunks(Bytes::from(png))
        .into_iter()
        .map(Ok::<_, std::io::Error>);
    let body = Body::from_stream(futures::stream::iter(frames));
    let disposition = format!("attachment; filename={}.png", Uuid::new_v4());

    (
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}

//! Extractors whose rejections are answered like every other API error

use axum::extract::FromRequest;

use crate::error::AppError;

/// `Json` body extractor; a rejected body becomes an `AppError` with a `detail` body
#[derive(Debug, Clone, Copy, Default, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

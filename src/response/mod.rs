//! Response handling module - Base64, PNG streaming, and output persistence

pub mod base64;
pub mod png;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::ImageStore;

/// Response format options for `/v1/images/generations`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Base64 encoded PNG inline in the JSON body
    Base64Json,
    /// URL of the PNG persisted in the output store
    Url,
}

impl ResponseFormat {
    /// Anything other than `url` is answered inline
    pub fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("url") {
            Self::Url
        } else {
            Self::Base64Json
        }
    }
}

/// One generated image as returned to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub object: String,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
}

/// Response handler for converting pipeline output
pub struct ResponseHandler {
    outputs: Arc<ImageStore>,
}

impl ResponseHandler {
    /// Create a new response handler persisting into `outputs`
    pub fn new(outputs: Arc<ImageStore>) -> Self {
        Self { outputs }
    }

    /// Convert one image according to the requested format
    pub async fn process(
        &self,
        image: &DynamicImage,
        format: ResponseFormat,
        id: &str,
        created: i64,
    ) -> Result<GeneratedImage> {
        let png = png::encode(image)?;

        let (url, b64_json) = match format {
            ResponseFormat::Url => {
                let file_id = self.outputs.store(&png).await?;
                (Some(self.outputs.url_for(&file_id)), None)
            }
            ResponseFormat::Base64Json => (None, Some(base64::encode(&png))),
        };

        Ok(GeneratedImage {
            id: id.to_string(),
            object: "image".to_string(),
            created,
            url,
            b64_json,
        })
    }

    /// Convert all images of one request; they share one id and timestamp
    pub async fn process_batch(
        &self,
        images: &[DynamicImage],
        format: ResponseFormat,
    ) -> Result<Vec<GeneratedImage>> {
        let id = Uuid::new_v4().to_string();
        let created = chrono::Utc::now().timestamp();

        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.process(image, format, &id, created).await?);
        }

        Ok(results)
    }
}

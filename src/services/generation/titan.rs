// Amazon Titan text-to-image through Bedrock

use async_trait::async_trait;
use aws_sdk_bedrockruntime::config::Region;
use aws_sdk_bedrockruntime::error::DisplayErrorContext;
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::Client;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::ImageGenerator;
use crate::core::errors::{GenerationError, GenerationResult};
use crate::core::types::GeneratedImage;

const TITAN_MODEL_ID: &str = "amazon.titan-image-generator-v1";
const IMAGE_SIZE: u32 = 512;
const CFG_SCALE: f64 = 8.0;
const MAX_SEED: u32 = 10_000;

#[derive(Debug, Deserialize)]
struct TitanImageResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct TitanGenerator {
    client: Client,
}

impl TitanGenerator {
    /// Client from the ambient AWS credential chain for `region`
    pub async fn from_env(region: &str) -> Self {
        let shared = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: Client::new(&shared),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request_body(prompt: &str, seed: u32) -> serde_json::Value {
        json!({
            "taskType": "TEXT_IMAGE",
            "textToImageParams": {
                "text": prompt
            },
            "imageGenerationConfig": {
                "numberOfImages": 1,
                "height": IMAGE_SIZE,
                "width": IMAGE_SIZE,
                "cfgScale": CFG_SCALE,
                "seed": seed
            }
        })
    }

    fn decode_first_image(index: usize, raw: &[u8]) -> GenerationResult<Vec<u8>> {
        let response: TitanImageResponse = serde_json::from_slice(raw)
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(GenerationError::InvalidResponse(error));
        }

        let first = response
            .images
            .first()
            .ok_or(GenerationError::NoImages { index })?;

        STANDARD
            .decode(first.as_bytes())
            .map_err(|e| GenerationError::InvalidResponse(format!("image payload: {}", e)))
    }
}

#[async_trait]
impl ImageGenerator for TitanGenerator {
    #[instrument(skip(self, prompt))]
    async fn generate(&self, index: usize, prompt: &str) -> GenerationResult<GeneratedImage> {
        let start = Instant::now();
        let seed: u32 = rand::thread_rng().gen_range(0..MAX_SEED);

        let body = serde_json::to_vec(&Self::request_body(prompt, seed))
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let response = self
            .client
            .invoke_model()
            .model_id(TITAN_MODEL_ID)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await
            .map_err(|e| GenerationError::Request(DisplayErrorContext(&e).to_string()))?;

        let bytes = Self::decode_first_image(index, &response.body.into_inner())?;
        debug!(
            "Titan produced {} bytes in {:?} (seed {})",
            bytes.len(),
            start.elapsed(),
            seed
        );

        Ok(GeneratedImage {
            index,
            image_id: Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            bytes: Arc::new(bytes),
            model_tag: "titan".to_string(),
        })
    }
}

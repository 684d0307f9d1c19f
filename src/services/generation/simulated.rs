// Offline stand-in for the generation service: solid-color JPEGs with a
// configurable failure rate

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use rand::Rng;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::ImageGenerator;
use crate::core::errors::{GenerationError, GenerationResult};
use crate::core::types::GeneratedImage;

const MOCK_SIZE: u32 = 512;

pub struct SimulatedGenerator {
    failure_rate: f64,
    fixture: Option<Arc<Vec<u8>>>,
}

impl SimulatedGenerator {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            fixture: None,
        }
    }

    /// Return these bytes for every successful call instead of a solid color
    pub fn with_fixture(mut self, bytes: Vec<u8>) -> Self {
        self.fixture = Some(Arc::new(bytes));
        self
    }

    fn solid_jpeg(color: [u8; 3]) -> GenerationResult<Vec<u8>> {
        let img = RgbImage::from_pixel(MOCK_SIZE, MOCK_SIZE, Rgb(color));
        let mut bytes = Vec::new();
        JpegEncoder::new(&mut bytes)
            .encode_image(&img)
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        Ok(bytes)
    }
}

#[async_trait]
impl ImageGenerator for SimulatedGenerator {
    async fn generate(&self, index: usize, prompt: &str) -> GenerationResult<GeneratedImage> {
        let (fail, color) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(self.failure_rate), rng.gen::<[u8; 3]>())
        };

        if fail {
            debug!("Simulated failure for prompt {}", index);
            return Err(GenerationError::Simulated { index });
        }

        let bytes = match &self.fixture {
            Some(bytes) => Arc::clone(bytes),
            None => Arc::new(Self::solid_jpeg(color)?),
        };

        Ok(GeneratedImage {
            index,
            image_id: Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            bytes,
            model_tag: "mocked-titan".to_string(),
        })
    }
}

//! Image generation and prompt expansion collaborators
//!
//! Every generation call in the process goes through one shared
//! [`GenerationGate`], so the upstream service never sees more than
//! `capacity` requests at once regardless of how many batches are running.

pub mod prompts;
pub mod simulated;
pub mod titan;

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::core::errors::{GenerationError, GenerationResult, PromptError};
use crate::core::types::{GeneratedImage, GenerationRequest};
use crate::utils::Metrics;

pub use prompts::{OpenAiPromptExpander, PassthroughExpander};
pub use simulated::SimulatedGenerator;
pub use titan::TitanGenerator;

/// Produces one image per prompt
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, index: usize, prompt: &str) -> GenerationResult<GeneratedImage>;
}

/// Turns a handful of themes into `request.total` concrete prompts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PromptExpander: Send + Sync {
    async fn expand(&self, request: &GenerationRequest) -> Result<Vec<String>, PromptError>;
}

/// Process-wide bound on in-flight generation calls.
///
/// Every call is timed from permit grant to completion and recorded in
/// `metrics`, so latency excludes time spent queued at the gate.
#[derive(Clone)]
pub struct GenerationGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    metrics: Metrics,
}

impl GenerationGate {
    pub fn new(capacity: usize, metrics: Metrics) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one generation call while holding a permit
    pub async fn generate(
        &self,
        generator: &dyn ImageGenerator,
        index: usize,
        prompt: &str,
    ) -> GenerationResult<GeneratedImage> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let start = Instant::now();
        let result = generator.generate(index, prompt).await;
        self.metrics.record_generation(result.is_ok(), start.elapsed());
        result
    }

    /// Generate one image per prompt concurrently; results keep prompt order.
    #[instrument(skip(self, generator, prompts), fields(prompts = prompts.len()))]
    pub async fn generate_all(
        &self,
        generator: &dyn ImageGenerator,
        prompts: &[String],
    ) -> Vec<GenerationResult<GeneratedImage>> {
        debug!(
            "Dispatching {} generations ({} of {} permits free)",
            prompts.len(),
            self.available(),
            self.capacity
        );
        join_all(
            prompts
                .iter()
                .enumerate()
                .map(|(index, prompt)| self.generate(generator, index, prompt)),
        )
        .await
    }
}

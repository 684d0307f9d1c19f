// Error taxonomy for the fulfillment pipeline
//
// One enum per concern, built with thiserror. Compositor and collaborator
// errors carry their original cause; the orchestrator wraps them with the
// batch/item context needed to diagnose an aborted run.

use thiserror::Error;

/// Compositor errors (key-color removal and pattern placement)
#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("Failed to fetch source image: {0}")]
    SourceFetch(#[from] FetchError),

    #[error("Failed to decode image data: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Pattern exceeds canvas bounds: ({x}, {y}) {width}x{height} on a {canvas}px canvas")]
    Geometry {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        canvas: u32,
    },

    #[error("Image encoding failed: {0}")]
    Encode(String),

    #[error("Scratch file operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload of composite failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Blocking task failed: {0}")]
    TaskJoin(String),
}

/// Remote image fetch failure (non-200, timeout, transport)
#[derive(Debug, Error)]
#[error("GET {url} failed: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

/// Image generation collaborator errors
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation request failed: {0}")]
    Request(String),

    #[error("Invalid generation response: {0}")]
    InvalidResponse(String),

    #[error("Generation service returned no images for prompt {index}")]
    NoImages { index: usize },

    #[error("Simulated generation failure for prompt {index}")]
    Simulated { index: usize },
}

/// Prompt expansion errors
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("At least one theme is required")]
    NoThemes,

    #[error("Prompt expansion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Prompt service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unparseable prompt response: {0}")]
    InvalidResponse(String),
}

/// Object storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload to {bucket}/{key} failed: {reason}")]
    Upload {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Presigning {bucket}/{key} failed: {reason}")]
    Presign {
        bucket: String,
        key: String,
        reason: String,
    },
}

/// Document store (orders, organizations) errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: String },

    #[error("Document store failure: {0}")]
    Backend(String),

    #[error("Reading organization seed failed: {0}")]
    SeedIo(#[from] std::io::Error),

    #[error("Organization seed is not valid JSON: {0}")]
    SeedFormat(#[from] serde_json::Error),
}

/// Organization/product/color resolution miss. Never fatal: the caller
/// degrades to a sentinel thumbnail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupMiss {
    #[error("Line item carries no organization id")]
    NoOrganization,

    #[error("Organization not found: {0}")]
    Organization(String),

    #[error("Organization {org_id} has no product named {apparel}")]
    Product { org_id: String, apparel: String },

    #[error("Product {apparel} has no color named {color}")]
    Color { apparel: String, color: String },
}

/// Bulk orchestration errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Retry budget exhausted for task {task_id}: {failures} failures against a limit of {limit}")]
    RetryBudgetExceeded {
        task_id: String,
        failures: usize,
        limit: usize,
    },

    #[error("Persisting order for item {index} failed: {source}")]
    Persistence {
        index: usize,
        #[source]
        source: StoreError,
    },

    #[error("Prompt expansion failed: {0}")]
    PromptExpansion(#[from] PromptError),

    #[error("Task {0} is already running")]
    DuplicateTask(String),

    #[error("Batch contains no line items")]
    EmptyBatch,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid key color {0:?} (expected four comma-separated 0-255 values)")]
    InvalidKeyColor(String),

    #[error("{name} must be > 0, got {value}")]
    NotPositive { name: &'static str, value: u64 },

    #[error("Unknown {name} backend: {value}")]
    UnknownBackend { name: &'static str, value: String },

    #[error("Failure rate must be in [0.0, 1.0], got {0}")]
    InvalidFailureRate(f64),
}

pub type CompositorResult<T> = Result<T, CompositorError>;
pub type GenerationResult<T> = Result<T, GenerationError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<image::ImageError> for CompositorError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Encoding(e) => CompositorError::Encode(e.to_string()),
            other => CompositorError::Decode(Box::new(other)),
        }
    }
}

impl From<base64::DecodeError> for CompositorError {
    fn from(err: base64::DecodeError) -> Self {
        CompositorError::Decode(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for CompositorError {
    fn from(err: tokio::task::JoinError) -> Self {
        CompositorError::TaskJoin(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use std::error::Error as _;

    #[test]
    fn test_decode_error_keeps_its_cause() {
        let b64 = base64::engine::general_purpose::STANDARD
            .decode("not*base64")
            .unwrap_err();
        let err = CompositorError::from(b64);
        let cause = err.source().expect("decode error has a source");
        assert!(cause.downcast_ref::<base64::DecodeError>().is_some());

        let img = image::load_from_memory(b"definitely not an image").unwrap_err();
        let err = CompositorError::from(img);
        assert!(matches!(err, CompositorError::Decode(_)));
        assert!(err
            .source()
            .and_then(|cause| cause.downcast_ref::<image::ImageError>())
            .is_some());
    }
}

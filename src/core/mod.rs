pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    CompositorError, ConfigError, FetchError, GenerationError, LookupMiss, OrchestratorError,
    PromptError, StorageError, StoreError,
};
pub use types::{
    BatchTaskState, BulkLineItem, GeneratedImage, GenerationRequest, ImageSource, Order,
    Organization, PixelRect, PlacementGeometry, PrintFlow,
};

pub mod compositor;
pub mod fetch;
pub mod generation;
pub mod storage;
pub mod store;

// Re-export commonly used services
pub use compositor::{Compositor, CompositorSettings};
pub use fetch::{HttpImageFetcher, ImageFetcher};
pub use generation::{
    GenerationGate, ImageGenerator, OpenAiPromptExpander, PassthroughExpander, PromptExpander,
    SimulatedGenerator, TitanGenerator,
};
pub use storage::{MemoryStorage, ObjectStorage, S3Storage};
pub use store::{MemoryStore, OrderStore, OrganizationStore};

// Library exports for the apparel fulfillment backend
//
// core: config, errors, shared records
// services: compositor and the external collaborators
// orchestration: bulk generation workflow and its progress table
// api: axum router

pub mod api;
pub mod core;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{CompositorError, ConfigError, LookupMiss, OrchestratorError},
    types::{BatchTaskState, BulkLineItem, ImageSource, PlacementGeometry, PrintFlow},
};

pub use orchestration::{BulkBatchReport, BulkOrchestrator, TaskRegistry};

pub use services::{Compositor, CompositorSettings, GenerationGate};

pub use utils::Metrics;

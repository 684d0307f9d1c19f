pub mod bulk_orchestrator;
pub mod retry_budget;
pub mod task_registry;

pub use bulk_orchestrator::{
    BulkBatchReport, BulkCollaborators, BulkOrchestrator, OrchestratorSettings,
};
pub use retry_budget::RetryBudget;
pub use task_registry::{TaskGuard, TaskRegistry};

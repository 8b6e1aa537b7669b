pub mod orchestrator;
pub mod state;
pub mod types;

pub use orchestrator::{PipelineSettings, TryOnPipeline};
pub use state::{PipelineState, RetryBudget, RetryMachine, MAX_RENDER_CALLS};
pub use types::{
    GenerationDebug, GenerationInput, GenerationResult, RequestContext, StageRecord, StageStatus,
};

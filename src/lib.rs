//! Identity-preserving outfit try-on: resolves a scene, locks the person's
//! identity, renders a candidate and retries at most once when the face drifts
//! or the scene looks wrong.

pub mod assess;
pub mod composite;
pub mod config;
pub mod face;
pub mod guard;
pub mod identity;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod render;
pub mod scene;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use guard::{GuardRejection, InFlightGuard, TryOnService};
pub use pipeline::{GenerationInput, GenerationResult, PipelineSettings, TryOnPipeline};

pub mod compositor;
pub mod sanitize;

pub use compositor::{clamp_creative_deviation, GenerationPrompt, PromptCompositor, PromptInputs};
pub use sanitize::{PhraseSanitizer, Sanitized};

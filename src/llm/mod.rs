pub mod gemini;
pub mod json;
pub mod media;

use std::future::Future;

use anyhow::Result;

pub use gemini::GeminiClient;
pub use media::SourceImage;

#[derive(Debug, thiserror::Error)]
#[error("Image generation failed: {0}")]
pub struct ImageGenerationError(pub String);

/// One image-plus-text question for a vision-capable language model.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    /// Stable label used for logs and timing (e.g. `face_locate`).
    pub operation: &'static str,
    pub system_prompt: String,
    pub prompt: String,
    pub images: Vec<SourceImage>,
    /// Ask the model for a JSON-only response.
    pub expect_json: bool,
}

impl VisionRequest {
    pub fn json(
        operation: &'static str,
        system_prompt: &str,
        prompt: String,
        images: Vec<SourceImage>,
    ) -> Self {
        VisionRequest {
            operation,
            system_prompt: system_prompt.to_string(),
            prompt,
            images,
            expect_json: true,
        }
    }
}

/// Inputs for one image-generation call.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub images: Vec<SourceImage>,
    pub aspect_ratio: String,
    pub image_size: String,
}

pub trait VisionModel: Send + Sync + 'static {
    fn model_name(&self) -> &str;

    /// Returns the raw text the model produced.
    fn analyze(&self, request: VisionRequest) -> impl Future<Output = Result<String>> + Send;
}

pub trait ImageModel: Send + Sync + 'static {
    fn model_name(&self) -> &str;

    /// Returns the encoded bytes of the first image the model produced.
    fn generate(
        &self,
        request: ImageRequest,
    ) -> impl Future<Output = Result<Vec<u8>, ImageGenerationError>> + Send;
}

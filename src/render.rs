use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm::{ImageGenerationError, ImageModel, ImageRequest, SourceImage};
use crate::pipeline::types::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:5")]
    Portrait4x5,
    #[serde(rename = "3:4")]
    Portrait3x4,
    #[serde(rename = "9:16")]
    Story,
}

impl AspectRatio {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1:1" => Some(AspectRatio::Square),
            "4:5" => Some(AspectRatio::Portrait4x5),
            "3:4" => Some(AspectRatio::Portrait3x4),
            "9:16" => Some(AspectRatio::Story),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait4x5 => "4:5",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Story => "9:16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl ResolutionTier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "1K" => Some(ResolutionTier::OneK),
            "2K" => Some(ResolutionTier::TwoK),
            "4K" => Some(ResolutionTier::FourK),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionTier::OneK => "1K",
            ResolutionTier::TwoK => "2K",
            ResolutionTier::FourK => "4K",
        }
    }
}

/// Everything one render call needs. Image 1 is the person, Image 2 the garment.
#[derive(Debug, Clone)]
pub struct RenderRequest<'a> {
    pub person: &'a SourceImage,
    pub garment: &'a SourceImage,
    pub prompt: &'a str,
    pub aspect_ratio: AspectRatio,
    pub resolution: ResolutionTier,
}

/// Issues exactly one image-generation call. Errors are returned to the
/// caller untouched; the orchestrator decides whether another attempt runs.
pub async fn render_candidate<R: ImageModel>(
    renderer: &R,
    request: RenderRequest<'_>,
    timeout: Duration,
    ctx: &RequestContext,
) -> Result<SourceImage, ImageGenerationError> {
    let image_request = ImageRequest {
        prompt: request.prompt.to_string(),
        images: vec![request.person.clone(), request.garment.clone()],
        aspect_ratio: request.aspect_ratio.as_str().to_string(),
        image_size: request.resolution.as_str().to_string(),
    };

    let bytes = match tokio::time::timeout(timeout, renderer.generate(image_request)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(
                request_id = %ctx.request_id,
                timeout_s = timeout.as_secs(),
                "Render call timed out"
            );
            return Err(ImageGenerationError(format!(
                "render timed out after {}s",
                timeout.as_secs()
            )));
        }
    };
    if bytes.is_empty() {
        return Err(ImageGenerationError("renderer returned an empty image".to_string()));
    }

    let candidate = SourceImage::new(bytes);
    info!(
        request_id = %ctx.request_id,
        model = renderer.model_name(),
        bytes = candidate.len(),
        mime_type = candidate.mime_type(),
        "Candidate rendered"
    );
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRenderer;

    #[test]
    fn aspect_ratios_round_trip_through_strings() {
        for raw in ["1:1", "4:5", "3:4", "9:16"] {
            assert_eq!(AspectRatio::parse(raw).unwrap().as_str(), raw);
        }
        assert_eq!(AspectRatio::parse("16:9"), None);
        assert_eq!(
            serde_json::to_value(AspectRatio::Story).unwrap(),
            serde_json::json!("9:16")
        );
    }

    #[test]
    fn resolution_parsing_is_case_insensitive() {
        assert_eq!(ResolutionTier::parse(" 4k "), Some(ResolutionTier::FourK));
        assert_eq!(ResolutionTier::parse("8K"), None);
    }

    #[tokio::test]
    async fn sends_person_then_garment() {
        let renderer = ScriptedRenderer::new(vec![Ok(vec![1, 2, 3])]);
        let person = SourceImage::new(vec![10]);
        let garment = SourceImage::new(vec![20]);
        let candidate = render_candidate(
            &renderer,
            RenderRequest {
                person: &person,
                garment: &garment,
                prompt: "dress the person",
                aspect_ratio: AspectRatio::Portrait4x5,
                resolution: ResolutionTier::TwoK,
            },
            Duration::from_secs(5),
            &RequestContext::new("render-test"),
        )
        .await
        .unwrap();
        assert_eq!(candidate.bytes(), &[1, 2, 3]);
        let seen = renderer.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].images[0].bytes(), &[10]);
        assert_eq!(seen[0].images[1].bytes(), &[20]);
        assert_eq!(seen[0].aspect_ratio, "4:5");
        assert_eq!(seen[0].image_size, "2K");
    }

    #[tokio::test]
    async fn failures_propagate_without_retry() {
        let renderer = ScriptedRenderer::new(vec![Err("quota".to_string()), Ok(vec![1])]);
        let person = SourceImage::new(vec![10]);
        let garment = SourceImage::new(vec![20]);
        let result = render_candidate(
            &renderer,
            RenderRequest {
                person: &person,
                garment: &garment,
                prompt: "p",
                aspect_ratio: AspectRatio::Square,
                resolution: ResolutionTier::OneK,
            },
            Duration::from_secs(5),
            &RequestContext::new("render-test"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(renderer.calls(), 1);
    }
}

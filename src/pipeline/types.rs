use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::assess::{DriftAssessment, SceneQualityAssessment};
use crate::render::AspectRatio;
use crate::scene::{SceneInput, SceneSource};

/// Per-request correlation data passed explicitly to every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        RequestContext {
            request_id: request_id.into(),
        }
    }

    pub fn generate() -> Self {
        RequestContext::new(Uuid::new_v4().to_string())
    }
}

#[derive(Clone)]
pub struct GenerationInput {
    pub person_image: Vec<u8>,
    pub garment_image: Vec<u8>,
    pub aspect_ratio: AspectRatio,
    pub garment_description: Option<String>,
    pub user_request: Option<String>,
    pub preset_id: Option<String>,
    pub preset_description: Option<String>,
    pub lighting_description: Option<String>,
}

impl GenerationInput {
    pub fn new(person_image: Vec<u8>, garment_image: Vec<u8>, aspect_ratio: AspectRatio) -> Self {
        GenerationInput {
            person_image,
            garment_image,
            aspect_ratio,
            garment_description: None,
            user_request: None,
            preset_id: None,
            preset_description: None,
            lighting_description: None,
        }
    }

    pub fn scene_input(&self) -> SceneInput {
        SceneInput {
            user_request: self.user_request.clone(),
            preset_id: self.preset_id.clone(),
            preset_description: self.preset_description.clone(),
            lighting_description: self.lighting_description.clone(),
        }
    }
}

impl std::fmt::Debug for GenerationInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationInput")
            .field("person_image_len", &self.person_image.len())
            .field("garment_image_len", &self.garment_image.len())
            .field("aspect_ratio", &self.aspect_ratio)
            .field("garment_description", &self.garment_description)
            .field("user_request", &self.user_request)
            .field("preset_id", &self.preset_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Pass,
    Fail,
    Skip,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: u8,
    pub name: String,
    pub status: StageStatus,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationDebug {
    pub request_id: String,
    pub stages: Vec<StageRecord>,
    pub retried: bool,
    pub retry_reason: Option<String>,
    pub correction_guidance: Option<String>,
    pub render_calls: u32,
    pub scene_source: Option<SceneSource>,
    pub initial_drift: Option<DriftAssessment>,
    pub initial_quality: Option<SceneQualityAssessment>,
    pub final_drift: Option<DriftAssessment>,
    pub final_quality: Option<SceneQualityAssessment>,
    pub pixel_correction_applied: bool,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub total_time_ms: u64,
}

impl GenerationDebug {
    pub fn new(request_id: &str) -> Self {
        GenerationDebug {
            request_id: request_id.to_string(),
            ..GenerationDebug::default()
        }
    }

    pub fn record(
        &mut self,
        stage: u8,
        name: &str,
        status: StageStatus,
        time_ms: u64,
        data: JsonValue,
    ) {
        self.stages.push(StageRecord {
            stage,
            name: name.to_string(),
            status,
            time_ms,
            data,
        });
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.name == name)
    }
}

/// Terminal artifact of one run. `image` is set only on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub success: bool,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
    pub mime_type: Option<String>,
    pub generation_time_ms: u64,
    pub prompt_used: Option<String>,
    pub debug: GenerationDebug,
}

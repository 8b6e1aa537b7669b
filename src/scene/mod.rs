pub mod presets;
pub mod resolver;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub use presets::{Preset, PresetCatalog};
pub use resolver::{resolve_scene, SceneInput, SceneResolution, SceneSource};

pub const FALLBACK_PRESET_ID: &str = "studio_gradient";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightingMode {
    /// Light the person to match the new environment.
    EnvironmentCoherent,
    StudioControlled,
    /// Keep the light of the source photo.
    PreserveSource,
}

impl LightingMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "environment_coherent" | "environment" => Some(LightingMode::EnvironmentCoherent),
            "studio_controlled" | "studio" => Some(LightingMode::StudioControlled),
            "preserve_source" | "preserve" | "source" => Some(LightingMode::PreserveSource),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LightingMode::EnvironmentCoherent => "environment_coherent",
            LightingMode::StudioControlled => "studio_controlled",
            LightingMode::PreserveSource => "preserve_source",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosePolicy {
    Inherit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacePolicy {
    Immutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraPolicy {
    Inherit,
}

/// Background, light and policy bundle for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    pub preset_id: String,
    pub anchor_zone_description: String,
    pub lighting_mode: LightingMode,
    pub pose_policy: PosePolicy,
    pub face_policy: FacePolicy,
    pub camera_policy: CameraPolicy,
    pub realism_guidance: String,
    pub lighting_blueprint: String,
    pub preset_avoid_list: Vec<String>,
    /// Raw value from the preset; the compositor clamps it.
    pub creative_deviation: f32,
}

static FALLBACK_SCENE: Lazy<SceneConfig> = Lazy::new(|| SceneConfig {
    preset_id: FALLBACK_PRESET_ID.to_string(),
    anchor_zone_description: "Seamless studio gradient backdrop from warm grey to soft white".to_string(),
    lighting_mode: LightingMode::StudioControlled,
    pose_policy: PosePolicy::Inherit,
    face_policy: FacePolicy::Immutable,
    camera_policy: CameraPolicy::Inherit,
    realism_guidance: "Photorealistic, natural skin texture, true-to-life fabric detail".to_string(),
    lighting_blueprint: "Soft ambient lighting with a gentle frontal key and even fill, no hard shadows".to_string(),
    preset_avoid_list: vec!["props".to_string(), "text".to_string()],
    creative_deviation: 0.2,
});

impl SceneConfig {
    /// Neutral studio scene used whenever resolution fails or times out.
    pub fn fallback() -> Self {
        FALLBACK_SCENE.clone()
    }

    pub fn from_preset(preset: &Preset) -> Self {
        SceneConfig {
            preset_id: preset.id.clone(),
            anchor_zone_description: preset.background.clone(),
            lighting_mode: preset.lighting_mode,
            pose_policy: PosePolicy::Inherit,
            face_policy: FacePolicy::Immutable,
            camera_policy: CameraPolicy::Inherit,
            realism_guidance: if preset.realism.is_empty() {
                FALLBACK_SCENE.realism_guidance.clone()
            } else {
                preset.realism.clone()
            },
            lighting_blueprint: preset.lighting.clone(),
            preset_avoid_list: preset.avoid.clone(),
            creative_deviation: preset.creative_deviation,
        }
    }

    /// One-line description used when asking the reviewer about the scene.
    pub fn summary(&self) -> String {
        format!(
            "{} ({}); lighting: {}",
            self.anchor_zone_description,
            self.preset_id,
            self.lighting_blueprint
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_studio_gradient() {
        let scene = SceneConfig::fallback();
        assert_eq!(scene.preset_id, FALLBACK_PRESET_ID);
        assert_eq!(scene.face_policy, FacePolicy::Immutable);
        assert!(scene.lighting_blueprint.contains("Soft ambient"));
    }

    #[test]
    fn lighting_mode_parsing_is_lenient() {
        assert_eq!(
            LightingMode::parse(" Environment-Coherent "),
            Some(LightingMode::EnvironmentCoherent)
        );
        assert_eq!(LightingMode::parse("studio"), Some(LightingMode::StudioControlled));
        assert_eq!(LightingMode::parse("neon"), None);
    }

    #[test]
    fn policies_serialize_as_snake_case() {
        let value = serde_json::to_value(SceneConfig::fallback()).unwrap();
        assert_eq!(value["pose_policy"], "inherit");
        assert_eq!(value["face_policy"], "immutable");
        assert_eq!(value["lighting_mode"], "studio_controlled");
    }
}

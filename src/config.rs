use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

use crate::assess::AssessmentThresholds;
use crate::composite::PixelCorrectionMode;
use crate::render::ResolutionTier;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub gemini_api_key: String,
    pub gemini_vision_model: String,
    pub gemini_image_model: String,
    pub gemini_temperature: f32,
    pub gemini_safety_settings: String,
    pub gemini_request_timeout_seconds: u64,
    pub presets_path: Option<PathBuf>,
    pub resolution: ResolutionTier,
    pub prompt_max_chars: usize,
    pub scene_timeout_ms: u64,
    pub identity_timeout_ms: u64,
    pub quality_timeout_ms: u64,
    pub face_timeout_ms: u64,
    pub render_timeout_seconds: u64,
    pub thresholds: AssessmentThresholds,
    pub pixel_correction: PixelCorrectionMode,
    pub forbidden_phrases: Vec<String>,
    pub max_inflight_per_user: usize,
    pub inflight_retry_after_seconds: u64,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

fn resolve_presets_path() -> Option<PathBuf> {
    let raw = env::var("TRYON_PRESETS_PATH").ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let path = PathBuf::from(trimmed);
    if path.is_absolute() {
        return Some(path);
    }
    Some(
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path),
    )
}

fn load_thresholds() -> AssessmentThresholds {
    let defaults = AssessmentThresholds::default();
    AssessmentThresholds {
        min_iou: env_f64("TRYON_MIN_IOU", defaults.min_iou),
        max_center_distance: env_f64("TRYON_MAX_CENTER_DISTANCE", defaults.max_center_distance),
        max_size_delta: env_f64("TRYON_MAX_SIZE_DELTA", defaults.max_size_delta),
        min_dimension_score: env_f64("TRYON_MIN_DIMENSION_SCORE", defaults.min_dimension_score),
        min_average_score: env_f64("TRYON_MIN_AVERAGE_SCORE", defaults.min_average_score),
        min_major_issues: env_usize("TRYON_MIN_MAJOR_ISSUES", defaults.min_major_issues),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let gemini_api_key = env::var("GEMINI_API_KEY").unwrap_or_default();
        if gemini_api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("GEMINI_API_KEY is required"));
        }

        let resolution_raw = env_string("TRYON_RESOLUTION", "2K");
        let resolution = ResolutionTier::parse(&resolution_raw).unwrap_or_else(|| {
            warn!(
                "Unknown TRYON_RESOLUTION value '{}'; defaulting to 2K.",
                resolution_raw
            );
            ResolutionTier::TwoK
        });

        let pixel_raw = env_string("TRYON_PIXEL_CORRECTION", "off");
        let pixel_correction = PixelCorrectionMode::parse(&pixel_raw).unwrap_or_else(|| {
            warn!(
                "Unknown TRYON_PIXEL_CORRECTION value '{}'; pixel correction disabled.",
                pixel_raw
            );
            PixelCorrectionMode::Off
        });

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            gemini_api_key,
            gemini_vision_model: env_string("GEMINI_VISION_MODEL", "gemini-2.5-flash"),
            gemini_image_model: env_string("GEMINI_IMAGE_MODEL", "gemini-3-pro-image-preview"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.2),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            gemini_request_timeout_seconds: env_u64("GEMINI_REQUEST_TIMEOUT_SECONDS", 90),
            presets_path: resolve_presets_path(),
            resolution,
            prompt_max_chars: env_usize("TRYON_PROMPT_MAX_CHARS", 4000).max(1500),
            scene_timeout_ms: env_u64("TRYON_SCENE_TIMEOUT_MS", 7000),
            identity_timeout_ms: env_u64("TRYON_IDENTITY_TIMEOUT_MS", 5000),
            quality_timeout_ms: env_u64("TRYON_QUALITY_TIMEOUT_MS", 5000),
            face_timeout_ms: env_u64("TRYON_FACE_TIMEOUT_MS", 8000),
            render_timeout_seconds: env_u64("TRYON_RENDER_TIMEOUT_SECONDS", 120),
            thresholds: load_thresholds(),
            pixel_correction,
            forbidden_phrases: env_csv("TRYON_FORBIDDEN_PHRASES"),
            max_inflight_per_user: env_usize("TRYON_MAX_INFLIGHT_PER_USER", 1).max(1),
            inflight_retry_after_seconds: env_u64("TRYON_INFLIGHT_RETRY_AFTER_SECONDS", 30),
        })
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_seconds)
    }
}

pub const FACE_LOCATOR_SYSTEM_PROMPT: &str = "You are a precise face localization engine. You look at one photograph and report the bounding box of the single most prominent human face.\n\nRules:\n1. Respond with ONLY a JSON object, no prose and no markdown.\n2. Use normalized coordinates in the 0-1000 range relative to the image: {\"ymin\": int, \"xmin\": int, \"ymax\": int, \"xmax\": int, \"confidence\": float}.\n3. The box covers forehead to chin and ear to ear.\n4. If there is no visible human face, respond with {\"ymin\": 0, \"xmin\": 0, \"ymax\": 0, \"xmax\": 0, \"confidence\": 0}.\n";

pub const IDENTITY_SYSTEM_PROMPT: &str = "You are a forensic visual analyst. You describe stable, objective, visible identity features of the person in the photograph so an image editor can keep that person recognisable.\n\nRules:\n1. Respond with ONLY a JSON object using exactly these keys: face_anchor, eyes_anchor, character_summary, pose_summary, appearance_summary, body_anchor, garment_on_person_guidance.\n2. Each value is one short sentence (max 30 words) of objective geometry and texture: eye shape and spacing, nose bridge and tip, lip shape, jawline, skin texture, hairline, body build and proportions, current pose.\n3. NEVER mention or guess age, ethnicity, race, nationality, religion, names or any other protected or sensitive attribute.\n4. Do not judge attractiveness.\n";

pub const SCENE_SYSTEM_PROMPT: &str = "You are a photography director planning a realistic outfit photo. You choose a background and a lighting plan that fit the person's existing pose and camera angle.\n\nRules:\n1. Respond with ONLY a JSON object with keys: preset_id (one of the provided catalog ids or null), anchor_zone_description, lighting_mode (environment_coherent | studio_controlled | preserve_source), realism_guidance, lighting_blueprint, avoid (array of short strings).\n2. The person's face, body, pose and camera angle are fixed. Describe only the environment and light.\n3. Keep each text value under 40 words.\n";

pub const QUALITY_SYSTEM_PROMPT: &str = "You are a strict photo quality reviewer for generated outfit photos. Score the image honestly.\n\nRules:\n1. Respond with ONLY a JSON object with keys: pose_naturalness, lighting_coherence, background_quality, composition_balance (integers 0-100), major_issues (array of short strings, only real, clearly visible problems), correction_guidance (one or two imperative sentences telling an editor how to fix the problems, or an empty string).\n2. A natural, well-lit, coherent photo scores above 80 on every dimension.\n";

//! Scripted model stand-ins shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use crate::llm::{ImageGenerationError, ImageModel, ImageRequest, VisionModel, VisionRequest};

pub const NO_FACE: &str = r#"{"ymin": 0, "xmin": 0, "ymax": 0, "xmax": 0, "confidence": 0}"#;

pub const GOOD_IDENTITY: &str = r#"{
    "face_anchor": "Oval face, straight nose bridge, full lower lip.",
    "eyes_anchor": "Almond eyes with medium spacing.",
    "character_summary": "Relaxed, confident stance.",
    "pose_summary": "Standing, facing camera, arms at sides.",
    "appearance_summary": "Short dark curly hair.",
    "body_anchor": "Medium build, broad shoulders.",
    "garment_on_person_guidance": "Let the coat fall straight from the shoulders."
}"#;

pub const GOOD_SCENE: &str = r#"{
    "preset_id": "minimal_loft",
    "anchor_zone_description": "Bright loft with white walls and large windows",
    "lighting_mode": "environment_coherent",
    "realism_guidance": "Natural skin texture and realistic fabric folds",
    "lighting_blueprint": "Soft window light from the left",
    "avoid": ["clutter"]
}"#;

pub const GOOD_QUALITY: &str = r#"{"pose_naturalness": 90, "lighting_coherence": 88, "background_quality": 92,
    "composition_balance": 89, "major_issues": [], "correction_guidance": ""}"#;

pub const POOR_QUALITY: &str = r#"{"pose_naturalness": 40, "lighting_coherence": 88, "background_quality": 92,
    "composition_balance": 89, "major_issues": ["stiff arms"], "correction_guidance": "Relax the arms naturally."}"#;

pub fn face_answer(ymin: i32, xmin: i32, ymax: i32, xmax: i32) -> String {
    format!(r#"{{"ymin": {ymin}, "xmin": {xmin}, "ymax": {ymax}, "xmax": {xmax}, "confidence": 0.95}}"#)
}

/// Canned answers per operation. Errors are given as strings.
#[derive(Debug, Clone)]
pub struct VisionScript {
    pub identity: Result<String, String>,
    pub scene: Result<String, String>,
    /// Answers for successive quality calls; the last one repeats.
    pub quality: Vec<Result<String, String>>,
    /// Face answers keyed by the exact bytes of the analysed image.
    pub faces: Vec<(Vec<u8>, String)>,
    /// Artificial latency per operation.
    pub delays: HashMap<&'static str, Duration>,
}

impl Default for VisionScript {
    fn default() -> Self {
        VisionScript {
            identity: Ok(GOOD_IDENTITY.to_string()),
            scene: Ok(GOOD_SCENE.to_string()),
            quality: vec![Ok(GOOD_QUALITY.to_string())],
            faces: Vec::new(),
            delays: HashMap::new(),
        }
    }
}

pub struct ScriptedVision {
    script: VisionScript,
    quality_calls: Mutex<usize>,
    requests: Mutex<Vec<VisionRequest>>,
}

impl ScriptedVision {
    pub fn new(script: VisionScript) -> Self {
        ScriptedVision {
            script,
            quality_calls: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.operation == operation)
            .count()
    }

    fn answer(&self, request: &VisionRequest) -> Result<String, String> {
        match request.operation {
            "identity_extract" => self.script.identity.clone(),
            "scene_resolve" => self.script.scene.clone(),
            "scene_quality" => {
                let index = {
                    let mut calls = self.quality_calls.lock();
                    let index = *calls;
                    *calls += 1;
                    index
                };
                self.script
                    .quality
                    .get(index)
                    .or_else(|| self.script.quality.last())
                    .cloned()
                    .unwrap_or_else(|| Ok(GOOD_QUALITY.to_string()))
            }
            "face_locate" => {
                let bytes = request
                    .images
                    .first()
                    .map(|image| image.bytes())
                    .unwrap_or_default();
                Ok(self
                    .script
                    .faces
                    .iter()
                    .find(|(key, _)| key.as_slice() == bytes)
                    .map(|(_, answer)| answer.clone())
                    .unwrap_or_else(|| NO_FACE.to_string()))
            }
            other => Err(format!("unexpected operation {other}")),
        }
    }
}

impl VisionModel for ScriptedVision {
    fn model_name(&self) -> &str {
        "scripted-vision"
    }

    async fn analyze(&self, request: VisionRequest) -> Result<String> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.script.delays.get(request.operation).copied() {
            tokio::time::sleep(delay).await;
        }
        self.answer(&request).map_err(|err| anyhow!(err))
    }
}

/// Renderer that replays a fixed list of outputs and records every request.
pub struct ScriptedRenderer {
    outputs: Mutex<VecDeque<Result<Vec<u8>, String>>>,
    requests: Mutex<Vec<ImageRequest>>,
}

impl ScriptedRenderer {
    pub fn new(outputs: Vec<Result<Vec<u8>, String>>) -> Self {
        ScriptedRenderer {
            outputs: Mutex::new(outputs.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<ImageRequest> {
        self.requests.lock().clone()
    }
}

impl ImageModel for ScriptedRenderer {
    fn model_name(&self) -> &str {
        "scripted-renderer"
    }

    async fn generate(&self, request: ImageRequest) -> Result<Vec<u8>, ImageGenerationError> {
        self.requests.lock().push(request);
        let next = self.outputs.lock().pop_front();
        match next {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(err)) => Err(ImageGenerationError(err)),
            None => Err(ImageGenerationError("no scripted output left".to_string())),
        }
    }
}

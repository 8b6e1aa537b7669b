//! Forensic identity anchors: short objective descriptions of the stable
//! features of the person in the source photo.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::IDENTITY_SYSTEM_PROMPT;
use crate::llm::json::{extract_json_object, field_text};
use crate::llm::{SourceImage, VisionModel, VisionRequest};
use crate::pipeline::types::RequestContext;
use crate::utils::text::{squash_whitespace, truncate_chars};

const MAX_FIELD_CHARS: usize = 240;

static PROTECTED_ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(age[ds]?|years?[- ]old|elderly|teen(age|ager)?s?|ethnic(ity)?|race|racial|caucasian|asian|african|hispanic|latin[ao]|nationality|religio(n|us)|named?)\b",
    )
    .expect("valid protected attribute regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAnchor {
    pub face_anchor: String,
    pub eyes_anchor: String,
    pub character_summary: String,
    pub pose_summary: String,
    pub appearance_summary: String,
    pub body_anchor: String,
    pub garment_on_person_guidance: String,
}

static DEFAULT_IDENTITY_ANCHOR: Lazy<IdentityAnchor> = Lazy::new(|| IdentityAnchor {
    face_anchor: "Keep the exact facial geometry of the person in Image 1: same face shape, nose, lips, jawline and skin texture.".to_string(),
    eyes_anchor: "Keep the exact eye shape, eye spacing, eyelids, iris colour and gaze direction from Image 1.".to_string(),
    character_summary: "The same real person as in Image 1, unchanged and fully recognisable.".to_string(),
    pose_summary: "Keep the original pose, head tilt and body orientation from Image 1.".to_string(),
    appearance_summary: "Keep the original hairstyle, hair colour and visible skin details from Image 1.".to_string(),
    body_anchor: "Keep the original body build, proportions, shoulder width and height from Image 1.".to_string(),
    garment_on_person_guidance: "Fit the garment from Image 2 naturally to the existing body with realistic folds, seams and drape.".to_string(),
});

impl IdentityAnchor {
    pub fn fallback() -> Self {
        DEFAULT_IDENTITY_ANCHOR.clone()
    }

    fn fields(&self) -> [&str; 7] {
        [
            &self.face_anchor,
            &self.eyes_anchor,
            &self.character_summary,
            &self.pose_summary,
            &self.appearance_summary,
            &self.body_anchor,
            &self.garment_on_person_guidance,
        ]
    }
}

/// Anchor plus how much of it came from the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityExtraction {
    pub anchor: IdentityAnchor,
    /// Fields that fell back to their generic default.
    pub defaulted_fields: usize,
    /// Set when the model call failed or returned no usable object.
    pub degraded: bool,
}

impl IdentityExtraction {
    pub fn fallback() -> Self {
        IdentityExtraction {
            anchor: IdentityAnchor::fallback(),
            defaulted_fields: 7,
            degraded: true,
        }
    }
}

pub fn mentions_protected_attribute(text: &str) -> bool {
    PROTECTED_ATTRIBUTE_RE.is_match(text)
}

fn clean_field(map: &Map<String, Value>, key: &str, default: &str, defaulted: &mut usize) -> String {
    let value = field_text(map, key)
        .map(|text| truncate_chars(&squash_whitespace(&text), MAX_FIELD_CHARS))
        .filter(|text| !text.is_empty());
    match value {
        Some(text) if !mentions_protected_attribute(&text) => text,
        Some(_) => {
            debug!(field = key, "Dropping identity field that mentions a protected attribute");
            *defaulted += 1;
            default.to_string()
        }
        None => {
            *defaulted += 1;
            default.to_string()
        }
    }
}

/// Builds an anchor from model text, defaulting each missing or unsafe field.
pub fn parse_identity_response(raw: &str) -> IdentityExtraction {
    let Some(map) = extract_json_object(raw) else {
        return IdentityExtraction::fallback();
    };
    let defaults = &*DEFAULT_IDENTITY_ANCHOR;
    let mut defaulted = 0usize;
    let anchor = IdentityAnchor {
        face_anchor: clean_field(&map, "face_anchor", &defaults.face_anchor, &mut defaulted),
        eyes_anchor: clean_field(&map, "eyes_anchor", &defaults.eyes_anchor, &mut defaulted),
        character_summary: clean_field(
            &map,
            "character_summary",
            &defaults.character_summary,
            &mut defaulted,
        ),
        pose_summary: clean_field(&map, "pose_summary", &defaults.pose_summary, &mut defaulted),
        appearance_summary: clean_field(
            &map,
            "appearance_summary",
            &defaults.appearance_summary,
            &mut defaulted,
        ),
        body_anchor: clean_field(&map, "body_anchor", &defaults.body_anchor, &mut defaulted),
        garment_on_person_guidance: clean_field(
            &map,
            "garment_on_person_guidance",
            &defaults.garment_on_person_guidance,
            &mut defaulted,
        ),
    };
    IdentityExtraction {
        anchor,
        defaulted_fields: defaulted,
        degraded: false,
    }
}

/// Extracts identity anchors from the person image. Never fails.
pub async fn extract_identity<V: VisionModel>(
    vision: &V,
    person: &SourceImage,
    garment_description: Option<&str>,
    ctx: &RequestContext,
) -> IdentityExtraction {
    let mut prompt = String::from(
        "Describe the stable identity features of the person in this photo for an identity-preserving outfit edit.",
    );
    if let Some(garment) = garment_description.map(str::trim).filter(|text| !text.is_empty()) {
        prompt.push_str(&format!(
            "\nThe person will be dressed in: {}. In garment_on_person_guidance, describe how that garment should sit on this body.",
            truncate_chars(garment, 300)
        ));
    }

    let request = VisionRequest::json(
        "identity_extract",
        IDENTITY_SYSTEM_PROMPT,
        prompt,
        vec![person.clone()],
    );
    match vision.analyze(request).await {
        Ok(raw) => {
            let extraction = parse_identity_response(&raw);
            debug!(
                request_id = %ctx.request_id,
                defaulted_fields = extraction.defaulted_fields,
                degraded = extraction.degraded,
                "Identity anchors extracted"
            );
            extraction
        }
        Err(err) => {
            warn!(request_id = %ctx.request_id, "Identity extraction failed: {}", err);
            IdentityExtraction::fallback()
        }
    }
}

/// Total characters across every anchor field.
pub fn anchor_chars(anchor: &IdentityAnchor) -> usize {
    anchor.fields().iter().map(|field| field.chars().count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedVision, VisionScript};

    #[test]
    fn complete_answer_keeps_every_field() {
        let raw = r#"{
            "face_anchor": "Oval face, straight nose bridge, full lower lip, soft jawline.",
            "eyes_anchor": "Almond eyes, medium spacing, slight hooded lids.",
            "character_summary": "Calm, upright posture.",
            "pose_summary": "Standing, weight on left leg, head tilted right.",
            "appearance_summary": "Shoulder-length wavy dark hair.",
            "body_anchor": "Slim build, narrow shoulders.",
            "garment_on_person_guidance": "Let the blazer hang open over the hips."
        }"#;
        let extraction = parse_identity_response(raw);
        assert!(!extraction.degraded);
        assert_eq!(extraction.defaulted_fields, 0);
        assert_eq!(extraction.anchor.body_anchor, "Slim build, narrow shoulders.");
    }

    #[test]
    fn missing_fields_use_generic_defaults() {
        let extraction = parse_identity_response(r#"{"face_anchor": "Round face."}"#);
        assert_eq!(extraction.anchor.face_anchor, "Round face.");
        assert_eq!(extraction.anchor.eyes_anchor, IdentityAnchor::fallback().eyes_anchor);
        assert_eq!(extraction.defaulted_fields, 6);
        assert!(!extraction.degraded);
    }

    #[test]
    fn protected_attributes_are_replaced() {
        let extraction = parse_identity_response(
            r#"{"character_summary": "A woman in her 30s, about 35 years old.", "face_anchor": "Hispanic features."}"#,
        );
        let defaults = IdentityAnchor::fallback();
        assert_eq!(extraction.anchor.character_summary, defaults.character_summary);
        assert_eq!(extraction.anchor.face_anchor, defaults.face_anchor);
    }

    #[test]
    fn malformed_answer_degrades_to_fallback() {
        let extraction = parse_identity_response("sorry, I can't");
        assert!(extraction.degraded);
        assert_eq!(extraction.anchor, IdentityAnchor::fallback());
    }

    #[test]
    fn long_fields_are_truncated() {
        let long = "wide ".repeat(200);
        let raw = serde_json::json!({ "body_anchor": long }).to_string();
        let extraction = parse_identity_response(&raw);
        assert!(extraction.anchor.body_anchor.chars().count() <= MAX_FIELD_CHARS);
    }

    #[tokio::test]
    async fn failing_model_never_raises() {
        let vision = ScriptedVision::new(VisionScript {
            identity: Err("network down".to_string()),
            ..VisionScript::default()
        });
        let extraction = extract_identity(
            &vision,
            &SourceImage::new(vec![1, 2, 3]),
            Some("red blazer"),
            &RequestContext::new("test"),
        )
        .await;
        assert!(extraction.degraded);
        assert_eq!(extraction.anchor, IdentityAnchor::fallback());
        assert!(anchor_chars(&extraction.anchor) > 0);
    }
}

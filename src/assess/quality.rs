use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::assess::AssessmentThresholds;
use crate::config::QUALITY_SYSTEM_PROMPT;
use crate::llm::json::{extract_json_object, field_f64, field_string_list, field_text};
use crate::llm::{SourceImage, VisionModel, VisionRequest};
use crate::pipeline::types::RequestContext;
use crate::utils::text::{squash_whitespace, truncate_chars};

/// Score used for a dimension the reviewer did not report.
const NEUTRAL_SCORE: f64 = 75.0;
const MAX_ISSUES: usize = 6;
const MAX_GUIDANCE_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub pose_naturalness: f64,
    pub lighting_coherence: f64,
    pub background_quality: f64,
    pub composition_balance: f64,
}

impl QualityScores {
    /// Every score is clamped into 0–100.
    pub fn new(pose: f64, lighting: f64, background: f64, composition: f64) -> Self {
        let clamp = |value: f64| {
            if value.is_finite() {
                value.clamp(0.0, 100.0)
            } else {
                0.0
            }
        };
        QualityScores {
            pose_naturalness: clamp(pose),
            lighting_coherence: clamp(lighting),
            background_quality: clamp(background),
            composition_balance: clamp(composition),
        }
    }

    pub fn uniform(value: f64) -> Self {
        QualityScores::new(value, value, value, value)
    }

    fn named(&self) -> [(&'static str, f64); 4] {
        [
            ("pose naturalness", self.pose_naturalness),
            ("lighting coherence", self.lighting_coherence),
            ("background quality", self.background_quality),
            ("composition balance", self.composition_balance),
        ]
    }

    pub fn min(&self) -> f64 {
        self.named()
            .iter()
            .map(|(_, score)| *score)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn average(&self) -> f64 {
        self.named().iter().map(|(_, score)| *score).sum::<f64>() / 4.0
    }

    /// Lowest-scoring dimension; ties resolve to the first in declaration order.
    pub fn weakest(&self) -> (&'static str, f64) {
        let mut weakest = self.named()[0];
        for entry in self.named().into_iter().skip(1) {
            if entry.1 < weakest.1 {
                weakest = entry;
            }
        }
        weakest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityReason {
    Acceptable,
    /// A single dimension fell under the floor.
    ScoreFloor,
    /// Low average corroborated by several major issues.
    SystemicQuality,
    /// The reviewer could not be reached or answered unusably.
    Unavailable,
}

impl QualityReason {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityReason::Acceptable => "acceptable",
            QualityReason::ScoreFloor => "score_floor",
            QualityReason::SystemicQuality => "systemic_quality",
            QualityReason::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneQualityAssessment {
    pub should_retry: bool,
    pub reason: QualityReason,
    pub correction_guidance: Option<String>,
    pub scores: QualityScores,
    pub major_issues: Vec<String>,
}

static QUALITY_FALLBACK: Lazy<SceneQualityAssessment> = Lazy::new(|| SceneQualityAssessment {
    should_retry: false,
    reason: QualityReason::Unavailable,
    correction_guidance: None,
    scores: QualityScores::uniform(NEUTRAL_SCORE),
    major_issues: Vec::new(),
});

impl SceneQualityAssessment {
    /// Used when the reviewer times out or fails; never asks for a retry.
    pub fn fallback() -> Self {
        QUALITY_FALLBACK.clone()
    }
}

fn synthesize_guidance(scores: &QualityScores, issues: &[String]) -> String {
    let (weakest, _) = scores.weakest();
    if issues.is_empty() {
        return format!(
            "Improve {weakest} while keeping the person, face, pose and garment exactly as they are."
        );
    }
    format!(
        "Fix these problems: {}. Pay particular attention to {weakest}.",
        issues.join("; ")
    )
}

/// Applies the two-threshold retry rule to reviewer scores.
pub fn evaluate_quality(
    scores: QualityScores,
    major_issues: Vec<String>,
    model_guidance: Option<String>,
    thresholds: &AssessmentThresholds,
) -> SceneQualityAssessment {
    let reason = if scores.min() < thresholds.min_dimension_score {
        QualityReason::ScoreFloor
    } else if scores.average() < thresholds.min_average_score
        && major_issues.len() >= thresholds.min_major_issues
    {
        QualityReason::SystemicQuality
    } else {
        QualityReason::Acceptable
    };
    let should_retry = reason != QualityReason::Acceptable;

    let correction_guidance = if should_retry {
        let guidance = model_guidance
            .map(|text| squash_whitespace(&text))
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| synthesize_guidance(&scores, &major_issues));
        Some(truncate_chars(&guidance, MAX_GUIDANCE_CHARS))
    } else {
        None
    };

    SceneQualityAssessment {
        should_retry,
        reason,
        correction_guidance,
        scores,
        major_issues,
    }
}

/// Parses a reviewer answer. Missing scores default to neutral; `None` when
/// no JSON object can be found at all.
pub fn parse_quality_response(
    raw: &str,
    thresholds: &AssessmentThresholds,
) -> Option<SceneQualityAssessment> {
    let map = extract_json_object(raw)?;
    let score = |key: &str| field_f64(&map, key).unwrap_or(NEUTRAL_SCORE);
    let scores = QualityScores::new(
        score("pose_naturalness"),
        score("lighting_coherence"),
        score("background_quality"),
        score("composition_balance"),
    );
    let major_issues = field_string_list(&map, "major_issues")
        .into_iter()
        .take(MAX_ISSUES)
        .map(|issue| truncate_chars(&squash_whitespace(&issue), 120))
        .collect();
    let guidance = field_text(&map, "correction_guidance");
    Some(evaluate_quality(scores, major_issues, guidance, thresholds))
}

/// Scores a candidate image. Errors and unusable answers degrade to
/// [`SceneQualityAssessment::fallback`].
pub async fn assess_scene_quality<V: VisionModel>(
    vision: &V,
    candidate: &SourceImage,
    scene_summary: &str,
    ctx: &RequestContext,
    thresholds: &AssessmentThresholds,
) -> SceneQualityAssessment {
    let prompt = format!(
        "Review this generated outfit photo. Intended scene: {}.\nScore pose naturalness, lighting coherence between person and background, background quality and composition balance.",
        scene_summary
    );
    let request = VisionRequest::json(
        "scene_quality",
        QUALITY_SYSTEM_PROMPT,
        prompt,
        vec![candidate.clone()],
    );

    let raw = match vision.analyze(request).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(request_id = %ctx.request_id, "Scene quality call failed: {}", err);
            return SceneQualityAssessment::fallback();
        }
    };

    match parse_quality_response(&raw, thresholds) {
        Some(assessment) => {
            debug!(
                request_id = %ctx.request_id,
                reason = assessment.reason.as_str(),
                min = assessment.scores.min(),
                average = assessment.scores.average(),
                issues = assessment.major_issues.len(),
                "Scene quality assessed"
            );
            assessment
        }
        None => {
            warn!(request_id = %ctx.request_id, "Scene quality answer was not JSON; using fallback");
            SceneQualityAssessment::fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issues(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("issue {index}")).collect()
    }

    #[test]
    fn high_scores_are_accepted() {
        let assessment = evaluate_quality(
            QualityScores::uniform(90.0),
            Vec::new(),
            None,
            &AssessmentThresholds::default(),
        );
        assert!(!assessment.should_retry);
        assert_eq!(assessment.reason, QualityReason::Acceptable);
        assert!(assessment.correction_guidance.is_none());
    }

    #[test]
    fn single_dimension_floor_breach_retries() {
        let scores = QualityScores::new(40.0, 90.0, 90.0, 90.0);
        let assessment =
            evaluate_quality(scores, Vec::new(), None, &AssessmentThresholds::default());
        assert!(assessment.should_retry);
        assert_eq!(assessment.reason, QualityReason::ScoreFloor);
        assert!(assessment
            .correction_guidance
            .unwrap()
            .contains("pose naturalness"));
    }

    #[test]
    fn low_average_needs_corroborating_issues() {
        let thresholds = AssessmentThresholds::default();
        let with_issues =
            evaluate_quality(QualityScores::uniform(60.0), issues(2), None, &thresholds);
        assert!(with_issues.should_retry);
        assert_eq!(with_issues.reason, QualityReason::SystemicQuality);

        let without_issues =
            evaluate_quality(QualityScores::uniform(60.0), Vec::new(), None, &thresholds);
        assert!(!without_issues.should_retry);

        let one_issue = evaluate_quality(QualityScores::uniform(60.0), issues(1), None, &thresholds);
        assert!(!one_issue.should_retry);
    }

    #[test]
    fn scores_are_clamped() {
        let scores = QualityScores::new(-5.0, 140.0, f64::NAN, 50.0);
        assert_eq!(scores.pose_naturalness, 0.0);
        assert_eq!(scores.lighting_coherence, 100.0);
        assert_eq!(scores.background_quality, 0.0);
    }

    #[test]
    fn model_guidance_is_preferred_when_retrying() {
        let assessment = evaluate_quality(
            QualityScores::new(90.0, 30.0, 90.0, 90.0),
            Vec::new(),
            Some("  Match the  warm light\n on the face. ".to_string()),
            &AssessmentThresholds::default(),
        );
        assert_eq!(
            assessment.correction_guidance.as_deref(),
            Some("Match the warm light on the face.")
        );
    }

    #[test]
    fn parses_reviewer_json_with_string_scores() {
        let raw = r#"{"pose_naturalness": "62", "lighting_coherence": 58, "background_quality": 61, "composition_balance": 64,
            "major_issues": ["floating shadow", "warped railing"], "correction_guidance": ""}"#;
        let assessment = parse_quality_response(raw, &AssessmentThresholds::default()).unwrap();
        assert_eq!(assessment.scores.pose_naturalness, 62.0);
        assert!(assessment.should_retry);
        assert_eq!(assessment.reason, QualityReason::SystemicQuality);
        let guidance = assessment.correction_guidance.unwrap();
        assert!(guidance.contains("floating shadow; warped railing"));
    }

    #[test]
    fn missing_scores_default_to_neutral() {
        let assessment =
            parse_quality_response(r#"{"major_issues": []}"#, &AssessmentThresholds::default())
                .unwrap();
        assert_eq!(assessment.scores, QualityScores::uniform(75.0));
        assert!(!assessment.should_retry);
        assert!(parse_quality_response("not json", &AssessmentThresholds::default()).is_none());
    }

    #[test]
    fn fallback_never_retries() {
        let fallback = SceneQualityAssessment::fallback();
        assert!(!fallback.should_retry);
        assert_eq!(fallback.reason, QualityReason::Unavailable);
    }
}

pub mod drift;
pub mod quality;

use serde::{Deserialize, Serialize};

pub use drift::{assess_drift, DriftAssessment, DriftMetrics, DriftReason};
pub use quality::{
    assess_scene_quality, evaluate_quality, QualityReason, QualityScores,
    SceneQualityAssessment,
};

/// Tolerances for accepting a candidate image. Calibration is product
/// specific, so every value can be overridden through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssessmentThresholds {
    /// Minimum IoU between input and output face boxes.
    pub min_iou: f64,
    /// Maximum distance between box centers, in 0–1000 space.
    pub max_center_distance: f64,
    /// Maximum relative width/height change.
    pub max_size_delta: f64,
    /// Any single quality score below this triggers a retry.
    pub min_dimension_score: f64,
    /// Average quality below this triggers a retry when corroborated by issues.
    pub min_average_score: f64,
    pub min_major_issues: usize,
}

impl Default for AssessmentThresholds {
    fn default() -> Self {
        AssessmentThresholds {
            min_iou: 0.45,
            max_center_distance: 90.0,
            max_size_delta: 0.22,
            min_dimension_score: 55.0,
            min_average_score: 65.0,
            min_major_issues: 2,
        }
    }
}

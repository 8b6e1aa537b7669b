use serde::{Deserialize, Serialize};

use crate::assess::AssessmentThresholds;
use crate::face::NormalizedBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftReason {
    /// No face in the input; nothing to compare against.
    PersonFaceMissing,
    /// No face found in the candidate. Detector noise is not evidence of drift.
    OutputFaceMissing,
    GeometryDrift,
    WithinTolerance,
}

impl DriftReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DriftReason::PersonFaceMissing => "person_face_missing",
            DriftReason::OutputFaceMissing => "output_face_missing",
            DriftReason::GeometryDrift => "geometry_drift",
            DriftReason::WithinTolerance => "within_tolerance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftMetrics {
    pub iou: f64,
    pub center_distance: f64,
    pub size_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAssessment {
    pub should_retry: bool,
    pub reason: DriftReason,
    pub metrics: Option<DriftMetrics>,
}

impl DriftAssessment {
    /// Correction text for a retry prompt, present only for geometry drift.
    pub fn guidance(&self, input_face: Option<&NormalizedBox>) -> Option<String> {
        if self.reason != DriftReason::GeometryDrift {
            return None;
        }
        let mut text = String::from(
            "The previous attempt moved or resized the face. Keep the head at exactly the same position, scale and angle as in Image 1",
        );
        if let Some(face) = input_face {
            text.push_str(&format!(
                " (face region y {}-{}, x {}-{} of 1000)",
                face.ymin(),
                face.ymax(),
                face.xmin(),
                face.xmax()
            ));
        }
        text.push_str("; do not reframe, zoom or re-pose the person.");
        Some(text)
    }
}

pub fn compute_metrics(input: &NormalizedBox, output: &NormalizedBox) -> DriftMetrics {
    DriftMetrics {
        iou: input.iou(output),
        center_distance: input.center_distance(output),
        size_delta: input.size_delta(output),
    }
}

/// Compares the face box of the input with that of the candidate.
pub fn assess_drift(
    input: Option<&NormalizedBox>,
    output: Option<&NormalizedBox>,
    thresholds: &AssessmentThresholds,
) -> DriftAssessment {
    let Some(input) = input else {
        return DriftAssessment {
            should_retry: false,
            reason: DriftReason::PersonFaceMissing,
            metrics: None,
        };
    };
    let Some(output) = output else {
        return DriftAssessment {
            should_retry: false,
            reason: DriftReason::OutputFaceMissing,
            metrics: None,
        };
    };

    let metrics = compute_metrics(input, output);
    let drifted = metrics.iou < thresholds.min_iou
        || metrics.center_distance > thresholds.max_center_distance
        || metrics.size_delta > thresholds.max_size_delta;

    DriftAssessment {
        should_retry: drifted,
        reason: if drifted {
            DriftReason::GeometryDrift
        } else {
            DriftReason::WithinTolerance
        },
        metrics: Some(metrics),
    }
}

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::FACE_LOCATOR_SYSTEM_PROMPT;
use crate::face::geometry::{NormalizedBox, NORMALIZED_SCALE};
use crate::llm::json::{extract_json_object, field_f64, value_as_f64};
use crate::llm::{SourceImage, VisionModel, VisionRequest};
use crate::pipeline::types::RequestContext;
use crate::utils::text::truncate_for_log;

/// Fraction of the image height assumed for a face when the bottom edge was lost.
pub const SYNTHETIC_FACE_HEIGHT_FRACTION: f64 = 0.22;
/// Fraction of the image width assumed for a face when the right edge was lost.
pub const SYNTHETIC_FACE_WIDTH_FRACTION: f64 = 0.18;

static FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(ymin|xmin|ymax|xmax|top|left|bottom|right|image_width|image_height|width|height|confidence)"?\s*[:=]\s*"?(-?\d+(?:\.\d+)?)"#,
    )
    .expect("valid face field regex")
});
static BOX_2D_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)box_2d"?\s*[:=]\s*\[\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)"#,
    )
    .expect("valid box_2d regex")
});

/// How a face box was obtained from model output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseResult {
    /// Well-formed JSON carrying a complete box.
    Strict(NormalizedBox),
    /// Box rebuilt from loose or truncated output.
    Recovered(NormalizedBox),
    Absent,
}

impl ParseResult {
    pub fn face(&self) -> Option<NormalizedBox> {
        match self {
            ParseResult::Strict(bbox) | ParseResult::Recovered(bbox) => Some(*bbox),
            ParseResult::Absent => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ParseResult::Strict(_) => "strict",
            ParseResult::Recovered(_) => "recovered",
            ParseResult::Absent => "absent",
        }
    }
}

/// Intermediate verdict of a single parse strategy.
enum Detection {
    Face(NormalizedBox),
    /// The model explicitly reported no face (or a box with no area).
    NoFace,
}

/// Field values pulled out of model text, keyed by lowercase name.
struct Fields {
    values: HashMap<String, f64>,
}

impl Fields {
    fn from_json(map: &Map<String, Value>) -> Self {
        let mut values = HashMap::new();
        for (key, value) in map {
            if let Some(number) = value_as_f64(value) {
                values.insert(key.to_ascii_lowercase(), number);
            }
        }
        if let Some(Value::Array(items)) = map.get("box_2d") {
            insert_box_2d(&mut values, items.iter().filter_map(value_as_f64).collect());
        }
        Fields { values }
    }

    fn from_text(raw: &str) -> Self {
        let mut values = HashMap::new();
        for captures in FIELD_RE.captures_iter(raw) {
            let key = captures[1].to_ascii_lowercase();
            if let Ok(number) = captures[2].parse::<f64>() {
                values.entry(key).or_insert(number);
            }
        }
        if let Some(captures) = BOX_2D_RE.captures(raw) {
            let numbers = (1..=4)
                .filter_map(|index| captures[index].parse::<f64>().ok())
                .collect();
            insert_box_2d(&mut values, numbers);
        }
        Fields { values }
    }

    fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied().filter(|value| value.is_finite())
    }

    fn confidence(&self) -> f64 {
        self.get("confidence").unwrap_or(1.0)
    }

    fn dimensions(&self, fallback: Option<(u32, u32)>) -> Option<(u32, u32)> {
        let width = self.get("image_width").or_else(|| self.get("width"));
        let height = self.get("image_height").or_else(|| self.get("height"));
        match (width, height) {
            (Some(width), Some(height)) if width >= 1.0 && height >= 1.0 => {
                Some((width as u32, height as u32))
            }
            _ => fallback,
        }
    }

    fn is_explicit_no_face(&self) -> bool {
        let keys = ["ymin", "xmin", "ymax", "xmax"];
        keys.iter().all(|key| self.get(key) == Some(0.0)) && self.confidence() == 0.0
    }
}

fn insert_box_2d(values: &mut HashMap<String, f64>, numbers: Vec<f64>) {
    if numbers.len() != 4 {
        return;
    }
    for (key, number) in ["ymin", "xmin", "ymax", "xmax"].iter().zip(numbers) {
        values.entry((*key).to_string()).or_insert(number);
    }
}

fn complete_normalized(fields: &Fields) -> Option<Detection> {
    let ymin = fields.get("ymin")?;
    let xmin = fields.get("xmin")?;
    let ymax = fields.get("ymax")?;
    let xmax = fields.get("xmax")?;
    if fields.is_explicit_no_face() {
        return Some(Detection::NoFace);
    }
    Some(
        NormalizedBox::new(ymin, xmin, ymax, xmax, fields.confidence())
            .map(Detection::Face)
            .unwrap_or(Detection::NoFace),
    )
}

fn complete_pixels(fields: &Fields, dims: Option<(u32, u32)>) -> Option<Detection> {
    let top = fields.get("top")?;
    let left = fields.get("left")?;
    let bottom = fields.get("bottom")?;
    let right = fields.get("right")?;
    let (width, height) = fields.dimensions(dims)?;
    Some(
        NormalizedBox::from_pixels(top, left, bottom, right, width, height, fields.confidence())
            .map(Detection::Face)
            .unwrap_or(Detection::NoFace),
    )
}

/// Fills a lost bottom/right edge with fixed fractional defaults.
fn synthesize_partial(fields: &Fields, dims: Option<(u32, u32)>) -> Option<NormalizedBox> {
    if let (Some(ymin), Some(xmin)) = (fields.get("ymin"), fields.get("xmin")) {
        let scale = NORMALIZED_SCALE as f64;
        let ymax = fields
            .get("ymax")
            .unwrap_or(ymin + SYNTHETIC_FACE_HEIGHT_FRACTION * scale);
        let xmax = fields
            .get("xmax")
            .unwrap_or(xmin + SYNTHETIC_FACE_WIDTH_FRACTION * scale);
        return NormalizedBox::new(ymin, xmin, ymax, xmax, fields.confidence());
    }

    let top = fields.get("top")?;
    let left = fields.get("left")?;
    let (width, height) = fields.dimensions(dims)?;
    let bottom = fields
        .get("bottom")
        .unwrap_or(top + SYNTHETIC_FACE_HEIGHT_FRACTION * height as f64);
    let right = fields
        .get("right")
        .unwrap_or(left + SYNTHETIC_FACE_WIDTH_FRACTION * width as f64);
    NormalizedBox::from_pixels(top, left, bottom, right, width, height, fields.confidence())
}

/// Strategy 1: strict JSON parse of the largest brace-delimited span.
fn parse_strict(raw: &str, dims: Option<(u32, u32)>) -> Option<Detection> {
    let map = extract_json_object(raw)?;
    let fields = Fields::from_json(&map);
    complete_normalized(&fields).or_else(|| complete_pixels(&fields, dims))
}

/// Strategy 2: pull individual numeric fields out of loose or truncated text.
fn parse_recovered(raw: &str, dims: Option<(u32, u32)>) -> Option<Detection> {
    let fields = Fields::from_text(raw);
    if let Some(detection) = complete_normalized(&fields) {
        return Some(detection);
    }
    if let Some(detection) = complete_pixels(&fields, dims) {
        return Some(detection);
    }
    synthesize_partial(&fields, dims).map(Detection::Face)
}

/// Parses a face box out of raw model text, trying each strategy in order.
///
/// `dims` are the pixel dimensions of the analysed image, used for
/// pixel-space answers that omit them.
pub fn parse_face_box(raw: &str, dims: Option<(u32, u32)>) -> ParseResult {
    if let Some(detection) = parse_strict(raw, dims) {
        return match detection {
            Detection::Face(bbox) => ParseResult::Strict(bbox),
            Detection::NoFace => ParseResult::Absent,
        };
    }
    match parse_recovered(raw, dims) {
        Some(Detection::Face(bbox)) => ParseResult::Recovered(bbox),
        Some(Detection::NoFace) | None => ParseResult::Absent,
    }
}

fn build_locator_prompt(dims: Option<(u32, u32)>) -> String {
    let mut prompt = String::from(
        "Locate the single most prominent human face in this image and return its bounding box as JSON in 0-1000 normalized coordinates.",
    );
    if let Some((width, height)) = dims {
        prompt.push_str(&format!(
            "\nThe image is {width}x{height} pixels. Do not answer in pixels."
        ));
    }
    prompt
}

/// Asks the vision model for the face box of `image`. Never fails: call
/// errors and unusable output both yield [`ParseResult::Absent`].
pub async fn locate_face<V: VisionModel>(
    vision: &V,
    image: &SourceImage,
    ctx: &RequestContext,
    role: &'static str,
) -> ParseResult {
    let dims = image.dimensions();
    let request = VisionRequest::json(
        "face_locate",
        FACE_LOCATOR_SYSTEM_PROMPT,
        build_locator_prompt(dims),
        vec![image.clone()],
    );

    let raw = match vision.analyze(request).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(request_id = %ctx.request_id, role = role, "Face locator call failed: {}", err);
            return ParseResult::Absent;
        }
    };

    let result = parse_face_box(&raw, dims);
    if matches!(result, ParseResult::Recovered(_)) {
        debug!(
            request_id = %ctx.request_id,
            role = role,
            raw = %truncate_for_log(&raw, 300),
            "Face box recovered from non-conformant output"
        );
    }
    debug!(request_id = %ctx.request_id, role = role, parse = result.label(), face = ?result.face());
    result
}

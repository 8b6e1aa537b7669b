use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::identity::IdentityAnchor;
use crate::prompt::sanitize::PhraseSanitizer;
use crate::render::AspectRatio;
use crate::scene::SceneConfig;
use crate::utils::text::{squash_whitespace, truncate_words};

pub const MIN_CREATIVE_DEVIATION: f32 = 0.1;
pub const MAX_CREATIVE_DEVIATION: f32 = 0.5;
const MAX_FIELD_CHARS: usize = 400;
const MAX_AVOID_ITEMS: usize = 8;
const MIN_GUIDANCE_CHARS: usize = 80;
const MAX_GUIDANCE_CHARS: usize = 600;
const FIT_ATTEMPTS: usize = 6;
const RETRY_HEADER: &str = "RETRY CORRECTIONS: The previous attempt was rejected. Apply these corrections while every rule below still holds:";

/// Keeps presets from asking for unconstrained departure from the source.
pub fn clamp_creative_deviation(value: f32) -> f32 {
    if !value.is_finite() {
        return MIN_CREATIVE_DEVIATION;
    }
    value.clamp(MIN_CREATIVE_DEVIATION, MAX_CREATIVE_DEVIATION)
}

#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub scene: &'a SceneConfig,
    pub identity: &'a IdentityAnchor,
    pub garment_description: Option<&'a str>,
    /// Only read when `retry_mode` is set.
    pub correction_guidance: Option<&'a str>,
    pub aspect_ratio: AspectRatio,
    pub retry_mode: bool,
}

/// The bounded prompt sent to the renderer, plus what happened while building it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPrompt {
    pub text: String,
    pub retry_mode: bool,
    pub creative_deviation: f32,
    pub rewrites: usize,
    pub dropped_fragments: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct PromptCompositor {
    sanitizer: PhraseSanitizer,
    max_chars: usize,
}

struct Cleaner<'s> {
    sanitizer: &'s PhraseSanitizer,
    rewrites: usize,
    dropped: usize,
}

impl Cleaner<'_> {
    fn clean(&mut self, fragment: &str, max_chars: usize) -> String {
        let squashed = squash_whitespace(fragment);
        if squashed.is_empty() {
            return squashed;
        }
        let sanitized = self.sanitizer.sanitize(&squashed);
        self.rewrites += sanitized.rewrites;
        self.dropped += sanitized.dropped_sentences;
        truncate_words(&sanitized.text, max_chars)
    }
}

/// Sanitized free text that goes into the prompt body. Only these strings
/// shrink when the body exceeds its budget; the directive text around them
/// is fixed.
#[derive(Debug, Clone, PartialEq)]
struct Fragments {
    /// Face, eyes, character, pose, appearance, body.
    identity: [String; 6],
    garment_description: String,
    garment_guidance: String,
    anchor_zone: String,
    realism: String,
    avoid: Vec<String>,
    lighting: String,
}

impl Fragments {
    fn collect(inputs: &PromptInputs<'_>, cleaner: &mut Cleaner) -> Self {
        let anchor = inputs.identity;
        let scene = inputs.scene;
        Fragments {
            identity: [
                &anchor.face_anchor,
                &anchor.eyes_anchor,
                &anchor.character_summary,
                &anchor.pose_summary,
                &anchor.appearance_summary,
                &anchor.body_anchor,
            ]
            .map(|value| cleaner.clean(value, MAX_FIELD_CHARS)),
            garment_description: inputs
                .garment_description
                .map(|text| cleaner.clean(text, MAX_FIELD_CHARS))
                .unwrap_or_default(),
            garment_guidance: cleaner.clean(&anchor.garment_on_person_guidance, MAX_FIELD_CHARS),
            anchor_zone: cleaner.clean(&scene.anchor_zone_description, MAX_FIELD_CHARS),
            realism: cleaner.clean(&scene.realism_guidance, MAX_FIELD_CHARS),
            avoid: scene
                .preset_avoid_list
                .iter()
                .take(MAX_AVOID_ITEMS)
                .map(|item| {
                    cleaner
                        .clean(item, MAX_FIELD_CHARS)
                        .trim_end_matches('.')
                        .to_string()
                })
                .filter(|item| !item.is_empty())
                .collect(),
            lighting: cleaner.clean(&scene.lighting_blueprint, MAX_FIELD_CHARS),
        }
    }

    fn slots_mut(&mut self) -> Vec<&mut String> {
        let mut slots: Vec<&mut String> = self.identity.iter_mut().collect();
        slots.push(&mut self.garment_description);
        slots.push(&mut self.garment_guidance);
        slots.push(&mut self.anchor_zone);
        slots.push(&mut self.realism);
        slots.extend(self.avoid.iter_mut());
        slots.push(&mut self.lighting);
        slots
    }
}

fn push_sentence(out: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !out.is_empty() && !out.ends_with(' ') && !out.ends_with('\n') {
        out.push(' ');
    }
    out.push_str(text);
    if !text.ends_with(['.', '!', '?']) {
        out.push('.');
    }
}

fn identity_section(fragments: &Fragments) -> String {
    let mut section = String::from(
        "IDENTITY LOCK: Image 1 shows the real person. Keep the face, eyes, head position, pose and body exactly as in Image 1 (face policy: immutable; pose policy: inherit). Do not beautify or stylize the person.",
    );
    let labels = ["Face", "Eyes", "Character", "Pose", "Appearance", "Body"];
    for (label, value) in labels.iter().zip(&fragments.identity) {
        if !value.is_empty() {
            section.push_str(&format!("\n- {label}: {value}"));
        }
    }
    section
}

fn garment_section(fragments: &Fragments) -> String {
    let mut section = String::from("GARMENT:");
    push_sentence(
        &mut section,
        "Dress the person from Image 1 in the garment shown in Image 2, matching its colour, material, pattern and cut",
    );
    push_sentence(&mut section, &fragments.garment_description);
    push_sentence(&mut section, &fragments.garment_guidance);
    section
}

fn scene_section(fragments: &Fragments) -> String {
    let mut section = String::from("SCENE:");
    push_sentence(&mut section, &fragments.anchor_zone);
    if !fragments.realism.is_empty() {
        push_sentence(&mut section, &format!("Realism: {}", fragments.realism));
    }
    let avoid = fragments
        .avoid
        .iter()
        .filter(|item| !item.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>();
    if !avoid.is_empty() {
        push_sentence(&mut section, &format!("Avoid: {}", avoid.join(", ")));
    }
    section
}

fn camera_section(fragments: &Fragments, scene: &SceneConfig, deviation: f32) -> String {
    let mut section = String::from("CAMERA & LIGHTING:");
    push_sentence(
        &mut section,
        "Keep the original camera angle, framing, distance and focal length from Image 1 (camera policy: inherit)",
    );
    push_sentence(
        &mut section,
        &format!("Lighting mode: {}", scene.lighting_mode.as_str()),
    );
    push_sentence(&mut section, &fragments.lighting);
    push_sentence(
        &mut section,
        &format!(
            "Creative deviation: {:.2} on a 0-1 scale; stay close to the source photo",
            deviation
        ),
    );
    section
}

fn assemble_body(fragments: &Fragments, scene: &SceneConfig, deviation: f32) -> String {
    [
        identity_section(fragments),
        garment_section(fragments),
        scene_section(fragments),
        camera_section(fragments, scene, deviation),
    ]
    .join("\n\n")
}

/// Shrinks every fragment by the same ratio until the body fits `budget`.
/// Returns whether anything was cut.
fn fit_fragments(
    fragments: &mut Fragments,
    scene: &SceneConfig,
    deviation: f32,
    budget: usize,
) -> bool {
    let mut length = assemble_body(fragments, scene, deviation).chars().count();
    if length <= budget {
        return false;
    }
    let originals = fragments
        .slots_mut()
        .into_iter()
        .map(|slot| slot.clone())
        .collect::<Vec<_>>();
    let total = originals
        .iter()
        .map(|text| text.chars().count())
        .sum::<usize>()
        .max(1);
    let mut allowance = total.saturating_sub(length - budget);
    for _ in 0..FIT_ATTEMPTS {
        for (slot, original) in fragments.slots_mut().into_iter().zip(&originals) {
            let share = original.chars().count() * allowance / total;
            *slot = truncate_words(original, share);
        }
        length = assemble_body(fragments, scene, deviation).chars().count();
        if length <= budget || allowance == 0 {
            break;
        }
        allowance = allowance.saturating_sub(length - budget);
    }
    true
}

fn output_section(aspect_ratio: AspectRatio) -> String {
    format!(
        "OUTPUT: One photorealistic image with aspect ratio {}. No text, no watermark, no borders.",
        aspect_ratio.as_str()
    )
}

impl PromptCompositor {
    pub fn new(sanitizer: PhraseSanitizer, max_chars: usize) -> Self {
        PromptCompositor {
            sanitizer,
            max_chars,
        }
    }

    pub fn sanitizer(&self) -> &PhraseSanitizer {
        &self.sanitizer
    }

    fn guidance_cap(&self) -> usize {
        (self.max_chars / 6).clamp(MIN_GUIDANCE_CHARS, MAX_GUIDANCE_CHARS)
    }

    /// Characters held back for the retry section in both modes, so the body
    /// of a first prompt and of its retry are byte-identical.
    fn retry_reserve(&self) -> usize {
        RETRY_HEADER.chars().count() + self.guidance_cap() + 4
    }

    /// Assembles the prompt. Identical inputs always yield identical text,
    /// and a retry prompt contains its first prompt verbatim.
    pub fn compose(&self, inputs: &PromptInputs<'_>) -> GenerationPrompt {
        let mut cleaner = Cleaner {
            sanitizer: &self.sanitizer,
            rewrites: 0,
            dropped: 0,
        };
        let deviation = clamp_creative_deviation(inputs.scene.creative_deviation);
        let output = output_section(inputs.aspect_ratio);
        let body_budget = self
            .max_chars
            .saturating_sub(output.chars().count() + 2 + self.retry_reserve());

        let mut fragments = Fragments::collect(inputs, &mut cleaner);
        let mut truncated = fit_fragments(&mut fragments, inputs.scene, deviation, body_budget);
        let (mut body, mut removed) = self
            .sanitizer
            .verify(&assemble_body(&fragments, inputs.scene, deviation));
        if body.chars().count() > body_budget {
            warn!(
                budget = body_budget,
                "Fixed prompt directives exceed the budget; cutting the body"
            );
            body = truncate_words(&body, body_budget);
            truncated = true;
        }

        let mut sections = Vec::with_capacity(3);
        if inputs.retry_mode {
            let guidance = inputs
                .correction_guidance
                .map(|text| cleaner.clean(text, self.guidance_cap()))
                .filter(|text| !text.is_empty());
            let mut section = String::from(RETRY_HEADER);
            match guidance {
                Some(text) => push_sentence(&mut section, &text),
                None => push_sentence(&mut section, "Follow the identity and scene rules more strictly"),
            }
            let (section, retry_removed) = self.sanitizer.verify(&section);
            removed += retry_removed;
            if !section.is_empty() {
                sections.push(section);
            }
        }
        sections.push(body);
        sections.push(output);
        let text = sections.join("\n\n");
        if removed > 0 {
            warn!(removed, "Removed prompt lines that still carried forbidden phrases");
        }

        debug!(
            chars = text.chars().count(),
            retry_mode = inputs.retry_mode,
            rewrites = cleaner.rewrites,
            dropped = cleaner.dropped + removed,
            truncated,
            "Prompt composed"
        );

        GenerationPrompt {
            text,
            retry_mode: inputs.retry_mode,
            creative_deviation: deviation,
            rewrites: cleaner.rewrites,
            dropped_fragments: cleaner.dropped + removed,
            truncated,
        }
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::SCENE_SYSTEM_PROMPT;
use crate::llm::json::{extract_json_object, field_string_list, field_text};
use crate::llm::{SourceImage, VisionModel, VisionRequest};
use crate::pipeline::types::RequestContext;
use crate::prompt::sanitize::PhraseSanitizer;
use crate::scene::presets::{Preset, PresetCatalog};
use crate::scene::{LightingMode, SceneConfig, FALLBACK_PRESET_ID};
use crate::utils::text::{squash_whitespace, truncate_chars};

const SHORTLIST_LIMIT: usize = 4;
const MAX_TEXT_CHARS: usize = 300;
const MAX_AVOID_ITEMS: usize = 8;

/// Caller-supplied hints for the scene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneInput {
    pub user_request: Option<String>,
    pub preset_id: Option<String>,
    pub preset_description: Option<String>,
    pub lighting_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneSource {
    /// Resolved by the vision model, possibly on top of a preset.
    Model,
    /// Model unavailable; built from the requested preset alone.
    Preset,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneResolution {
    pub config: SceneConfig,
    pub source: SceneSource,
    /// Preset rejected because its text was unsafe.
    pub discarded_preset: Option<String>,
}

impl SceneResolution {
    pub fn fallback() -> Self {
        SceneResolution {
            config: SceneConfig::fallback(),
            source: SceneSource::Fallback,
            discarded_preset: None,
        }
    }
}

#[derive(Debug, Default)]
struct SceneDraft {
    preset_id: Option<String>,
    anchor_zone_description: Option<String>,
    lighting_mode: Option<LightingMode>,
    realism_guidance: Option<String>,
    lighting_blueprint: Option<String>,
    avoid: Vec<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

fn clean_text(map: &Map<String, Value>, key: &str) -> Option<String> {
    field_text(map, key)
        .map(|text| truncate_chars(&squash_whitespace(&text), MAX_TEXT_CHARS))
        .filter(|text| !text.is_empty())
}

fn parse_scene_response(raw: &str) -> Option<SceneDraft> {
    let map = extract_json_object(raw)?;
    Some(SceneDraft {
        preset_id: clean_text(&map, "preset_id").filter(|id| id != "null"),
        anchor_zone_description: clean_text(&map, "anchor_zone_description"),
        lighting_mode: field_text(&map, "lighting_mode").and_then(|mode| LightingMode::parse(&mode)),
        realism_guidance: clean_text(&map, "realism_guidance"),
        lighting_blueprint: clean_text(&map, "lighting_blueprint"),
        avoid: field_string_list(&map, "avoid")
            .into_iter()
            .map(|item| truncate_chars(&squash_whitespace(&item), 80))
            .filter(|item| !item.is_empty())
            .take(MAX_AVOID_ITEMS)
            .collect(),
    })
}

fn preset_is_safe(preset: &Preset, sanitizer: &PhraseSanitizer) -> bool {
    !sanitizer.is_blocked(&preset.background) && !sanitizer.is_blocked(&preset.lighting)
}

/// Looks up `id` and rejects presets with unsafe text.
fn accept_preset<'a>(
    id: &str,
    catalog: &'a PresetCatalog,
    sanitizer: &PhraseSanitizer,
    discarded: &mut Option<String>,
    ctx: &RequestContext,
) -> Option<&'a Preset> {
    let Some(preset) = catalog.get(id) else {
        warn!(request_id = %ctx.request_id, preset_id = id, "Unknown preset id; ignoring");
        return None;
    };
    if preset_is_safe(preset, sanitizer) {
        return Some(preset);
    }
    warn!(
        request_id = %ctx.request_id,
        preset_id = %preset.id,
        "Preset content is unsafe; discarding it for the neutral default"
    );
    *discarded = Some(preset.id.clone());
    None
}

fn neutral_base(catalog: &PresetCatalog, sanitizer: &PhraseSanitizer) -> SceneConfig {
    catalog
        .get(FALLBACK_PRESET_ID)
        .filter(|preset| preset_is_safe(preset, sanitizer))
        .map(SceneConfig::from_preset)
        .unwrap_or_else(SceneConfig::fallback)
}

fn apply_draft(config: &mut SceneConfig, draft: SceneDraft, sanitizer: &PhraseSanitizer) {
    let usable = |text: Option<String>| text.filter(|value| !sanitizer.is_blocked(value));
    if let Some(anchor) = usable(draft.anchor_zone_description) {
        config.anchor_zone_description = anchor;
    }
    if let Some(mode) = draft.lighting_mode {
        config.lighting_mode = mode;
    }
    if let Some(realism) = usable(draft.realism_guidance) {
        config.realism_guidance = realism;
    }
    if let Some(blueprint) = usable(draft.lighting_blueprint) {
        config.lighting_blueprint = blueprint;
    }
    for item in draft.avoid {
        if !config
            .preset_avoid_list
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(&item))
        {
            config.preset_avoid_list.push(item);
        }
    }
}

fn apply_lighting_override(config: &mut SceneConfig, input: &SceneInput) {
    if let Some(lighting) = non_empty(input.lighting_description.as_deref()) {
        config.lighting_blueprint = format!(
            "{}. {}",
            truncate_chars(lighting, MAX_TEXT_CHARS).trim_end_matches('.'),
            config.lighting_blueprint
        );
    }
}

fn candidate_ids(input: &SceneInput, catalog: &PresetCatalog, explicit: Option<&Preset>) -> Vec<String> {
    if let Some(preset) = explicit {
        return vec![preset.id.clone()];
    }
    let query = [
        input.user_request.as_deref(),
        input.preset_description.as_deref(),
        input.lighting_description.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");
    let shortlist = catalog.shortlist(&query, SHORTLIST_LIMIT);
    if shortlist.is_empty() {
        catalog.ids().into_iter().map(str::to_string).collect()
    } else {
        shortlist.into_iter().map(|preset| preset.id.clone()).collect()
    }
}

fn build_scene_prompt(input: &SceneInput, explicit: Option<&Preset>, ids: &[String]) -> String {
    let mut sections = vec![
        "Plan the background and lighting for a photo of this person wearing a new outfit.".to_string(),
    ];
    if let Some(request) = non_empty(input.user_request.as_deref()) {
        sections.push(format!("User request: {}", truncate_chars(request, MAX_TEXT_CHARS)));
    }
    if let Some(description) = non_empty(input.preset_description.as_deref()) {
        sections.push(format!("Preset description: {}", truncate_chars(description, MAX_TEXT_CHARS)));
    }
    if let Some(lighting) = non_empty(input.lighting_description.as_deref()) {
        sections.push(format!("Requested lighting: {}", truncate_chars(lighting, MAX_TEXT_CHARS)));
    }
    if let Some(preset) = explicit {
        sections.push(format!(
            "Selected preset '{}': background: {}; lighting: {}",
            preset.id, preset.background, preset.lighting
        ));
    }
    sections.push(format!("Catalog preset ids: {}", ids.join(", ")));
    sections.join("\n")
}

/// Resolves the scene for one request. Never fails: without a usable model
/// answer the requested preset or the studio fallback is used.
pub async fn resolve_scene<V: VisionModel>(
    vision: &V,
    input: &SceneInput,
    person: &SourceImage,
    catalog: &PresetCatalog,
    sanitizer: &PhraseSanitizer,
    ctx: &RequestContext,
) -> SceneResolution {
    let mut discarded = None;
    let explicit = non_empty(input.preset_id.as_deref())
        .and_then(|id| accept_preset(id, catalog, sanitizer, &mut discarded, ctx));

    let ids = candidate_ids(input, catalog, explicit);
    let request = VisionRequest::json(
        "scene_resolve",
        SCENE_SYSTEM_PROMPT,
        build_scene_prompt(input, explicit, &ids),
        vec![person.clone()],
    );

    let draft = match vision.analyze(request).await {
        Ok(raw) => {
            let draft = parse_scene_response(&raw);
            if draft.is_none() {
                warn!(request_id = %ctx.request_id, "Scene answer was not JSON");
            }
            draft
        }
        Err(err) => {
            warn!(request_id = %ctx.request_id, "Scene resolution call failed: {}", err);
            None
        }
    };

    let Some(mut draft) = draft else {
        let (mut config, source) = match explicit {
            Some(preset) => (SceneConfig::from_preset(preset), SceneSource::Preset),
            None => (SceneConfig::fallback(), SceneSource::Fallback),
        };
        apply_lighting_override(&mut config, input);
        return SceneResolution {
            config,
            source,
            discarded_preset: discarded,
        };
    };

    let chosen = match explicit {
        Some(preset) => Some(preset),
        None => draft
            .preset_id
            .take()
            .and_then(|id| accept_preset(&id, catalog, sanitizer, &mut discarded, ctx)),
    };
    let mut config = chosen
        .map(SceneConfig::from_preset)
        .unwrap_or_else(|| neutral_base(catalog, sanitizer));
    apply_draft(&mut config, draft, sanitizer);
    apply_lighting_override(&mut config, input);

    info!(
        request_id = %ctx.request_id,
        preset_id = %config.preset_id,
        lighting_mode = config.lighting_mode.as_str(),
        "Scene resolved"
    );
    debug!(request_id = %ctx.request_id, scene = ?config);

    SceneResolution {
        config,
        source: SceneSource::Model,
        discarded_preset: discarded,
    }
}

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::scene::LightingMode;

/// A named bundle of scene, lighting and camera directives.
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub background: String,
    pub lighting: String,
    pub lighting_mode: LightingMode,
    pub realism: String,
    pub avoid: Vec<String>,
    pub creative_deviation: f32,
    pub tags: Vec<String>,
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PresetFile {
    presets: Vec<PresetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct PresetEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    background: String,
    lighting: String,
    #[serde(default)]
    lighting_mode: Option<String>,
    #[serde(default)]
    realism: Option<String>,
    #[serde(default)]
    avoid: Vec<String>,
    #[serde(default)]
    creative_deviation: Option<f32>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    triggers: Vec<String>,
}

fn normalize_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

fn normalize_entry(entry: PresetEntry) -> Result<Preset> {
    let id = entry.id.trim().to_lowercase();
    if id.is_empty() {
        return Err(anyhow!("Preset id cannot be empty"));
    }
    let background = entry.background.trim().to_string();
    let lighting = entry.lighting.trim().to_string();
    if background.is_empty() || lighting.is_empty() {
        return Err(anyhow!("Preset '{}' needs background and lighting", id));
    }
    let lighting_mode = match entry.lighting_mode.as_deref() {
        None => LightingMode::EnvironmentCoherent,
        Some(raw) => LightingMode::parse(raw).unwrap_or_else(|| {
            warn!("Preset '{}' has unknown lighting_mode '{}'", id, raw);
            LightingMode::EnvironmentCoherent
        }),
    };

    Ok(Preset {
        name: entry
            .name
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| id.clone()),
        description: entry.description.unwrap_or_default().trim().to_string(),
        background,
        lighting,
        lighting_mode,
        realism: entry.realism.unwrap_or_default().trim().to_string(),
        avoid: entry
            .avoid
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect(),
        creative_deviation: entry.creative_deviation.unwrap_or(0.3),
        tags: normalize_list(entry.tags),
        triggers: normalize_list(entry.triggers),
        id,
    })
}

struct BuiltIn {
    id: &'static str,
    name: &'static str,
    background: &'static str,
    lighting: &'static str,
    mode: LightingMode,
    avoid: &'static [&'static str],
    tags: &'static [&'static str],
    triggers: &'static [&'static str],
}

const BUILT_IN_PRESETS: &[BuiltIn] = &[
    BuiltIn {
        id: "studio_gradient",
        name: "Studio gradient",
        background: "Seamless studio gradient backdrop from warm grey to soft white",
        lighting: "Soft ambient key light from the front-left with gentle fill, no hard shadows",
        mode: LightingMode::StudioControlled,
        avoid: &["props", "text", "busy patterns"],
        tags: &["studio", "plain", "neutral", "catalog"],
        triggers: &["studio", "plain background", "white background"],
    },
    BuiltIn {
        id: "urban_street",
        name: "Urban street",
        background: "Quiet city sidewalk with softly blurred storefronts and parked bicycles",
        lighting: "Overcast daylight with soft directional light matching the sky",
        mode: LightingMode::EnvironmentCoherent,
        avoid: &["crowds", "cars in motion", "readable signage"],
        tags: &["city", "street", "urban", "outdoor"],
        triggers: &["street", "city", "downtown"],
    },
    BuiltIn {
        id: "golden_hour_park",
        name: "Golden hour park",
        background: "Green park lawn with trees in soft bokeh",
        lighting: "Warm low sun behind the subject with natural rim light and warm bounce fill",
        mode: LightingMode::EnvironmentCoherent,
        avoid: &["harsh midday sun", "lens flare over the face"],
        tags: &["park", "nature", "sunset", "outdoor", "golden"],
        triggers: &["golden hour", "sunset", "park"],
    },
    BuiltIn {
        id: "minimal_loft",
        name: "Minimal loft",
        background: "Bright minimalist loft interior with white walls, concrete floor and large windows",
        lighting: "Diffused window light from one side with soft natural falloff",
        mode: LightingMode::EnvironmentCoherent,
        avoid: &["clutter", "mirrors", "artificial colour casts"],
        tags: &["indoor", "loft", "interior", "minimal"],
        triggers: &["loft", "apartment", "interior"],
    },
    BuiltIn {
        id: "beach_boardwalk",
        name: "Beach boardwalk",
        background: "Wooden boardwalk by a calm beach with soft sea horizon",
        lighting: "Bright late-morning daylight with sea-reflected fill",
        mode: LightingMode::EnvironmentCoherent,
        avoid: &["tilted horizon", "sand on clothing"],
        tags: &["beach", "sea", "summer", "outdoor"],
        triggers: &["beach", "seaside", "summer"],
    },
    BuiltIn {
        id: "evening_event",
        name: "Evening event",
        background: "Elegant evening venue with warm bokeh lights and dark wood tones",
        lighting: "Warm tungsten ambient light with a soft key on the subject",
        mode: LightingMode::EnvironmentCoherent,
        avoid: &["flash glare", "other guests in focus"],
        tags: &["evening", "party", "event", "formal", "night"],
        triggers: &["party", "gala", "wedding", "evening"],
    },
];

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn built_in_presets() -> Vec<Preset> {
    BUILT_IN_PRESETS
        .iter()
        .map(|preset| Preset {
            id: preset.id.to_string(),
            name: preset.name.to_string(),
            description: String::new(),
            background: preset.background.to_string(),
            lighting: preset.lighting.to_string(),
            lighting_mode: preset.mode,
            realism: "Photorealistic, natural skin texture, true-to-life fabric detail".to_string(),
            avoid: to_strings(preset.avoid),
            creative_deviation: 0.3,
            tags: to_strings(preset.tags),
            triggers: to_strings(preset.triggers),
        })
        .collect()
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(str::to_string)
        .collect()
}

fn heuristic_score(request: &str, tokens: &HashSet<String>, preset: &Preset) -> i32 {
    let mut score = 0;
    let lowered_request = request.to_lowercase();
    let lowered_name = preset.name.to_lowercase();
    let lowered_background = preset.background.to_lowercase();

    for trigger in &preset.triggers {
        if lowered_request.contains(trigger.as_str()) {
            score += 5;
        }
    }
    for token in tokens {
        if preset.tags.iter().any(|tag| tag == token) {
            score += 2;
        }
        if lowered_name.contains(token.as_str()) {
            score += 2;
        }
        if lowered_background.contains(token.as_str()) {
            score += 1;
        }
    }
    score
}

/// Known presets keyed by id. File entries override built-ins with the same id.
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    presets: BTreeMap<String, Preset>,
}

impl Default for PresetCatalog {
    fn default() -> Self {
        PresetCatalog::from_presets(built_in_presets())
    }
}

impl PresetCatalog {
    pub fn from_presets(presets: Vec<Preset>) -> Self {
        PresetCatalog {
            presets: presets
                .into_iter()
                .map(|preset| (preset.id.clone(), preset))
                .collect(),
        }
    }

    /// Built-ins merged with presets parsed from YAML.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: PresetFile = serde_yaml::from_str(raw)
            .map_err(|err| anyhow!("Failed to parse preset catalog: {}", err))?;
        let mut catalog = PresetCatalog::default();
        for entry in file.presets {
            let entry_id = entry.id.clone();
            match normalize_entry(entry) {
                Ok(preset) => {
                    catalog.presets.insert(preset.id.clone(), preset);
                }
                Err(err) => warn!("Skipping preset '{}': {}", entry_id, err),
            }
        }
        Ok(catalog)
    }

    /// Loads the catalog from `path`, or returns the built-ins when the path
    /// is absent or unreadable.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return PresetCatalog::default();
        };
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    "Failed to read preset catalog at {}: {}; using built-ins",
                    path.display(),
                    err
                );
                return PresetCatalog::default();
            }
        };
        match PresetCatalog::from_yaml(&raw) {
            Ok(catalog) => {
                info!(
                    "Loaded preset catalog with {} preset(s) from {}",
                    catalog.len(),
                    path.display()
                );
                catalog
            }
            Err(err) => {
                warn!("{}; using built-ins", err);
                PresetCatalog::default()
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Preset> {
        self.presets.get(&id.trim().to_lowercase())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Ranks presets against free text; ties break on id for determinism.
    pub fn shortlist(&self, request: &str, limit: usize) -> Vec<&Preset> {
        let tokens = tokenize(request);
        let mut scored = self
            .presets
            .values()
            .map(|preset| (heuristic_score(request, &tokens, preset), preset))
            .filter(|(score, _)| *score > 0)
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        let shortlist = scored
            .into_iter()
            .take(limit)
            .map(|(_, preset)| preset)
            .collect::<Vec<_>>();
        debug!(
            "Preset shortlist for request: [{}]",
            shortlist
                .iter()
                .map(|preset| preset.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        shortlist
    }
}

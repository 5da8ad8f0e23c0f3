use replica_contracts::strategy::StageSelection;
use replica_contracts::{
    AssetRequest, ExecutionPlan, PipelineError, PipelineInput, RouteMode, RoutingStrategy,
};
use serde_json::Value;

use crate::services::{TextRequest, TextService};
use crate::util::{error_chain_text, parse_json_object, truncate_text};

const VIBE_MAX_CHARS: usize = 240;

/// Instruction phrases that ask for a synthetic asset, with the asset name
/// they produce.
const ASSET_CUES: &[(&[&str], &str)] = &[
    (&["hero image", "hero banner", "hero background", "hero photo"], "hero-image"),
    (&["background image", "backdrop"], "background"),
    (&["avatar", "profile picture", "headshot"], "avatar"),
    (&["product photo", "product image", "product shot"], "product-shot"),
    (&["illustration", "mascot"], "illustration"),
    (&["logo"], "logo"),
];

/// With a reference image the Router only orders new imagery on explicit
/// request; everything else is cropped from the reference.
const GENERATION_VERBS: &[&[&str]] = &[
    &["generate"],
    &["create"],
    &["new"],
    &["add", "a"],
    &["add", "an"],
    &["make", "a"],
];

const ROUTER_SYSTEM_PROMPT: &str = "You route UI synthesis requests. Reply with one JSON object: \
{\"mode\": \"GENERATE\" | \"REPLICATE\" | \"EDIT\", \"assets\": [{\"name\": string, \"vibe\": string, \"keywords\": [string]}], \"reasoning\": string}. \
REPLICATE requires a reference image, EDIT requires existing code. Only list assets that must be generated because no reference provides them.";

/// Sequential gate in front of every other stage. Heuristic unless a router
/// model is attached.
pub struct Router<'a> {
    model: Option<(&'a dyn TextService, &'a str)>,
}

impl<'a> Router<'a> {
    pub fn heuristic() -> Self {
        Self { model: None }
    }

    pub fn with_model(text: &'a dyn TextService, model: &'a str) -> Self {
        Self {
            model: Some((text, model)),
        }
    }

    pub fn route(&self, input: &PipelineInput) -> Result<RoutingStrategy, PipelineError> {
        if input.files.is_empty() && !input.has_instructions() && !input.has_current_code() {
            return Err(PipelineError::Routing(
                "nothing to build: no reference files, instructions or existing code".to_string(),
            ));
        }
        let mode = classify(input);
        let assets = asset_requests(input, mode);
        let Some((text, model)) = self.model else {
            return Ok(plan(input, mode, assets, heuristic_reasoning(input, mode)));
        };

        let raw = text
            .complete(&TextRequest {
                model: model.to_string(),
                system: ROUTER_SYSTEM_PROMPT.to_string(),
                prompt: router_prompt(input),
            })
            .map_err(|err| {
                PipelineError::Routing(format!("router model failed: {}", error_chain_text(&err, 400)))
            })?;
        let Some(reply) = parse_json_object(&raw) else {
            return Err(PipelineError::Routing(format!(
                "router model reply is not a JSON object: {}",
                truncate_text(raw.trim(), 200)
            )));
        };

        let mode = match reply.get("mode").and_then(Value::as_str) {
            Some(raw_mode) => parse_mode(raw_mode).ok_or_else(|| {
                PipelineError::Routing(format!("router model chose unknown mode '{raw_mode}'"))
            })?,
            None => mode,
        };
        if mode == RouteMode::Replicate && input.canonical_image_index().is_none() {
            return Err(PipelineError::Routing(
                "router model chose REPLICATE without a reference image".to_string(),
            ));
        }
        if mode == RouteMode::Edit && !input.has_current_code() {
            return Err(PipelineError::Routing(
                "router model chose EDIT without existing code".to_string(),
            ));
        }
        let assets = match reply.get("assets") {
            Some(value) => model_asset_requests(value)?,
            None => asset_requests(input, mode),
        };
        let reasoning = reply
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| heuristic_reasoning(input, mode));
        Ok(plan(input, mode, assets, reasoning))
    }
}

fn classify(input: &PipelineInput) -> RouteMode {
    if input.canonical_image_index().is_some() {
        RouteMode::Replicate
    } else if input.has_current_code() {
        RouteMode::Edit
    } else {
        RouteMode::Generate
    }
}

fn parse_mode(raw: &str) -> Option<RouteMode> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "GENERATE" => Some(RouteMode::Generate),
        "REPLICATE" | "MEASURE" | "REPLICATION" => Some(RouteMode::Replicate),
        "EDIT" => Some(RouteMode::Edit),
        _ => None,
    }
}

fn plan(
    input: &PipelineInput,
    mode: RouteMode,
    generate_assets: Vec<AssetRequest>,
    reasoning: String,
) -> RoutingStrategy {
    let extract_physics = input.video_indices();
    RoutingStrategy {
        mode,
        execution_plan: ExecutionPlan {
            measure_pixels: if mode.uses_vision() {
                input.image_indices()
            } else {
                Vec::new()
            },
            stages: StageSelection {
                architect: mode != RouteMode::Edit,
                physicist: !extract_physics.is_empty(),
                healing: mode.uses_vision(),
            },
            extract_physics,
            generate_assets,
        },
        reasoning,
    }
}

fn asset_requests(input: &PipelineInput, mode: RouteMode) -> Vec<AssetRequest> {
    let lowered = input.instructions.to_ascii_lowercase();
    if mode.uses_vision() && !has_generation_verb(&lowered) {
        return Vec::new();
    }
    let vibe = truncate_text(input.instructions.trim(), VIBE_MAX_CHARS);
    let mut requests: Vec<AssetRequest> = Vec::new();
    for (phrases, name) in ASSET_CUES {
        let matched: Vec<String> = phrases
            .iter()
            .filter(|phrase| lowered.contains(*phrase))
            .map(|phrase| phrase.to_string())
            .collect();
        if matched.is_empty() || requests.iter().any(|request| request.name == *name) {
            continue;
        }
        let mut request = AssetRequest::new(name, &vibe);
        request.keywords = matched;
        requests.push(request);
    }
    requests
}

/// Whole-word match, so "recreate" or "renew" never count as a request for
/// new imagery.
fn has_generation_verb(lowered: &str) -> bool {
    let words: Vec<&str> = lowered
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    GENERATION_VERBS.iter().any(|verb| {
        words
            .windows(verb.len())
            .any(|window| window == *verb)
    })
}

fn model_asset_requests(value: &Value) -> Result<Vec<AssetRequest>, PipelineError> {
    let Some(rows) = value.as_array() else {
        return Err(PipelineError::Routing(
            "router model assets must be a list".to_string(),
        ));
    };
    let mut requests: Vec<AssetRequest> = Vec::new();
    for row in rows {
        let request = match row {
            Value::String(name) => AssetRequest::new(name.trim(), ""),
            Value::Object(_) => serde_json::from_value::<AssetRequest>(row.clone()).map_err(|err| {
                PipelineError::Routing(format!("router model asset entry invalid: {err}"))
            })?,
            _ => continue,
        };
        let name = request.name.trim();
        if name.is_empty() || requests.iter().any(|seen| seen.name == name) {
            continue;
        }
        requests.push(AssetRequest {
            name: name.to_string(),
            ..request.clone()
        });
    }
    Ok(requests)
}

fn router_prompt(input: &PipelineInput) -> String {
    let files: Vec<String> = input
        .files
        .iter()
        .enumerate()
        .map(|(idx, file)| format!("{idx}: {} ({})", file.filename, file.mime_type))
        .collect();
    format!(
        "Instructions: {}\nReference files: {}\nExisting code: {}\nApp context keys: {}",
        if input.has_instructions() {
            input.instructions.trim()
        } else {
            "(none)"
        },
        if files.is_empty() {
            "(none)".to_string()
        } else {
            files.join(", ")
        },
        if input.has_current_code() { "yes" } else { "no" },
        input
            .app_context
            .as_ref()
            .map(|ctx| ctx.keys().cloned().collect::<Vec<_>>().join(", "))
            .filter(|keys| !keys.is_empty())
            .unwrap_or_else(|| "(none)".to_string()),
    )
}

fn heuristic_reasoning(input: &PipelineInput, mode: RouteMode) -> String {
    match mode {
        RouteMode::Replicate => format!(
            "{} reference image(s) present; measuring pixels for replication.",
            input.image_indices().len()
        ),
        RouteMode::Edit => "No reference image; editing the supplied code.".to_string(),
        RouteMode::Generate => {
            "No reference image or existing code; generating from instructions.".to_string()
        }
    }
}

//! Vision analysis of one reference image into a [`VisualManifest`].
//!
//! The canvas is measured from the original bytes before anything else and
//! is never re-estimated. Enhancement only changes what the vision model
//! sees. A reply that cannot be parsed is recovered locally: the manifest has
//! an empty theme and the fallback canvas.

use std::sync::Mutex;

use replica_contracts::events::EventWriter;
use replica_contracts::manifest::{apply_auto_fix, AssetNeed, Canvas, GlobalTheme, ImageRef};
use replica_contracts::runs::cache::ManifestCache;
use replica_contracts::{ReferenceFile, UiNode, VisualManifest};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;
use crate::imaging::{encode_png, enhance_for_vision, load_image, measure_dimensions};
use crate::services::{InlineImage, VisionRequest, VisionService};
use crate::util::{error_chain_text, map_object, parse_json_object, strip_code_fences, truncate_text};

pub const SURVEYOR_PROMPT_VERSION: &str = "surveyor-v3";
pub const DOM_EXTRACTION_WARNING: &str = "DOM structure could not be extracted";

#[derive(Debug, Clone)]
pub struct SurveyOutcome {
    pub manifest: VisualManifest,
    pub warnings: Vec<String>,
}

pub struct Surveyor<'a> {
    vision: &'a dyn VisionService,
    model: &'a str,
    config: &'a PipelineConfig,
    events: &'a EventWriter,
    cache: Option<&'a Mutex<ManifestCache>>,
}

impl<'a> Surveyor<'a> {
    pub fn new(
        vision: &'a dyn VisionService,
        model: &'a str,
        config: &'a PipelineConfig,
        events: &'a EventWriter,
    ) -> Self {
        Self {
            vision,
            model,
            config,
            events,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a Mutex<ManifestCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn survey_layout(&self, file_index: usize, file: &ReferenceFile, bytes: &[u8]) -> SurveyOutcome {
        let mut warnings = Vec::new();
        let image_ref = ImageRef {
            file_uri: format!("ref://{file_index}"),
            mime_type: file.mime_type.clone(),
        };
        let fallback = self.config.fallback_canvas();
        let canvas = match measure_dimensions(bytes) {
            Some((width, height)) => Canvas::measured(width, height),
            None => {
                warnings.push(format!(
                    "Could not measure '{}'; using fallback canvas {}x{}.",
                    file.filename, fallback.width, fallback.height
                ));
                fallback
            }
        };

        let cache_key = self.cache_key(bytes);
        if let Some(mut cached) = self.cached(&cache_key) {
            cached.file_index = file_index;
            return SurveyOutcome {
                manifest: cached,
                warnings,
            };
        }

        let image = self.prepare_image(bytes, &file.mime_type);
        let request = VisionRequest {
            model: self.model.to_string(),
            prompt: survey_prompt(&canvas),
            image,
            canvas,
        };
        let raw = match self.vision.analyze(&request) {
            Ok(raw) => raw,
            Err(err) => {
                warnings.push(format!(
                    "Vision analysis failed for '{}' ({}); {DOM_EXTRACTION_WARNING}.",
                    file.filename,
                    error_chain_text(&err, 300)
                ));
                return SurveyOutcome {
                    manifest: VisualManifest::empty(file_index, image_ref, fallback),
                    warnings,
                };
            }
        };

        let Some(parsed) = parse_survey_reply(&raw) else {
            self.events.note(
                "surveyor_parse_failed",
                map_object(json!({
                    "file_index": file_index,
                    "preview": truncate_text(raw.trim(), 200),
                })),
            );
            warnings.push(format!(
                "{DOM_EXTRACTION_WARNING} for '{}'; falling back to the reference image.",
                file.filename
            ));
            return SurveyOutcome {
                manifest: VisualManifest::empty(file_index, image_ref, fallback),
                warnings,
            };
        };

        let (tree, notes) = apply_auto_fix(&parsed.tree);
        if !notes.is_empty() {
            let fixes: Vec<Value> = notes
                .iter()
                .map(|note| {
                    json!({
                        "rule": note.rule.as_str(),
                        "node_id": note.node_id,
                        "tag": note.tag,
                    })
                })
                .collect();
            self.events.note(
                "surveyor_autofix",
                map_object(json!({ "file_index": file_index, "fixes": fixes })),
            );
        }

        let manifest = VisualManifest {
            file_index,
            original_image_ref: image_ref,
            canvas,
            global_theme: GlobalTheme {
                dom_tree: Some(tree),
                assets: parsed.assets,
            },
            measured_components: parsed.measured_components,
        };
        if let Some(cache) = self.cache {
            let stored = cache
                .lock()
                .map_err(|_| anyhow::anyhow!("survey cache lock poisoned"))
                .and_then(|mut cache| cache.set(&cache_key, &manifest));
            if let Err(err) = stored {
                warnings.push(format!("Survey cache write failed: {}", error_chain_text(&err, 200)));
            }
        }
        SurveyOutcome { manifest, warnings }
    }

    fn cache_key(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.update(self.model.as_bytes());
        hasher.update(SURVEYOR_PROMPT_VERSION.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn cached(&self, key: &str) -> Option<VisualManifest> {
        let mut cache = self.cache?.lock().ok()?;
        cache.get(key).filter(VisualManifest::has_structure)
    }

    /// The image sent to the vision model: upscaled and sharpened when small,
    /// otherwise the original bytes.
    fn prepare_image(&self, bytes: &[u8], mime_type: &str) -> InlineImage {
        let enhanced = self.config.enhance_min_dimension.and_then(|min_dimension| {
            let image = load_image(bytes).ok()?;
            let upscaled = enhance_for_vision(&image, min_dimension, self.config.enhance_max_scale)?;
            encode_png(&upscaled).ok()
        });
        match enhanced {
            Some(png) => InlineImage::new(png, "image/png"),
            None => InlineImage::new(bytes.to_vec(), mime_type),
        }
    }
}

fn survey_prompt(canvas: &Canvas) -> String {
    format!(
        "The screenshot is exactly {width}x{height} pixels. Reconstruct it as JSON:\n\
{{\"dom_tree\": node, \"assets\": [string]}} where node is\n\
{{\"id\": string, \"type\": html tag, \"bounds\": {{\"top\", \"left\", \"width\", \"height\"}} as 0-100 percentages \
(roots relative to the canvas, children relative to their parent), \"styles\": {{camelCase CSS with literal values}}, \
\"text\"?: string, \"visualCategory\"?: \"photograph\" | \"logo\" | \"brand_icon\" | \"decorative_graphic\" | \"simple_icon\" | \"ui_chrome\", \
\"hasImage\"?: bool, \"iconName\"?: string, \"svgPath\"?: string, \"viewBox\"?: string, \"fill\"?: string, \"children\"?: [node]}}.\n\
Copy exact hex colours, exact gradients and exact pixel paddings and margins. Never describe a value in words.\n\
Give every node a unique id. img and input nodes have no children. Label every non-text, non-container node with a visualCategory.",
        width = canvas.width,
        height = canvas.height,
    )
}

#[derive(Debug, Clone)]
struct ParsedSurvey {
    tree: UiNode,
    assets: Vec<AssetNeed>,
    measured_components: Vec<Value>,
}

/// Accepts `{dom_tree, assets}`, `{global_theme: {...}}`, a bare node object
/// or a bare array of nodes (wrapped in a `div` root).
fn parse_survey_reply(raw: &str) -> Option<ParsedSurvey> {
    let root = match serde_json::from_str::<Value>(strip_code_fences(raw)) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => parse_json_object(raw)?,
    };

    let (tree_value, theme) = match &root {
        Value::Array(_) => (root.clone(), None),
        Value::Object(obj) => {
            let theme = obj
                .get("global_theme")
                .or_else(|| obj.get("globalTheme"))
                .filter(|value| value.is_object())
                .unwrap_or(&root);
            let tree = theme
                .get("dom_tree")
                .or_else(|| theme.get("domTree"))
                .or_else(|| obj.get("dom_tree"))
                .cloned()
                .or_else(|| obj.contains_key("type").then(|| root.clone()))?;
            (tree, Some(theme))
        }
        _ => return None,
    };

    let tree = match tree_value {
        Value::Object(_) => serde_json::from_value::<UiNode>(tree_value).ok()?,
        Value::Array(items) => {
            let children: Vec<UiNode> = items
                .into_iter()
                .filter(Value::is_object)
                .filter_map(|item| serde_json::from_value::<UiNode>(item).ok())
                .collect();
            if children.is_empty() {
                return None;
            }
            children
                .into_iter()
                .fold(UiNode::new("div").with_id("root"), UiNode::with_child)
        }
        _ => return None,
    };

    let assets = theme
        .and_then(|theme| theme.get("assets"))
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| serde_json::from_value::<AssetNeed>(row.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let measured_components = root
        .get("measured_components")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Some(ParsedSurvey {
        tree,
        assets,
        measured_components,
    })
}

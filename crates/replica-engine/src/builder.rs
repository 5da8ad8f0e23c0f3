//! Code synthesis. The brief is the single hand-off to the code model; the
//! model's reply is parsed into files, asset placeholders are resolved and
//! the result is audited for dropped literal colours.

use replica_contracts::assets::asset_placeholder;
use replica_contracts::result::MotionData;
use replica_contracts::{
    AssetMap, OutputFile, PipelineError, PipelineInput, RouteMode, VisualManifest,
};
use serde_json::{Map, Value};

use crate::fidelity::Hotspot;
use crate::services::{CodeService, InlineImage};
use crate::util::{parse_json_object, strip_code_fences};

const PLACEHOLDER_SCHEME: &str = "asset://";
const DEFAULT_ENTRY: &str = "index.html";

/// Corrective context for a healing re-invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchContext {
    /// 1-based index of the rebuild this context drives.
    pub iteration: u32,
    pub score: f64,
    pub target: f64,
    pub hotspots: Vec<Hotspot>,
    pub previous_files: Vec<OutputFile>,
}

#[derive(Debug, Clone)]
pub struct BuildBrief {
    pub model: String,
    pub mode: RouteMode,
    pub instructions: String,
    pub app_context: Option<Map<String, Value>>,
    pub manifests: Vec<VisualManifest>,
    pub structure: Option<Value>,
    pub physics: Option<Vec<MotionData>>,
    pub assets: AssetMap,
    pub current_code: Option<String>,
    pub reference: Option<InlineImage>,
    pub patch: Option<PatchContext>,
}

impl BuildBrief {
    /// Brief carrying only what every mode uses. Vision-derived inputs are
    /// attached by the caller when the mode uses them.
    pub fn for_input(model: &str, mode: RouteMode, input: &PipelineInput) -> Self {
        Self {
            model: model.to_string(),
            mode,
            instructions: input.instructions.trim().to_string(),
            app_context: input.app_context.clone(),
            manifests: Vec::new(),
            structure: None,
            physics: None,
            assets: AssetMap::new(),
            current_code: input
                .current_code
                .clone()
                .filter(|code| !code.trim().is_empty()),
            reference: None,
            patch: None,
        }
    }

    pub fn with_patch(&self, patch: PatchContext) -> Self {
        let mut next = self.clone();
        next.patch = Some(patch);
        next
    }

    pub fn system_prompt(&self) -> String {
        let mut lines = vec![
            "You are a senior front-end engineer producing production UI code.".to_string(),
            "Reply with one JSON object: {\"files\": [{\"path\": string, \"content\": string}]}."
                .to_string(),
            format!("The entry file must be {DEFAULT_ENTRY}."),
            format!(
                "Reference images and assets only through {PLACEHOLDER_SCHEME}<key> URLs using the keys listed under Assets."
            ),
        ];
        match self.mode {
            RouteMode::Replicate => {
                lines.push(
                    "Copy every style value from the manifest verbatim: exact hex colours, gradients, paddings and margins. Never paraphrase a value.".to_string(),
                );
                lines.push(
                    "Bounds are percentages: roots relative to the canvas, children relative to their parent.".to_string(),
                );
            }
            RouteMode::Edit => lines.push(
                "Apply the instructions to the existing code and return every changed file in full.".to_string(),
            ),
            RouteMode::Generate => lines.push(
                "Design from the instructions and app context; there is no reference image.".to_string(),
            ),
        }
        lines.join("\n")
    }

    pub fn user_prompt(&self) -> String {
        let mut sections = vec![format!("## Mode\n{}", self.mode.as_str())];
        if !self.instructions.is_empty() {
            sections.push(format!("## Instructions\n{}", self.instructions));
        }
        if let Some(context) = self.app_context.as_ref().filter(|ctx| !ctx.is_empty()) {
            sections.push(format!("## App context\n{}", pretty(&Value::Object(context.clone()))));
        }
        if !self.manifests.is_empty() {
            let manifests = serde_json::to_value(&self.manifests).unwrap_or(Value::Null);
            sections.push(format!("## Visual manifests\n{}", pretty(&manifests)));
            let colors = manifest_colors(&self.manifests);
            if !colors.is_empty() {
                sections.push(format!("## Literal colours (all must appear)\n{}", colors.join(" ")));
            }
        }
        if !self.assets.is_empty() {
            let keys: Vec<String> = self
                .assets
                .keys()
                .map(|key| format!("- {}", asset_placeholder(key)))
                .collect();
            sections.push(format!("## Assets\n{}", keys.join("\n")));
        }
        if let Some(structure) = &self.structure {
            sections.push(format!("## Structure\n{}", pretty(structure)));
        }
        if let Some(physics) = self.physics.as_ref().filter(|rows| !rows.is_empty()) {
            let physics = serde_json::to_value(physics).unwrap_or(Value::Null);
            sections.push(format!("## Motion\n{}", pretty(&physics)));
        }
        if let Some(code) = &self.current_code {
            sections.push(format!("## Existing code\n{code}"));
        }
        if let Some(patch) = &self.patch {
            let mut text = format!(
                "## Fidelity patch {}\nThe rendered output scored {:.2} against a target of {:.2}. Fix the regions that differ most:",
                patch.iteration, patch.score, patch.target
            );
            for spot in &patch.hotspots {
                text.push_str(&format!(
                    "\n- top {:.0}% left {:.0}% ({:.0}%×{:.0}%): mean difference {:.0}%",
                    spot.bounds.top,
                    spot.bounds.left,
                    spot.bounds.width,
                    spot.bounds.height,
                    spot.delta * 100.0
                ));
            }
            for file in &patch.previous_files {
                text.push_str(&format!("\n### {}\n{}", file.path, file.content));
            }
            sections.push(text);
        }
        sections.join("\n\n")
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn manifest_colors(manifests: &[VisualManifest]) -> Vec<String> {
    let mut colors: Vec<String> = Vec::new();
    for manifest in manifests {
        for color in manifest.hex_colors() {
            if !colors.contains(&color) {
                colors.push(color);
            }
        }
    }
    colors
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub files: Vec<OutputFile>,
    pub warnings: Vec<String>,
}

/// Invokes the code service and post-processes its reply. A service error is
/// catastrophic; a reply with no usable file is a build error.
pub fn build(code: &dyn CodeService, brief: &BuildBrief) -> Result<BuildOutcome, PipelineError> {
    let raw = code
        .generate(brief)
        .map_err(|err| PipelineError::catastrophic("builder", &err))?;
    let files = parse_build_response(&raw).map_err(PipelineError::Build)?;
    let (files, unresolved) = substitute_placeholders(&files, &brief.assets);

    let mut warnings = Vec::new();
    if !unresolved.is_empty() {
        warnings.push(format!(
            "Unresolved asset placeholders left in output: {}",
            unresolved.join(", ")
        ));
    }
    let missing = audit_literal_colors(&files, &brief.manifests);
    if !missing.is_empty() {
        warnings.push(format!(
            "Builder output dropped {} literal colour(s) from the manifest: {}",
            missing.len(),
            missing.join(", ")
        ));
    }
    Ok(BuildOutcome { files, warnings })
}

/// Accepts `{"files": [...]}` JSON, optionally fenced, or a bare document
/// which becomes the entry file. Braces inside a document (CSS rules, JSON-LD)
/// do not make it a JSON reply.
pub fn parse_build_response(raw: &str) -> Result<Vec<OutputFile>, String> {
    let body = strip_code_fences(raw);
    let payload = parse_json_object(raw)
        .filter(|payload| body.starts_with('{') || payload.get("files").is_some());
    if let Some(payload) = payload {
        let Some(entries) = payload.get("files").and_then(Value::as_array) else {
            return Err("code model reply is JSON without a files list".to_string());
        };
        let files: Vec<OutputFile> = entries
            .iter()
            .filter_map(|entry| {
                let path = entry.get("path").and_then(Value::as_str)?.trim();
                let content = entry
                    .get("content")
                    .or_else(|| entry.get("code"))
                    .and_then(Value::as_str)?;
                (!path.is_empty()).then(|| OutputFile::new(path, content))
            })
            .collect();
        if files.is_empty() {
            return Err("code model reply contained no files".to_string());
        }
        return Ok(files);
    }

    if body.is_empty() {
        return Err("code model reply was empty".to_string());
    }
    Ok(vec![OutputFile::new(DEFAULT_ENTRY, body)])
}

/// Replaces `asset://<key>` with the mapped URL. Returns the rewritten files
/// and the keys that had no mapping.
pub fn substitute_placeholders(
    files: &[OutputFile],
    assets: &AssetMap,
) -> (Vec<OutputFile>, Vec<String>) {
    let mut unresolved: Vec<String> = Vec::new();
    let rewritten = files
        .iter()
        .map(|file| {
            let mut out = String::with_capacity(file.content.len());
            let mut rest = file.content.as_str();
            while let Some(pos) = rest.find(PLACEHOLDER_SCHEME) {
                out.push_str(&rest[..pos]);
                let after = &rest[pos + PLACEHOLDER_SCHEME.len()..];
                let key_len = after
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
                    .unwrap_or(after.len());
                let key = after[..key_len].trim_end_matches('.');
                match assets.get(key) {
                    Some(url) => out.push_str(url),
                    None => {
                        if !key.is_empty() && !unresolved.iter().any(|seen| seen == key) {
                            unresolved.push(key.to_string());
                        }
                        out.push_str(PLACEHOLDER_SCHEME);
                        out.push_str(key);
                    }
                }
                rest = &after[key.len()..];
            }
            out.push_str(rest);
            OutputFile::new(file.path.clone(), out)
        })
        .collect();
    (rewritten, unresolved)
}

/// Manifest colours that appear in no output file (case-insensitive).
pub fn audit_literal_colors(files: &[OutputFile], manifests: &[VisualManifest]) -> Vec<String> {
    let colors = manifest_colors(manifests);
    if colors.is_empty() {
        return Vec::new();
    }
    let haystack: String = files
        .iter()
        .map(|file| file.content.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("\n");
    colors
        .into_iter()
        .filter(|color| !haystack.contains(color.as_str()))
        .collect()
}

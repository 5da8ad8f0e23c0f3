//! Optional stages ahead of the Builder. Each runs only when enabled in
//! config, selected by the routing strategy and backed by an implementation;
//! otherwise it is skipped with a `stage_skipped` event. Failures never stop
//! the pipeline.

use std::sync::Arc;

use replica_contracts::events::EventWriter;
use replica_contracts::manifest::{Canvas, VisualManifest};
use replica_contracts::result::MotionData;
use replica_contracts::PipelineInput;
use serde_json::{json, Value};

use crate::imaging::decode_reference;
use crate::services::{InlineImage, MotionStage, StructureStage, VisionRequest, VisionService};
use crate::util::{error_chain_text, map_object, parse_json_object};

/// Returns the stage when it may run, otherwise records why it was skipped.
pub fn gate<'a, S: ?Sized>(
    stage: &str,
    enabled: bool,
    selected: bool,
    service: Option<&'a S>,
    events: &EventWriter,
) -> Option<&'a S> {
    let reason = if !selected {
        "not selected by routing strategy"
    } else if !enabled {
        "disabled in config"
    } else if service.is_none() {
        "no implementation configured"
    } else {
        return service;
    };
    events.note(
        "stage_skipped",
        map_object(json!({ "stage": stage, "reason": reason })),
    );
    None
}

pub fn synthesize_structure(
    stage: &dyn StructureStage,
    input: &PipelineInput,
    manifests: &[VisualManifest],
) -> (Option<Value>, Vec<String>) {
    match stage.synthesize(input, manifests) {
        Ok(Value::Null) => (None, Vec::new()),
        Ok(structure) => (Some(structure), Vec::new()),
        Err(err) => (
            None,
            vec![format!(
                "Architect stage '{}' failed: {}; building without a structure plan.",
                stage.name(),
                error_chain_text(&err, 300)
            )],
        ),
    }
}

/// Runs motion extraction for every listed file. Files that fail are skipped
/// with a warning; `None` when nothing was extracted.
pub fn extract_motion(
    stage: &dyn MotionStage,
    input: &PipelineInput,
    file_indexes: &[usize],
) -> (Option<Vec<MotionData>>, Vec<String>) {
    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for &file_index in file_indexes {
        match stage.extract(input, file_index) {
            Ok(row) => rows.push(row),
            Err(err) => warnings.push(format!(
                "Motion extraction failed for file {file_index}: {}",
                error_chain_text(&err, 300)
            )),
        }
    }
    ((!rows.is_empty()).then_some(rows), warnings)
}

/// Deterministic structure plan: the top-level sections of every manifest in
/// document order.
pub struct OutlineArchitect;

impl StructureStage for OutlineArchitect {
    fn name(&self) -> &str {
        "outline"
    }

    fn synthesize(&self, _input: &PipelineInput, manifests: &[VisualManifest]) -> anyhow::Result<Value> {
        let pages: Vec<Value> = manifests
            .iter()
            .filter_map(|manifest| {
                let tree = manifest.global_theme.dom_tree.as_ref()?;
                let sections: Vec<Value> = tree
                    .children()
                    .iter()
                    .map(|node| {
                        json!({
                            "tag": node.tag(),
                            "id": node.valid_id(),
                            "bounds": node.bounds,
                            "descendants": node.count().saturating_sub(1),
                        })
                    })
                    .collect();
                Some(json!({
                    "file_index": manifest.file_index,
                    "root": tree.tag(),
                    "sections": sections,
                }))
            })
            .collect();
        if pages.is_empty() {
            return Ok(Value::Null);
        }
        Ok(json!({ "pages": pages }))
    }
}

const MOTION_PROMPT: &str = "Describe every animation and transition in this recording. Reply with one JSON object: \
{\"timelines\": [{\"target\": string, \"property\": string, \"from\": string, \"to\": string, \"duration_ms\": number, \"easing\": string, \"delay_ms\": number}]}.";

/// Motion extraction backed by a vision model that accepts video input.
pub struct VisionMotionStage {
    vision: Arc<dyn VisionService>,
    model: String,
    canvas: Canvas,
}

impl VisionMotionStage {
    pub fn new(vision: Arc<dyn VisionService>, model: impl Into<String>, canvas: Canvas) -> Self {
        Self {
            vision,
            model: model.into(),
            canvas,
        }
    }
}

impl MotionStage for VisionMotionStage {
    fn name(&self) -> &str {
        "vision-motion"
    }

    fn extract(&self, input: &PipelineInput, file_index: usize) -> anyhow::Result<MotionData> {
        let Some(file) = input.files.get(file_index) else {
            anyhow::bail!("file {file_index} does not exist");
        };
        if !file.is_video() {
            anyhow::bail!("file {file_index} is not a video ({})", file.mime_type);
        }
        let raw = self.vision.analyze(&VisionRequest {
            model: self.model.clone(),
            prompt: MOTION_PROMPT.to_string(),
            image: InlineImage::new(decode_reference(file)?, file.mime_type.clone()),
            canvas: self.canvas,
        })?;
        let Some(parsed) = parse_json_object(&raw) else {
            anyhow::bail!("motion reply was not a JSON object");
        };
        let timelines = parsed
            .get("timelines")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(MotionData {
            file_index,
            canvas: None,
            timelines,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::bail;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use replica_contracts::events::{drain_types, EventWriter};
    use replica_contracts::manifest::{Bounds, Canvas, ImageRef};
    use replica_contracts::result::MotionData;
    use replica_contracts::{PipelineInput, ReferenceFile, UiNode, VisualManifest};
    use serde_json::json;

    use super::{extract_motion, gate, synthesize_structure, OutlineArchitect, VisionMotionStage};
    use crate::services::{MotionStage, StructureStage, VisionRequest, VisionService};

    struct FixedVision(&'static str);

    impl VisionService for FixedVision {
        fn name(&self) -> &str {
            "fixed"
        }

        fn analyze(&self, request: &VisionRequest) -> anyhow::Result<String> {
            assert_eq!(request.image.mime_type, "video/mp4");
            Ok(self.0.to_string())
        }
    }

    struct BrokenMotion;

    impl MotionStage for BrokenMotion {
        fn name(&self) -> &str {
            "broken"
        }

        fn extract(&self, _input: &PipelineInput, file_index: usize) -> anyhow::Result<MotionData> {
            if file_index == 0 {
                bail!("decoder missing");
            }
            Ok(MotionData {
                file_index,
                canvas: None,
                timelines: Vec::new(),
            })
        }
    }

    fn video_input() -> PipelineInput {
        PipelineInput {
            files: vec![ReferenceFile {
                base64: BASE64.encode(b"fake-mp4"),
                mime_type: "video/mp4".to_string(),
                filename: "intro.mp4".to_string(),
            }],
            ..PipelineInput::default()
        }
    }

    #[test]
    fn gate_reports_the_first_missing_condition() {
        let (events, rx) = EventWriter::channel("run");
        let stage = OutlineArchitect;
        let service: Option<&dyn StructureStage> = Some(&stage);
        assert!(gate("architect", false, true, service, &events).is_none());
        assert!(gate("architect", true, false, service, &events).is_none());
        assert!(gate::<dyn StructureStage>("architect", true, true, None, &events).is_none());
        assert!(gate("architect", true, true, service, &events).is_some());

        let reasons: Vec<String> = rx
            .try_iter()
            .filter_map(|event| event["reason"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            reasons,
            vec![
                "disabled in config",
                "not selected by routing strategy",
                "no implementation configured"
            ]
        );
        assert!(drain_types(&rx).is_empty());
    }

    #[test]
    fn outline_lists_top_level_sections() -> anyhow::Result<()> {
        let tree = UiNode::new("body")
            .with_child(
                UiNode::new("header")
                    .with_id("top")
                    .with_bounds(Bounds::new(0.0, 0.0, 100.0, 10.0))
                    .with_child(UiNode::new("nav")),
            )
            .with_child(UiNode::new("main"));
        let mut manifest = VisualManifest::empty(
            0,
            ImageRef {
                file_uri: "ref://0".to_string(),
                mime_type: "image/png".to_string(),
            },
            Canvas::measured(800, 600),
        );
        manifest.global_theme.dom_tree = Some(tree);

        let (structure, warnings) =
            synthesize_structure(&OutlineArchitect, &PipelineInput::default(), &[manifest]);
        assert!(warnings.is_empty());
        let structure = structure.ok_or_else(|| anyhow::anyhow!("missing structure"))?;
        let sections = &structure["pages"][0]["sections"];
        assert_eq!(sections[0]["id"], json!("top"));
        assert_eq!(sections[0]["descendants"], json!(1));
        assert_eq!(sections[1]["tag"], json!("main"));

        let (empty, _) = synthesize_structure(&OutlineArchitect, &PipelineInput::default(), &[]);
        assert!(empty.is_none());
        Ok(())
    }

    #[test]
    fn motion_failures_are_warnings() {
        let (rows, warnings) = extract_motion(&BrokenMotion, &PipelineInput::default(), &[0, 1]);
        assert_eq!(rows.map(|rows| rows.len()), Some(1));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("decoder missing"));
    }

    #[test]
    fn vision_motion_parses_timelines() -> anyhow::Result<()> {
        let stage = VisionMotionStage::new(
            Arc::new(FixedVision(
                "```json\n{\"timelines\": [{\"target\": \"#hero\", \"property\": \"opacity\"}]}\n```",
            )),
            "dryrun-vision-1",
            Canvas::fallback(1440, 900),
        );
        let motion = stage.extract(&video_input(), 0)?;
        assert_eq!(motion.timelines.len(), 1);
        assert_eq!(motion.timelines[0]["property"], json!("opacity"));
        assert!(stage.extract(&video_input(), 3).is_err());
        Ok(())
    }
}

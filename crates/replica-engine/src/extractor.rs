use replica_contracts::events::EventWriter;
use replica_contracts::manifest::Bounds;
use replica_contracts::{AssetMap, UiNode, VisualManifest};
use serde_json::json;

use crate::fanout::bounded_map;
use crate::services::{CropService, SourceImage};
use crate::util::{error_chain_text, map_object};

#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub assets: AssetMap,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
struct CropJob {
    node_id: String,
    file_index: usize,
    bounds: Bounds,
}

/// Crops every node flagged for extraction out of its reference image.
///
/// Each job owns exactly one node id, so results never collide. A failed crop
/// is logged and omitted; it never fails the batch.
pub fn extract_assets(
    manifests: &[VisualManifest],
    sources: &[SourceImage],
    cropper: &dyn CropService,
    concurrency: usize,
    events: &EventWriter,
) -> ExtractionOutcome {
    let mut outcome = ExtractionOutcome::default();
    let mut jobs: Vec<CropJob> = Vec::new();
    for manifest in manifests {
        if let Some(tree) = &manifest.global_theme.dom_tree {
            collect_jobs(tree, &Bounds::FULL, manifest.file_index, &mut jobs, &mut outcome, events);
        }
    }
    if jobs.is_empty() {
        return outcome;
    }

    let source_for = |file_index: usize| {
        sources
            .iter()
            .find(|source| source.file_index == file_index)
            .or_else(|| sources.first())
    };
    if sources.is_empty() {
        outcome.warnings.push(format!(
            "No decoded reference image; skipped {} asset crop(s).",
            jobs.len()
        ));
        return outcome;
    }

    let results = bounded_map(&jobs, concurrency, |job| {
        let Some(source) = source_for(job.file_index) else {
            return Err(anyhow::anyhow!("no reference image for file {}", job.file_index));
        };
        cropper.crop(source, &job.bounds, &job.node_id)
    });

    for (job, result) in jobs.iter().zip(results) {
        match result {
            Ok(url) => {
                events.note(
                    "asset_extracted",
                    map_object(json!({
                        "node_id": job.node_id,
                        "file_index": job.file_index,
                        "bounds": job.bounds,
                    })),
                );
                outcome.assets.insert(job.node_id.clone(), url);
            }
            Err(err) => {
                let reason = error_chain_text(&err, 300);
                events.note(
                    "extraction_failed",
                    map_object(json!({ "node_id": job.node_id, "error": reason })),
                );
                outcome.warnings.push(format!(
                    "Asset extraction failed for node '{}': {reason}",
                    job.node_id
                ));
            }
        }
    }
    outcome
}

fn collect_jobs(
    node: &UiNode,
    parent_frame: &Bounds,
    file_index: usize,
    jobs: &mut Vec<CropJob>,
    outcome: &mut ExtractionOutcome,
    events: &EventWriter,
) {
    let absolute = node.bounds.map(|bounds| bounds.within(parent_frame));
    if node.is_flagged_for_crop() {
        let crop_bounds = node.extraction_bounds.or(absolute).filter(Bounds::is_valid);
        match (node.valid_id(), crop_bounds) {
            (Some(id), Some(bounds)) => {
                if let Some(first) = jobs.iter().find(|job| job.node_id == id) {
                    let reason = if first.file_index == file_index {
                        "duplicate id".to_string()
                    } else {
                        format!(
                            "id already claimed by reference file {}, asset keys are shared across files",
                            first.file_index
                        )
                    };
                    skip(node, &reason, outcome, events);
                } else {
                    jobs.push(CropJob {
                        node_id: id.to_string(),
                        file_index,
                        bounds,
                    });
                }
            }
            (None, _) => skip(node, "missing id", outcome, events),
            (Some(_), None) => skip(node, "missing bounds", outcome, events),
        }
    }
    let frame = absolute.unwrap_or(*parent_frame);
    for child in node.children() {
        collect_jobs(child, &frame, file_index, jobs, outcome, events);
    }
}

fn skip(node: &UiNode, reason: &str, outcome: &mut ExtractionOutcome, events: &EventWriter) {
    let label = node.valid_id().unwrap_or(node.tag());
    events.note(
        "extraction_skipped",
        map_object(json!({ "node": label, "reason": reason })),
    );
    outcome
        .warnings
        .push(format!("Skipped asset extraction for '{label}': {reason}."));
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;
    use image::{DynamicImage, Rgb, RgbImage};
    use replica_contracts::events::{drain_types, EventWriter};
    use replica_contracts::manifest::{Bounds, Canvas, ExtractionAction, ImageRef};
    use replica_contracts::{UiNode, VisualManifest};

    use super::extract_assets;
    use crate::services::{CropService, SourceImage};

    struct RecordingCropper {
        fail_on: &'static str,
        seen: Mutex<Vec<(String, Bounds)>>,
    }

    impl CropService for RecordingCropper {
        fn crop(&self, _source: &SourceImage, bounds: &Bounds, key: &str) -> anyhow::Result<String> {
            self.seen.lock().expect("lock").push((key.to_string(), *bounds));
            if key == self.fail_on {
                bail!("storage unavailable");
            }
            Ok(format!("https://cdn.test/{key}.png"))
        }
    }

    fn flagged(id: Option<&str>, extraction: Option<Bounds>) -> UiNode {
        let mut node = UiNode::new("div");
        node.id = id.map(str::to_string);
        node.has_custom_visual = true;
        node.extraction_action = Some(ExtractionAction::Crop);
        node.extraction_bounds = extraction;
        node
    }

    fn manifest(tree: UiNode) -> VisualManifest {
        let mut manifest = VisualManifest::empty(
            0,
            ImageRef {
                file_uri: "ref://0".to_string(),
                mime_type: "image/png".to_string(),
            },
            Canvas::measured(400, 300),
        );
        manifest.global_theme.dom_tree = Some(tree);
        manifest
    }

    fn source() -> SourceImage {
        SourceImage {
            file_index: 0,
            mime_type: "image/png".to_string(),
            image: DynamicImage::ImageRgb8(RgbImage::new(400, 300)),
        }
    }

    #[test]
    fn failures_and_skips_are_isolated() {
        let tree = UiNode::new("div")
            .with_id("root")
            .with_child(flagged(Some("logo"), Some(Bounds::new(2.0, 2.0, 15.0, 6.0))))
            .with_child(flagged(Some("hero"), Some(Bounds::new(10.0, 0.0, 100.0, 40.0))))
            .with_child(flagged(None, Some(Bounds::new(0.0, 0.0, 5.0, 5.0))))
            .with_child(flagged(Some("badge"), None));
        let cropper = RecordingCropper {
            fail_on: "logo",
            seen: Mutex::new(Vec::new()),
        };
        let (events, rx) = EventWriter::channel("run");
        let outcome = extract_assets(&[manifest(tree)], &[source()], &cropper, 4, &events);

        assert!(!outcome.assets.contains_key("logo"));
        assert_eq!(
            outcome.assets.get("hero").map(String::as_str),
            Some("https://cdn.test/hero.png")
        );
        assert!(outcome
            .warnings
            .iter()
            .any(|warning| warning.contains("'logo'") && warning.contains("storage unavailable")));
        assert_eq!(outcome.warnings.len(), 3);

        let mut types = drain_types(&rx);
        types.sort();
        assert_eq!(
            types,
            vec![
                "asset_extracted",
                "extraction_failed",
                "extraction_skipped",
                "extraction_skipped"
            ]
        );
    }

    #[test]
    fn relative_bounds_are_composed_when_extraction_bounds_are_absent() {
        let mut child = flagged(Some("icon"), None);
        child.bounds = Some(Bounds::new(50.0, 50.0, 50.0, 50.0));
        let tree = UiNode::new("section")
            .with_bounds(Bounds::new(0.0, 0.0, 50.0, 20.0))
            .with_child(child);
        let cropper = RecordingCropper {
            fail_on: "",
            seen: Mutex::new(Vec::new()),
        };
        let events = EventWriter::new("run");
        let outcome = extract_assets(&[manifest(tree)], &[source()], &cropper, 1, &events);
        assert_eq!(outcome.assets.len(), 1);
        let seen = cropper.seen.lock().expect("lock");
        assert_eq!(seen[0].1, Bounds::new(10.0, 25.0, 25.0, 10.0));
    }

    #[test]
    fn id_collisions_across_files_name_the_first_file() {
        let first = manifest(flagged(Some("logo"), Some(Bounds::new(1.0, 1.0, 10.0, 10.0))));
        let mut second = manifest(flagged(Some("logo"), Some(Bounds::new(5.0, 5.0, 10.0, 10.0))));
        second.file_index = 1;
        let cropper = RecordingCropper {
            fail_on: "",
            seen: Mutex::new(Vec::new()),
        };
        let outcome = extract_assets(&[first, second], &[source()], &cropper, 2, &EventWriter::new("run"));
        assert_eq!(outcome.assets.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("'logo'"));
        assert!(outcome.warnings[0].contains("reference file 0"));
        assert_eq!(cropper.seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn missing_source_skips_every_crop() {
        let tree = flagged(Some("logo"), Some(Bounds::new(1.0, 1.0, 1.0, 1.0)));
        let cropper = RecordingCropper {
            fail_on: "",
            seen: Mutex::new(Vec::new()),
        };
        let outcome = extract_assets(&[manifest(tree)], &[], &cropper, 2, &EventWriter::new("run"));
        assert!(outcome.assets.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(cropper.seen.lock().expect("lock").is_empty());
    }
}

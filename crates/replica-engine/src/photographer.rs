use replica_contracts::events::EventWriter;
use replica_contracts::strategy::AssetTarget;
use replica_contracts::{AssetMap, AssetRequest, PipelineInput};
use serde_json::json;

use crate::fanout::bounded_map;
use crate::imaging::decode_reference;
use crate::services::{AssetStore, ImageGenRequest, ImageGenService, InlineImage};
use crate::util::{error_chain_text, map_object};

#[derive(Debug, Clone, Default)]
pub struct GenerationOutcome {
    pub assets: AssetMap,
    pub warnings: Vec<String>,
}

/// Synthesizes every requested asset. Requests are independent: a failure
/// skips that asset with a warning and the rest continue.
pub fn generate_assets(
    requests: &[AssetRequest],
    input: &PipelineInput,
    service: &dyn ImageGenService,
    model: &str,
    store: &dyn AssetStore,
    concurrency: usize,
    events: &EventWriter,
) -> GenerationOutcome {
    let results = bounded_map(requests, concurrency, |request| {
        let target = request.target();
        let generated = service.generate(&ImageGenRequest {
            model: model.to_string(),
            prompt: asset_prompt(request, target),
            size: target.size_hint().to_string(),
            target,
            reference: reference_image(input, request.reference_file),
        })?;
        store.put(&request.name, &generated.bytes, &generated.mime_type)
    });

    let mut outcome = GenerationOutcome::default();
    for (request, result) in requests.iter().zip(results) {
        match result {
            Ok(url) => {
                events.note(
                    "asset_generated",
                    map_object(json!({
                        "name": request.name,
                        "target": request.target(),
                    })),
                );
                outcome.assets.insert(request.name.clone(), url);
            }
            Err(err) => {
                let reason = error_chain_text(&err, 300);
                events.note(
                    "asset_generation_failed",
                    map_object(json!({ "name": request.name, "error": reason })),
                );
                outcome.warnings.push(format!(
                    "Asset generation failed for '{}': {reason}",
                    request.name
                ));
            }
        }
    }
    outcome
}

fn asset_prompt(request: &AssetRequest, target: AssetTarget) -> String {
    let subject = request.name.replace(['-', '_'], " ");
    let framing = match target {
        AssetTarget::Icon => "a clean, centered mark on a plain background, no text",
        AssetTarget::Background => "a wide background image with calm areas for overlaid text",
        AssetTarget::Avatar => "a friendly head-and-shoulders portrait, softly lit",
        AssetTarget::Product => "a studio product photograph on a neutral backdrop",
        AssetTarget::Illustration => "a flat editorial illustration",
    };
    let mut prompt = format!("{subject}: {framing}.");
    if !request.vibe.trim().is_empty() {
        prompt.push_str(&format!(" Mood: {}.", request.vibe.trim()));
    }
    if !request.keywords.is_empty() {
        prompt.push_str(&format!(" Keywords: {}.", request.keywords.join(", ")));
    }
    prompt
}

fn reference_image(input: &PipelineInput, file_index: Option<usize>) -> Option<InlineImage> {
    let file = input.files.get(file_index?).filter(|file| file.is_image())?;
    let bytes = decode_reference(file).ok()?;
    Some(InlineImage::new(bytes, file.mime_type.clone()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use replica_contracts::events::{drain_types, EventWriter};
    use replica_contracts::strategy::AssetTarget;
    use replica_contracts::{AssetRequest, PipelineInput};

    use super::{asset_prompt, generate_assets};
    use crate::providers::InlineAssetStore;
    use crate::services::{GeneratedImage, ImageGenRequest, ImageGenService};

    struct FlakyImages {
        calls: AtomicUsize,
    }

    impl ImageGenService for FlakyImages {
        fn name(&self) -> &str {
            "flaky"
        }

        fn generate(&self, request: &ImageGenRequest) -> anyhow::Result<GeneratedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.prompt.starts_with("avatar") {
                bail!("safety filter");
            }
            Ok(GeneratedImage {
                bytes: vec![1, 2, 3],
                mime_type: "image/png".to_string(),
            })
        }
    }

    #[test]
    fn failed_assets_are_skipped_with_a_warning() {
        let requests = vec![
            AssetRequest::new("hero-image", "sunset"),
            AssetRequest::new("avatar", "warm"),
            AssetRequest::new("product-shot", ""),
        ];
        let service = FlakyImages {
            calls: AtomicUsize::new(0),
        };
        let (events, rx) = EventWriter::channel("run");
        let outcome = generate_assets(
            &requests,
            &PipelineInput::default(),
            &service,
            "dryrun-image-1",
            &InlineAssetStore,
            1,
            &events,
        );
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
        let keys: Vec<&String> = outcome.assets.keys().collect();
        assert_eq!(keys, vec!["hero-image", "product-shot"]);
        assert_eq!(
            outcome.warnings,
            vec!["Asset generation failed for 'avatar': safety filter"]
        );
        assert_eq!(
            drain_types(&rx),
            vec!["asset_generated", "asset_generation_failed", "asset_generated"]
        );
    }

    #[test]
    fn prompt_reflects_target_and_vibe() {
        let mut request = AssetRequest::new("hero_background", "moody dusk");
        request.keywords = vec!["city".to_string()];
        let prompt = asset_prompt(&request, AssetTarget::Background);
        assert!(prompt.starts_with("hero background: a wide background image"));
        assert!(prompt.contains("Mood: moody dusk."));
        assert!(prompt.contains("Keywords: city."));
    }
}

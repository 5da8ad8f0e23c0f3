//! Concrete implementations of the service traits.

mod dryrun;
mod gemini;
mod render;
mod storage;

use std::sync::Arc;

use replica_contracts::models::{Capability, ModelRegistry};
use replica_contracts::PipelineError;

pub use dryrun::{
    render_tree_html, DryrunCodeService, DryrunImageService, DryrunTextService,
    DryrunVisionService,
};
pub use gemini::GeminiClient;
pub use render::CommandRenderer;
pub use storage::{InlineAssetStore, LocalAssetStore, LocalCropper};

use crate::config::PipelineConfig;
use crate::services::{
    AssetStore, CodeService, ImageGenService, MotionStage, RenderService, Services,
    StructureStage, TextService, VisionService,
};
use crate::stages::{OutlineArchitect, VisionMotionStage};

/// Wires the service set for `config`: offline dryrun services or the Gemini
/// client, plus local storage, cropping, rendering and the optional stages.
pub fn build_services(config: &PipelineConfig, dryrun: bool) -> Result<Services, PipelineError> {
    let store: Arc<dyn AssetStore> = match &config.asset_dir {
        Some(dir) => Arc::new(LocalAssetStore::new(dir, config.asset_base_url.clone())),
        None => Arc::new(InlineAssetStore),
    };
    let (vision, code, images, text): (
        Arc<dyn VisionService>,
        Arc<dyn CodeService>,
        Arc<dyn ImageGenService>,
        Arc<dyn TextService>,
    ) = if dryrun {
        (
            Arc::new(DryrunVisionService) as Arc<dyn VisionService>,
            Arc::new(DryrunCodeService) as Arc<dyn CodeService>,
            Arc::new(DryrunImageService) as Arc<dyn ImageGenService>,
            Arc::new(DryrunTextService) as Arc<dyn TextService>,
        )
    } else {
        let client = Arc::new(GeminiClient::from_env()?);
        (
            client.clone() as Arc<dyn VisionService>,
            client.clone() as Arc<dyn CodeService>,
            client.clone() as Arc<dyn ImageGenService>,
            client as Arc<dyn TextService>,
        )
    };

    let renderer = match config.render_command.as_deref() {
        Some(command) => {
            let renderer = CommandRenderer::new(command)
                .map_err(|err| PipelineError::Configuration(format!("{err:#}")))?;
            Some(Arc::new(renderer) as Arc<dyn RenderService>)
        }
        None => None,
    };
    let architect = config
        .architect_enabled
        .then(|| Arc::new(OutlineArchitect) as Arc<dyn StructureStage>);
    let physicist = config.physicist_enabled.then(|| {
        let model = config
            .vision_model
            .clone()
            .or_else(|| default_model(vision.name(), Capability::Vision))
            .unwrap_or_else(|| vision.name().to_string());
        Arc::new(VisionMotionStage::new(
            vision.clone(),
            model,
            config.fallback_canvas(),
        )) as Arc<dyn MotionStage>
    });

    Ok(Services {
        vision,
        code,
        images,
        cropper: Arc::new(LocalCropper::new(store.clone())),
        store,
        text: config.router_model.is_some().then_some(text),
        renderer,
        architect,
        physicist,
    })
}

fn default_model(provider: &str, capability: Capability) -> Option<String> {
    ModelRegistry::new(None)
        .by_capability(capability, Some(provider))
        .into_iter()
        .next()
        .map(|model| model.name)
}

/// Parses a `WIDTHxHEIGHT` hint, falling back to 1024×1024.
pub(crate) fn parse_dims(size: &str) -> (u32, u32) {
    let normalized = size.trim().to_ascii_lowercase();
    let Some((width, height)) = normalized.split_once('x') else {
        return (1024, 1024);
    };
    match (width.trim().parse::<u32>(), height.trim().parse::<u32>()) {
        (Ok(width), Ok(height)) if width > 0 && height > 0 => (width, height),
        _ => (1024, 1024),
    }
}

pub(crate) fn extension_for_mime(mime_type: &str) -> &'static str {
    let lowered = mime_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        "jpg"
    } else if lowered.contains("webp") {
        "webp"
    } else if lowered.contains("gif") {
        "gif"
    } else {
        "png"
    }
}

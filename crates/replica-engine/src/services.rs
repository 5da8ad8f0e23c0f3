//! Opaque capability boundary. The pipeline only ever talks to these traits;
//! concrete network or local implementations live under `providers`.

use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use replica_contracts::manifest::{Bounds, Canvas};
use replica_contracts::result::{MotionData, OutputFile};
use replica_contracts::strategy::AssetTarget;
use replica_contracts::{PipelineInput, VisualManifest};
use serde_json::Value;

use crate::builder::BuildBrief;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl InlineImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }
}

#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub model: String,
    pub prompt: String,
    pub image: InlineImage,
    pub canvas: Canvas,
}

pub trait VisionService: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the model's raw text; parsing is the caller's job.
    fn analyze(&self, request: &VisionRequest) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
}

pub trait TextService: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &TextRequest) -> Result<String>;
}

pub trait CodeService: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, brief: &BuildBrief) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ImageGenRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
    pub target: AssetTarget,
    pub reference: Option<InlineImage>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub trait ImageGenService: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageGenRequest) -> Result<GeneratedImage>;
}

/// Decoded canonical reference image.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub file_index: usize,
    pub mime_type: String,
    pub image: DynamicImage,
}

pub trait CropService: Send + Sync {
    /// Crops `bounds` (canvas percentages) from `source`, stores it under
    /// `key` and returns its URL.
    fn crop(&self, source: &SourceImage, bounds: &Bounds, key: &str) -> Result<String>;
}

pub trait AssetStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<String>;
}

pub trait RenderService: Send + Sync {
    fn name(&self) -> &str;
    /// Renders the file set at the canvas size and returns the screenshot.
    fn render(&self, files: &[OutputFile], canvas: &Canvas) -> Result<DynamicImage>;
}

/// Structure synthesis ahead of the Builder (Architect).
pub trait StructureStage: Send + Sync {
    fn name(&self) -> &str;
    fn synthesize(&self, input: &PipelineInput, manifests: &[VisualManifest]) -> Result<Value>;
}

/// Motion extraction from video references (Physicist).
pub trait MotionStage: Send + Sync {
    fn name(&self) -> &str;
    fn extract(&self, input: &PipelineInput, file_index: usize) -> Result<MotionData>;
}

/// Everything the pipeline calls out to, constructed once at the call site.
#[derive(Clone)]
pub struct Services {
    pub vision: Arc<dyn VisionService>,
    pub code: Arc<dyn CodeService>,
    pub images: Arc<dyn ImageGenService>,
    pub cropper: Arc<dyn CropService>,
    pub store: Arc<dyn AssetStore>,
    /// Backs the Router when a router model is configured.
    pub text: Option<Arc<dyn TextService>>,
    /// Healing is skipped without a renderer.
    pub renderer: Option<Arc<dyn RenderService>>,
    pub architect: Option<Arc<dyn StructureStage>>,
    pub physicist: Option<Arc<dyn MotionStage>>,
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::{Canvas, VisualManifest};
use crate::strategy::RoutingStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub content: String,
}

impl OutputFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn is_html(&self) -> bool {
        let lowered = self.path.to_ascii_lowercase();
        lowered.ends_with(".html") || lowered.ends_with(".htm")
    }
}

/// Per-stage wall time in milliseconds. Optional stages are absent when they
/// did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepTimings {
    pub router: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surveyor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photographer: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architect: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physicist: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<u64>,
    pub builder: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healing: Option<u64>,
}

/// Motion data extracted from a video reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionData {
    pub file_index: usize,
    #[serde(default)]
    pub canvas: Option<Canvas>,
    #[serde(default)]
    pub timelines: Vec<Value>,
}

/// Terminal artifact returned to the caller. Always populated, even under
/// partial failure; `warnings` lists every degradation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub files: Vec<OutputFile>,
    pub strategy: RoutingStrategy,
    pub manifests: Vec<VisualManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physics: Option<Vec<MotionData>>,
    pub warnings: Vec<String>,
    pub step_timings: StepTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fidelity: Option<f64>,
}

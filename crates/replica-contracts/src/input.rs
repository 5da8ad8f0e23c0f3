use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One uploaded reference (image or video), carried as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceFile {
    pub base64: String,
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
}

impl ReferenceFile {
    pub fn is_image(&self) -> bool {
        self.mime_type.trim().to_ascii_lowercase().starts_with("image/")
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.trim().to_ascii_lowercase().starts_with("video/")
    }

    /// Base64 payload without a `data:<mime>;base64,` prefix.
    pub fn payload(&self) -> &str {
        let trimmed = self.base64.trim();
        match trimmed.split_once(";base64,") {
            Some((head, rest)) if head.starts_with("data:") => rest,
            _ => trimmed,
        }
    }
}

/// Request accepted by the pipeline. Immutable for the pipeline's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInput {
    #[serde(default)]
    pub files: Vec<ReferenceFile>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_context: Option<Map<String, Value>>,
}

impl PipelineInput {
    pub fn has_instructions(&self) -> bool {
        !self.instructions.trim().is_empty()
    }

    pub fn has_current_code(&self) -> bool {
        self.current_code
            .as_deref()
            .map(|code| !code.trim().is_empty())
            .unwrap_or(false)
    }

    /// Index of the first image reference. The pipeline treats it as the
    /// canonical original for cropping and fidelity comparison.
    pub fn canonical_image_index(&self) -> Option<usize> {
        self.files.iter().position(ReferenceFile::is_image)
    }

    pub fn image_indices(&self) -> Vec<usize> {
        self.files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.is_image())
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn video_indices(&self) -> Vec<usize> {
        self.files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.is_video())
            .map(|(idx, _)| idx)
            .collect()
    }
}

mod autofix;
mod node;

pub use autofix::{apply_auto_fix, is_valid_svg_path, AutoFixNote, AutoFixRule, LARGE_ICON_THRESHOLD_PCT};
pub use node::{Bounds, Element, ExtractionAction, IconFields, UiNode, VisualCategory, VoidTag};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanvasSource {
    Measured,
    Fallback,
}

/// Canvas size in pixels. A measured canvas is the single source of truth for
/// sizing downstream and is never re-estimated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub source: CanvasSource,
    pub aspect_ratio: f64,
}

impl Canvas {
    pub fn measured(width: u32, height: u32) -> Self {
        Self::with_source(width, height, CanvasSource::Measured)
    }

    pub fn fallback(width: u32, height: u32) -> Self {
        Self::with_source(width, height, CanvasSource::Fallback)
    }

    fn with_source(width: u32, height: u32, source: CanvasSource) -> Self {
        let aspect_ratio = if height == 0 {
            0.0
        } else {
            ((width as f64 / height as f64) * 10_000.0).round() / 10_000.0
        };
        Self {
            width,
            height,
            source,
            aspect_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub file_uri: String,
    pub mime_type: String,
}

/// Entry of the flat asset-needs list. Models emit either a bare name or an
/// object; both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetNeed {
    Named(String),
    Detailed {
        #[serde(alias = "id")]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl AssetNeed {
    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Detailed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GlobalTheme {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_tree: Option<UiNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<AssetNeed>,
}

impl GlobalTheme {
    pub fn is_empty(&self) -> bool {
        self.dom_tree.is_none() && self.assets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualManifest {
    pub file_index: usize,
    #[serde(rename = "originalImageRef")]
    pub original_image_ref: ImageRef,
    pub canvas: Canvas,
    #[serde(default)]
    pub global_theme: GlobalTheme,
    #[serde(default)]
    pub measured_components: Vec<Value>,
}

impl VisualManifest {
    /// Manifest with no structure: used when the vision response cannot be
    /// parsed or the vision call fails.
    pub fn empty(file_index: usize, original_image_ref: ImageRef, canvas: Canvas) -> Self {
        Self {
            file_index,
            original_image_ref,
            canvas,
            global_theme: GlobalTheme::default(),
            measured_components: Vec::new(),
        }
    }

    /// A tree counts as structure once the root carries something to build
    /// from: children, styles, text or a crop flag. A bare root does not.
    pub fn has_structure(&self) -> bool {
        self.global_theme
            .dom_tree
            .as_ref()
            .map(|tree| {
                !tree.children().is_empty()
                    || !tree.styles.is_empty()
                    || tree.text.as_deref().is_some_and(|text| !text.trim().is_empty())
                    || tree.is_flagged_for_crop()
            })
            .unwrap_or(false)
    }

    /// Distinct literal hex colours used anywhere in the tree's styles,
    /// lowercased, in first-seen order.
    pub fn hex_colors(&self) -> Vec<String> {
        let mut colors = Vec::new();
        if let Some(tree) = &self.global_theme.dom_tree {
            tree.walk(&mut |node| {
                for value in node.styles.values() {
                    if let Some(text) = value.as_str() {
                        for color in extract_hex_colors(text) {
                            if !colors.contains(&color) {
                                colors.push(color);
                            }
                        }
                    }
                }
            });
        }
        colors
    }
}

/// Finds `#rgb`, `#rrggbb` and `#rrggbbaa` literals in a CSS value.
pub fn extract_hex_colors(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'#' {
            idx += 1;
            continue;
        }
        let start = idx + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        let len = end - start;
        let terminated = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if terminated && matches!(len, 3 | 6 | 8) {
            out.push(format!("#{}", text[start..end].to_ascii_lowercase()));
        }
        idx = end.max(idx + 1);
    }
    out
}

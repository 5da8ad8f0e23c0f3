//! Offline, deterministic stand-ins for the model-backed services.

use anyhow::{Context, Result};
use image::{DynamicImage, Rgb, RgbImage};
use replica_contracts::assets::asset_placeholder;
use replica_contracts::manifest::{is_valid_svg_path, Canvas, UiNode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::builder::BuildBrief;
use crate::imaging::{encode_png, image_stats, load_image};
use crate::services::{
    CodeService, GeneratedImage, ImageGenRequest, ImageGenService, TextRequest, TextService,
    VisionRequest, VisionService,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunVisionService;

impl VisionService for DryrunVisionService {
    fn name(&self) -> &str {
        "dryrun"
    }

    /// Derives a header/content/footer skeleton coloured with the image's
    /// dominant palette.
    fn analyze(&self, request: &VisionRequest) -> Result<String> {
        let image = load_image(&request.image.bytes)?;
        let stats = image_stats(&image);
        let color = |idx: usize| {
            stats
                .palette
                .get(idx)
                .or_else(|| stats.palette.first())
                .cloned()
                .unwrap_or_else(|| "#ffffff".to_string())
        };
        let ink = if stats.brightness > 0.5 { "#111111" } else { "#f5f5f5" };
        let tree = json!({
            "dom_tree": {
                "type": "div",
                "id": "root",
                "bounds": {"top": 0, "left": 0, "width": 100, "height": 100},
                "styles": {"backgroundColor": color(0), "color": ink},
                "children": [
                    {
                        "type": "header",
                        "id": "header",
                        "bounds": {"top": 0, "left": 0, "width": 100, "height": 12},
                        "styles": {"backgroundColor": color(1), "padding": "16px 24px"},
                        "children": [
                            {
                                "type": "div",
                                "id": "logo",
                                "visualCategory": "logo",
                                "bounds": {"top": 20, "left": 2, "width": 12, "height": 60},
                                "styles": {}
                            },
                            {
                                "type": "nav",
                                "id": "nav",
                                "text": "Menu",
                                "bounds": {"top": 30, "left": 70, "width": 28, "height": 40},
                                "styles": {"color": ink}
                            }
                        ]
                    },
                    {
                        "type": "main",
                        "id": "content",
                        "bounds": {"top": 12, "left": 0, "width": 100, "height": 76},
                        "styles": {"backgroundColor": color(0)},
                        "children": [
                            {
                                "type": "h1",
                                "id": "headline",
                                "text": "Headline",
                                "bounds": {"top": 10, "left": 5, "width": 60, "height": 10},
                                "styles": {"color": ink, "fontSize": "40px"}
                            }
                        ]
                    },
                    {
                        "type": "footer",
                        "id": "footer",
                        "bounds": {"top": 88, "left": 0, "width": 100, "height": 12},
                        "styles": {"backgroundColor": color(2)}
                    }
                ]
            },
            "assets": []
        });
        Ok(tree.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunTextService;

impl TextService for DryrunTextService {
    fn name(&self) -> &str {
        "dryrun"
    }

    /// An empty plan: the Router keeps its heuristic decisions.
    fn complete(&self, _request: &TextRequest) -> Result<String> {
        Ok("{}".to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunCodeService;

impl CodeService for DryrunCodeService {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, brief: &BuildBrief) -> Result<String> {
        let surveyed = brief.manifests.iter().find_map(|manifest| {
            manifest
                .global_theme
                .dom_tree
                .as_ref()
                .map(|tree| (tree, manifest.canvas))
        });
        let content = if let Some((tree, canvas)) = surveyed {
            render_tree_html(tree, &canvas)
        } else if let Some(code) = brief.current_code.as_deref() {
            format!(
                "{}\n<!-- edit: {} -->\n",
                code.trim_end(),
                escape_html(brief.instructions.trim())
            )
        } else {
            let mut body = format!("<h1>{}</h1>\n", escape_html(brief.instructions.trim()));
            for key in brief.assets.keys() {
                body.push_str(&format!(
                    "<img alt=\"{}\" src=\"{}\">\n",
                    escape_html(key),
                    asset_placeholder(key)
                ));
            }
            document(&body)
        };
        Ok(json!({ "files": [{ "path": "index.html", "content": content }] }).to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunImageService;

impl ImageGenService for DryrunImageService {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ImageGenRequest) -> Result<GeneratedImage> {
        let (width, height) = super::parse_dims(&request.size);
        let (r, g, b) = color_from_prompt(&request.prompt);
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([r, g, b])));
        let bytes = encode_png(&image).context("dryrun swatch encode failed")?;
        Ok(GeneratedImage {
            bytes,
            mime_type: "image/png".to_string(),
        })
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Renders a manifest tree as absolutely positioned HTML, copying every style
/// value verbatim. Nodes flagged for extraction reference their asset
/// placeholder.
pub fn render_tree_html(tree: &UiNode, canvas: &Canvas) -> String {
    let mut body = format!(
        "<div style=\"position:relative;width:{}px;height:{}px;overflow:hidden\">\n",
        canvas.width, canvas.height
    );
    render_node(tree, &mut body, 1);
    body.push_str("</div>\n");
    document(&body)
}

fn render_node(node: &UiNode, out: &mut String, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut style = String::new();
    if let Some(bounds) = node.bounds {
        style.push_str(&format!(
            "position:absolute;top:{}%;left:{}%;width:{}%;height:{}%;",
            bounds.top, bounds.left, bounds.width, bounds.height
        ));
    }
    for (key, value) in &node.styles {
        let literal = match value {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            _ => continue,
        };
        style.push_str(&format!("{}:{};", kebab_case(key), literal));
    }
    let id_attr = node
        .valid_id()
        .map(|id| format!(" id=\"{}\"", escape_html(id)))
        .unwrap_or_default();
    let style_attr = escape_html(&style);
    let asset = node
        .is_flagged_for_crop()
        .then(|| node.valid_id())
        .flatten()
        .map(asset_placeholder);

    if node.is_void() {
        let src = asset
            .map(|url| format!(" src=\"{url}\""))
            .unwrap_or_default();
        out.push_str(&format!(
            "{indent}<{}{id_attr}{src} style=\"{style_attr}\">\n",
            node.tag()
        ));
        return;
    }

    out.push_str(&format!(
        "{indent}<{}{id_attr} style=\"{style_attr}\">\n",
        node.tag()
    ));
    if let Some(url) = asset {
        out.push_str(&format!(
            "{indent}  <img src=\"{url}\" alt=\"\" style=\"width:100%;height:100%;object-fit:cover\">\n"
        ));
    } else if is_valid_svg_path(node.icon.svg_path.as_deref()) {
        out.push_str(&format!(
            "{indent}  <svg viewBox=\"{}\" width=\"100%\" height=\"100%\"><path d=\"{}\" fill=\"{}\"/></svg>\n",
            escape_html(node.icon.view_box.as_deref().unwrap_or("0 0 24 24")),
            escape_html(node.icon.svg_path.as_deref().unwrap_or_default()),
            escape_html(node.icon.fill.as_deref().unwrap_or("currentColor")),
        ));
    }
    if let Some(text) = node.text.as_deref() {
        out.push_str(&format!("{indent}  {}\n", escape_html(text)));
    }
    for child in node.children() {
        render_node(child, out, depth + 1);
    }
    out.push_str(&format!("{indent}</{}>\n", node.tag()));
}

fn document(body: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>body{{margin:0}}</style>\n</head>\n<body>\n{body}</body>\n</html>\n"
    )
}

fn kebab_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

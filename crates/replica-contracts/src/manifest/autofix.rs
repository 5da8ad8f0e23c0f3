//! Deterministic corrections layered over the vision model's element tree.
//!
//! The pass is a pure transform: it returns a new tree and never mutates its
//! input. Applying it to its own output is a no-op.

use super::node::{Bounds, ExtractionAction, UiNode};

/// A failed vector trace at or above this share of the canvas (in either
/// dimension, percent) is cropped from the reference instead.
pub const LARGE_ICON_THRESHOLD_PCT: f64 = 4.0;

const SVG_MIN_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoFixRule {
    /// Logo, brand icon or decorative graphic forced to crop extraction.
    BrandCategory,
    /// Icon with an unusable vector path that is too large to fake.
    LargeBrokenIcon,
    /// Image content (img tag, hasImage, background-image) forced to crop.
    ImageContent,
    /// Image content without geometry; left as is.
    ImageWithoutBounds,
}

impl AutoFixRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BrandCategory => "brand_category",
            Self::LargeBrokenIcon => "large_broken_icon",
            Self::ImageContent => "image_content",
            Self::ImageWithoutBounds => "image_without_bounds",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoFixNote {
    pub rule: AutoFixRule,
    pub node_id: Option<String>,
    pub tag: String,
}

/// A usable path starts with a move command, is at least ten characters long
/// and contains at least one further drawing command.
pub fn is_valid_svg_path(path: Option<&str>) -> bool {
    let Some(path) = path.map(str::trim) else {
        return false;
    };
    if path.len() < SVG_MIN_LEN {
        return false;
    }
    let mut chars = path.chars();
    if !matches!(chars.next(), Some('M' | 'm')) {
        return false;
    }
    chars.any(|ch| "LlHhVvCcSsQqTtAaZz".contains(ch))
}

pub fn apply_auto_fix(tree: &UiNode) -> (UiNode, Vec<AutoFixNote>) {
    let mut notes = Vec::new();
    let fixed = fix_node(tree, &Bounds::FULL, &mut notes);
    (fixed, notes)
}

fn fix_node(node: &UiNode, parent_frame: &Bounds, notes: &mut Vec<AutoFixNote>) -> UiNode {
    let mut out = node.clone();
    let absolute = node.bounds.map(|bounds| bounds.within(parent_frame));

    if node
        .visual_category
        .map(|category| category.requires_crop())
        .unwrap_or(false)
        && force_crop(&mut out, absolute)
    {
        notes.push(note(&out, AutoFixRule::BrandCategory));
    }

    if out.icon.name.is_some() && !is_valid_svg_path(out.icon.svg_path.as_deref()) {
        let large = absolute
            .map(|bounds| {
                bounds.width >= LARGE_ICON_THRESHOLD_PCT
                    || bounds.height >= LARGE_ICON_THRESHOLD_PCT
            })
            .unwrap_or(false);
        if large && force_crop(&mut out, absolute) {
            notes.push(note(&out, AutoFixRule::LargeBrokenIcon));
        }
    }

    if (node.is_void() && node.tag() == "img")
        || node.has_image
        || node.background_image_url().is_some()
    {
        match absolute.filter(Bounds::is_valid) {
            Some(bounds) => {
                if force_crop(&mut out, Some(bounds)) {
                    notes.push(note(&out, AutoFixRule::ImageContent));
                }
            }
            None => notes.push(note(&out, AutoFixRule::ImageWithoutBounds)),
        }
    }

    let frame = absolute.unwrap_or(*parent_frame);
    let fixed_children: Vec<UiNode> = node
        .children()
        .iter()
        .map(|child| fix_node(child, &frame, notes))
        .collect();
    for (slot, child) in out.children_mut().iter_mut().zip(fixed_children) {
        *slot = child;
    }
    out
}

/// Flags the node for crop extraction. Returns whether anything changed.
fn force_crop(node: &mut UiNode, absolute: Option<Bounds>) -> bool {
    let extraction_bounds = absolute.or(node.extraction_bounds);
    let changed = !node.has_custom_visual
        || node.extraction_action != Some(ExtractionAction::Crop)
        || node.extraction_bounds != extraction_bounds;
    node.has_custom_visual = true;
    node.extraction_action = Some(ExtractionAction::Crop);
    node.extraction_bounds = extraction_bounds;
    changed
}

fn note(node: &UiNode, rule: AutoFixRule) -> AutoFixNote {
    AutoFixNote {
        rule,
        node_id: node.valid_id().map(str::to_string),
        tag: node.tag().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::{Bounds, ExtractionAction, UiNode, VisualCategory};
    use super::{apply_auto_fix, is_valid_svg_path, AutoFixRule};

    fn icon(id: &str, path: Option<&str>, bounds: Bounds) -> UiNode {
        let mut node = UiNode::new("span").with_id(id).with_bounds(bounds);
        node.icon.name = Some("arrow".to_string());
        node.icon.svg_path = path.map(str::to_string);
        node
    }

    fn sample_tree() -> UiNode {
        UiNode::new("div")
            .with_id("root")
            .with_bounds(Bounds::FULL)
            .with_child(
                UiNode::new("header")
                    .with_id("header")
                    .with_bounds(Bounds::new(0.0, 0.0, 100.0, 10.0))
                    .with_child(
                        UiNode::new("div")
                            .with_id("logo")
                            .with_category(VisualCategory::Logo)
                            .with_bounds(Bounds::new(20.0, 2.0, 15.0, 60.0)),
                    )
                    .with_child(icon("small-icon", Some("bogus"), Bounds::new(0.0, 90.0, 2.0, 20.0))),
            )
            .with_child(icon("big-icon", None, Bounds::new(20.0, 10.0, 30.0, 30.0)))
            .with_child(icon(
                "traced-icon",
                Some("M10 10 L20 20 Z"),
                Bounds::new(60.0, 10.0, 30.0, 30.0),
            ))
            .with_child(UiNode::new("img").with_id("photo"))
            .with_child(
                UiNode::new("section")
                    .with_id("hero")
                    .with_bounds(Bounds::new(50.0, 0.0, 100.0, 50.0))
                    .with_style("backgroundImage", "url(hero.png)"),
            )
    }

    fn find<'a>(tree: &'a UiNode, id: &str) -> &'a UiNode {
        let mut found = None;
        tree.walk(&mut |node| {
            if node.valid_id() == Some(id) {
                found = Some(node);
            }
        });
        found.unwrap_or_else(|| panic!("node {id} missing"))
    }

    #[test]
    fn brand_categories_are_forced_to_crop() {
        let (fixed, notes) = apply_auto_fix(&sample_tree());
        let logo = find(&fixed, "logo");
        assert!(logo.has_custom_visual);
        assert_eq!(logo.extraction_action, Some(ExtractionAction::Crop));
        // 2..17% horizontally, 2..8% vertically of the canvas.
        assert_eq!(logo.extraction_bounds, Some(Bounds::new(2.0, 2.0, 15.0, 6.0)));
        assert!(notes
            .iter()
            .any(|note| note.rule == AutoFixRule::BrandCategory
                && note.node_id.as_deref() == Some("logo")));

        let mut violations = 0;
        fixed.walk(&mut |node| {
            if node.visual_category.map(|c| c.requires_crop()).unwrap_or(false)
                && !node.is_flagged_for_crop()
            {
                violations += 1;
            }
        });
        assert_eq!(violations, 0);
    }

    #[test]
    fn large_broken_icons_crop_but_small_ones_keep_vector_fallback() {
        let (fixed, _) = apply_auto_fix(&sample_tree());
        assert!(find(&fixed, "big-icon").is_flagged_for_crop());
        // 2% wide and 2% tall of the canvas after composing with the header.
        assert!(!find(&fixed, "small-icon").is_flagged_for_crop());
    }

    #[test]
    fn valid_vector_paths_are_never_cropped_by_size() {
        let (fixed, _) = apply_auto_fix(&sample_tree());
        let traced = find(&fixed, "traced-icon");
        assert!(!traced.has_custom_visual);
        assert_eq!(traced.extraction_action, None);
    }

    #[test]
    fn image_content_needs_geometry() {
        let (fixed, notes) = apply_auto_fix(&sample_tree());
        let hero = find(&fixed, "hero");
        assert!(hero.is_flagged_for_crop());
        assert_eq!(hero.extraction_bounds, Some(Bounds::new(50.0, 0.0, 100.0, 50.0)));

        let photo = find(&fixed, "photo");
        assert!(!photo.is_flagged_for_crop());
        assert!(notes
            .iter()
            .any(|note| note.rule == AutoFixRule::ImageWithoutBounds
                && note.node_id.as_deref() == Some("photo")));
    }

    #[test]
    fn auto_fix_is_idempotent() {
        let tree = sample_tree();
        let (once, _) = apply_auto_fix(&tree);
        let (twice, notes) = apply_auto_fix(&once);
        assert_eq!(once, twice);
        assert!(notes
            .iter()
            .all(|note| note.rule == AutoFixRule::ImageWithoutBounds));
        // Input is untouched.
        assert!(!find(&tree, "logo").has_custom_visual);
    }

    #[test]
    fn svg_path_validation() {
        assert!(is_valid_svg_path(Some("M0 0 L10 10")));
        assert!(is_valid_svg_path(Some("  m 1 1 c 2 2 3 3 4 4")));
        assert!(!is_valid_svg_path(Some("L0 0 L10 10 Z")));
        assert!(!is_valid_svg_path(Some("M0 0 L1")));
        assert!(!is_valid_svg_path(Some("M0 0 10 10 20")));
        assert!(!is_valid_svg_path(None));
    }
}

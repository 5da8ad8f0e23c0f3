use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Normalised bounding box. Every field is a 0–100 percentage: root nodes are
/// relative to the canvas, children to their parent's content box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub const FULL: Bounds = Bounds {
        top: 0.0,
        left: 0.0,
        width: 100.0,
        height: 100.0,
    };

    pub fn new(top: f64, left: f64, width: f64, height: f64) -> Self {
        Self {
            top,
            left,
            width,
            height,
        }
    }

    /// Geometry usable for cropping: finite, non-negative origin, positive size.
    pub fn is_valid(&self) -> bool {
        [self.top, self.left, self.width, self.height]
            .iter()
            .all(|value| value.is_finite())
            && self.top >= 0.0
            && self.left >= 0.0
            && self.width > 0.0
            && self.height > 0.0
    }

    /// Maps a box expressed relative to `parent` into `parent`'s own frame.
    /// Applied from the root down this yields canvas percentages.
    pub fn within(&self, parent: &Bounds) -> Bounds {
        Bounds {
            top: parent.top + self.top * parent.height / 100.0,
            left: parent.left + self.left * parent.width / 100.0,
            width: self.width * parent.width / 100.0,
            height: self.height * parent.height / 100.0,
        }
    }

    /// Lenient reader for model output: accepts numbers or strings such as
    /// `"12.5%"`. Returns `None` unless all four fields parse.
    pub fn from_value(value: &Value) -> Option<Bounds> {
        let obj = value.as_object()?;
        let field = |key: &str| obj.get(key).and_then(percent_value);
        Some(Bounds {
            top: field("top")?,
            left: field("left")?,
            width: field("width")?,
            height: field("height")?,
        })
    }
}

fn percent_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualCategory {
    Photograph,
    Logo,
    BrandIcon,
    DecorativeGraphic,
    SimpleIcon,
    UiChrome,
}

impl VisualCategory {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "photograph" | "photo" => Some(Self::Photograph),
            "logo" => Some(Self::Logo),
            "brand_icon" => Some(Self::BrandIcon),
            "decorative_graphic" => Some(Self::DecorativeGraphic),
            "simple_icon" => Some(Self::SimpleIcon),
            "ui_chrome" => Some(Self::UiChrome),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photograph => "photograph",
            Self::Logo => "logo",
            Self::BrandIcon => "brand_icon",
            Self::DecorativeGraphic => "decorative_graphic",
            Self::SimpleIcon => "simple_icon",
            Self::UiChrome => "ui_chrome",
        }
    }

    /// Brand marks and bespoke graphics cannot be approximated with vectors.
    pub fn requires_crop(&self) -> bool {
        matches!(self, Self::Logo | Self::BrandIcon | Self::DecorativeGraphic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractionAction {
    Crop,
    Generate,
    Vector,
}

impl ExtractionAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "crop" => Some(Self::Crop),
            "generate" => Some(Self::Generate),
            "vector" | "svg" => Some(Self::Vector),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crop => "crop",
            Self::Generate => "generate",
            Self::Vector => "vector",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidTag {
    Img,
    Input,
}

impl VoidTag {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "img" | "image" => Some(Self::Img),
            "input" => Some(Self::Input),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Img => "img",
            Self::Input => "input",
        }
    }
}

/// Element type of a node. Void elements have no child list at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Void(VoidTag),
    Container { tag: String, children: Vec<UiNode> },
}

impl Element {
    pub fn tag(&self) -> &str {
        match self {
            Self::Void(tag) => tag.as_str(),
            Self::Container { tag, .. } => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IconFields {
    pub name: Option<String>,
    pub svg_path: Option<String>,
    pub view_box: Option<String>,
    pub fill: Option<String>,
}

/// One entry of a manifest's element tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireNode", into = "WireNode")]
pub struct UiNode {
    pub id: Option<String>,
    pub element: Element,
    pub bounds: Option<Bounds>,
    pub styles: Map<String, Value>,
    pub interaction_states: Option<Map<String, Value>>,
    pub text: Option<String>,
    pub visual_category: Option<VisualCategory>,
    pub has_image: bool,
    pub has_custom_visual: bool,
    pub extraction_action: Option<ExtractionAction>,
    /// Canvas-relative crop box once the node is flagged for extraction.
    pub extraction_bounds: Option<Bounds>,
    pub icon: IconFields,
}

impl UiNode {
    pub fn new(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        let element = match VoidTag::parse(&tag) {
            Some(void) => Element::Void(void),
            None => Element::Container {
                tag: if tag.is_empty() { "div".to_string() } else { tag },
                children: Vec::new(),
            },
        };
        Self {
            id: None,
            element,
            bounds: None,
            styles: Map::new(),
            interaction_states: None,
            text: None,
            visual_category: None,
            has_image: false,
            has_custom_visual: false,
            extraction_action: None,
            extraction_bounds: None,
            icon: IconFields::default(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_style(mut self, key: &str, value: &str) -> Self {
        self.styles
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    pub fn with_category(mut self, category: VisualCategory) -> Self {
        self.visual_category = Some(category);
        self
    }

    /// Appends a child. Void elements silently refuse children.
    pub fn with_child(mut self, child: UiNode) -> Self {
        if let Element::Container { children, .. } = &mut self.element {
            children.push(child);
        }
        self
    }

    pub fn tag(&self) -> &str {
        self.element.tag()
    }

    pub fn is_void(&self) -> bool {
        matches!(self.element, Element::Void(_))
    }

    pub fn children(&self) -> &[UiNode] {
        match &self.element {
            Element::Void(_) => &[],
            Element::Container { children, .. } => children,
        }
    }

    pub fn children_mut(&mut self) -> &mut [UiNode] {
        match &mut self.element {
            Element::Void(_) => &mut [],
            Element::Container { children, .. } => children,
        }
    }

    pub fn valid_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn is_flagged_for_crop(&self) -> bool {
        self.has_custom_visual && self.extraction_action == Some(ExtractionAction::Crop)
    }

    /// URL inside a `background-image`/`background` style, if any.
    pub fn background_image_url(&self) -> Option<&str> {
        ["backgroundImage", "background-image", "background"]
            .iter()
            .filter_map(|key| self.styles.get(*key).and_then(Value::as_str))
            .find(|value| value.contains("url("))
    }

    /// Pre-order walk over this node and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a UiNode)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    pub fn count(&self) -> usize {
        let mut total = 0;
        self.walk(&mut |_| total += 1);
        total
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bounds: Option<Value>,
    #[serde(default)]
    styles: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interaction_states: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    visual_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_image: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_custom_visual: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extraction_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extraction_bounds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    icon_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    svg_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    view_box: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    children: Option<Vec<Value>>,
}

impl From<WireNode> for UiNode {
    fn from(wire: WireNode) -> Self {
        let mut node = UiNode::new(&wire.kind);
        node.id = wire.id.as_ref().and_then(|value| match value {
            Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
            _ => None,
        });
        node.bounds = wire.bounds.as_ref().and_then(Bounds::from_value);
        node.styles = wire.styles;
        node.interaction_states = wire.interaction_states;
        node.text = wire.text.and_then(|value| match value {
            Value::String(text) => Some(text),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
        node.visual_category = wire.visual_category.as_deref().and_then(VisualCategory::parse);
        node.has_image = wire.has_image.as_ref().and_then(value_as_bool).unwrap_or(false);
        node.has_custom_visual = wire
            .has_custom_visual
            .as_ref()
            .and_then(value_as_bool)
            .unwrap_or(false);
        node.extraction_action = wire.extraction_action.as_deref().and_then(ExtractionAction::parse);
        node.extraction_bounds = wire.extraction_bounds.as_ref().and_then(Bounds::from_value);
        node.icon = IconFields {
            name: wire.icon_name.filter(|value| !value.trim().is_empty()),
            svg_path: wire.svg_path.filter(|value| !value.trim().is_empty()),
            view_box: wire.view_box,
            fill: wire.fill,
        };
        if let Element::Container { children, .. } = &mut node.element {
            // Malformed children are dropped rather than failing the whole tree.
            *children = wire
                .children
                .unwrap_or_default()
                .into_iter()
                .filter(Value::is_object)
                .filter_map(|child| serde_json::from_value::<UiNode>(child).ok())
                .collect();
        }
        node
    }
}

impl From<UiNode> for WireNode {
    fn from(node: UiNode) -> Self {
        let kind = node.tag().to_string();
        let children = match node.element {
            Element::Void(_) => None,
            Element::Container { children, .. } if children.is_empty() => None,
            Element::Container { children, .. } => Some(
                children
                    .into_iter()
                    .filter_map(|child| serde_json::to_value(child).ok())
                    .collect(),
            ),
        };
        WireNode {
            id: node.id.map(Value::String),
            kind,
            bounds: node.bounds.and_then(|bounds| serde_json::to_value(bounds).ok()),
            styles: node.styles,
            interaction_states: node.interaction_states,
            text: node.text.map(Value::String),
            visual_category: node.visual_category.map(|value| value.as_str().to_string()),
            has_image: node.has_image.then_some(Value::Bool(true)),
            has_custom_visual: node.has_custom_visual.then_some(Value::Bool(true)),
            extraction_action: node.extraction_action.map(|value| value.as_str().to_string()),
            extraction_bounds: node
                .extraction_bounds
                .and_then(|bounds| serde_json::to_value(bounds).ok()),
            icon_name: node.icon.name,
            svg_path: node.icon.svg_path,
            view_box: node.icon.view_box,
            fill: node.icon.fill,
            children,
        }
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_f64().map(|raw| raw != 0.0),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

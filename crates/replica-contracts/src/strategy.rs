use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteMode {
    /// No reference image: synthesize from app context and instructions.
    Generate,
    /// Reference image present: measure it and replicate its layout.
    Replicate,
    /// No reference image but existing code to modify.
    Edit,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "GENERATE",
            Self::Replicate => "REPLICATE",
            Self::Edit => "EDIT",
        }
    }

    pub fn uses_vision(&self) -> bool {
        matches!(self, Self::Replicate)
    }
}

/// The element family a synthetic asset is destined for. Inferred from the
/// asset name so the image prompt can be shaped accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetTarget {
    Icon,
    Background,
    Avatar,
    Product,
    Illustration,
}

impl AssetTarget {
    pub fn infer(name: &str) -> Self {
        let lowered = name.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));
        if has(&["logo", "icon", "favicon", "badge"]) {
            Self::Icon
        } else if has(&["hero", "background", "bg", "banner", "backdrop", "cover"]) {
            Self::Background
        } else if has(&["avatar", "profile", "portrait", "headshot"]) {
            Self::Avatar
        } else if has(&["product", "item", "thumbnail"]) {
            Self::Product
        } else {
            Self::Illustration
        }
    }

    /// Generation size hint, `WIDTHxHEIGHT`.
    pub fn size_hint(&self) -> &'static str {
        match self {
            Self::Icon | Self::Avatar => "512x512",
            Self::Background => "1536x864",
            Self::Product => "1024x1024",
            Self::Illustration => "1024x768",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRequest {
    pub name: String,
    #[serde(default)]
    pub vibe: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_file: Option<usize>,
}

impl AssetRequest {
    pub fn new(name: &str, vibe: &str) -> Self {
        Self {
            name: name.to_string(),
            vibe: vibe.to_string(),
            keywords: Vec::new(),
            reference_file: None,
        }
    }

    pub fn target(&self) -> AssetTarget {
        AssetTarget::infer(&self.name)
    }
}

/// Optional stages the strategy asks for. A stage still only runs when it is
/// also enabled in the pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSelection {
    #[serde(default)]
    pub architect: bool,
    #[serde(default)]
    pub physicist: bool,
    #[serde(default = "default_true")]
    pub healing: bool,
}

impl Default for StageSelection {
    fn default() -> Self {
        Self {
            architect: false,
            physicist: false,
            healing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionPlan {
    /// File indices that need pixel measurement by the Surveyor.
    #[serde(default)]
    pub measure_pixels: Vec<usize>,
    /// File indices that need motion extraction.
    #[serde(default)]
    pub extract_physics: Vec<usize>,
    #[serde(default)]
    pub generate_assets: Vec<AssetRequest>,
    #[serde(default)]
    pub stages: StageSelection,
}

/// Produced once by the Router; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingStrategy {
    pub mode: RouteMode,
    pub execution_plan: ExecutionPlan,
    #[serde(default)]
    pub reasoning: String,
}

impl RoutingStrategy {
    pub fn measures(&self, file_index: usize) -> bool {
        self.execution_plan.measure_pixels.contains(&file_index)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AssetRequest, AssetTarget, RouteMode, RoutingStrategy};

    #[test]
    fn target_is_inferred_from_asset_name() {
        assert_eq!(AssetTarget::infer("brand_logo"), AssetTarget::Icon);
        assert_eq!(AssetTarget::infer("Hero-Background"), AssetTarget::Background);
        assert_eq!(AssetTarget::infer("team_avatar_1"), AssetTarget::Avatar);
        assert_eq!(AssetTarget::infer("product_shot"), AssetTarget::Product);
        assert_eq!(AssetTarget::infer("mascot"), AssetTarget::Illustration);
        assert_eq!(AssetRequest::new("footer_icon", "flat").target(), AssetTarget::Icon);
    }

    #[test]
    fn strategy_wire_shape() -> anyhow::Result<()> {
        let strategy: RoutingStrategy = serde_json::from_value(json!({
            "mode": "REPLICATE",
            "execution_plan": {
                "measure_pixels": [0],
                "generate_assets": [{"name": "hero_bg", "vibe": "sunset"}]
            }
        }))?;
        assert_eq!(strategy.mode, RouteMode::Replicate);
        assert!(strategy.measures(0));
        assert!(!strategy.measures(1));
        assert!(strategy.execution_plan.stages.healing);
        assert!(!strategy.execution_plan.stages.physicist);
        assert_eq!(strategy.execution_plan.generate_assets[0].keywords.len(), 0);
        Ok(())
    }
}

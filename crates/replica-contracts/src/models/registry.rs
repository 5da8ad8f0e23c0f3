use indexmap::IndexMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Image understanding (Surveyor).
    Vision,
    /// Code synthesis (Builder).
    Code,
    /// Short text completions (Router).
    Text,
    /// Image generation (Photographer).
    Image,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Code => "code",
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    /// Capable models in registry order, optionally restricted to a provider.
    pub fn by_capability(&self, capability: Capability, provider: Option<&str>) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .filter(|model| provider.map(|name| model.provider == name).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<ModelSpec> {
        self.get(name)
            .filter(|model| model.supports(capability))
            .cloned()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    use Capability::{Code, Image, Text, Vision};

    let mut map = IndexMap::new();
    let mut insert = |name: &str, provider: &str, capabilities: &[Capability], context: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities.to_vec(),
                context_window: context,
            },
        );
    };

    insert("gemini-2.5-pro", "gemini", &[Vision, Code, Text], Some(1_048_576));
    insert("gemini-2.5-flash", "gemini", &[Vision, Code, Text], Some(1_048_576));
    insert("gemini-2.5-flash-lite", "gemini", &[Text], Some(1_048_576));
    insert("gemini-3-pro-preview", "gemini", &[Vision, Code, Text], Some(1_048_576));
    insert("gemini-2.5-flash-image", "gemini", &[Image], None);
    insert("gemini-3-pro-image-preview", "gemini", &[Image], None);
    insert("dryrun-vision-1", "dryrun", &[Vision], None);
    insert("dryrun-code-1", "dryrun", &[Code, Text], Some(8192));
    insert("dryrun-image-1", "dryrun", &[Image], None);

    map
}

#[cfg(test)]
mod tests {
    use super::{Capability, ModelRegistry};

    #[test]
    fn default_registry_filters_by_provider() {
        let registry = ModelRegistry::new(None);
        let dryrun_image = registry.by_capability(Capability::Image, Some("dryrun"));
        assert_eq!(dryrun_image.len(), 1);
        assert_eq!(dryrun_image[0].name, "dryrun-image-1");

        let gemini_vision = registry.by_capability(Capability::Vision, Some("gemini"));
        assert_eq!(gemini_vision[0].name, "gemini-2.5-pro");
        assert!(registry.ensure("gemini-2.5-flash-image", Capability::Vision).is_none());
    }
}

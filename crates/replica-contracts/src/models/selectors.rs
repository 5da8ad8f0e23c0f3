use super::registry::{Capability, ModelRegistry, ModelSpec};
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    /// Set whenever the requested model was not used as-is.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Resolves the model for one pipeline stage. A requested model that is
    /// unknown or lacks the capability falls back to the first capable model
    /// of `provider`; having no capable model at all is a configuration error.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: Capability,
        provider: Option<&str>,
    ) -> Result<ModelSelection, PipelineError> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let fallback_reason = match requested {
            Some(name) => {
                if let Some(model) = self
                    .registry
                    .ensure(name, capability)
                    .filter(|model| provider.map(|p| model.provider == p).unwrap_or(true))
                {
                    return Ok(ModelSelection {
                        model,
                        requested: Some(name.to_string()),
                        fallback_reason: None,
                    });
                }
                Some(format!(
                    "Requested model '{name}' unavailable for capability '{}'.",
                    capability.as_str()
                ))
            }
            None => None,
        };

        let Some(model) = self
            .registry
            .by_capability(capability, provider)
            .into_iter()
            .next()
        else {
            return Err(PipelineError::Configuration(format!(
                "No models available for capability '{}'{}.",
                capability.as_str(),
                provider
                    .map(|name| format!(" from provider '{name}'"))
                    .unwrap_or_default()
            )));
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason,
        })
    }
}

use std::fmt;

use super::registry::{ModelRegistry, ModelSpec, CAPABILITY_IMAGE, CAPABILITY_REMIX};

/// Why the selected model is not the one that was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    Unspecified,
    Unavailable { requested: String },
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::Unspecified => f.write_str("no model requested; using the default"),
            Fallback::Unavailable { requested } => {
                write!(f, "model '{requested}' cannot serve this request")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub fallback: Option<Fallback>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(ModelRegistry::new(None))
    }
}

impl ModelSelector {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    /// Capability a batch needs: remixes need a model that accepts a
    /// reference image.
    pub fn capability_for(remix: bool) -> &'static str {
        if remix {
            CAPABILITY_REMIX
        } else {
            CAPABILITY_IMAGE
        }
    }

    /// Honours `requested` when it names a model with `capability`, otherwise
    /// takes the registry's first model that has it.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> anyhow::Result<ModelSelection> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());
        if let Some(model) = requested.and_then(|name| self.registry.ensure(name, capability)) {
            return Ok(ModelSelection {
                model,
                fallback: None,
            });
        }
        let model = self
            .registry
            .by_capability(capability)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no image model supports '{capability}'"))?;
        let fallback = match requested {
            Some(name) => Fallback::Unavailable {
                requested: name.to_string(),
            },
            None => Fallback::Unspecified,
        };
        Ok(ModelSelection {
            model,
            fallback: Some(fallback),
        })
    }
}

use gemlens_contracts::models::{ModelSelector, NoModelForCapability};
use serde::Serialize;
use tracing::warn;

/// Per-task model overrides, usually from the command line.
#[derive(Debug, Clone, Default)]
pub struct ModelOverrides {
    pub qa: Option<String>,
    pub image: Option<String>,
    pub image_fallback: Option<String>,
    pub edit: Option<String>,
    pub edit_fallback: Option<String>,
    pub detect: Option<String>,
    pub segment: Option<String>,
    pub text: Option<String>,
    pub reasoning: Option<String>,
    pub stream: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskModels {
    pub qa: String,
    pub image: String,
    pub image_fallback: String,
    pub edit: String,
    pub edit_fallback: String,
    pub detect: String,
    pub segment: String,
    pub text: String,
    pub reasoning: String,
    pub stream: String,
}

impl Default for TaskModels {
    fn default() -> Self {
        let flash = "gemini-2.0-flash".to_string();
        let image_gen = "gemini-2.0-flash-exp-image-generation".to_string();
        Self {
            qa: flash.clone(),
            image: image_gen.clone(),
            image_fallback: "imagen-3.0-generate-002".to_string(),
            edit: image_gen,
            edit_fallback: flash.clone(),
            detect: flash.clone(),
            segment: flash.clone(),
            text: flash.clone(),
            reasoning: "gemini-2.5-flash".to_string(),
            stream: flash,
        }
    }
}

impl TaskModels {
    /// Checks every task model (override or default) against the registry.
    /// A model lacking the task's capability is replaced by the registry
    /// default for that capability.
    pub fn resolve(
        selector: &ModelSelector,
        overrides: &ModelOverrides,
    ) -> Result<Self, NoModelForCapability> {
        let defaults = Self::default();
        let pick = |requested: &Option<String>,
                    fallback: &str,
                    capability: &str|
         -> Result<String, NoModelForCapability> {
            let wanted = requested
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(fallback);
            let selection = selector.select(Some(wanted), capability)?;
            if let Some(reason) = selection.fallback_reason.as_deref() {
                warn!(capability, model = %selection.model.name, %reason, "task model replaced");
            }
            Ok(selection.model.name)
        };
        Ok(Self {
            qa: pick(&overrides.qa, &defaults.qa, "vision")?,
            image: pick(&overrides.image, &defaults.image, "image")?,
            image_fallback: pick(&overrides.image_fallback, &defaults.image_fallback, "image")?,
            edit: pick(&overrides.edit, &defaults.edit, "edit")?,
            edit_fallback: pick(&overrides.edit_fallback, &defaults.edit_fallback, "edit")?,
            detect: pick(&overrides.detect, &defaults.detect, "detect")?,
            segment: pick(&overrides.segment, &defaults.segment, "segment")?,
            text: pick(&overrides.text, &defaults.text, "text")?,
            reasoning: pick(&overrides.reasoning, &defaults.reasoning, "reasoning")?,
            stream: pick(&overrides.stream, &defaults.stream, "stream")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use gemlens_contracts::models::ModelSelector;

    use super::{ModelOverrides, TaskModels};

    #[test]
    fn defaults_survive_registry_checks() {
        let resolved = TaskModels::resolve(&ModelSelector::new(None), &ModelOverrides::default())
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(resolved, TaskModels::default());
    }

    #[test]
    fn incapable_override_is_replaced() {
        let overrides = ModelOverrides {
            detect: Some("imagen-3.0-generate-002".to_string()),
            reasoning: Some("gemini-2.5-pro".to_string()),
            ..ModelOverrides::default()
        };
        let resolved = TaskModels::resolve(&ModelSelector::new(None), &overrides)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(resolved.detect, "gemini-2.0-flash");
        assert_eq!(resolved.reasoning, "gemini-2.5-pro");
    }
}

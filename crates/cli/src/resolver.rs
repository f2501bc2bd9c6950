//! Maps session model identifiers to concrete provider clients.

use std::sync::Arc;

use secrecy::Secret;

use {
    hearth_common::ToolError,
    hearth_config::ApiSettings,
    hearth_providers::ProvidersFile,
    hearth_runner::{LlmProvider, OpenAiCompatProvider, ProviderResolver},
};

/// Resolves `providerId::modelId` composites against the provider settings
/// file, with the env-configured default provider for bare model names.
pub struct SettingsResolver {
    api: ApiSettings,
    providers: ProvidersFile,
}

impl SettingsResolver {
    #[must_use]
    pub fn new(api: ApiSettings, providers: ProvidersFile) -> Self {
        Self { api, providers }
    }

    fn default_provider(&self, model: &str) -> Result<Arc<dyn LlmProvider>, ToolError> {
        let base_url = self
            .api
            .base_url
            .clone()
            .ok_or_else(|| ToolError::user("no default provider configured (set BASE_URL)"))?;
        let api_key = self
            .api
            .api_key
            .clone()
            .ok_or_else(|| ToolError::user("no default API key configured (set API_KEY)"))?;
        let model = if model.is_empty() || model == "default" {
            self.api
                .model_name
                .clone()
                .ok_or_else(|| ToolError::user("no default model configured (set MODEL_NAME)"))?
        } else {
            model.to_string()
        };
        Ok(Arc::new(OpenAiCompatProvider::new(
            "default",
            model,
            base_url,
            Secret::new(api_key),
        )))
    }
}

impl ProviderResolver for SettingsResolver {
    fn resolve(&self, model: &str) -> Result<Arc<dyn LlmProvider>, ToolError> {
        match self.providers.resolve(model) {
            Some((provider, wire_model)) => {
                let context_length = self
                    .providers
                    .models
                    .iter()
                    .find(|m| m.id == model)
                    .and_then(|m| m.context_length);
                let mut client = OpenAiCompatProvider::new(
                    provider.id.clone(),
                    wire_model,
                    provider.effective_base_url(),
                    provider.api_key.clone(),
                );
                if let Some(tokens) = context_length {
                    client = client.with_context_window(tokens as u32);
                }
                Ok(Arc::new(client))
            },
            None => self.default_provider(model),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, hearth_providers::{ProviderConfig, ProviderKind}, secrecy::ExposeSecret};

    fn api() -> ApiSettings {
        ApiSettings {
            base_url: Some("https://llm.example/v1".into()),
            api_key: Some("sk-default".into()),
            model_name: Some("default-model".into()),
            summary_model: None,
            temperature: None,
        }
    }

    fn providers() -> ProvidersFile {
        ProvidersFile {
            providers: vec![ProviderConfig {
                id: "openrouter".into(),
                kind: ProviderKind::Openrouter,
                name: "OpenRouter".into(),
                api_key: Secret::new("sk-or".into()),
                base_url: None,
                prefix: None,
                enabled: true,
            }],
            models: vec![],
        }
    }

    #[test]
    fn composite_id_resolves_configured_provider() {
        let resolver = SettingsResolver::new(api(), providers());
        let provider = resolver.resolve("openrouter::meta/llama-3").unwrap();
        assert_eq!(provider.name(), "openrouter");
        assert_eq!(provider.id(), "meta/llama-3");
    }

    #[test]
    fn bare_name_falls_back_to_default() {
        let resolver = SettingsResolver::new(api(), providers());
        let provider = resolver.resolve("default").unwrap();
        assert_eq!(provider.name(), "default");
        assert_eq!(provider.id(), "default-model");
        let provider = resolver.resolve("gpt-4o").unwrap();
        assert_eq!(provider.id(), "gpt-4o");
    }

    #[test]
    fn missing_default_config_is_user_error() {
        let resolver = SettingsResolver::new(ApiSettings::default(), providers());
        let err = match resolver.resolve("anything") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert_eq!(err.kind(), "user");
        assert!(err.to_string().contains("BASE_URL"));
        // Secrets untouched by the failure path.
        assert_eq!(
            providers().providers[0].api_key.expose_secret(),
            "sk-or"
        );
    }

    #[test]
    fn unknown_composite_provider_falls_back() {
        let resolver = SettingsResolver::new(api(), providers());
        // "zai" is not configured; treated as a bare model on the default.
        let provider = resolver.resolve("zai::glm-4").unwrap();
        assert_eq!(provider.name(), "default");
    }
}

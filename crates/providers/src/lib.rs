//! LLM provider descriptors: persisted configuration, model enumeration
//! from OpenAI-compatible endpoints, and availability probing.
//!
//! The actual completion traffic lives in `hearth-runner`; this crate only
//! answers "which providers and models exist, and are they reachable".

use std::path::Path;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use hearth_config::SettingsFile;

/// Provider family. Determines endpoint conventions and model-id prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Openrouter,
    Zai,
    Subscription,
}

impl ProviderKind {
    /// Default API base for providers that omit one.
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Openai => "https://api.openai.com/v1",
            Self::Openrouter => "https://openrouter.ai/api/v1",
            Self::Zai => "https://api.z.ai/api/paas/v4",
            Self::Subscription => "https://api.openai.com/v1",
        }
    }
}

/// One configured provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub name: String,
    /// Wrapped in `Secret` so the key never shows up in debug output; the
    /// settings file is the one place it is written in the clear.
    #[serde(
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub api_key: Secret<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Variant prefix prepended to model ids on the wire (e.g. `openai/`).
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Secret<String>, D::Error> {
    String::deserialize(deserializer).map(Secret::new)
}

impl ProviderConfig {
    #[must_use]
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
    }

    /// Model id as sent on the wire, with the variant prefix applied.
    #[must_use]
    pub fn wire_model_id(&self, model_id: &str) -> String {
        match self.prefix.as_deref() {
            Some(prefix) if !model_id.starts_with(prefix) => format!("{prefix}{model_id}"),
            _ => model_id.to_string(),
        }
    }
}

/// One enumerated model. `id` is the composite `providerId::modelId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Split a composite `providerId::modelId`.
#[must_use]
pub fn split_model_id(composite: &str) -> Option<(&str, &str)> {
    composite.split_once("::")
}

/// Build a composite model id.
#[must_use]
pub fn composite_model_id(provider_id: &str, model_id: &str) -> String {
    format!("{provider_id}::{model_id}")
}

/// On-disk schema of `llm-providers-settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl ProvidersFile {
    #[must_use]
    pub fn file(dir: &Path) -> SettingsFile<Self> {
        SettingsFile::new(dir, "llm-providers-settings.json")
    }

    #[must_use]
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Resolve a composite model id to its provider and wire model id.
    #[must_use]
    pub fn resolve(&self, composite: &str) -> Option<(&ProviderConfig, String)> {
        let (provider_id, model_id) = split_model_id(composite)?;
        let provider = self.provider(provider_id).filter(|p| p.enabled)?;
        Some((provider, provider.wire_model_id(model_id)))
    }

    /// Enabled models, in file order.
    #[must_use]
    pub fn enabled_models(&self) -> Vec<&ModelConfig> {
        self.models.iter().filter(|m| m.enabled).collect()
    }
}

/// Result of probing one provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub provider_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Enumerate models from a provider's OpenAI-compatible `/models` endpoint.
///
/// Returns composite-id model records. Failures are external errors — the
/// caller reports them per provider and carries on.
pub async fn fetch_models(
    client: &reqwest::Client,
    provider: &ProviderConfig,
) -> Result<Vec<ModelConfig>, hearth_common::ToolError> {
    let url = format!("{}/models", provider.effective_base_url());
    debug!(provider = %provider.id, url = %url, "fetching model list");

    let response = client
        .get(&url)
        .bearer_auth(provider.api_key.expose_secret())
        .send()
        .await
        .map_err(|e| hearth_common::ToolError::external(format!("model fetch failed: {e}")))?;

    if !response.status().is_success() {
        return Err(hearth_common::ToolError::external(format!(
            "model fetch failed: HTTP {}",
            response.status()
        )));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| hearth_common::ToolError::external(format!("model list unparseable: {e}")))?;

    let models = body["data"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let raw_id = entry["id"].as_str()?;
                    Some(ModelConfig {
                        id: composite_model_id(&provider.id, raw_id),
                        name: entry["name"].as_str().unwrap_or(raw_id).to_string(),
                        provider: provider.id.clone(),
                        context_length: entry["context_length"].as_u64(),
                        enabled: true,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(models)
}

/// Probe a provider with a minimal completion request.
pub async fn probe_provider(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    model_id: &str,
) -> ProbeResult {
    let url = format!("{}/chat/completions", provider.effective_base_url());
    let body = serde_json::json!({
        "model": provider.wire_model_id(model_id),
        "messages": [{"role": "user", "content": "ping"}],
        "max_tokens": 1,
    });

    let outcome = client
        .post(&url)
        .bearer_auth(provider.api_key.expose_secret())
        .json(&body)
        .send()
        .await;

    match outcome {
        Ok(response) if response.status().is_success() => ProbeResult {
            provider_id: provider.id.clone(),
            ok: true,
            error: None,
        },
        Ok(response) => {
            let status = response.status();
            warn!(provider = %provider.id, %status, "provider probe rejected");
            ProbeResult {
                provider_id: provider.id.clone(),
                ok: false,
                error: Some(format!("HTTP {status}")),
            }
        },
        Err(e) => ProbeResult {
            provider_id: provider.id.clone(),
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

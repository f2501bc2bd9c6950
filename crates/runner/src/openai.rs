//! OpenAI-compatible chat-completions provider.
//!
//! Speaks the `/chat/completions` dialect shared by OpenAI, OpenRouter,
//! and the other configured provider families.

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    tracing::{debug, trace},
};

use {
    crate::model::{CompletionResponse, LlmProvider, ToolCall, Usage},
    hearth_common::ToolError,
};

/// Provider client for one `(base_url, model)` pair.
pub struct OpenAiCompatProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: Secret<String>,
    context_window: u32,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Secret<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key,
            context_window: 128_000,
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }
}

/// Convert registry tool schemas to the function-calling wire format.
fn to_wire_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .filter_map(|t| {
            let name = t["name"].as_str()?;
            Some(serde_json::json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": t["description"].as_str().unwrap_or(""),
                    "parameters": t["parameters"].clone(),
                }
            }))
        })
        .collect()
}

/// Parse `tool_calls` from a response message.
fn parse_tool_calls(message: &serde_json::Value) -> Vec<ToolCall> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call["id"].as_str()?.to_string();
                    let name = call["function"]["name"].as_str()?.to_string();
                    let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(raw_args).unwrap_or(serde_json::json!({}));
                    Some(ToolCall { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse usage, tolerating both OpenAI- and Anthropic-style field names.
fn parse_usage(usage: &serde_json::Value) -> Usage {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| usage.get(*n).and_then(|v| v.as_u64()))
            .unwrap_or(0)
    };
    Usage {
        input_tokens: field(&["prompt_tokens", "input_tokens"]),
        output_tokens: field(&["completion_tokens", "output_tokens"]),
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn complete(
        &self,
        messages: &[serde_json::Value],
        tools: &[serde_json::Value],
        temperature: Option<f32>,
    ) -> Result<CompletionResponse, ToolError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(to_wire_tools(tools));
        }
        if let Some(t) = temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, url = %url, messages = messages.len(), "completion request");
        trace!(body = %body, "completion request body");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::external(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ToolError::external(format!(
                "LLM returned HTTP {status}: {detail:.300}"
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ToolError::external(format!("LLM response unparseable: {e}")))?;

        let message = &payload["choices"][0]["message"];
        let text = message["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(String::from);
        let tool_calls = parse_tool_calls(message);
        let usage = parse_usage(&payload["usage"]);

        debug!(
            has_text = text.is_some(),
            tool_calls = tool_calls.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "completion response"
        );

        Ok(CompletionResponse { text, tool_calls, usage })
    }
}

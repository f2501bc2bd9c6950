//! Provider-backed web tools with a uniform fallback chain:
//! configured provider → alternate provider → unauthenticated plain HTTP
//! fetch with text extraction. Results are cached per provider so a
//! fallback can never poison the primary's entries.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    tracing::{debug, warn},
};

use {
    crate::registry::{Tool, ToolCtx},
    hearth_common::ToolError,
    hearth_guard::UrlGuard,
};

/// Provider name used for the plain-fetch fallback in cache keys.
const PLAIN_PROVIDER: &str = "plain";
/// Default cache TTL.
const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// Maximum redirect hops for the plain fetch.
const MAX_REDIRECTS: u8 = 5;
/// Characters returned from a plain-fetch extraction.
const MAX_EXTRACT_CHARS: usize = 50_000;

// ── Cache ───────────────────────────────────────────────────────────────────

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Web result cache keyed by `(operation, provider, input)`.
pub struct WebCache {
    entries: Mutex<HashMap<(String, String, String), CacheEntry>>,
    ttl: Duration,
}

impl Default for WebCache {
    fn default() -> Self {
        Self::new(CACHE_TTL)
    }
}

impl WebCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    #[must_use]
    pub fn get(&self, operation: &str, provider: &str, input: &str) -> Option<serde_json::Value> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(&(
            operation.to_string(),
            provider.to_string(),
            input.to_string(),
        ))?;
        (Instant::now() < entry.expires_at).then(|| entry.value.clone())
    }

    pub fn set(&self, operation: &str, provider: &str, input: &str, value: serde_json::Value) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() > 256 {
                let now = Instant::now();
                entries.retain(|_, e| e.expires_at > now);
            }
            entries.insert(
                (
                    operation.to_string(),
                    provider.to_string(),
                    input.to_string(),
                ),
                CacheEntry {
                    value,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
    }

    /// All-or-nothing clear. Used when a task opts out of cache sharing.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

// ── Providers ───────────────────────────────────────────────────────────────

/// A pluggable search/reader backend.
#[async_trait]
pub trait WebProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str) -> Result<serde_json::Value, ToolError>;
    async fn read(&self, url: &str) -> Result<serde_json::Value, ToolError>;
}

/// Generic JSON-API provider: `GET {endpoint}/search?q=` and
/// `GET {endpoint}/read?url=` with a bearer key. Concrete third-party
/// services are configured as instances of this shape.
pub struct HttpWebProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpWebProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ToolError> {
        let mut request = self.client.get(url).timeout(Duration::from_secs(15));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ToolError::external(format!("{}: {e}", self.name)))?;
        if !response.status().is_success() {
            return Err(ToolError::external(format!(
                "{}: HTTP {}",
                self.name,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ToolError::external(format!("{}: bad response: {e}", self.name)))
    }
}

#[async_trait]
impl WebProvider for HttpWebProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> Result<serde_json::Value, ToolError> {
        let url = format!(
            "{}/search?q={}",
            self.endpoint,
            encode_query(query)
        );
        self.get_json(&url).await
    }

    async fn read(&self, url: &str) -> Result<serde_json::Value, ToolError> {
        let target = format!("{}/read?url={}", self.endpoint, encode_query(url));
        self.get_json(&target).await
    }
}

/// Minimal percent-encoding for query values.
pub(crate) fn encode_query(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            },
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            },
        }
    }
    out
}

// ── Plain fetch ─────────────────────────────────────────────────────────────

/// Fetch a URL with manual redirects, re-checking the guard on every hop,
/// and extract readable text.
pub async fn plain_fetch(
    client: &reqwest::Client,
    guard: &UrlGuard,
    url: &str,
) -> Result<serde_json::Value, ToolError> {
    let mut current = guard.check_resolved(url).await?;
    let mut visited: Vec<String> = Vec::new();
    let mut hops = 0u8;

    loop {
        visited.push(current.to_string());
        let response = client
            .get(current.as_str())
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| ToolError::external(format!("fetch failed: {e}")))?;
        let status = response.status();

        if status.is_redirection() {
            if hops >= MAX_REDIRECTS {
                return Err(ToolError::external(format!(
                    "too many redirects ({} hops)",
                    hops + 1
                )));
            }
            let location = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ToolError::external("redirect without Location header"))?;
            let next = current
                .join(location)
                .map_err(|e| ToolError::external(format!("bad redirect target: {e}")))?;

            if visited.contains(&next.to_string()) {
                return Err(ToolError::external(format!(
                    "redirect loop detected at {next}"
                )));
            }

            // The redirect target gets the same scrutiny as the original.
            current = guard.check_resolved(next.as_str()).await?;
            hops += 1;
            continue;
        }

        if !status.is_success() {
            return Err(ToolError::external(format!("HTTP {status}")));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::external(format!("body read failed: {e}")))?;

        let text = if content_type.contains("html") {
            html_to_text(&body)
        } else if content_type.contains("json") {
            serde_json::from_str::<serde_json::Value>(&body)
                .map(|v| serde_json::to_string_pretty(&v).unwrap_or(body.clone()))
                .unwrap_or(body.clone())
        } else {
            body.clone()
        };

        let truncated = text.len() > MAX_EXTRACT_CHARS;
        let content = if truncated {
            let mut end = MAX_EXTRACT_CHARS;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].to_string()
        } else {
            text
        };

        return Ok(serde_json::json!({
            "url": current.to_string(),
            "content": content,
            "content_type": content_type,
            "truncated": truncated,
        }));
    }
}

/// Strip tags, drop script/style bodies, decode the common entities, and
/// collapse whitespace. Deliberately lighter than a readability engine.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut last_was_space = true;

    while let Some(open) = rest.find('<') {
        push_text(&rest[..open], &mut out, &mut last_was_space);
        rest = &rest[open..];

        let lower = rest.to_ascii_lowercase();
        // Swallow script/style bodies entirely.
        let skipped = if lower.starts_with("<script") {
            skip_past(rest, &lower, "</script>")
        } else if lower.starts_with("<style") {
            skip_past(rest, &lower, "</style>")
        } else {
            None
        };
        if let Some(next) = skipped {
            rest = next;
            continue;
        }

        // Block-level tags become line breaks.
        if ["<p", "</p", "<br", "<div", "</div", "<h", "</h", "<li", "<tr"]
            .iter()
            .any(|t| lower.starts_with(t))
            && !out.ends_with('\n')
        {
            out.push('\n');
            last_was_space = true;
        }

        match rest.find('>') {
            Some(close) => rest = &rest[close + 1..],
            None => return out.trim().to_string(),
        }
    }
    push_text(rest, &mut out, &mut last_was_space);
    out.trim().to_string()
}

fn skip_past<'a>(rest: &'a str, lower: &str, closer: &str) -> Option<&'a str> {
    lower.find(closer).map(|pos| &rest[pos + closer.len()..])
}

fn push_text(text: &str, out: &mut String, last_was_space: &mut bool) {
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '&' {
            let rest = chars.as_str();
            let (decoded, skip) = decode_entity(rest);
            if let Some(d) = decoded {
                out.push(d);
                *last_was_space = d == ' ';
                for _ in 0..skip {
                    chars.next();
                }
                continue;
            }
        }
        if c.is_whitespace() {
            if !*last_was_space {
                out.push(' ');
                *last_was_space = true;
            }
        } else {
            out.push(c);
            *last_was_space = false;
        }
    }
}

/// Decode the entity at the head of `rest` (after the `&`). Returns the
/// char and how many input chars to skip.
fn decode_entity(rest: &str) -> (Option<char>, usize) {
    for (entity, decoded) in [
        ("amp;", '&'),
        ("lt;", '<'),
        ("gt;", '>'),
        ("quot;", '"'),
        ("apos;", '\''),
        ("#39;", '\''),
        ("nbsp;", ' '),
        ("#160;", ' '),
    ] {
        if rest.starts_with(entity) {
            return (Some(decoded), entity.len());
        }
    }
    (None, 0)
}

// ── Tools ───────────────────────────────────────────────────────────────────

/// Web search with provider fallback.
pub struct WebSearchTool {
    providers: Vec<std::sync::Arc<dyn WebProvider>>,
}

impl WebSearchTool {
    #[must_use]
    pub fn new(providers: Vec<std::sync::Arc<dyn WebProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns result titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'query' parameter"))?;

        // Chain order also defines cache lookup order: a fallback hit must
        // not shadow a fresher primary entry.
        for provider in &self.providers {
            if let Some(cached) = ctx.web_cache.get("search", provider.name(), query) {
                debug!(provider = provider.name(), query, "search cache hit");
                return Ok(cached);
            }
        }

        let mut last_error = None;
        for provider in &self.providers {
            match provider.search(query).await {
                Ok(mut results) => {
                    if let Some(obj) = results.as_object_mut() {
                        obj.insert(
                            "provider".to_string(),
                            serde_json::Value::String(provider.name().to_string()),
                        );
                    }
                    ctx.web_cache.set("search", provider.name(), query, results.clone());
                    return Ok(results);
                },
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "search provider failed, trying next");
                    last_error = Some(e);
                },
            }
        }

        // Last resort: unauthenticated fetch of an HTML results page.
        let fallback_url = format!(
            "https://html.duckduckgo.com/html/?q={}",
            encode_query(query)
        );
        match plain_fetch(crate::shared_http_client(), &ctx.url_guard, &fallback_url).await {
            Ok(mut page) => {
                if let Some(obj) = page.as_object_mut() {
                    obj.insert(
                        "provider".to_string(),
                        serde_json::Value::String(PLAIN_PROVIDER.to_string()),
                    );
                }
                ctx.web_cache.set("search", PLAIN_PROVIDER, query, page.clone());
                Ok(page)
            },
            Err(e) => Err(last_error.unwrap_or(e)),
        }
    }
}

/// Page read with provider fallback and guarded plain fetch.
pub struct WebReadTool {
    providers: Vec<std::sync::Arc<dyn WebProvider>>,
}

impl WebReadTool {
    #[must_use]
    pub fn new(providers: Vec<std::sync::Arc<dyn WebProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Tool for WebReadTool {
    fn name(&self) -> &str {
        "web_read"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text content."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The page URL (http or https)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'url' parameter"))?;

        // The guard vets the URL before any provider sees it.
        ctx.url_guard.check(url)?;

        for provider in &self.providers {
            if let Some(cached) = ctx.web_cache.get("read", provider.name(), url) {
                return Ok(cached);
            }
        }
        if let Some(cached) = ctx.web_cache.get("read", PLAIN_PROVIDER, url) {
            return Ok(cached);
        }

        for provider in &self.providers {
            match provider.read(url).await {
                Ok(mut result) => {
                    if let Some(obj) = result.as_object_mut() {
                        obj.insert(
                            "provider".to_string(),
                            serde_json::Value::String(provider.name().to_string()),
                        );
                    }
                    ctx.web_cache.set("read", provider.name(), url, result.clone());
                    return Ok(result);
                },
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "read provider failed, trying next");
                },
            }
        }

        let mut page = plain_fetch(crate::shared_http_client(), &ctx.url_guard, url).await?;
        if let Some(obj) = page.as_object_mut() {
            obj.insert(
                "provider".to_string(),
                serde_json::Value::String(PLAIN_PROVIDER.to_string()),
            );
        }
        ctx.web_cache.set("read", PLAIN_PROVIDER, url, page.clone());
        Ok(page)
    }
}

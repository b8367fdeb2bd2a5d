//! Model backends for the classifier: local in-process, HTTP-to-local,
//! and HTTP-to-hosted-API, behind a common [`ClassifierBackend`] trait.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::{BackendConfig, HttpHostedBackendConfig, HttpLocalBackendConfig, LocalBackendConfig};
use crate::error::BackendError;

/// Strip `<think>...</think>` blocks, markdown code fences, and
/// surrounding narrative, the way a raw LLM completion tends to wrap a
/// JSON payload.
pub fn strip_markdown_fences(text: &str) -> String {
    let mut s = text.trim().to_string();

    while let (Some(start), Some(end)) = (s.find("<think>"), s.find("</think>")) {
        if end < start {
            break;
        }
        s.replace_range(start..end + "</think>".len(), "");
        s = s.trim().to_string();
    }

    if let Some(rest) = s.strip_prefix("```json") {
        s = rest.trim_start().to_string();
        if let Some(end) = s.rfind("```") {
            s.truncate(end);
        }
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest.trim_start().to_string();
        if let Some(end) = s.rfind("```") {
            s.truncate(end);
        }
    }

    s.trim().to_string()
}

/// A model backend able to produce a raw completion string for a
/// system/user prompt pair. The classifier layer owns JSON parsing and
/// validation of the response; backends only speak text.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    async fn infer(&self, system: &str, user: &str) -> Result<String, BackendError>;
    fn name(&self) -> &str;
    fn is_available(&self) -> bool {
        true
    }
}

/// Implemented by an operator-supplied in-process model runtime. This
/// crate does not vendor an inference engine; [`LocalBackend`] wraps
/// whatever implementation the host provides.
pub trait LocalModel: Send + Sync {
    fn infer(&self, system: &str, user: &str) -> Result<String, String>;
}

enum LoadState {
    Unloaded,
    Loaded(Arc<dyn LocalModel>),
    Failed,
}

/// Local in-process backend. Lazily constructs the model behind a
/// double-checked lock; once a load fails, a latch makes every later
/// attempt fail fast without retrying.
pub struct LocalBackend {
    config: LocalBackendConfig,
    loader: Box<dyn Fn(&LocalBackendConfig) -> Result<Arc<dyn LocalModel>, String> + Send + Sync>,
    state: Mutex<LoadState>,
    infer_lock: Mutex<()>,
}

impl LocalBackend {
    pub fn new(
        config: LocalBackendConfig,
        loader: impl Fn(&LocalBackendConfig) -> Result<Arc<dyn LocalModel>, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            loader: Box::new(loader),
            state: Mutex::new(LoadState::Unloaded),
            infer_lock: Mutex::new(()),
        }
    }

    async fn ensure_loaded(&self) -> Result<Arc<dyn LocalModel>, BackendError> {
        let mut guard = self.state.lock().await;
        match &*guard {
            LoadState::Loaded(model) => return Ok(model.clone()),
            LoadState::Failed => return Err(BackendError::PreviouslyFailed),
            LoadState::Unloaded => {}
        }

        match (self.loader)(&self.config) {
            Ok(model) => {
                *guard = LoadState::Loaded(model.clone());
                Ok(model)
            }
            Err(e) => {
                *guard = LoadState::Failed;
                Err(BackendError::Unavailable(e))
            }
        }
    }
}

#[async_trait]
impl ClassifierBackend for LocalBackend {
    async fn infer(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let model = self.ensure_loaded().await?;
        let _serialize = self.infer_lock.lock().await;
        let system = system.to_string();
        let user = user.to_string();
        tokio::task::spawn_blocking(move || model.infer(&system, &user))
            .await
            .map_err(|e| BackendError::Other(format!("local model task panicked: {e}")))?
            .map_err(BackendError::Request)
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// HTTP backend speaking the Ollama chat API on a local or LAN host.
/// Availability is probed at most once per 60 seconds.
pub struct HttpLocalBackend {
    config: HttpLocalBackendConfig,
    client: reqwest::Client,
    availability: StdMutex<Option<(bool, Instant)>>,
}

const AVAILABILITY_TTL: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

impl HttpLocalBackend {
    pub fn new(config: HttpLocalBackendConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("reqwest client build");
        Self {
            config,
            client,
            availability: StdMutex::new(None),
        }
    }
}

impl HttpLocalBackend {
    fn record_availability(&self, available: bool) {
        *self.availability.lock().unwrap() = Some((available, Instant::now()));
    }
}

#[async_trait]
impl ClassifierBackend for HttpLocalBackend {
    async fn infer(&self, system: &str, user: &str) -> Result<String, BackendError> {
        if !self.is_available() {
            return Err(BackendError::Unavailable(self.config.url.clone()));
        }

        let body = serde_json::json!({
            "model": self.config.model,
            "format": "json",
            "stream": false,
            "options": {
                "temperature": self.config.temperature,
                "num_predict": self.config.max_tokens,
                "num_ctx": self.config.num_ctx,
            },
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let url = format!("{}/api/chat", self.config.url.trim_end_matches('/'));
        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                self.record_availability(false);
                return Err(BackendError::Request(e.to_string()));
            }
        };

        if !resp.status().is_success() {
            self.record_availability(false);
            return Err(BackendError::Request(format!("status {}", resp.status())));
        }

        let parsed: OllamaChatResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Request(format!("decode response: {e}")))?;
        self.record_availability(true);
        Ok(parsed.message.content)
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn is_available(&self) -> bool {
        let guard = self.availability.lock().unwrap();
        match &*guard {
            Some((available, checked_at)) if checked_at.elapsed() < AVAILABILITY_TTL => *available,
            _ => true,
        }
    }
}

/// Token usage reported by a hosted completion call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}

/// Hosted OpenAI-compatible backend. A URL containing `generativelanguage`
/// is treated as Gemini and uses its payload/response shape instead.
pub struct HttpHostedBackend {
    config: HttpHostedBackendConfig,
    client: reqwest::Client,
    last_usage: StdMutex<Usage>,
}

impl HttpHostedBackend {
    pub fn new(config: HttpHostedBackendConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("reqwest client build");
        Self {
            config,
            client,
            last_usage: StdMutex::new(Usage::default()),
        }
    }

    fn is_gemini(&self) -> bool {
        self.config.url.contains("generativelanguage")
    }

    pub fn last_usage(&self) -> Usage {
        *self.last_usage.lock().unwrap()
    }

    async fn infer_openai(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let url = format!("{}/chat/completions", self.config.url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(BackendError::Request("rate limited (429)".into()));
        }
        if !resp.status().is_success() {
            return Err(BackendError::Request(format!("status {}", resp.status())));
        }

        let parsed: OpenAiChatResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Request(format!("decode response: {e}")))?;

        if let Some(usage) = parsed.usage {
            *self.last_usage.lock().unwrap() = Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            };
        }

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| BackendError::Request("empty choices array".into()))
    }

    async fn infer_gemini(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "system_instruction": {"parts": [{"text": system}]},
            "contents": [{"role": "user", "parts": [{"text": user}]}],
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_tokens,
            },
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.url.trim_end_matches('/'),
            self.config.model,
            self.config.api_key
        );
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(BackendError::Request(format!("status {}", resp.status())));
        }

        let parsed: GeminiResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Request(format!("decode response: {e}")))?;

        if let Some(usage) = parsed.usage_metadata {
            *self.last_usage.lock().unwrap() = Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
            };
        }

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| BackendError::Request("empty candidates array".into()))
    }
}

#[async_trait]
impl ClassifierBackend for HttpHostedBackend {
    async fn infer(&self, system: &str, user: &str) -> Result<String, BackendError> {
        if self.is_gemini() {
            self.infer_gemini(system, user).await
        } else {
            self.infer_openai(system, user).await
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Construct the backend named by configuration. `local_loader` is only
/// invoked for `BackendConfig::Local`.
pub fn build_backend(
    config: &BackendConfig,
    local_loader: impl Fn(&LocalBackendConfig) -> Result<Arc<dyn LocalModel>, String> + Send + Sync + 'static,
) -> Arc<dyn ClassifierBackend> {
    match config {
        BackendConfig::Local(c) => Arc::new(LocalBackend::new(c.clone(), local_loader)),
        BackendConfig::Ollama(c) => Arc::new(HttpLocalBackend::new(c.clone())),
        BackendConfig::Openai(c) => Arc::new(HttpHostedBackend::new(c.clone())),
    }
}

/// Process-wide backend singleton, double-checked-locked the way the
/// model runtime and the classifier's configured backend both need to
/// be shared across the async runtime's worker threads.
static BACKEND: OnceLock<Mutex<Option<Arc<dyn ClassifierBackend>>>> = OnceLock::new();

fn backend_slot() -> &'static Mutex<Option<Arc<dyn ClassifierBackend>>> {
    BACKEND.get_or_init(|| Mutex::new(None))
}

/// Fetch the memoized backend, constructing it on first use.
pub async fn get_or_init_backend(
    config: &BackendConfig,
    local_loader: impl Fn(&LocalBackendConfig) -> Result<Arc<dyn LocalModel>, String> + Send + Sync + 'static,
) -> Arc<dyn ClassifierBackend> {
    let mut guard = backend_slot().lock().await;
    if let Some(existing) = &*guard {
        return existing.clone();
    }
    let built = build_backend(config, local_loader);
    *guard = Some(built.clone());
    built
}

/// Force re-creation of the singleton on the next call. Used when an
/// operator pushes new backend configuration.
pub async fn reset_backend() {
    let mut guard = backend_slot().lock().await;
    *guard = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_markdown_fences_handles_json_fence() {
        let raw = "```json\n{\"action\":\"drop\"}\n```";
        assert_eq!(strip_markdown_fences(raw), r#"{"action":"drop"}"#);
    }

    #[test]
    fn strip_markdown_fences_handles_bare_fence() {
        let raw = "```\n{\"action\":\"wake\"}\n```";
        assert_eq!(strip_markdown_fences(raw), r#"{"action":"wake"}"#);
    }

    #[test]
    fn strip_markdown_fences_strips_think_blocks() {
        let raw = "<think>pondering</think>{\"action\":\"reply\"}";
        assert_eq!(strip_markdown_fences(raw), r#"{"action":"reply"}"#);
    }

    #[test]
    fn strip_markdown_fences_passes_through_plain_text() {
        assert_eq!(strip_markdown_fences("  hello  "), "hello");
    }

    struct StubModel;
    impl LocalModel for StubModel {
        fn infer(&self, _system: &str, _user: &str) -> Result<String, String> {
            Ok(r#"{"action":"wake","reason":"ok"}"#.to_string())
        }
    }

    struct FailingModel;
    impl LocalModel for FailingModel {
        fn infer(&self, _system: &str, _user: &str) -> Result<String, String> {
            Err("boom".into())
        }
    }

    fn local_config() -> LocalBackendConfig {
        LocalBackendConfig {
            model_path: "/tmp/model.gguf".into(),
            n_threads: 2,
            n_ctx: 1024,
            max_tokens: 128,
        }
    }

    #[tokio::test]
    async fn local_backend_loads_once_and_infers() {
        let backend = LocalBackend::new(local_config(), |_| Ok(Arc::new(StubModel)));
        let out = backend.infer("sys", "user").await.unwrap();
        assert!(out.contains("wake"));
    }

    #[tokio::test]
    async fn local_backend_fails_fast_after_load_failure() {
        let backend = LocalBackend::new(local_config(), |_| Err("no weights".into()));
        assert!(backend.infer("sys", "user").await.is_err());
        let second = backend.infer("sys", "user").await;
        assert!(matches!(second, Err(BackendError::PreviouslyFailed)));
    }

    #[test]
    fn hosted_backend_detects_gemini_by_url_substring() {
        let cfg = HttpHostedBackendConfig {
            url: "https://generativelanguage.googleapis.com/v1beta".into(),
            model: "gemini-1.5-flash".into(),
            api_key: "k".into(),
            temperature: 0.1,
            max_tokens: 128,
            timeout_seconds: 10,
        };
        let backend = HttpHostedBackend::new(cfg);
        assert!(backend.is_gemini());
    }

    #[test]
    fn hosted_backend_openai_url_is_not_gemini() {
        let cfg = HttpHostedBackendConfig {
            url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: "k".into(),
            temperature: 0.1,
            max_tokens: 128,
            timeout_seconds: 10,
        };
        let backend = HttpHostedBackend::new(cfg);
        assert!(!backend.is_gemini());
    }

    #[test]
    fn local_http_backend_is_available_by_default() {
        let cfg = HttpLocalBackendConfig {
            url: "http://localhost:11434".into(),
            model: "gemma3:1b".into(),
            timeout_seconds: 10,
            temperature: 0.1,
            max_tokens: 128,
            num_ctx: 1024,
        };
        let backend = HttpLocalBackend::new(cfg);
        assert!(backend.is_available());
    }

    #[test]
    fn local_http_backend_caches_a_recorded_outage() {
        let cfg = HttpLocalBackendConfig {
            url: "http://localhost:11434".into(),
            model: "gemma3:1b".into(),
            timeout_seconds: 10,
            temperature: 0.1,
            max_tokens: 128,
            num_ctx: 1024,
        };
        let backend = HttpLocalBackend::new(cfg);
        backend.record_availability(false);
        assert!(!backend.is_available());
    }
}

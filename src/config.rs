//! Operator-provided configuration for the triage guard.

use serde::{Deserialize, Serialize};

/// Fallback mode used when the classifier backend fails or returns an
/// unrecognized action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// team -> wake, known -> wake, unknown -> drop.
    Tier,
    /// Always wake.
    Wake,
    /// Always drop.
    Drop,
}

impl Default for FallbackMode {
    fn default() -> Self {
        FallbackMode::Tier
    }
}

/// Trust tier prefix lists in operator-declared order: the first tier
/// whose prefix list matches wins, so team tiers should be listed first.
/// A plain `Vec` (not `HashMap`) so that order is actually preserved
/// across parses and process restarts.
pub type TrustTiers = Vec<(String, Vec<String>)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBackendConfig {
    pub model_path: String,
    #[serde(default = "default_n_threads")]
    pub n_threads: u32,
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_n_threads() -> u32 {
    2
}
fn default_n_ctx() -> u32 {
    1024
}
fn default_max_tokens() -> u32 {
    128
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLocalBackendConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_n_ctx")]
    pub num_ctx: u32,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "gemma3:1b".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_temperature() -> f32 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpHostedBackendConfig {
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_hosted_timeout_secs")]
    pub timeout_seconds: u64,
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_hosted_timeout_secs() -> u64 {
    10
}

/// Which backend the classifier dispatches to. Structured (v3) shape;
/// see [`migrate_legacy`] for translation from the older flat shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Local(LocalBackendConfig),
    Ollama(HttpLocalBackendConfig),
    Openai(HttpHostedBackendConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub triage_enabled: bool,
    pub backend: BackendConfig,
    #[serde(default)]
    pub trust_tiers: TrustTiers,
    #[serde(default = "default_ignored_kinds")]
    pub ignore_msg_types: Vec<String>,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,
    #[serde(default = "default_loop_threshold_sessionless")]
    pub loop_threshold_sessionless: u32,
    #[serde(default = "default_knock_threshold")]
    pub knock_threshold: u32,
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,
    #[serde(default = "default_ttl_days")]
    pub classification_ttl_days: u32,
    #[serde(default)]
    pub fallback: FallbackMode,
    #[serde(default)]
    pub prompt: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_ignored_kinds() -> Vec<String> {
    vec!["ack".into(), "delivery".into(), "system".into()]
}
fn default_loop_threshold() -> u32 {
    2
}
fn default_loop_threshold_sessionless() -> u32 {
    5
}
fn default_knock_threshold() -> u32 {
    10
}
fn default_max_per_hour() -> u32 {
    5
}
fn default_ttl_days() -> u32 {
    30
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            triage_enabled: true,
            backend: BackendConfig::Local(LocalBackendConfig {
                model_path: "/app/models/gemma3-1b.gguf".into(),
                n_threads: default_n_threads(),
                n_ctx: default_n_ctx(),
                max_tokens: default_max_tokens(),
            }),
            trust_tiers: Vec::new(),
            ignore_msg_types: default_ignored_kinds(),
            loop_threshold: default_loop_threshold(),
            loop_threshold_sessionless: default_loop_threshold_sessionless(),
            knock_threshold: default_knock_threshold(),
            max_per_hour: default_max_per_hour(),
            classification_ttl_days: default_ttl_days(),
            fallback: FallbackMode::Tier,
            prompt: None,
        }
    }
}

impl GuardConfig {
    /// Parse a config document, migrating a legacy v2 flat `backend: <name>`
    /// shape into the structured v3 shape first so old config files keep
    /// loading instead of failing to deserialize.
    pub fn from_yaml(text: &str) -> Result<Self, crate::error::ThrallError> {
        let mut raw: serde_json::Value = serde_yaml::from_str(text)
            .map_err(|e| crate::error::ThrallError::Config(e.to_string()))?;

        if let Some(obj) = raw.as_object_mut() {
            if matches!(obj.get("backend"), Some(serde_json::Value::String(_))) {
                let migrated = migrate_legacy(&serde_json::Value::Object(obj.clone()));
                obj.insert("backend".to_string(), migrated);
            }
        }

        serde_json::from_value(raw).map_err(|e| crate::error::ThrallError::Config(e.to_string()))
    }
}

/// Legacy v2 flat config (`backend: embedded|ollama|local|openai` with
/// top-level params) translated into the structured v3 shape, mirroring
/// `thrall.py::_migrate_config`. Accepts a raw JSON/YAML value so callers
/// with old config files don't need to hand-edit them.
pub fn migrate_legacy(raw: &serde_json::Value) -> serde_json::Value {
    let backend_name = raw
        .get("backend")
        .and_then(|v| v.as_str())
        .unwrap_or("embedded");

    match backend_name {
        "embedded" => serde_json::json!({
            "backend": "local",
            "model_path": raw.get("model_path").and_then(|v| v.as_str())
                .unwrap_or("/app/models/gemma3-1b.gguf"),
            "n_threads": raw.get("n_threads").and_then(|v| v.as_u64()).unwrap_or(2),
            "n_ctx": raw.get("n_ctx").and_then(|v| v.as_u64()).unwrap_or(1024),
            "max_tokens": raw.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(128),
        }),
        "ollama" => serde_json::json!({
            "backend": "ollama",
            "url": raw.get("ollama_url").and_then(|v| v.as_str())
                .unwrap_or("http://localhost:11434"),
            "model": raw.get("model").and_then(|v| v.as_str()).unwrap_or("gemma3:1b"),
            "timeout_seconds": raw.get("timeout_seconds").and_then(|v| v.as_u64()).unwrap_or(10),
            "temperature": 0.1,
            "max_tokens": 128,
            "num_ctx": 1024,
        }),
        // "local" and "openai" are already v3 shaped; pass through.
        _ => raw.clone(),
    }
}

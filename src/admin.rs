//! Prompt Registry / Admin Surface: list, fetch, and install
//! classification prompts for a trusted external caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::classifier::prompt_hash;
use crate::error::ThrallError;
use crate::persistence::{PromptRecord, Store};

const TIER_PLACEHOLDER: &str = "{tier}";
pub const TRIAGE_PROMPT_NAME: &str = "triage";

pub const DEFAULT_TRIAGE_PROMPT: &str = "You are a triage classifier for a peer-to-peer node. \
The sender is in trust tier: {tier}. \
Respond with a JSON object {\"action\": \"drop\"|\"wake\"|\"reply\", \"reason\": \"...\"}.";

#[derive(Debug, Serialize)]
pub struct PromptSummary {
    pub name: String,
    pub hash: String,
    pub pushed_by: String,
    pub pushed_at: f64,
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct PromptDetail {
    pub content: String,
    pub hash: String,
    pub pushed_by: String,
    pub pushed_at: f64,
}

#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    pub action: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub from_node: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AdminResponse {
    Ok(serde_json::Value),
    Error { error: String },
}

/// Called synchronously after a successful `load`, in the same
/// execution context as the admin call, to re-read the active prompt
/// into the live guard. Passed as a plain callback rather than a
/// back-reference to the guard, so the registry and the guard never
/// hold pointers to each other.
pub type ReloadCallback = Arc<dyn Fn() -> Result<(), ThrallError> + Send + Sync>;

pub struct PromptRegistry {
    store: Arc<Mutex<Store>>,
    on_reload: ReloadCallback,
}

impl PromptRegistry {
    pub fn new(store: Arc<Mutex<Store>>, on_reload: ReloadCallback) -> Self {
        Self { store, on_reload }
    }

    /// Ensure a default `triage` prompt exists and is active. Called at
    /// startup if no active triage prompt is found.
    pub async fn ensure_default_prompt(&self) -> Result<(), ThrallError> {
        let store = self.store.lock().await;
        if store
            .get_active_prompt(TRIAGE_PROMPT_NAME)
            .await
            .map_err(ThrallError::Persistence)?
            .is_some()
        {
            return Ok(());
        }

        store
            .upsert_prompt(&PromptRecord {
                name: TRIAGE_PROMPT_NAME.to_string(),
                content: DEFAULT_TRIAGE_PROMPT.to_string(),
                hash: prompt_hash(DEFAULT_TRIAGE_PROMPT),
                pushed_by: "hardcoded".to_string(),
                pushed_at: now_secs(),
                active: true,
            })
            .await
            .map_err(ThrallError::Persistence)?;
        store
            .activate_prompt(TRIAGE_PROMPT_NAME)
            .await
            .map_err(ThrallError::Persistence)?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<PromptSummary>, ThrallError> {
        let store = self.store.lock().await;
        let rows = store.list_prompts().await.map_err(ThrallError::Persistence)?;
        Ok(rows
            .into_iter()
            .map(|r| PromptSummary {
                name: r.name,
                hash: r.hash,
                pushed_by: r.pushed_by,
                pushed_at: r.pushed_at,
                active: r.active,
            })
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<Option<PromptDetail>, ThrallError> {
        let store = self.store.lock().await;
        let row = store.get_prompt(name).await.map_err(ThrallError::Persistence)?;
        Ok(row.map(|r| PromptDetail {
            content: r.content,
            hash: r.hash,
            pushed_by: r.pushed_by,
            pushed_at: r.pushed_at,
        }))
    }

    /// Validates, persists, activates, and triggers a synchronous
    /// reload. Rejects content missing the literal `{tier}` placeholder
    /// without touching the in-memory active prompt.
    pub async fn load(&self, name: &str, content: &str, pushed_by: &str) -> Result<String, ThrallError> {
        if content.is_empty() {
            return Err(ThrallError::Admin("content must not be empty".to_string()));
        }
        if !content.contains(TIER_PLACEHOLDER) {
            return Err(ThrallError::Admin("content must contain the {tier} placeholder".to_string()));
        }

        let hash = prompt_hash(content);
        {
            let store = self.store.lock().await;
            store
                .upsert_prompt(&PromptRecord {
                    name: name.to_string(),
                    content: content.to_string(),
                    hash: hash.clone(),
                    pushed_by: pushed_by.to_string(),
                    pushed_at: now_secs(),
                    active: name == TRIAGE_PROMPT_NAME,
                })
                .await
                .map_err(ThrallError::Persistence)?;
            if name == TRIAGE_PROMPT_NAME {
                store.activate_prompt(name).await.map_err(ThrallError::Persistence)?;
            }
        }

        if name == TRIAGE_PROMPT_NAME {
            (self.on_reload)()?;
        }
        Ok(hash)
    }

    /// Dispatch a raw admin-surface request, returning the wire shape.
    pub async fn handle(&self, req: AdminRequest) -> AdminResponse {
        match req.action.as_str() {
            "list" => match self.list().await {
                Ok(prompts) => AdminResponse::Ok(serde_json::json!({ "prompts": prompts })),
                Err(e) => AdminResponse::Error { error: e.to_string() },
            },
            "get" => {
                let Some(name) = req.name else {
                    return AdminResponse::Error { error: "name is required".to_string() };
                };
                match self.get(&name).await {
                    Ok(Some(detail)) => AdminResponse::Ok(serde_json::json!(detail)),
                    Ok(None) => AdminResponse::Error { error: format!("prompt not found: {name}") },
                    Err(e) => AdminResponse::Error { error: e.to_string() },
                }
            }
            "load" => {
                let (Some(name), Some(content)) = (req.name, req.content) else {
                    return AdminResponse::Error { error: "name and content are required".to_string() };
                };
                let pushed_by = req.from_node.unwrap_or_else(|| "unknown".to_string());
                match self.load(&name, &content, &pushed_by).await {
                    Ok(hash) => AdminResponse::Ok(serde_json::json!({ "hash": hash })),
                    Err(e) => AdminResponse::Error { error: e.to_string() },
                }
            }
            other => AdminResponse::Error { error: format!("unknown action: {other}") },
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

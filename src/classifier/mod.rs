//! Classifier: trust-tier resolution, prompt rendering, backend
//! dispatch, and tolerant parsing of the model's verdict.

pub mod backends;

use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::config::{BackendConfig, FallbackMode, LocalBackendConfig, TrustTiers};
use backends::{get_or_init_backend, reset_backend, ClassifierBackend, LocalModel};

const MAX_BODY_CHARS: usize = 800;
const MAX_REASONING_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Team,
    Known,
    Unknown,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Team => "team",
            Tier::Known => "known",
            Tier::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Drop,
    Wake,
    Reply,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Drop => "drop",
            Action::Wake => "wake",
            Action::Reply => "reply",
        }
    }

    fn parse(s: &str) -> Option<Action> {
        match s {
            "drop" => Some(Action::Drop),
            "wake" => Some(Action::Wake),
            "reply" => Some(Action::Reply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriageResult {
    pub action: Action,
    pub reason: String,
    pub tier: Tier,
    pub wall_ms: u64,
    pub reasoning: String,
    pub prompt_hash: String,
}

/// Resolve a sender prefix's trust tier by first-prefix-match against
/// operator-configured tier lists. Tier iteration order is the
/// operator's declared order; team lists should be listed first since
/// the first matching tier wins.
pub fn resolve_tier(sender_prefix: &str, trust_tiers: &TrustTiers) -> Tier {
    for (name, prefixes) in trust_tiers {
        if prefixes.iter().any(|p| sender_prefix.starts_with(p.as_str())) {
            return match name.as_str() {
                "team" => Tier::Team,
                "known" => Tier::Known,
                _ => Tier::Unknown,
            };
        }
    }
    Tier::Unknown
}

/// First 16 hex characters of SHA-256 of `content`.
pub fn prompt_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^{}]*\}").unwrap())
}

#[derive(Deserialize)]
struct RawVerdict {
    action: String,
    #[serde(default)]
    reason: String,
}

/// Parse a raw model completion into `(action, reason)`. Tolerates
/// think-blocks and markdown fences (stripped by the caller via
/// [`backends::strip_markdown_fences`]) and extraneous narrative
/// surrounding the JSON object, extracting the first well-formed
/// object that contains an `action` field.
fn parse_verdict(raw: &str) -> (String, String) {
    let cleaned = backends::strip_markdown_fences(raw);

    if let Ok(v) = serde_json::from_str::<RawVerdict>(&cleaned) {
        return (v.action, v.reason);
    }

    for m in json_object_re().find_iter(&cleaned) {
        if let Ok(v) = serde_json::from_str::<RawVerdict>(m.as_str()) {
            return (v.action, v.reason);
        }
    }

    let prefix: String = cleaned.chars().take(120).collect();
    ("drop".to_string(), format!("unparseable LLM output: {prefix}"))
}

fn tier_fallback_action(tier: Tier, mode: FallbackMode) -> Action {
    match mode {
        FallbackMode::Wake => Action::Wake,
        FallbackMode::Drop => Action::Drop,
        FallbackMode::Tier => match tier {
            Tier::Team | Tier::Known => Action::Wake,
            Tier::Unknown => Action::Drop,
        },
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}

/// Render the active prompt template by substituting `{tier}`.
pub fn render_prompt(template: &str, tier: Tier) -> String {
    template.replace("{tier}", tier.as_str())
}

/// Owns the memoized backend handle and dispatches triage calls.
/// Backend construction itself is process-wide (see
/// [`backends::get_or_init_backend`]); this struct only holds the
/// configuration needed to build or rebuild it.
pub struct Classifier {
    backend_config: BackendConfig,
    local_loader: Arc<dyn Fn(&LocalBackendConfig) -> Result<Arc<dyn LocalModel>, String> + Send + Sync>,
}

impl Classifier {
    pub fn new(
        backend_config: BackendConfig,
        local_loader: impl Fn(&LocalBackendConfig) -> Result<Arc<dyn LocalModel>, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            backend_config,
            local_loader: Arc::new(local_loader),
        }
    }

    async fn backend(&self) -> Arc<dyn ClassifierBackend> {
        let loader = self.local_loader.clone();
        get_or_init_backend(&self.backend_config, move |c| loader(c)).await
    }

    /// Force the process-wide backend singleton to rebuild on next use,
    /// e.g. after an operator pushes new backend configuration.
    pub async fn reset_backend(&self) {
        reset_backend().await;
    }

    pub async fn triage(
        &self,
        sender_prefix: &str,
        body_text: &str,
        trust_tiers: &TrustTiers,
        active_prompt: &str,
        fallback: FallbackMode,
    ) -> TriageResult {
        let started = Instant::now();
        let tier = resolve_tier(sender_prefix, trust_tiers);
        let hash = prompt_hash(active_prompt);

        if tier == Tier::Team {
            return TriageResult {
                action: Action::Wake,
                reason: "team node, bypass".to_string(),
                tier,
                wall_ms: started.elapsed().as_millis() as u64,
                reasoning: "team node, no classification".to_string(),
                prompt_hash: hash,
            };
        }

        let system_prompt = render_prompt(active_prompt, tier);
        let user_text = truncate_chars(body_text, MAX_BODY_CHARS);

        let backend = self.backend().await;
        let (action, reason) = match backend.infer(&system_prompt, &user_text).await {
            Ok(raw) => parse_verdict(&raw),
            Err(e) => {
                let truncated = truncate_chars(&e.to_string(), 300);
                let action = tier_fallback_action(tier, fallback);
                return TriageResult {
                    action,
                    reason: format!("backend error: {truncated}"),
                    tier,
                    wall_ms: started.elapsed().as_millis() as u64,
                    reasoning: truncate_chars(&format!("backend error: {truncated}"), MAX_REASONING_CHARS),
                    prompt_hash: hash,
                };
            }
        };

        let resolved_action = Action::parse(&action).unwrap_or_else(|| tier_fallback_action(tier, fallback));

        TriageResult {
            action: resolved_action,
            reason: reason.clone(),
            tier,
            wall_ms: started.elapsed().as_millis() as u64,
            reasoning: truncate_chars(&reason, MAX_REASONING_CHARS),
            prompt_hash: hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> TrustTiers {
        vec![
            ("team".to_string(), vec!["bbbbbbbb".to_string()]),
            ("known".to_string(), vec!["cccccccc".to_string()]),
        ]
    }

    #[test]
    fn resolve_tier_matches_team_prefix() {
        assert_eq!(resolve_tier("bbbbbbbb00112233", &tiers()), Tier::Team);
    }

    #[test]
    fn resolve_tier_defaults_to_unknown() {
        assert_eq!(resolve_tier("ffffffffffffffff", &tiers()), Tier::Unknown);
    }

    #[test]
    fn prompt_hash_is_16_hex_chars() {
        let h = prompt_hash("hello {tier}");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn parse_verdict_handles_clean_json() {
        let (action, reason) = parse_verdict(r#"{"action":"wake","reason":"ok"}"#);
        assert_eq!(action, "wake");
        assert_eq!(reason, "ok");
    }

    #[test]
    fn parse_verdict_extracts_from_narrative() {
        let raw = "Sure, here's my answer:\n{\"action\":\"drop\",\"reason\":\"spam\"}\nHope that helps!";
        let (action, reason) = parse_verdict(raw);
        assert_eq!(action, "drop");
        assert_eq!(reason, "spam");
    }

    #[test]
    fn parse_verdict_falls_back_on_garbage() {
        let (action, reason) = parse_verdict("not json at all");
        assert_eq!(action, "drop");
        assert!(reason.starts_with("unparseable LLM output"));
    }

    #[test]
    fn tier_fallback_tier_mode_team_and_known_wake() {
        assert_eq!(tier_fallback_action(Tier::Team, FallbackMode::Tier), Action::Wake);
        assert_eq!(tier_fallback_action(Tier::Known, FallbackMode::Tier), Action::Wake);
        assert_eq!(tier_fallback_action(Tier::Unknown, FallbackMode::Tier), Action::Drop);
    }

    #[test]
    fn tier_fallback_constant_modes_ignore_tier() {
        assert_eq!(tier_fallback_action(Tier::Unknown, FallbackMode::Wake), Action::Wake);
        assert_eq!(tier_fallback_action(Tier::Team, FallbackMode::Drop), Action::Drop);
    }

    #[test]
    fn render_prompt_substitutes_tier_token() {
        assert_eq!(render_prompt("you are talking to a {tier} sender", Tier::Known), "you are talking to a known sender");
    }

    #[tokio::test]
    async fn team_sender_bypasses_backend_entirely() {
        let classifier = Classifier::new(
            BackendConfig::Local(LocalBackendConfig {
                model_path: "/tmp/never-loaded.gguf".into(),
                n_threads: 1,
                n_ctx: 512,
                max_tokens: 64,
            }),
            |_| Err("should never be called".into()),
        );

        let result = classifier
            .triage("bbbbbbbb00112233", "hi", &tiers(), "prompt {tier}", FallbackMode::Tier)
            .await;

        assert_eq!(result.action, Action::Wake);
        assert_eq!(result.tier, Tier::Team);
        assert_eq!(result.reason, "team node, bypass");
    }
}

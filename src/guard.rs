//! `ThrallGuard`: the top-level cooperative context composing every
//! component and implementing the inbound-message main hook.
//!
//! All hot-path state (loop/rate maps, breaker cache, DB connection) is
//! owned here and mutated only through `&mut self`, with no locking
//! around any of it. The only components that
//! cross a thread boundary (the classifier's backend singleton, the
//! local in-process model) carry their own locks internally.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::admin::{PromptRegistry, TRIAGE_PROMPT_NAME};
use crate::breaker::{BreakerGate, BreakerKind};
use crate::classifier::backends::LocalModel;
use crate::classifier::{Action, Classifier};
use crate::config::GuardConfig;
use crate::error::{ThrallError, ThrallResult};
use crate::intake;
use crate::loop_detector::LoopDetector;
use crate::persistence::{ClassificationRecord, Store};
use crate::rate_limiter::RateLimiter;

const LOOP_BREAKER_AUTO_EXPIRE_SECS: u64 = 3600;
const PRUNE_INTERVAL_SECS: u64 = 3600;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A request to wake the agent/operator, delivered as an outbound
/// system message by the host. The guard never sends this itself; it
/// only invokes the sink the host registered at construction.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    pub to_node: String,
    pub reason: String,
}

pub type WakeSink = Arc<dyn Fn(WakeEvent) + Send + Sync>;

pub struct ThrallGuard {
    config: GuardConfig,
    own_node_id: String,
    store: Arc<Mutex<Store>>,
    breaker_gate: BreakerGate,
    classifier: Classifier,
    loop_detector: LoopDetector,
    rate_limiter: RateLimiter,
    active_prompt: Arc<std::sync::Mutex<String>>,
    admin: PromptRegistry,
    wake_sink: WakeSink,
    last_prune: std::time::Instant,
}

impl ThrallGuard {
    pub async fn new(
        config: GuardConfig,
        plugin_dir: impl AsRef<Path>,
        own_node_id: impl Into<String>,
        local_loader: impl Fn(&crate::config::LocalBackendConfig) -> Result<Arc<dyn LocalModel>, String>
            + Send
            + Sync
            + 'static,
        wake_sink: WakeSink,
    ) -> ThrallResult<Self> {
        let plugin_dir = plugin_dir.as_ref().to_path_buf();
        let db_path = Store::default_path(&plugin_dir);
        let store = Arc::new(Mutex::new(
            Store::open(&db_path).map_err(ThrallError::Persistence)?,
        ));

        let active_prompt = Arc::new(std::sync::Mutex::new(
            config.prompt.clone().unwrap_or_default(),
        ));

        let reload_store = store.clone();
        let reload_prompt = active_prompt.clone();
        let on_reload: crate::admin::ReloadCallback = Arc::new(move || {
            let store = reload_store.clone();
            let prompt = reload_prompt.clone();
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async move {
                    let guard = store.lock().await;
                    let row = guard
                        .get_active_prompt(TRIAGE_PROMPT_NAME)
                        .await
                        .map_err(ThrallError::Persistence)?;
                    if let Some(row) = row {
                        *prompt.lock().unwrap() = row.content;
                    }
                    Ok(())
                })
            })
        });

        let admin = PromptRegistry::new(store.clone(), on_reload);
        admin.ensure_default_prompt().await?;
        if let Some(row) = store
            .lock()
            .await
            .get_active_prompt(TRIAGE_PROMPT_NAME)
            .await
            .map_err(ThrallError::Persistence)?
        {
            *active_prompt.lock().unwrap() = row.content;
        }

        let breaker_gate = BreakerGate::new(plugin_dir.join("breakers"));
        let classifier = Classifier::new(config.backend.clone(), local_loader);
        let loop_detector =
            LoopDetector::new(config.loop_threshold, config.loop_threshold_sessionless);
        let rate_limiter = RateLimiter::new(config.max_per_hour);

        Ok(Self {
            config,
            own_node_id: own_node_id.into(),
            store,
            breaker_gate,
            classifier,
            loop_detector,
            rate_limiter,
            active_prompt,
            admin,
            wake_sink,
            last_prune: std::time::Instant::now(),
        })
    }

    pub fn admin(&self) -> &PromptRegistry {
        &self.admin
    }

    pub fn record_send(&mut self, to_node_prefix: &str, session_id: &str) {
        self.loop_detector.record_send(to_node_prefix, session_id);
    }

    async fn record_classification(
        &self,
        sender_id: &str,
        tier: &str,
        action: &str,
        reasoning: &str,
        prompt_hash: &str,
        wall_ms: u64,
        session_id: Option<String>,
        message_id: Option<String>,
    ) {
        let now = now_secs();
        let ttl = now + (self.config.classification_ttl_days as f64) * 86_400.0;
        let record = ClassificationRecord {
            message_id,
            from_node: sender_id.to_string(),
            tier: tier.to_string(),
            action: action.to_string(),
            reasoning: crate::logging::sanitize(reasoning),
            prompt_hash: prompt_hash.to_string(),
            wall_ms,
            session_id,
            created_at: now,
            ttl_expires: ttl,
        };
        let mut store = self.store.lock().await;
        if let Err(e) = store.insert_classification(&record).await {
            tracing::warn!(error = %e, "failed to record classification");
        }
    }

    async fn knock_check(&self, sender_prefix: &str) {
        let since = now_secs() - 3600.0;
        let store = self.store.lock().await;
        match store.count_recent_drops(sender_prefix, since).await {
            Ok(count) if count >= self.config.knock_threshold => {
                (self.wake_sink)(WakeEvent {
                    to_node: self.own_node_id.clone(),
                    reason: format!("sustained drops from {sender_prefix}: {count} in the last hour"),
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "knock check query failed"),
        }
    }

    /// The inbound-message main hook. Always returns normally;
    /// failures in internal components are logged and swallowed here.
    pub async fn on_mail_received(
        &mut self,
        kind: &str,
        sender_id: &str,
        body: &serde_json::Value,
        session_id: Option<String>,
        message_id: Option<String>,
    ) {
        if !self.config.enabled {
            return;
        }

        let normalized = match intake::accept(
            kind,
            sender_id,
            body,
            session_id,
            message_id,
            &self.own_node_id,
            &self.config.ignore_msg_types,
        ) {
            Ok(m) => m,
            Err(reason) => {
                tracing::debug!(reason = reason.as_str(), sender_id, "message skipped at intake");
                return;
            }
        };

        if let Some(breaker) = self.breaker_gate.check(&normalized.sender_prefix) {
            self.record_classification(
                &normalized.sender_id,
                "unknown",
                "breaker_blocked",
                &format!("breaker: {}", breaker.reason),
                "",
                0,
                normalized.session_id.clone(),
                normalized.message_id.clone(),
            )
            .await;
            return;
        }

        if normalized.body_text.trim().is_empty() {
            tracing::debug!(sender_id, "message skipped: empty body");
            return;
        }

        let session_id = match &normalized.session_id {
            Some(s) if !s.is_empty() => Some(s.clone()),
            _ => Some(format!("resp:{}", normalized.sender_prefix)),
        };

        if !self.config.triage_enabled {
            tracing::debug!(sender_id, "triage disabled, passing message through");
            return;
        }

        let active_prompt = self.active_prompt.lock().unwrap().clone();
        let in_flight = self.store.lock().await.enter_in_flight();
        let result = self
            .classifier
            .triage(
                &normalized.sender_prefix,
                &normalized.body_text,
                &self.config.trust_tiers,
                &active_prompt,
                self.config.fallback,
            )
            .await;
        drop(in_flight);

        if result.action == Action::Drop {
            self.record_classification(
                &normalized.sender_id,
                result.tier.as_str(),
                "drop",
                &result.reasoning,
                &result.prompt_hash,
                result.wall_ms,
                session_id,
                normalized.message_id.clone(),
            )
            .await;
            self.knock_check(&normalized.sender_prefix).await;
            return;
        }

        if let Some(reason) = self
            .loop_detector
            .check(&normalized.sender_prefix, session_id.as_deref())
        {
            let _ = self.breaker_gate.trip(
                BreakerKind::Node,
                &normalized.sender_prefix,
                &reason,
                Some(LOOP_BREAKER_AUTO_EXPIRE_SECS),
            );
            (self.wake_sink)(WakeEvent {
                to_node: self.own_node_id.clone(),
                reason: reason.clone(),
            });
            self.record_classification(
                &normalized.sender_id,
                result.tier.as_str(),
                "loop_blocked",
                &reason,
                &result.prompt_hash,
                result.wall_ms,
                session_id,
                normalized.message_id.clone(),
            )
            .await;
            return;
        }

        if !self.rate_limiter.check(&normalized.sender_prefix) {
            tracing::debug!(sender_id, "rate limit exceeded, dropping silently");
            return;
        }
        self.rate_limiter.record(&normalized.sender_prefix);

        self.record_classification(
            &normalized.sender_id,
            result.tier.as_str(),
            result.action.as_str(),
            &result.reasoning,
            &result.prompt_hash,
            result.wall_ms,
            session_id,
            normalized.message_id.clone(),
        )
        .await;

        // Hand-off to the downstream collaborator (agent/responder) is
        // the host's responsibility; the guard's contract ends here.
    }

    /// Periodic tick: flush pending writes and, at most hourly, prune.
    pub async fn on_tick(&mut self) {
        if self.last_prune.elapsed().as_secs() < PRUNE_INTERVAL_SECS {
            return;
        }
        self.last_prune = std::time::Instant::now();

        let now = now_secs();
        let mut store = self.store.lock().await;
        if let Err(e) = store.prune_expired_classifications(now).await {
            tracing::warn!(error = %e, "prune failed");
        }
        if let Err(e) = store.flush().await {
            tracing::warn!(error = %e, "flush failed");
        }
        drop(store);

        self.breaker_gate.prune_expired();
    }

    pub async fn on_shutdown(&mut self) {
        let mut store = self.store.lock().await;
        if let Err(e) = store.shutdown().await {
            tracing::warn!(error = %e, "shutdown flush failed");
        }
    }
}

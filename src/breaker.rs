//! Breaker Gate: file-backed circuit breakers with a short-lived
//! in-memory read cache.
//!
//! Breakers live one-per-file under a `breakers/` directory. Reads are
//! cached for [`CACHE_TTL`] to avoid a filesystem round trip per
//! message; a trip invalidates the cache entry for its own target so
//! the next check observes it immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ThrallError;

const CACHE_TTL: Duration = Duration::from_secs(30);
pub const GLOBAL_TARGET: &str = "global";

fn target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]+$|^global$").unwrap())
}

/// Validate a breaker target before any path construction. Refuses
/// anything that is not the literal `global` or a hex string.
pub fn validate_target(target: &str) -> Result<(), ThrallError> {
    if target_re().is_match(target) {
        Ok(())
    } else {
        Err(ThrallError::Breaker(format!("invalid breaker target: {target}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerKind {
    Global,
    Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breaker {
    #[serde(rename = "type")]
    pub kind: BreakerKind,
    pub target: String,
    pub reason: String,
    pub tripped_at: String,
    pub trip_count: u32,
    pub last_event: String,
    pub auto_expire_seconds: Option<u64>,
    pub expires_at: Option<String>,
}

struct CacheEntry {
    value: Option<Breaker>,
    fetched_at: Instant,
}

/// Owns the on-disk breaker directory and the short-TTL read cache.
/// Not `Send`-shared; lives inside the single cooperative guard
/// context like every other hot-path structure.
pub struct BreakerGate {
    dir: PathBuf,
    cache: HashMap<String, CacheEntry>,
}

impl BreakerGate {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: HashMap::new(),
        }
    }

    fn path_for(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{target}.json"))
    }

    fn read_from_disk(&self, target: &str) -> Option<Breaker> {
        let path = self.path_for(target);
        let text = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str::<Breaker>(&text).ok()
    }

    fn is_expired(breaker: &Breaker, now: chrono::DateTime<chrono::Utc>) -> bool {
        match &breaker.expires_at {
            Some(ts) => match chrono::DateTime::parse_from_rfc3339(ts) {
                Ok(exp) => now >= exp.with_timezone(&chrono::Utc),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Fetch a single target, honoring the cache and pruning expired
    /// entries from disk as they are observed.
    fn lookup(&mut self, target: &str) -> Option<Breaker> {
        let now = Instant::now();
        let fresh = self
            .cache
            .get(target)
            .map(|e| now.duration_since(e.fetched_at) < CACHE_TTL)
            .unwrap_or(false);

        if !fresh {
            let on_disk = self.read_from_disk(target);
            let value = match on_disk {
                Some(b) if Self::is_expired(&b, chrono::Utc::now()) => {
                    let _ = std::fs::remove_file(self.path_for(target));
                    None
                }
                other => other,
            };
            self.cache.insert(
                target.to_string(),
                CacheEntry {
                    value: value.clone(),
                    fetched_at: now,
                },
            );
            return value;
        }

        self.cache.get(target).and_then(|e| e.value.clone())
    }

    /// Check the global breaker first, then the sender's prefix.
    /// Returns the first hit.
    pub fn check(&mut self, sender_prefix: &str) -> Option<Breaker> {
        if let Some(b) = self.lookup(GLOBAL_TARGET) {
            return Some(b);
        }
        self.lookup(sender_prefix)
    }

    /// Trip a breaker and persist it, invalidating the cache entry for
    /// its target so the next check observes it.
    pub fn trip(
        &mut self,
        kind: BreakerKind,
        target: &str,
        reason: &str,
        auto_expire_seconds: Option<u64>,
    ) -> Result<Breaker, ThrallError> {
        validate_target(target)?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ThrallError::Breaker(format!("create breakers dir: {e}")))?;

        let now = chrono::Utc::now();
        let expires_at = auto_expire_seconds
            .map(|secs| (now + chrono::Duration::seconds(secs as i64)).to_rfc3339());

        let existing_trip_count = self
            .lookup(target)
            .map(|b| b.trip_count)
            .unwrap_or(0);

        let breaker = Breaker {
            kind,
            target: target.to_string(),
            reason: reason.chars().take(500).collect(),
            tripped_at: now.to_rfc3339(),
            trip_count: existing_trip_count + 1,
            last_event: now.to_rfc3339(),
            auto_expire_seconds,
            expires_at,
        };

        let path = self.path_for(target);
        let text = serde_json::to_string(&breaker)
            .map_err(|e| ThrallError::Breaker(format!("serialize breaker: {e}")))?;
        std::fs::write(&path, text)
            .map_err(|e| ThrallError::Breaker(format!("write breaker: {e}")))?;

        self.cache.remove(target);
        Ok(breaker)
    }

    /// Clear the full cache. Called from the periodic prune cycle.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Sweep the breaker directory for expired files, deleting them.
    /// Called from the periodic prune cycle.
    pub fn prune_expired(&mut self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        let now = chrono::Utc::now();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(breaker) = serde_json::from_str::<Breaker>(&text) {
                    if Self::is_expired(&breaker, now) {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }
        self.clear_cache();
    }
}

/// Convenience used by callers who only have a directory path and want
/// to check without constructing a long-lived `BreakerGate`.
pub fn breaker_file_path(dir: &Path, target: &str) -> PathBuf {
    dir.join(format!("{target}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_target_accepts_hex_and_global() {
        assert!(validate_target("global").is_ok());
        assert!(validate_target("aabbccdd00112233").is_ok());
    }

    #[test]
    fn validate_target_rejects_traversal() {
        assert!(validate_target("../../etc/passwd").is_err());
        assert!(validate_target("GLOBAL").is_err());
        assert!(validate_target("abcd\nef").is_err());
    }

    #[test]
    fn trip_then_check_returns_breaker() {
        let dir = tempdir().unwrap();
        let mut gate = BreakerGate::new(dir.path());
        gate.trip(BreakerKind::Node, "dddddddddddddddd", "loop detected", Some(3600))
            .unwrap();

        let found = gate.check("dddddddddddddddd");
        assert!(found.is_some());
        assert_eq!(found.unwrap().target, "dddddddddddddddd");
    }

    #[test]
    fn global_breaker_short_circuits_before_sender() {
        let dir = tempdir().unwrap();
        let mut gate = BreakerGate::new(dir.path());
        gate.trip(BreakerKind::Global, GLOBAL_TARGET, "lockdown", None)
            .unwrap();

        let found = gate.check("aaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(found.target, GLOBAL_TARGET);
    }

    #[test]
    fn expired_breaker_is_pruned_and_not_returned() {
        let dir = tempdir().unwrap();
        let mut gate = BreakerGate::new(dir.path());
        let past = (chrono::Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
        let breaker = Breaker {
            kind: BreakerKind::Node,
            target: "eeeeeeeeeeeeeeee".into(),
            reason: "old".into(),
            tripped_at: past.clone(),
            trip_count: 1,
            last_event: past.clone(),
            auto_expire_seconds: Some(1),
            expires_at: Some(past),
        };
        std::fs::write(
            gate.path_for("eeeeeeeeeeeeeeee"),
            serde_json::to_string(&breaker).unwrap(),
        )
        .unwrap();

        assert!(gate.check("eeeeeeeeeeeeeeee").is_none());
        assert!(!gate.path_for("eeeeeeeeeeeeeeee").exists());
    }

    #[test]
    fn trip_rejects_invalid_target() {
        let dir = tempdir().unwrap();
        let mut gate = BreakerGate::new(dir.path());
        let err = gate
            .trip(BreakerKind::Node, "../escape", "x", None)
            .unwrap_err();
        assert!(matches!(err, ThrallError::Breaker(_)));
    }
}

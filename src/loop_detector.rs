//! Loop Detector: bounded LRU map of per-sender arrival windows, with
//! an auxiliary solicited-send map used to double the threshold when
//! the node itself has recently spoken to the same sender+session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use lru::LruCache;
use std::num::NonZeroUsize;

const CAPACITY: usize = 10_000;
const WINDOW: Duration = Duration::from_secs(30 * 60);
const SOLICITED_WINDOW: Duration = Duration::from_secs(60 * 60);
const RESPONDER_PREFIX: &str = "resp:";

/// Map a raw session id to its counting bucket: an explicit session
/// passes through, anything empty/missing/auto-generated collapses to
/// `"default"` so unrelated auto-sessions don't each get their own
/// separate threshold.
pub fn session_bucket(session_id: Option<&str>) -> String {
    match session_id {
        Some(s) if !s.is_empty() && !s.starts_with(RESPONDER_PREFIX) => s.to_string(),
        _ => "default".to_string(),
    }
}

pub struct LoopDetector {
    windows: LruCache<(String, String), VecDeque<Instant>>,
    solicited: LruCache<(String, String), Instant>,
    threshold_with_session: u32,
    threshold_sessionless: u32,
}

impl LoopDetector {
    pub fn new(threshold_with_session: u32, threshold_sessionless: u32) -> Self {
        let cap = NonZeroUsize::new(CAPACITY).unwrap();
        Self {
            windows: LruCache::new(cap),
            solicited: LruCache::new(cap),
            threshold_with_session,
            threshold_sessionless,
            }
    }

    /// Record that the node originated a message to `sender_prefix` in
    /// `session_id`, for the solicited-send double-threshold rule.
    pub fn record_send(&mut self, sender_prefix: &str, session_id: &str) {
        let key = (sender_prefix.to_string(), session_id.to_string());
        self.solicited.put(key, Instant::now());
    }

    fn has_recent_solicited_send(&mut self, sender_prefix: &str, session_id: &str) -> bool {
        let key = (sender_prefix.to_string(), session_id.to_string());
        match self.solicited.get(&key) {
            Some(at) => at.elapsed() < SOLICITED_WINDOW,
            None => false,
        }
    }

    fn effective_threshold(&self, session_id: Option<&str>, solicited: bool) -> u32 {
        let explicit_session = matches!(session_id, Some(s) if !s.is_empty() && !s.starts_with(RESPONDER_PREFIX));
        let base = if explicit_session {
            self.threshold_with_session
        } else {
            self.threshold_sessionless
        };
        if solicited {
            base * 2
        } else {
            base
        }
    }

    /// Record this arrival and check whether the sliding window now
    /// exceeds the effective threshold. Returns `Some(reason)` when a
    /// loop should be declared.
    pub fn check(&mut self, sender_prefix: &str, session_id: Option<&str>) -> Option<String> {
        let bucket = session_bucket(session_id);
        let solicited = self.has_recent_solicited_send(sender_prefix, session_id.unwrap_or(""));
        let threshold = self.effective_threshold(session_id, solicited);

        let key = (bucket.clone(), sender_prefix.to_string());
        let now = Instant::now();
        if !self.windows.contains(&key) {
            self.windows.put(key.clone(), VecDeque::new());
        }
        let window = self.windows.get_mut(&key).expect("just inserted");
        window.push_back(now);
        while let Some(front) = window.front() {
            if now.duration_since(*front) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() as u32 > threshold {
            Some(format!(
                "{} messages from {} in bucket {} within 30 minutes (threshold {})",
                window.len(),
                sender_prefix,
                bucket,
                threshold
            ))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn solicited_len(&self) -> usize {
        self.solicited.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_bucket_collapses_auto_generated() {
        assert_eq!(session_bucket(None), "default");
        assert_eq!(session_bucket(Some("")), "default");
        assert_eq!(session_bucket(Some("resp:aabb")), "default");
        assert_eq!(session_bucket(Some("s1")), "s1");
    }

    #[test]
    fn loop_trips_on_third_in_session_message() {
        let mut detector = LoopDetector::new(2, 5);
        assert!(detector.check("dddddddddddddddd", Some("s1")).is_none());
        assert!(detector.check("dddddddddddddddd", Some("s1")).is_none());
        assert!(detector.check("dddddddddddddddd", Some("s1")).is_some());
    }

    #[test]
    fn sessionless_threshold_is_higher() {
        let mut detector = LoopDetector::new(2, 5);
        for _ in 0..5 {
            assert!(detector.check("aaaaaaaaaaaaaaaa", None).is_none());
        }
        assert!(detector.check("aaaaaaaaaaaaaaaa", None).is_some());
    }

    #[test]
    fn solicited_send_doubles_threshold() {
        let mut detector = LoopDetector::new(2, 5);
        detector.record_send("cccccccccccccccc", "s2");
        assert!(detector.check("cccccccccccccccc", Some("s2")).is_none());
        assert!(detector.check("cccccccccccccccc", Some("s2")).is_none());
        assert!(detector.check("cccccccccccccccc", Some("s2")).is_none());
        assert!(detector.check("cccccccccccccccc", Some("s2")).is_some());
    }

    #[test]
    fn distinct_senders_do_not_share_windows() {
        let mut detector = LoopDetector::new(2, 5);
        detector.check("1111111111111111", Some("s"));
        detector.check("2222222222222222", Some("s"));
        assert_eq!(detector.len(), 2);
    }
}

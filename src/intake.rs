//! Intake Filter: sender validation, ignored-kind filtering, and body
//! coercion into usable text.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Reserved token substituted for any sender id that fails the hex test.
pub const INVALID_PREFIX: &str = "invalid";

/// Truncation applied to each scalar field when building a body preview.
const MAX_BODY_PREVIEW_FIELD: usize = 2000;

fn hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]+$").unwrap())
}

/// Extract and validate a 16-char hex prefix from a node id. Returns
/// `"invalid"` if the first 16 characters (lowercased) are not all hex.
pub fn sanitize_node_prefix(sender_id: &str) -> String {
    let lower = sender_id.to_lowercase();
    let prefix: String = lower.chars().take(16).collect();
    if !prefix.is_empty() && hex_re().is_match(&prefix) {
        prefix
    } else {
        INVALID_PREFIX.to_string()
    }
}

/// Why an inbound message was rejected before reaching the breaker gate
/// or classifier. Logged, never persisted as a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InvalidSender,
    OwnNode,
    IgnoredKind,
    EmptyBody,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InvalidSender => "skip_invalid_sender",
            SkipReason::OwnNode => "skip_own_node",
            SkipReason::IgnoredKind => "skip_ignored_kind",
            SkipReason::EmptyBody => "skip_empty_body",
        }
    }
}

/// A message admitted past the intake gate.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub sender_id: String,
    pub sender_prefix: String,
    pub kind: String,
    pub body_text: String,
    pub session_id: Option<String>,
    pub message_id: Option<String>,
}

/// Coerce an arbitrary JSON body into an object map, per spec:
/// - string: try to parse as JSON; on failure wrap as `{content: s}`
/// - object: pass through
/// - null: becomes `{}`
/// - anything else (array, number, bool): wrap as `{content: stringify(v)}`
pub fn coerce_body(body: &Value) -> Map<String, Value> {
    match body {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            _ => {
                let mut m = Map::new();
                m.insert("content".into(), Value::String(s.clone()));
                m
            }
        },
        other => {
            let mut m = Map::new();
            m.insert("content".into(), Value::String(other.to_string()));
            m
        }
    }
}

/// Derive body text: `content` then `text`, else a truncated preview of
/// the first ~10 fields serialized as JSON. Returns empty string if
/// nothing usable is found.
pub fn extract_body_text(body: &Map<String, Value>) -> String {
    if let Some(Value::String(s)) = body.get("content") {
        if !s.is_empty() {
            return s.clone();
        }
    }
    if let Some(Value::String(s)) = body.get("text") {
        if !s.is_empty() {
            return s.clone();
        }
    }

    let mut preview = Map::new();
    for (k, v) in body.iter().take(10) {
        let truncated = match v {
            Value::String(s) if s.len() > MAX_BODY_PREVIEW_FIELD => {
                Value::String(s.chars().take(MAX_BODY_PREVIEW_FIELD).collect())
            }
            other => other.clone(),
        };
        preview.insert(k.clone(), truncated);
    }
    if preview.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&preview).unwrap_or_default()
    }
}

/// Run the full intake pipeline. `own_node_id` is this node's own id
/// (messages from self are rejected); `ignored_kinds` is the
/// operator-configured ignore list.
pub fn accept(
    kind: &str,
    sender_id: &str,
    body: &Value,
    session_id: Option<String>,
    message_id: Option<String>,
    own_node_id: &str,
    ignored_kinds: &[String],
) -> Result<NormalizedMessage, SkipReason> {
    let prefix = sanitize_node_prefix(sender_id);
    if prefix == INVALID_PREFIX {
        return Err(SkipReason::InvalidSender);
    }
    if sender_id == own_node_id {
        return Err(SkipReason::OwnNode);
    }
    let effective_kind = if kind.is_empty() { "text" } else { kind };
    if ignored_kinds.iter().any(|k| k == effective_kind) {
        return Err(SkipReason::IgnoredKind);
    }

    let coerced = coerce_body(body);
    let text = extract_body_text(&coerced);
    if text.trim().is_empty() {
        return Err(SkipReason::EmptyBody);
    }

    Ok(NormalizedMessage {
        sender_id: sender_id.to_string(),
        sender_prefix: prefix,
        kind: effective_kind.to_string(),
        body_text: text,
        session_id,
        message_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_hex_prefix_is_lowercased_and_truncated() {
        let id = "AABBCCDDEEFF00112233445566778899";
        assert_eq!(sanitize_node_prefix(id), "aabbccddeeff0011");
    }

    #[test]
    fn invalid_senders_resolve_to_invalid() {
        for bad in ["not-hex!!", "../../etc/passwd", "abcd\nef", "abcdef01234567%_"] {
            assert_eq!(sanitize_node_prefix(bad), INVALID_PREFIX, "{bad}");
        }
    }

    #[test]
    fn coerce_body_object_passthrough() {
        let v = serde_json::json!({"content": "hi"});
        let m = coerce_body(&v);
        assert_eq!(m.get("content").unwrap(), "hi");
    }

    #[test]
    fn coerce_body_null_becomes_empty_map() {
        assert!(coerce_body(&Value::Null).is_empty());
    }

    #[test]
    fn coerce_body_string_json_parses() {
        let v = Value::String(r#"{"content":"hello"}"#.to_string());
        let m = coerce_body(&v);
        assert_eq!(m.get("content").unwrap(), "hello");
    }

    #[test]
    fn coerce_body_plain_string_wraps() {
        let v = Value::String("not json".to_string());
        let m = coerce_body(&v);
        assert_eq!(m.get("content").unwrap(), "not json");
    }

    #[test]
    fn coerce_body_string_literal_null_becomes_empty_map() {
        let v = Value::String("null".to_string());
        assert!(coerce_body(&v).is_empty());
    }

    #[test]
    fn coerce_body_scalars_never_panic() {
        for v in [
            Value::Null,
            serde_json::json!(42),
            serde_json::json!(["a", "b"]),
            serde_json::json!(true),
        ] {
            let _ = coerce_body(&v);
        }
    }

    #[test]
    fn extract_text_prefers_content_over_text() {
        let mut m = Map::new();
        m.insert("content".into(), Value::String("c".into()));
        m.insert("text".into(), Value::String("t".into()));
        assert_eq!(extract_body_text(&m), "c");
    }

    #[test]
    fn extract_text_falls_back_to_preview() {
        let mut m = Map::new();
        m.insert("foo".into(), Value::String("bar".into()));
        assert!(extract_body_text(&m).contains("bar"));
    }

    #[test]
    fn extract_text_empty_map_is_empty() {
        assert_eq!(extract_body_text(&Map::new()), "");
    }

    #[test]
    fn accept_rejects_self_messages() {
        let body = serde_json::json!({"content": "hi"});
        let err = accept(
            "text",
            "aa".repeat(32).as_str(),
            &body,
            None,
            None,
            "aa".repeat(32).as_str(),
            &[],
        )
        .unwrap_err();
        assert_eq!(err, SkipReason::OwnNode);
    }

    #[test]
    fn accept_rejects_ignored_kinds() {
        let body = serde_json::json!({"content": "hi"});
        let err = accept(
            "ack",
            &"bb".repeat(32),
            &body,
            None,
            None,
            &"aa".repeat(32),
            &["ack".to_string()],
        )
        .unwrap_err();
        assert_eq!(err, SkipReason::IgnoredKind);
    }

    #[test]
    fn accept_admits_valid_message() {
        let body = serde_json::json!({"content": "hello there"});
        let msg = accept(
            "text",
            &"bb".repeat(32),
            &body,
            Some("s1".into()),
            Some("m1".into()),
            &"aa".repeat(32),
            &[],
        )
        .unwrap();
        assert_eq!(msg.body_text, "hello there");
        assert_eq!(msg.sender_prefix, "b".repeat(16));
    }
}

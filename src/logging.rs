//! Append-only, sanitized text logging to `thrall.log`, plus the
//! ambient `tracing` subscriber setup shared by every component.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "thrall.log";
const MAX_SANITIZED_LEN: usize = 2000;

/// Strip control characters (including newlines) from a user-supplied
/// substring before it reaches the log, to prevent log injection /
/// forged log lines, and cap its length.
pub fn sanitize(text: &str) -> String {
    let cleaned: String = text.chars().filter(|c| !c.is_control()).collect();
    if cleaned.chars().count() > MAX_SANITIZED_LEN {
        cleaned.chars().take(MAX_SANITIZED_LEN).collect()
    } else {
        cleaned
    }
}

/// Initialize the global `tracing` subscriber: pretty console output
/// plus a non-blocking append-only writer to `<plugin_dir>/thrall.log`.
/// The returned guard must be held for the process lifetime; dropping
/// it stops the background flush thread.
pub fn init(plugin_dir: impl AsRef<Path>) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(plugin_dir.as_ref())?;
    let file_appender = tracing_appender::rolling::never(plugin_dir.as_ref(), LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_newlines_and_control_chars() {
        let raw = "line one\nline two\r\ttabbed";
        let cleaned = sanitize(raw);
        assert!(!cleaned.contains('\n'));
        assert!(!cleaned.contains('\r'));
        assert!(!cleaned.contains('\t'));
    }

    #[test]
    fn sanitize_truncates_to_max_length() {
        let raw = "a".repeat(MAX_SANITIZED_LEN + 500);
        let cleaned = sanitize(&raw);
        assert_eq!(cleaned.chars().count(), MAX_SANITIZED_LEN);
    }

    #[test]
    fn sanitize_leaves_plain_text_untouched() {
        assert_eq!(sanitize("hello world"), "hello world");
    }
}

//! Inbound-mail triage guard for a peer-to-peer node: breaker gate,
//! tiered LLM classification, loop/rate limiting, and audit
//! persistence sitting on the message receive path.

pub mod admin;
pub mod breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod guard;
pub mod intake;
pub mod logging;
pub mod loop_detector;
pub mod persistence;
pub mod rate_limiter;

pub use config::GuardConfig;
pub use error::{BackendError, PersistenceError, ThrallError, ThrallResult};
pub use guard::{ThrallGuard, WakeEvent, WakeSink};

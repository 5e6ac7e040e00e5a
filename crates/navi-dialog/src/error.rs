//! Error types for the dialogue core.

use navi_core::error::NaviError;

/// Errors surfaced to callers of the dialogue API.
///
/// Collaborator failures inside a turn (NLU, handlers) never show up here;
/// the engine turns them into a parsing-error reply instead.
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("registry error: {0}")]
    Registry(String),
    #[error("response catalog error: {0}")]
    Catalog(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("core error: {0}")]
    Core(#[from] NaviError),
}

/// Failure reported by an NLU collaborator.
#[derive(Debug, thiserror::Error)]
pub enum NluError {
    #[error("NLU service unavailable: {0}")]
    Unavailable(String),
    #[error("NLU response malformed: {0}")]
    Malformed(String),
    #[error("NLU call timed out after {0} ms")]
    Timeout(u64),
}

/// Failure reported by an intent handler stage.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("handler stage timed out after {0} ms")]
    Timeout(u64),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Failure delivering a reply over an adapter's transport.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("reply delivery failed: {0}")]
    Delivery(String),
    #[error("adapter closed")]
    Closed,
}

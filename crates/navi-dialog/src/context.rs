//! Per-user conversation state.
//!
//! A [`UserContext`] is a string-keyed map of JSON values that the engine and
//! handlers read and write across the stages of a turn. [`Handles`] stores
//! typed, non-serialisable objects (reply channels, platform clients) for a
//! user or for the whole process.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use navi_core::types::UserId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Well-known context keys.
pub mod keys {
    pub const USER: &str = "user";
    pub const SESSION_STARTED: &str = "session_started";
    pub const SHOULD_CLOSE_SESSION: &str = "should_close_session";
    pub const SESSION_NUMBER: &str = "session_number";
    /// Type name of the intent being worked on, kept between turns.
    pub const INTENT: &str = "intent";
    pub const READY: &str = "ready";
    pub const HANDLED: &str = "handled";
    pub const FAILURE: &str = "failure";
    pub const IN_PROGRESS: &str = "in_progress";
    pub const CONFIRM_FAILURE: &str = "confirm_failure";
    pub const CONFIRM_UNSUPPORTED: &str = "confirm_unsupported";
}

/// Keys owned by the session lifecycle; [`UserContext::merge`] leaves them alone.
const MERGE_PROTECTED: [&str; 4] = [
    keys::USER,
    keys::SESSION_STARTED,
    keys::SESSION_NUMBER,
    keys::INTENT,
];

/// Endings that mark a key as a transient error marker.
const ERROR_MARKERS: [&str; 4] = ["missing", "unsupported", "ambiguous", "failure"];

/// Whether `key` is a transient error marker (`artist_missing`, `confirm_failure`, `failure`, ...).
pub fn is_error_marker(key: &str) -> bool {
    ERROR_MARKERS.iter().any(|marker| {
        key == *marker
            || key
                .strip_suffix(marker)
                .is_some_and(|head| head.ends_with('_'))
    })
}

// =============================================================================
// UserContext
// =============================================================================

/// Mutable semantic state for one user.
///
/// Always holds `user`, `session_started` and `should_close_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    values: Map<String, Value>,
}

impl UserContext {
    /// Create a context in its minimal, closed-session form.
    pub fn new(user: &UserId) -> Self {
        let mut ctx = Self { values: Map::new() };
        ctx.values
            .insert(keys::USER.to_string(), Value::String(user.to_string()));
        ctx.mark_closed();
        ctx
    }

    pub fn user(&self) -> UserId {
        UserId::from_optional(self.get_str(keys::USER))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Read a boolean flag; absent or non-boolean values count as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Merge `other` over this context.
    ///
    /// `user`, `session_started`, `session_number` and `intent` are never
    /// overwritten; `should_close_session` is the one lifecycle key a merge
    /// may set.
    pub fn merge(&mut self, other: &Map<String, Value>) {
        for (key, value) in other {
            if MERGE_PROTECTED.contains(&key.as_str()) {
                continue;
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Insert `defaults` for keys this context does not have yet.
    pub fn seed_defaults(&mut self, defaults: &Map<String, Value>) {
        for (key, value) in defaults {
            if !self.values.contains_key(key) {
                self.values.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    // -- Session lifecycle --

    pub fn session_started(&self) -> bool {
        self.flag(keys::SESSION_STARTED)
    }

    pub fn should_close_session(&self) -> bool {
        self.flag(keys::SHOULD_CLOSE_SESSION)
    }

    pub fn session_token(&self) -> Option<&str> {
        self.get_str(keys::SESSION_NUMBER)
    }

    /// Open a session if none is running and return the active token.
    pub fn ensure_session(&mut self) -> String {
        if self.session_started() {
            if let Some(token) = self.session_token() {
                return token.to_string();
            }
        }
        let token = Uuid::new_v4().to_string();
        self.insert(keys::SESSION_NUMBER, token.clone());
        self.insert(keys::SESSION_STARTED, true);
        self.insert(keys::SHOULD_CLOSE_SESSION, false);
        token
    }

    /// Ask for the session to be closed once the current turn completes.
    pub fn close_session_when_done(&mut self) {
        self.insert(keys::SHOULD_CLOSE_SESSION, true);
    }

    /// Drop everything except the owning user and mark the session closed.
    pub fn reset(&mut self) {
        let user = self
            .values
            .remove(keys::USER)
            .unwrap_or_else(|| Value::String(UserId::ANY.to_string()));
        self.values.clear();
        self.values.insert(keys::USER.to_string(), user);
        self.mark_closed();
    }

    /// Whether the context is in its minimal, closed form.
    pub fn is_reset(&self) -> bool {
        self.len() == 3 && !self.session_started() && !self.should_close_session()
    }

    fn mark_closed(&mut self) {
        self.values
            .insert(keys::SESSION_STARTED.to_string(), Value::Bool(false));
        self.values
            .insert(keys::SHOULD_CLOSE_SESSION.to_string(), Value::Bool(false));
    }

    // -- Error markers --

    /// Keys currently holding transient error markers.
    pub fn error_markers(&self) -> Vec<&str> {
        self.keys().filter(|k| is_error_marker(k)).collect()
    }

    pub fn has_error_markers(&self) -> bool {
        self.keys().any(is_error_marker)
    }

    /// Remove every transient error marker, returning how many were removed.
    pub fn clear_error_markers(&mut self) -> usize {
        let before = self.values.len();
        self.values.retain(|key, _| !is_error_marker(key));
        before - self.values.len()
    }
}

impl fmt::Display for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.values.clone()))
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Typed object store keyed by name.
///
/// Used for user metadata (reply handles that must outlive session resets)
/// and for the process-wide general map.
#[derive(Clone, Default)]
pub struct Handles {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Handles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    pub fn insert_arc<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.entries.insert(key.into(), value);
    }

    /// Fetch the entry under `key` if it holds a `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries.get(key).cloned()?.downcast::<T>().ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Handles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("Handles").field("keys", &keys).finish()
    }
}

/// Adapter-specific state for one user; survives session resets.
#[derive(Debug, Clone)]
pub struct UserMetadata {
    pub user: UserId,
    pub handles: Handles,
}

impl UserMetadata {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            handles: Handles::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

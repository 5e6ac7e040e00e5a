//! Core types for the dialogue pipeline.
//!
//! Defines intents and their declared slots, and the outcomes each pipeline
//! stage (resolve, confirm, handle) reports back to the engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::context::keys;

// =============================================================================
// Stage outcomes
// =============================================================================

/// Per-slot result of the resolve stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    NotRequired,
    Missing,
    Unsupported,
    Ambiguous,
    Ready,
}

impl ResolveOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolveOutcome::NotRequired => "not_required",
            ResolveOutcome::Missing => "missing",
            ResolveOutcome::Unsupported => "unsupported",
            ResolveOutcome::Ambiguous => "ambiguous",
            ResolveOutcome::Ready => "ready",
        }
    }

    /// Whether the user must be asked for more information.
    pub fn needs_more_input(self) -> bool {
        matches!(
            self,
            ResolveOutcome::Missing | ResolveOutcome::Unsupported | ResolveOutcome::Ambiguous
        )
    }

    /// Context key flagging this outcome for `slot`, e.g. `artist_missing`.
    pub fn marker_key(self, slot: &str) -> Option<String> {
        self.needs_more_input()
            .then(|| format!("{}_{}", slot, self.as_str()))
    }
}

impl fmt::Display for ResolveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolveOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_required" => Ok(ResolveOutcome::NotRequired),
            "missing" => Ok(ResolveOutcome::Missing),
            "unsupported" => Ok(ResolveOutcome::Unsupported),
            "ambiguous" => Ok(ResolveOutcome::Ambiguous),
            "ready" => Ok(ResolveOutcome::Ready),
            _ => Err(format!("Unknown resolve outcome: {}", s)),
        }
    }
}

/// Result of the confirm stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Unspecified,
    Unsupported,
    Failure,
    #[default]
    Ready,
}

impl ConfirmOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmOutcome::Unspecified => "unspecified",
            ConfirmOutcome::Unsupported => "unsupported",
            ConfirmOutcome::Failure => "failure",
            ConfirmOutcome::Ready => "ready",
        }
    }

    pub fn is_ready(self) -> bool {
        self == ConfirmOutcome::Ready
    }

    /// Context key set when confirmation does not go through.
    pub fn marker_key(self) -> Option<&'static str> {
        match self {
            ConfirmOutcome::Failure => Some(keys::CONFIRM_FAILURE),
            ConfirmOutcome::Unsupported => Some(keys::CONFIRM_UNSUPPORTED),
            ConfirmOutcome::Unspecified | ConfirmOutcome::Ready => None,
        }
    }
}

impl fmt::Display for ConfirmOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConfirmOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(ConfirmOutcome::Unspecified),
            "unsupported" => Ok(ConfirmOutcome::Unsupported),
            "failure" => Ok(ConfirmOutcome::Failure),
            "ready" => Ok(ConfirmOutcome::Ready),
            _ => Err(format!("Unknown confirm outcome: {}", s)),
        }
    }
}

/// Status reported by the handle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    #[default]
    Unspecified,
    InProgress,
    Success,
    Failure,
}

impl HandleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleStatus::Unspecified => "unspecified",
            HandleStatus::InProgress => "in_progress",
            HandleStatus::Success => "success",
            HandleStatus::Failure => "failure",
        }
    }

    /// Context flag recording this status, if any.
    pub fn context_flag(self) -> Option<&'static str> {
        match self {
            HandleStatus::Success => Some(keys::HANDLED),
            HandleStatus::Failure => Some(keys::FAILURE),
            HandleStatus::InProgress => Some(keys::IN_PROGRESS),
            HandleStatus::Unspecified => None,
        }
    }

    /// Whether the intent is finished and the session may close.
    pub fn completes_turn(self) -> bool {
        self != HandleStatus::InProgress
    }
}

impl fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HandleStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(HandleStatus::Unspecified),
            "in_progress" => Ok(HandleStatus::InProgress),
            "success" => Ok(HandleStatus::Success),
            "failure" => Ok(HandleStatus::Failure),
            _ => Err(format!("Unknown handle status: {}", s)),
        }
    }
}

/// What a handler returns from the handle stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleResponse {
    pub status: HandleStatus,
    /// Merged into the user's context and used to fill the reply template.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl HandleResponse {
    pub fn new(status: HandleStatus) -> Self {
        Self {
            status,
            payload: Map::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(HandleStatus::Success)
    }

    pub fn failure() -> Self {
        Self::new(HandleStatus::Failure)
    }

    pub fn in_progress() -> Self {
        Self::new(HandleStatus::InProgress)
    }

    /// Ask for the session to close after this turn, whatever the status.
    pub fn close_session(self) -> Self {
        self.with(keys::SHOULD_CLOSE_SESSION, true)
    }

    /// Add a payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Intents
// =============================================================================

/// Declared shape of an intent type: its name and ordered slot list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentSchema {
    name: String,
    slots: Vec<String>,
}

impl IntentSchema {
    pub fn new<S: Into<String>>(name: impl Into<String>, slots: impl IntoIterator<Item = S>) -> Self {
        let mut declared: Vec<String> = Vec::new();
        for slot in slots {
            let slot = slot.into();
            if !declared.contains(&slot) {
                declared.push(slot);
            }
        }
        Self {
            name: name.into(),
            slots: declared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }

    pub fn declares(&self, slot: &str) -> bool {
        self.slots.iter().any(|s| s == slot)
    }

    /// Build an intent, taking each slot from `entities`, else `context`, else absent.
    ///
    /// JSON `null` counts as absent in both sources.
    pub fn construct(&self, entities: &Map<String, Value>, context: &Map<String, Value>) -> Intent {
        let present = |source: &Map<String, Value>, slot: &str| {
            source.get(slot).filter(|v| !v.is_null()).cloned()
        };
        let slots = self
            .slots
            .iter()
            .map(|slot| {
                let value = present(entities, slot).or_else(|| present(context, slot));
                (slot.clone(), value)
            })
            .collect();
        Intent {
            type_name: self.name.clone(),
            slots,
        }
    }
}

/// A typed request with its slot values filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    type_name: String,
    slots: Vec<(String, Option<Value>)>,
}

impl Intent {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Value of `slot`, or `None` if absent or undeclared.
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.slots
            .iter()
            .find(|(name, _)| name == slot)
            .and_then(|(_, value)| value.as_ref())
    }

    pub fn get_str(&self, slot: &str) -> Option<&str> {
        self.get(slot).and_then(Value::as_str)
    }

    pub fn is_filled(&self, slot: &str) -> bool {
        self.get(slot).is_some()
    }

    /// Overwrite a declared slot. Returns `false` for undeclared slots.
    pub fn set(&mut self, slot: &str, value: impl Into<Value>) -> bool {
        match self.slots.iter_mut().find(|(name, _)| name == slot) {
            Some((_, current)) => {
                *current = Some(value.into());
                true
            }
            None => false,
        }
    }

    /// Declared slot names, in declaration order.
    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|(name, _)| name.as_str())
    }

    pub fn slots(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.slots
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.type_name)?;
        for (i, (name, value)) in self.slots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                Some(value) => write!(f, "{}={}", name, value)?,
                None => write!(f, "{}=<absent>", name)?,
            }
        }
        write!(f, ")")
    }
}

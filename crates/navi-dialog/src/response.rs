//! Response catalog.
//!
//! Reply templates are grouped under a [`ResponseKey`]: a slot outcome, a
//! confirm outcome, a handle status, or a bare string key. Each lookup picks
//! one template uniformly at random, then fills `{name}` placeholders from
//! the stage payload and, failing that, the user's context.
//!
//! Catalogs can be built in code or loaded from TOML response modules:
//!
//! ```toml
//! [keys]
//! greeting = ["Hi!", "Hello {user}."]
//!
//! [intents.FindMusicIntent.slots.artist]
//! missing = "Which artist?"
//!
//! [intents.FindMusicIntent.handle]
//! success = ["Now playing {track} by {artist}."]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use rand::seq::IndexedRandom;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::context::UserContext;
use crate::error::DialogError;
use crate::types::{ConfirmOutcome, HandleStatus, ResolveOutcome};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid placeholder regex")
});

// =============================================================================
// ResponseKey
// =============================================================================

/// Composite lookup key for a set of templates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseKey {
    Slot {
        intent: String,
        slot: String,
        outcome: ResolveOutcome,
    },
    Confirm {
        intent: String,
        outcome: ConfirmOutcome,
    },
    Handle {
        intent: String,
        status: HandleStatus,
    },
    Key(String),
}

impl ResponseKey {
    pub fn slot(intent: impl Into<String>, slot: impl Into<String>, outcome: ResolveOutcome) -> Self {
        ResponseKey::Slot {
            intent: intent.into(),
            slot: slot.into(),
            outcome,
        }
    }

    pub fn confirm(intent: impl Into<String>, outcome: ConfirmOutcome) -> Self {
        ResponseKey::Confirm {
            intent: intent.into(),
            outcome,
        }
    }

    pub fn handle(intent: impl Into<String>, status: HandleStatus) -> Self {
        ResponseKey::Handle {
            intent: intent.into(),
            status,
        }
    }

    pub fn key(key: impl Into<String>) -> Self {
        ResponseKey::Key(key.into())
    }

    /// Text returned when no template is registered.
    fn fallback(&self) -> &str {
        match self {
            ResponseKey::Key(key) => key,
            _ => "",
        }
    }
}

impl fmt::Display for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseKey::Slot {
                intent,
                slot,
                outcome,
            } => write!(f, "intent.{}.slot.{}.{}", intent, slot, outcome),
            ResponseKey::Confirm { intent, outcome } => {
                write!(f, "intent.{}.confirm.{}", intent, outcome)
            }
            ResponseKey::Handle { intent, status } => {
                write!(f, "intent.{}.handle.{}", intent, status)
            }
            ResponseKey::Key(key) => write!(f, "key.{}", key),
        }
    }
}

// =============================================================================
// ResponseCatalog
// =============================================================================

/// Keyed reply templates.
#[derive(Debug, Clone, Default)]
pub struct ResponseCatalog {
    templates: HashMap<ResponseKey, Vec<String>>,
}

impl ResponseCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append templates under `key`.
    pub fn add<S: Into<String>>(&mut self, key: ResponseKey, templates: impl IntoIterator<Item = S>) -> &mut Self {
        let entry = self.templates.entry(key).or_default();
        entry.extend(templates.into_iter().map(Into::into));
        self
    }

    /// Pick one template for `key` at random.
    pub fn get(&self, key: &ResponseKey) -> Option<&str> {
        self.templates
            .get(key)
            .and_then(|candidates| candidates.choose(&mut rand::rng()))
            .map(String::as_str)
    }

    /// Pick and fill a template; missing keys fall back to the bare key name or `""`.
    pub fn render(&self, key: &ResponseKey, payload: &Map<String, Value>, context: &UserContext) -> String {
        match self.get(key) {
            Some(template) => fill(template, payload, context.as_map()),
            None => {
                debug!(key = %key, "No response template registered");
                key.fallback().to_string()
            }
        }
    }

    pub fn contains(&self, key: &ResponseKey) -> bool {
        self.templates.get(key).is_some_and(|t| !t.is_empty())
    }

    /// Number of keys with at least one template.
    pub fn len(&self) -> usize {
        self.templates.values().filter(|t| !t.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append every template from `other`.
    pub fn merge(&mut self, other: ResponseCatalog) {
        for (key, templates) in other.templates {
            self.templates.entry(key).or_default().extend(templates);
        }
    }

    /// Parse a TOML response module.
    pub fn from_toml_str(content: &str) -> Result<Self, DialogError> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| DialogError::Catalog(e.to_string()))?;
        Ok(file.into_catalog())
    }

    /// Load a TOML response module from disk.
    pub fn load(path: &Path) -> Result<Self, DialogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DialogError::Catalog(format!("{}: {}", path.display(), e)))?;
        let catalog = Self::from_toml_str(&content)?;
        info!(path = %path.display(), keys = catalog.len(), "Response module loaded");
        Ok(catalog)
    }
}

/// Replace `{name}` placeholders from `payload`, then `context`.
///
/// Strings are inserted as-is, other values as JSON text. Placeholders with
/// no value are left untouched.
pub fn fill(template: &str, payload: &Map<String, Value>, context: &Map<String, Value>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match payload
                .get(name)
                .filter(|v| !v.is_null())
                .or_else(|| context.get(name).filter(|v| !v.is_null()))
            {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

// =============================================================================
// TOML response modules
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Templates {
    One(String),
    Many(Vec<String>),
}

impl Templates {
    fn into_vec(self) -> Vec<String> {
        match self {
            Templates::One(t) => vec![t],
            Templates::Many(ts) => ts,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IntentResponses {
    slots: HashMap<String, HashMap<ResolveOutcome, Templates>>,
    confirm: HashMap<ConfirmOutcome, Templates>,
    handle: HashMap<HandleStatus, Templates>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogFile {
    keys: HashMap<String, Templates>,
    intents: HashMap<String, IntentResponses>,
}

impl CatalogFile {
    fn into_catalog(self) -> ResponseCatalog {
        let mut catalog = ResponseCatalog::new();
        for (key, templates) in self.keys {
            catalog.add(ResponseKey::Key(key), templates.into_vec());
        }
        for (intent, responses) in self.intents {
            for (slot, outcomes) in responses.slots {
                for (outcome, templates) in outcomes {
                    catalog.add(ResponseKey::slot(&intent, &slot, outcome), templates.into_vec());
                }
            }
            for (outcome, templates) in responses.confirm {
                catalog.add(ResponseKey::confirm(&intent, outcome), templates.into_vec());
            }
            for (status, templates) in responses.handle {
                catalog.add(ResponseKey::handle(&intent, status), templates.into_vec());
            }
        }
        catalog
    }
}

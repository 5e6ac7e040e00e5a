//! Regex-based NLU adapter.
//!
//! A deterministic adapter for development and tests. Each rule pairs a
//! regex with either an intent name or a canned reply; named capture groups
//! (`(?P<artist>...)`) become entities. When nothing matches and the user's
//! context is waiting on a missing slot, the whole message fills that slot.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::context::{keys, UserContext};
use crate::error::{DialogError, NluError};
use crate::nlu::{NluAdapter, NluParse};

/// Slot markers that ask the user for a (new) value.
const PENDING_SUFFIXES: [&str; 2] = ["_missing", "_unsupported"];

/// What a matched rule produces.
#[derive(Debug, Clone)]
enum RuleAction {
    Intent(String),
    Reply(Vec<String>),
}

/// A single compiled rule.
#[derive(Debug)]
struct PatternRule {
    regex: Regex,
    action: RuleAction,
    confidence: f64,
}

/// Rule table evaluated against every message.
#[derive(Debug)]
pub struct PatternNlu {
    rules: Vec<PatternRule>,
    slot_fill_confidence: f64,
}

impl Default for PatternNlu {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternNlu {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            slot_fill_confidence: 0.9,
        }
    }

    /// Map messages matching `pattern` to `intent`.
    pub fn intent_rule(
        &mut self,
        pattern: &str,
        intent: impl Into<String>,
        confidence: f64,
    ) -> Result<&mut Self, DialogError> {
        self.rules.push(PatternRule {
            regex: Regex::new(pattern)?,
            action: RuleAction::Intent(intent.into()),
            confidence: confidence.clamp(0.0, 1.0),
        });
        Ok(self)
    }

    /// Answer messages matching `pattern` directly with one of `messages`.
    pub fn reply_rule<S: Into<String>>(
        &mut self,
        pattern: &str,
        messages: impl IntoIterator<Item = S>,
    ) -> Result<&mut Self, DialogError> {
        self.rules.push(PatternRule {
            regex: Regex::new(pattern)?,
            action: RuleAction::Reply(messages.into_iter().map(Into::into).collect()),
            confidence: 1.0,
        });
        Ok(self)
    }

    /// Confidence reported when a bare message fills a pending slot.
    pub fn with_slot_fill_confidence(mut self, confidence: f64) -> Self {
        self.slot_fill_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate the rules; the highest-confidence match wins, earlier rules on ties.
    pub fn detect(&self, message: &str, context: &UserContext) -> NluParse {
        let text = message.trim();
        if text.is_empty() {
            return NluParse::unknown();
        }

        let mut best: Option<NluParse> = None;
        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(text) else {
                continue;
            };
            if best.as_ref().is_some_and(|b| b.confidence >= rule.confidence) {
                continue;
            }

            let mut parse = match &rule.action {
                RuleAction::Intent(name) => NluParse::intent(name.clone(), rule.confidence),
                RuleAction::Reply(messages) => NluParse::reply(messages.iter().cloned()),
            };
            for name in rule.regex.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    let value = m.as_str().trim();
                    if !value.is_empty() {
                        parse.entities.insert(name.to_string(), Value::from(value));
                    }
                }
            }
            best = Some(parse);
        }

        if let Some(parse) = best {
            return parse;
        }

        match pending_slot(context) {
            Some(slot) => {
                debug!(slot = %slot, "Filling pending slot from bare message");
                NluParse::entities_only(self.slot_fill_confidence).with_entity(slot, text)
            }
            None => NluParse::unknown(),
        }
    }
}

/// First slot flagged missing or unsupported while an intent is in flight.
fn pending_slot(context: &UserContext) -> Option<String> {
    context.get_str(keys::INTENT)?;
    context
        .keys()
        .filter(|key| context.flag(key))
        .find_map(|key| PENDING_SUFFIXES.iter().find_map(|s| key.strip_suffix(s)))
        .filter(|slot| !slot.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl NluAdapter for PatternNlu {
    async fn parse(
        &self,
        _session: &str,
        message: &str,
        context: &UserContext,
    ) -> Result<NluParse, NluError> {
        Ok(self.detect(message, context))
    }
}

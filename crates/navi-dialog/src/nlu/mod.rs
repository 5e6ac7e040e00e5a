//! Natural-language understanding collaborator.
//!
//! The engine never interprets text itself. It hands each message to an
//! [`NluAdapter`] and acts on the returned [`NluParse`].

pub mod patterns;

pub use patterns::PatternNlu;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::UserContext;
use crate::error::NluError;

/// One parse step reported by an NLU adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NluParse {
    /// Intent or action name; `None` resumes the intent stored in context.
    pub intent: Option<String>,
    #[serde(default)]
    pub entities: Map<String, Value>,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// The adapter produced the final reply itself; skip the pipeline.
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    /// Consult the adapter again, with an empty message, after this step.
    #[serde(default)]
    pub follow_up: bool,
}

impl NluParse {
    pub fn intent(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent: Some(name.into()),
            confidence,
            ..Self::default()
        }
    }

    /// A parse carrying entities but no intent name.
    pub fn entities_only(confidence: f64) -> Self {
        Self {
            confidence,
            ..Self::default()
        }
    }

    /// A finished reply produced by the adapter.
    pub fn reply<S: Into<String>>(messages: impl IntoIterator<Item = S>) -> Self {
        Self {
            confidence: 1.0,
            ready: true,
            messages: messages.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Nothing understood.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entities.insert(name.into(), value.into());
        self
    }

    pub fn following_up(mut self) -> Self {
        self.follow_up = true;
        self
    }
}

#[async_trait]
pub trait NluAdapter: Send + Sync {
    /// Parse `message` within the session identified by `session`.
    ///
    /// An empty `message` is a follow-up request for the next step of a
    /// multi-step parse.
    async fn parse(
        &self,
        session: &str,
        message: &str,
        context: &UserContext,
    ) -> Result<NluParse, NluError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builders() {
        let parse = NluParse::intent("FindMusic", 0.9).with_entity("artist", "Daft Punk");
        assert_eq!(parse.intent.as_deref(), Some("FindMusic"));
        assert_eq!(parse.entities["artist"], json!("Daft Punk"));
        assert!(!parse.ready);
        assert!(!parse.follow_up);

        let parse = NluParse::reply(["Hello!"]);
        assert!(parse.ready);
        assert_eq!(parse.messages, vec!["Hello!".to_string()]);

        let parse = NluParse::entities_only(0.8).following_up();
        assert!(parse.intent.is_none());
        assert!(parse.follow_up);

        assert_eq!(NluParse::unknown().confidence, 0.0);
    }

    #[test]
    fn test_deserialize_minimal() {
        let parse: NluParse =
            serde_json::from_value(json!({"intent": null, "confidence": 0.4})).unwrap();
        assert!(parse.intent.is_none());
        assert!(parse.entities.is_empty());
        assert!(parse.messages.is_empty());
    }
}

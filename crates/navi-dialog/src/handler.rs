//! Intent handler trait and factories.
//!
//! A handler drives one intent type through the three pipeline stages.
//! Only `handle` is mandatory: slots resolve to `not_required` and
//! confirmation is `ready` unless a handler says otherwise.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::UserContext;
use crate::error::HandlerError;
use crate::types::{ConfirmOutcome, HandleResponse, Intent, ResolveOutcome};

/// Resolve results in slot declaration order.
pub type SlotOutcomes = Vec<(String, ResolveOutcome)>;

/// Builds a handler instance for one turn.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn IntentHandler> + Send + Sync>;

#[async_trait]
pub trait IntentHandler: Send + Sync {
    /// Resolve every declared slot of `intent`.
    async fn resolve(
        &self,
        intent: &Intent,
        context: &UserContext,
    ) -> Result<SlotOutcomes, HandlerError> {
        let mut outcomes = Vec::new();
        for slot in intent.slot_names() {
            let outcome = self.resolve_slot(intent, slot, context).await?;
            outcomes.push((slot.to_string(), outcome));
        }
        Ok(outcomes)
    }

    /// Resolve a single slot.
    async fn resolve_slot(
        &self,
        _intent: &Intent,
        _slot: &str,
        _context: &UserContext,
    ) -> Result<ResolveOutcome, HandlerError> {
        Ok(ResolveOutcome::NotRequired)
    }

    async fn confirm(
        &self,
        _intent: &Intent,
        _context: &UserContext,
    ) -> Result<ConfirmOutcome, HandlerError> {
        Ok(ConfirmOutcome::Ready)
    }

    /// Carry out the intent.
    ///
    /// The payload is merged into the user's context (session lifecycle keys
    /// excepted) and fills the reply template. `in_progress` keeps the session
    /// open for the next turn; use [`HandleResponse::close_session`] to end it
    /// regardless of status.
    async fn handle(
        &self,
        intent: &Intent,
        context: &UserContext,
    ) -> Result<HandleResponse, HandlerError>;
}

/// Factory that builds a fresh `H` for every turn.
pub fn factory_for<H>() -> HandlerFactory
where
    H: IntentHandler + Default + 'static,
{
    Arc::new(|| Arc::new(H::default()) as Arc<dyn IntentHandler>)
}

/// Factory that hands out the same shared instance every turn.
pub fn shared(handler: Arc<dyn IntentHandler>) -> HandlerFactory {
    Arc::new(move || Arc::clone(&handler))
}

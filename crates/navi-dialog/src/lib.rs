//! Dialogue orchestration for Navi bots.
//!
//! Turns free text into intents through an NLU adapter, drives each intent
//! through its handler's resolve, confirm and handle stages, and keeps
//! per-user conversation state between messages.

pub mod adapter;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod nlu;
pub mod registry;
pub mod response;
pub mod store;
pub mod types;

pub use adapter::{AdapterRunner, Inbound, ReplyHandle, Responder};
pub use context::{Handles, UserContext, UserMetadata};
pub use engine::{DialogEngine, TurnOutcome, TurnOutput};
pub use error::{AdapterError, DialogError, HandlerError, NluError};
pub use handler::{factory_for, shared, HandlerFactory, IntentHandler, SlotOutcomes};
pub use nlu::{NluAdapter, NluParse, PatternNlu};
pub use registry::{IntentRegistry, RegistryBuilder};
pub use response::{ResponseCatalog, ResponseKey};
pub use store::{ContextStore, SessionStore, SharedContext, SharedMetadata};
pub use types::{
    ConfirmOutcome, HandleResponse, HandleStatus, Intent, IntentSchema, ResolveOutcome,
};

//! Named-signal publish/subscribe bus.
//!
//! Subscribers connect a closure to a signal name, optionally restricted to a
//! single sender. Sending a signal invokes every matching subscriber
//! synchronously, in registration order, and collects what each one returned.
//! A subscriber that fails or panics is logged and skipped; the remaining
//! subscribers still run.
//!
//! The bus is used for extension hooks and per-turn routing. Signal names that
//! form the extension contract are listed in [`signals`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

/// Signal names that make up the extension protocol.
pub mod signals {
    /// Announces the registration of an intent type; subscribers answer with the type name.
    pub fn intent_class(type_name: &str) -> String {
        format!("intent_class_{}", type_name)
    }

    /// Announces the handler bound to an intent type.
    pub fn handler_for(type_name: &str) -> String {
        format!("handler_for_{}", type_name)
    }

    /// Per-turn routing hook for an NLU-reported action name.
    pub fn action(name: &str) -> String {
        format!("action_{}", name)
    }

    /// Slash-command hook raised by inbound adapters (`/start` -> `command_start`).
    pub fn command(name: &str) -> String {
        format!("command_{}", name)
    }

    /// Raised when a turn ends on the parsing-error path; a string reply replaces the fallback apology.
    pub const PARSING_ERROR: &str = "parsing_error";

    /// Raised once per new user context; object replies seed default context values.
    pub const CONTEXT_CREATED: &str = "context-created";

    /// Raised by inbound adapters before a message is processed.
    pub const TEXT_RECEIVED: &str = "did_receive_text_message";

    /// Raised by inbound adapters once the replies for a message are ready.
    pub const REPLY_GENERATED: &str = "did_generate_text_reply";
}

/// Failure reported by a single subscriber.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("subscriber failed: {0}")]
    Failed(String),
    #[error("subscriber panicked: {0}")]
    Panicked(String),
}

/// Identifies a sender for subscriber filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sender {
    /// Matches every sender when used as a filter.
    Any,
    Named(String),
}

impl Sender {
    pub fn named(name: impl Into<String>) -> Self {
        Sender::Named(name.into())
    }

    /// Whether a subscription filtered on `self` accepts a signal sent by `sender`.
    pub fn accepts(&self, sender: &Sender) -> bool {
        match self {
            Sender::Any => true,
            Sender::Named(_) => self == sender,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::Any => write!(f, "any"),
            Sender::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Handle returned by [`SignalBus::connect`], usable to disconnect later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type SignalHandler = Arc<dyn Fn(&Value) -> Result<Value, SignalError> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    signal: String,
    filter: Sender,
    handler: SignalHandler,
}

/// Process-wide named-signal registry.
pub struct SignalBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Connect `handler` to `signal`, accepting only senders matched by `filter`.
    pub fn connect<F>(&self, signal: impl Into<String>, filter: Sender, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) -> Result<Value, SignalError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let signal = signal.into();
        debug!(signal = %signal, filter = %filter, subscription = %id, "Connecting subscriber");

        let subscription = Subscription {
            id,
            signal,
            filter,
            handler: Arc::new(handler),
        };
        match self.subscriptions.write() {
            Ok(mut subs) => subs.push(subscription),
            Err(poisoned) => poisoned.into_inner().push(subscription),
        }
        id
    }

    /// Connect a subscriber that accepts any sender.
    pub fn connect_any<F>(&self, signal: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) -> Result<Value, SignalError> + Send + Sync + 'static,
    {
        self.connect(signal, Sender::Any, handler)
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut subs = match self.subscriptions.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Number of subscribers connected to `signal`, regardless of sender filter.
    pub fn receivers(&self, signal: &str) -> usize {
        self.read_subscriptions(|subs| subs.iter().filter(|s| s.signal == signal).count())
    }

    /// Send `signal` from `sender`, returning each matching subscriber's reply in
    /// registration order.
    ///
    /// An empty result means nobody is listening; it is never an error.
    pub fn send(&self, signal: &str, sender: &Sender, payload: &Value) -> Vec<(SubscriptionId, Value)> {
        // Snapshot the matching handlers so subscribers may connect or send re-entrantly.
        let matching: Vec<(SubscriptionId, SignalHandler)> = self.read_subscriptions(|subs| {
            subs.iter()
                .filter(|s| s.signal == signal && s.filter.accepts(sender))
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        });

        debug!(signal = %signal, sender = %sender, receivers = matching.len(), "Sent signal");

        let mut responses = Vec::with_capacity(matching.len());
        for (id, handler) in matching {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(payload)))
                .unwrap_or_else(|panic| Err(SignalError::Panicked(panic_message(&*panic))));
            match outcome {
                Ok(value) => responses.push((id, value)),
                Err(e) => {
                    warn!(signal = %signal, subscription = %id, error = %e, "Subscriber failed; skipping");
                }
            }
        }
        responses
    }

    /// Send `signal` and return the first non-null reply, if any.
    pub fn first_response(&self, signal: &str, sender: &Sender, payload: &Value) -> Option<Value> {
        self.send(signal, sender, payload)
            .into_iter()
            .map(|(_, value)| value)
            .find(|value| !value.is_null())
    }

    fn read_subscriptions<T>(&self, f: impl FnOnce(&[Subscription]) -> T) -> T {
        match self.subscriptions.read() {
            Ok(subs) => f(&subs),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

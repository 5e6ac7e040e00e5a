//! Dialogue engine: the per-turn state machine.
//!
//! A turn opens a session if needed, asks the NLU adapter for a parse, gates
//! it on confidence, then drives the resolved intent through the handler's
//! resolve, confirm and handle stages. Slot deficiencies and rejected
//! confirmations keep the session open for the next message; completed
//! intents and every rejection reset the context.
//!
//! NLU and handler calls run on their own tasks under a timeout, so a slow or
//! panicking collaborator ends up on the parsing-error path instead of
//! wedging the user's session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use navi_core::config::DialogConfig;
use navi_core::events::{panic_message, signals, Sender, SignalBus};
use navi_core::types::UserId;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::context::{keys, UserContext};
use crate::error::{HandlerError, NluError};
use crate::handler::{IntentHandler, SlotOutcomes};
use crate::nlu::{NluAdapter, NluParse};
use crate::registry::IntentRegistry;
use crate::response::{ResponseCatalog, ResponseKey};
use crate::store::SessionStore;
use crate::types::{ConfirmOutcome, HandleStatus, Intent};

/// Sender name used for signals emitted by the engine.
pub const ENGINE_SENDER: &str = "dialog-engine";

// =============================================================================
// Turn results
// =============================================================================

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The NLU adapter answered directly.
    Replied,
    /// Some slots need more input; the session stays open.
    AskedForMore {
        intent: String,
        slots: SlotOutcomes,
    },
    /// Confirmation did not go through; the session stays open.
    ConfirmRejected {
        intent: String,
        outcome: ConfirmOutcome,
    },
    /// The handle stage ran.
    Handled {
        intent: String,
        status: HandleStatus,
    },
    /// The message was rejected and the context reset.
    ParsingError,
}

/// Replies produced for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub messages: Vec<String>,
    pub outcome: TurnOutcome,
}

impl TurnOutput {
    fn new(message: String, outcome: TurnOutcome) -> Self {
        let messages = if message.is_empty() {
            Vec::new()
        } else {
            vec![message]
        };
        Self { messages, outcome }
    }

    /// All messages joined with newlines.
    pub fn text(&self) -> String {
        self.messages.join("\n")
    }

    pub fn is_parsing_error(&self) -> bool {
        self.outcome == TurnOutcome::ParsingError
    }
}

// =============================================================================
// Stage failures
// =============================================================================

/// Why a turn fell onto the parsing-error path.
#[derive(Debug, thiserror::Error)]
enum Rejection {
    #[error("empty message")]
    EmptyMessage,
    #[error("confidence {confidence} below threshold {threshold}")]
    LowConfidence { confidence: f64, threshold: f64 },
    #[error("no intent in parse or context")]
    NoIntent,
    #[error("unknown intent {0}")]
    UnknownIntent(String),
    #[error("no handler for {0}")]
    NoHandler(String),
    #[error("NLU failed: {0}")]
    Nlu(#[from] NluError),
    #[error("{stage} stage failed: {source}")]
    Handler {
        stage: &'static str,
        source: HandlerError,
    },
    #[error("no final answer after {0} NLU steps")]
    IterationLimit(u32),
}

/// Outcome of a spawned, time-bounded collaborator call.
enum Guarded<T> {
    Done(T),
    TimedOut,
    Panicked(String),
}

/// Run `fut` on its own task, bounded by `timeout`.
async fn run_guarded<T, F>(timeout: Duration, fut: F) -> Guarded<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::spawn(fut);
    let abort = task.abort_handle();
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(value)) => Guarded::Done(value),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Guarded::Panicked(panic_message(&*join_err.into_panic()))
        }
        Ok(Err(join_err)) => Guarded::Panicked(join_err.to_string()),
        Err(_) => {
            abort.abort();
            Guarded::TimedOut
        }
    }
}

// =============================================================================
// DialogEngine
// =============================================================================

/// Turn processor wired to its collaborators.
pub struct DialogEngine {
    store: Arc<dyn SessionStore>,
    registry: Arc<IntentRegistry>,
    responses: Arc<ResponseCatalog>,
    nlu: Arc<dyn NluAdapter>,
    bus: Arc<SignalBus>,
    config: DialogConfig,
}

impl DialogEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<IntentRegistry>,
        responses: Arc<ResponseCatalog>,
        nlu: Arc<dyn NluAdapter>,
        bus: Arc<SignalBus>,
        config: DialogConfig,
    ) -> Self {
        Self {
            store,
            registry,
            responses,
            nlu,
            bus,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    pub fn registry(&self) -> &IntentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DialogConfig {
        &self.config
    }

    /// Process one message for `user` (`None` is the shared `"any"` user).
    ///
    /// Turns for the same user are serialised on that user's context lock.
    pub async fn process_turn(&self, user: Option<&str>, message: &str) -> TurnOutput {
        self.process_turn_with_threshold(user, message, self.config.confidence_threshold)
            .await
    }

    /// [`process_turn`](Self::process_turn) with a confidence threshold for this call only.
    pub async fn process_turn_with_threshold(
        &self,
        user: Option<&str>,
        message: &str,
        threshold: f64,
    ) -> TurnOutput {
        let user = UserId::from_optional(user);
        let context = self.store.get_or_create(&user);
        let mut context = context.lock().await;
        self.process_turn_in_with_threshold(message, &mut context, threshold)
            .await
    }

    /// Process one message against an already locked context.
    pub async fn process_turn_in(&self, message: &str, context: &mut UserContext) -> TurnOutput {
        self.process_turn_in_with_threshold(message, context, self.config.confidence_threshold)
            .await
    }

    /// [`process_turn_in`](Self::process_turn_in) with a confidence threshold for this call only.
    ///
    /// Parses below `threshold` are rejected; a NaN threshold rejects every parse.
    pub async fn process_turn_in_with_threshold(
        &self,
        message: &str,
        context: &mut UserContext,
        threshold: f64,
    ) -> TurnOutput {
        let mut collected = Vec::new();
        match self.run_steps(message, context, threshold, &mut collected).await {
            Ok(outcome) => TurnOutput {
                messages: collected,
                outcome,
            },
            Err(rejection) => {
                // Replies from earlier follow-up steps still go out ahead of the apology.
                let mut output = self.parsing_error(message, context, rejection);
                collected.append(&mut output.messages);
                output.messages = collected;
                output
            }
        }
    }

    /// Consult the NLU until a step does not ask to follow up.
    async fn run_steps(
        &self,
        message: &str,
        context: &mut UserContext,
        threshold: f64,
        collected: &mut Vec<String>,
    ) -> Result<TurnOutcome, Rejection> {
        if message.trim().is_empty() {
            return Err(Rejection::EmptyMessage);
        }

        let limit = self.config.max_iterations.max(1);
        let mut input = message.to_string();

        for step in 0..limit {
            let session = context.ensure_session();
            debug!(user = %context.user(), session = %session, step, "Consulting NLU");

            let parse = self.consult_nlu(&session, &input, context).await?;

            let confidence = parse.confidence;
            if !(0.0..=1.0).contains(&confidence) {
                let reason = format!("confidence {} outside [0, 1]", confidence);
                return Err(NluError::Malformed(reason).into());
            }
            if threshold.is_nan() || confidence < threshold {
                return Err(Rejection::LowConfidence {
                    confidence,
                    threshold,
                });
            }

            let follow_up = parse.follow_up;
            let output = if parse.ready {
                self.finish_ready(parse, context)
            } else {
                self.run_pipeline(message, parse, context).await?
            };
            collected.extend(output.messages);

            if !follow_up {
                return Ok(output.outcome);
            }
            input.clear();
        }

        Err(Rejection::IterationLimit(limit))
    }

    /// The NLU adapter produced the reply itself.
    fn finish_ready(&self, parse: NluParse, context: &mut UserContext) -> TurnOutput {
        context.clear_error_markers();
        if context.should_close_session() {
            info!(user = %context.user(), "Closing session after direct reply");
            context.reset();
        }
        TurnOutput {
            messages: parse.messages,
            outcome: TurnOutcome::Replied,
        }
    }

    async fn consult_nlu(
        &self,
        session: &str,
        message: &str,
        context: &UserContext,
    ) -> Result<NluParse, Rejection> {
        let nlu = Arc::clone(&self.nlu);
        let session = session.to_string();
        let message = message.to_string();
        let snapshot = context.clone();
        let timeout_ms = self.config.nlu_timeout_ms;

        let guarded = run_guarded(Duration::from_millis(timeout_ms), async move {
            nlu.parse(&session, &message, &snapshot).await
        })
        .await;

        match guarded {
            Guarded::Done(result) => Ok(result?),
            Guarded::TimedOut => Err(NluError::Timeout(timeout_ms).into()),
            Guarded::Panicked(msg) => Err(NluError::Unavailable(format!("panicked: {}", msg)).into()),
        }
    }

    /// Run one handler stage on its own task.
    async fn run_stage<T, F, Fut>(
        &self,
        stage: &'static str,
        handler: &Arc<dyn IntentHandler>,
        intent: &Intent,
        context: &UserContext,
        call: F,
    ) -> Result<T, Rejection>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn IntentHandler>, Intent, UserContext) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        let timeout_ms = self.config.handler_timeout_ms;
        let fut = call(Arc::clone(handler), intent.clone(), context.clone());
        let result = match run_guarded(Duration::from_millis(timeout_ms), fut).await {
            Guarded::Done(result) => result,
            Guarded::TimedOut => Err(HandlerError::Timeout(timeout_ms)),
            Guarded::Panicked(msg) => Err(HandlerError::Panicked(msg)),
        };
        result.map_err(|source| Rejection::Handler { stage, source })
    }

    /// Pick the intent type for this step, consulting `action_<name>` subscribers first.
    fn route(
        &self,
        message: &str,
        parse: &NluParse,
        context: &UserContext,
    ) -> Result<(String, Map<String, Value>), Rejection> {
        let mut entities = parse.entities.clone();

        let Some(name) = parse.intent.as_deref() else {
            return context
                .get_str(keys::INTENT)
                .map(|stored| (stored.to_string(), entities))
                .ok_or(Rejection::NoIntent);
        };

        let payload = json!({
            "message": message,
            "action": name,
            "entities": Value::Object(parse.entities.clone()),
            "user": context.user().as_str(),
            "context": Value::Object(context.as_map().clone()),
        });
        let routed = self
            .bus
            .send(&signals::action(name), &Sender::named(ENGINE_SENDER), &payload)
            .into_iter()
            .find_map(|(_, reply)| {
                let target = reply.get("intent")?.as_str()?.to_string();
                let extra = reply
                    .get("entities")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Some((target, extra))
            });

        let type_name = match routed {
            Some((target, extra)) => {
                debug!(action = %name, intent = %target, "Action routed by subscriber");
                entities.extend(extra);
                self.registry.resolve_type_name(&target).unwrap_or(target)
            }
            None => self
                .registry
                .resolve_type_name(name)
                .ok_or_else(|| Rejection::UnknownIntent(name.to_string()))?,
        };
        Ok((type_name, entities))
    }

    /// Resolve → Confirm → Handle for one NLU step.
    async fn run_pipeline(
        &self,
        message: &str,
        parse: NluParse,
        context: &mut UserContext,
    ) -> Result<TurnOutput, Rejection> {
        let (type_name, entities) = self.route(message, &parse, context)?;

        if context
            .get_str(keys::INTENT)
            .is_some_and(|previous| previous != type_name)
        {
            let cleared = context.clear_error_markers();
            debug!(user = %context.user(), intent = %type_name, cleared, "Intent changed");
        }
        context.insert(keys::INTENT, type_name.clone());

        let intent = self
            .registry
            .construct_intent(&type_name, &entities, context)
            .ok_or_else(|| Rejection::UnknownIntent(type_name.clone()))?;
        let handler = self
            .registry
            .handler_for(&intent)
            .ok_or_else(|| Rejection::NoHandler(type_name.clone()))?;
        info!(user = %context.user(), intent = %intent, "Running pipeline");

        // Markers from the previous ask are consumed by this resolve.
        context.clear_error_markers();
        let slot_payload = slot_payload(&intent);

        // 1. Resolve
        let outcomes = self
            .run_stage("resolve", &handler, &intent, context, |h, i, c| async move {
                h.resolve(&i, &c).await
            })
            .await?;

        let mut pending: SlotOutcomes = Vec::new();
        let mut first_question: Option<String> = None;
        for (slot, outcome) in outcomes {
            match outcome.marker_key(&slot) {
                Some(marker) => {
                    context.insert(marker, true);
                    let key = ResponseKey::slot(&type_name, &slot, outcome);
                    if first_question.is_none() {
                        first_question = Some(self.responses.render(&key, &slot_payload, context));
                    }
                    pending.push((slot, outcome));
                }
                None => {
                    let value = intent.get(&slot).cloned().unwrap_or(Value::Null);
                    context.insert(slot, value);
                }
            }
        }

        if !pending.is_empty() {
            info!(user = %context.user(), intent = %type_name, slots = ?pending, "Asking for more input");
            return Ok(TurnOutput::new(
                first_question.unwrap_or_default(),
                TurnOutcome::AskedForMore {
                    intent: type_name,
                    slots: pending,
                },
            ));
        }

        // 2. Confirm
        let confirmation = self
            .run_stage("confirm", &handler, &intent, context, |h, i, c| async move {
                h.confirm(&i, &c).await
            })
            .await?;

        if !confirmation.is_ready() {
            if let Some(marker) = confirmation.marker_key() {
                context.insert(marker, true);
            }
            info!(user = %context.user(), intent = %type_name, outcome = %confirmation, "Confirmation rejected");
            let key = ResponseKey::confirm(&type_name, confirmation);
            let reply = self.responses.render(&key, &slot_payload, context);
            return Ok(TurnOutput::new(
                reply,
                TurnOutcome::ConfirmRejected {
                    intent: type_name,
                    outcome: confirmation,
                },
            ));
        }
        context.insert(keys::READY, true);

        // 3. Handle
        let response = self
            .run_stage("handle", &handler, &intent, context, |h, i, c| async move {
                h.handle(&i, &c).await
            })
            .await?;

        context.merge(&response.payload);
        if let Some(flag) = response.status.context_flag() {
            context.insert(flag, true);
        }
        let key = ResponseKey::handle(&type_name, response.status);
        let reply = self.responses.render(&key, &response.payload, context);
        info!(user = %context.user(), intent = %type_name, status = %response.status, "Intent handled");

        if response.status.completes_turn() || context.should_close_session() {
            context.clear_error_markers();
            context.reset();
            debug!(user = %context.user(), "Session closed");
        }

        Ok(TurnOutput::new(
            reply,
            TurnOutcome::Handled {
                intent: type_name,
                status: response.status,
            },
        ))
    }

    /// Reset the context and produce the apology reply.
    fn parsing_error(&self, message: &str, context: &mut UserContext, rejection: Rejection) -> TurnOutput {
        warn!(user = %context.user(), reason = %rejection, "Parsing error");
        context.clear_error_markers();
        context.reset();

        let payload = json!({
            "message": message,
            "user": context.user().as_str(),
            "reason": rejection.to_string(),
            "context": Value::Object(context.as_map().clone()),
        });
        let reply = self
            .bus
            .send(signals::PARSING_ERROR, &Sender::named(ENGINE_SENDER), &payload)
            .into_iter()
            .find_map(|(_, reply)| reply.as_str().map(str::to_string))
            .unwrap_or_else(|| {
                debug!("No parsing_error subscriber answered; using fallback");
                self.config.fallback_message.clone()
            });

        TurnOutput::new(reply, TurnOutcome::ParsingError)
    }
}

/// Filled slots of `intent`, used to fill slot and confirm templates.
fn slot_payload(intent: &Intent) -> Map<String, Value> {
    intent
        .slots()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{factory_for, shared};
    use crate::registry::RegistryBuilder;
    use crate::store::ContextStore;
    use crate::types::{HandleResponse, IntentSchema, ResolveOutcome};
    use async_trait::async_trait;
    use navi_core::config::SessionConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// NLU that replays queued parses and records the messages it saw.
    #[derive(Default)]
    struct Scripted {
        parses: Mutex<VecDeque<Result<NluParse, NluError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with(parses: Vec<NluParse>) -> Arc<Self> {
            Arc::new(Self {
                parses: Mutex::new(parses.into_iter().map(Ok).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NluAdapter for Scripted {
        async fn parse(
            &self,
            _session: &str,
            message: &str,
            _context: &UserContext,
        ) -> Result<NluParse, NluError> {
            self.seen.lock().unwrap().push(message.to_string());
            self.parses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(NluParse::unknown()))
        }
    }

    #[derive(Default)]
    struct FindMusic;

    #[async_trait]
    impl IntentHandler for FindMusic {
        async fn resolve_slot(
            &self,
            intent: &Intent,
            slot: &str,
            _context: &UserContext,
        ) -> Result<ResolveOutcome, HandlerError> {
            Ok(match (slot, intent.get_str(slot)) {
                ("artist", Some(_)) => ResolveOutcome::Ready,
                ("artist", None) => ResolveOutcome::Missing,
                _ => ResolveOutcome::NotRequired,
            })
        }

        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            Ok(HandleResponse::success().with("track", "One More Time"))
        }
    }

    struct Rejecting(ConfirmOutcome);

    #[async_trait]
    impl IntentHandler for Rejecting {
        async fn confirm(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<ConfirmOutcome, HandlerError> {
            Ok(self.0)
        }

        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            Ok(HandleResponse::success())
        }
    }

    struct Panicking;

    #[async_trait]
    impl IntentHandler for Panicking {
        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            panic!("speaker exploded");
        }
    }

    struct Sleepy;

    #[async_trait]
    impl IntentHandler for Sleepy {
        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HandleResponse::success())
        }
    }

    struct Progressing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IntentHandler for Progressing {
        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n == 0 {
                HandleResponse::in_progress().with("step", 1)
            } else {
                HandleResponse::success().with("step", 2)
            })
        }
    }

    /// Returns the same handle response every time.
    struct Fixed(HandleResponse);

    #[async_trait]
    impl IntentHandler for Fixed {
        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            Ok(self.0.clone())
        }
    }

    /// `date` is always missing and `venue` always ambiguous.
    #[derive(Default)]
    struct Booking;

    #[async_trait]
    impl IntentHandler for Booking {
        async fn resolve_slot(
            &self,
            _intent: &Intent,
            slot: &str,
            _context: &UserContext,
        ) -> Result<ResolveOutcome, HandlerError> {
            Ok(match slot {
                "date" => ResolveOutcome::Missing,
                "venue" => ResolveOutcome::Ambiguous,
                _ => ResolveOutcome::NotRequired,
            })
        }

        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            Ok(HandleResponse::success())
        }
    }

    fn catalog() -> ResponseCatalog {
        let mut catalog = ResponseCatalog::new();
        catalog
            .add(
                ResponseKey::slot("FindMusicIntent", "artist", ResolveOutcome::Missing),
                ["Which artist?"],
            )
            .add(
                ResponseKey::handle("FindMusicIntent", HandleStatus::Success),
                ["Now playing {track} by {artist}."],
            )
            .add(
                ResponseKey::confirm("RejectIntent", ConfirmOutcome::Failure),
                ["Can't do that."],
            )
            .add(
                ResponseKey::handle("ProgressIntent", HandleStatus::InProgress),
                ["Working on it (step {step})."],
            )
            .add(
                ResponseKey::handle("ProgressIntent", HandleStatus::Success),
                ["Done (step {step})."],
            )
            .add(
                ResponseKey::slot("BookIntent", "date", ResolveOutcome::Missing),
                ["Which date?"],
            )
            .add(
                ResponseKey::slot("BookIntent", "venue", ResolveOutcome::Ambiguous),
                ["Which venue do you mean?"],
            )
            .add(
                ResponseKey::confirm("UnsupportedIntent", ConfirmOutcome::Unsupported),
                ["I can't do that here."],
            );
        catalog
    }

    struct Harness {
        engine: DialogEngine,
        nlu: Arc<Scripted>,
        bus: Arc<SignalBus>,
    }

    fn harness_with(parses: Vec<NluParse>, config: DialogConfig) -> Harness {
        let bus = Arc::new(SignalBus::new());
        let mut builder = RegistryBuilder::new();
        builder
            .register_intent_with(
                IntentSchema::new("FindMusicIntent", ["artist"]),
                factory_for::<FindMusic>(),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("RejectIntent", Vec::<String>::new()),
                shared(Arc::new(Rejecting(ConfirmOutcome::Failure))),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("PanicIntent", Vec::<String>::new()),
                shared(Arc::new(Panicking)),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("SleepyIntent", Vec::<String>::new()),
                shared(Arc::new(Sleepy)),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("ProgressIntent", Vec::<String>::new()),
                shared(Arc::new(Progressing {
                    calls: AtomicUsize::new(0),
                })),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("BookIntent", ["date", "venue", "party"]),
                factory_for::<Booking>(),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("UnsupportedIntent", Vec::<String>::new()),
                shared(Arc::new(Rejecting(ConfirmOutcome::Unsupported))),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("UnspecifiedIntent", Vec::<String>::new()),
                shared(Arc::new(Rejecting(ConfirmOutcome::Unspecified))),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("HijackIntent", Vec::<String>::new()),
                shared(Arc::new(Fixed(
                    HandleResponse::in_progress()
                        .with("session_started", false)
                        .with("session_number", "forged")
                        .with("intent", "FindMusicIntent"),
                ))),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("HijackDoneIntent", Vec::<String>::new()),
                shared(Arc::new(Fixed(
                    HandleResponse::success().with("session_started", false),
                ))),
            )
            .unwrap()
            .register_intent_with(
                IntentSchema::new("HangUpIntent", Vec::<String>::new()),
                shared(Arc::new(Fixed(HandleResponse::in_progress().close_session()))),
            )
            .unwrap()
            .register_intent(IntentSchema::new("OrphanIntent", ["x"]))
            .unwrap();
        let registry = builder.build(&bus).unwrap();

        let nlu = Scripted::with(parses);
        let store = Arc::new(ContextStore::new(Arc::clone(&bus), SessionConfig::default()));
        let engine = DialogEngine::new(
            store,
            Arc::new(registry),
            Arc::new(catalog()),
            Arc::clone(&nlu) as Arc<dyn NluAdapter>,
            Arc::clone(&bus),
            config,
        );
        Harness { engine, nlu, bus }
    }

    fn harness(parses: Vec<NluParse>) -> Harness {
        harness_with(parses, DialogConfig::default())
    }

    fn fresh() -> UserContext {
        UserContext::new(&UserId::from("alice"))
    }

    // ---- rejection paths ----

    #[tokio::test]
    async fn test_empty_message_is_parsing_error_without_nlu() {
        let h = harness(vec![]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("   ", &mut ctx).await;
        assert!(out.is_parsing_error());
        assert_eq!(out.messages, vec![DialogConfig::default().fallback_message]);
        assert!(h.nlu.seen.lock().unwrap().is_empty());
        assert!(ctx.is_reset());
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let config = DialogConfig {
            confidence_threshold: 0.5,
            ..DialogConfig::default()
        };
        let h = harness_with(
            vec![
                NluParse::intent("FindMusic", 0.49),
                NluParse::intent("FindMusic", 0.5).with_entity("artist", "Air"),
            ],
            config,
        );
        let mut ctx = fresh();
        assert!(h.engine.process_turn_in("play", &mut ctx).await.is_parsing_error());
        assert!(!ctx.session_started());

        let out = h.engine.process_turn_in("play", &mut ctx).await;
        assert_eq!(out.text(), "Now playing One More Time by Air.");
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_rejected() {
        for confidence in [f64::NAN, 1.5, -0.1, f64::INFINITY] {
            let h = harness(vec![NluParse::intent("FindMusic", confidence).with_entity("artist", "Air")]);
            let mut ctx = fresh();
            let out = h.engine.process_turn_in("play Air", &mut ctx).await;
            assert!(out.is_parsing_error(), "confidence {confidence} was accepted");
            assert!(ctx.is_reset());
        }
    }

    #[tokio::test]
    async fn test_per_call_threshold_overrides_config() {
        let h = harness(vec![
            NluParse::intent("FindMusic", 0.3).with_entity("artist", "Air"),
            NluParse::intent("FindMusic", 0.3).with_entity("artist", "Air"),
            NluParse::intent("FindMusic", 0.9).with_entity("artist", "Air"),
        ]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in_with_threshold("play Air", &mut ctx, 0.5).await;
        assert!(out.is_parsing_error());

        let out = h.engine.process_turn_with_threshold(Some("bob"), "play Air", 0.2).await;
        assert_eq!(out.text(), "Now playing One More Time by Air.");

        let out = h
            .engine
            .process_turn_in_with_threshold("play Air", &mut ctx, f64::NAN)
            .await;
        assert!(out.is_parsing_error());
    }

    #[tokio::test]
    async fn test_parsing_error_subscriber_reply_wins() {
        let h = harness(vec![NluParse::unknown()]);
        h.bus.connect_any(signals::PARSING_ERROR, |payload| {
            Ok(json!(format!("Sorry, '{}' confused me.", payload["message"].as_str().unwrap_or(""))))
        });
        let out = h.engine.process_turn_in("gibberish", &mut fresh()).await;
        assert_eq!(out.text(), "Sorry, 'gibberish' confused me.");
    }

    #[tokio::test]
    async fn test_unknown_intent_and_missing_handler() {
        let h = harness(vec![NluParse::intent("Dance", 0.9), NluParse::intent("Orphan", 0.9)]);
        let mut ctx = fresh();
        assert!(h.engine.process_turn_in("dance", &mut ctx).await.is_parsing_error());
        assert!(h.engine.process_turn_in("orphan", &mut ctx).await.is_parsing_error());
        assert!(ctx.is_reset());
    }

    #[tokio::test]
    async fn test_no_intent_anywhere_is_parsing_error() {
        let h = harness(vec![NluParse::entities_only(0.9).with_entity("artist", "Air")]);
        let out = h.engine.process_turn_in("Air", &mut fresh()).await;
        assert!(out.is_parsing_error());
    }

    #[tokio::test]
    async fn test_nlu_error_is_parsing_error() {
        let h = harness(vec![]);
        h.nlu
            .parses
            .lock()
            .unwrap()
            .push_back(Err(NluError::Unavailable("down".to_string())));
        let mut ctx = fresh();
        ctx.insert("intent", "FindMusicIntent");
        let out = h.engine.process_turn_in("play", &mut ctx).await;
        assert!(out.is_parsing_error());
        assert!(ctx.is_reset());
    }

    // ---- pipeline ----

    #[tokio::test]
    async fn test_missing_slot_asks_and_keeps_session() {
        let h = harness(vec![NluParse::intent("FindMusic", 0.9)]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("play some music", &mut ctx).await;
        assert_eq!(out.text(), "Which artist?");
        assert_eq!(
            out.outcome,
            TurnOutcome::AskedForMore {
                intent: "FindMusicIntent".to_string(),
                slots: vec![("artist".to_string(), ResolveOutcome::Missing)],
            }
        );
        assert!(ctx.session_started());
        assert!(ctx.flag("artist_missing"));
        assert_eq!(ctx.get_str("intent"), Some("FindMusicIntent"));
    }

    #[tokio::test]
    async fn test_resume_from_context() {
        let h = harness(vec![
            NluParse::intent("FindMusic", 0.9),
            NluParse::entities_only(0.9).with_entity("artist", "Daft Punk"),
        ]);
        let mut ctx = fresh();
        h.engine.process_turn_in("play some music", &mut ctx).await;
        let session = ctx.session_token().map(str::to_string);

        let out = h.engine.process_turn_in("Daft Punk", &mut ctx).await;
        assert_eq!(out.text(), "Now playing One More Time by Daft Punk.");
        assert_eq!(
            out.outcome,
            TurnOutcome::Handled {
                intent: "FindMusicIntent".to_string(),
                status: HandleStatus::Success,
            }
        );
        assert!(session.is_some());
        assert!(ctx.is_reset());
    }

    #[tokio::test]
    async fn test_confirm_rejection_sets_marker() {
        let h = harness(vec![NluParse::intent("RejectIntent", 0.9)]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("do it", &mut ctx).await;
        assert_eq!(out.text(), "Can't do that.");
        assert!(ctx.flag("confirm_failure"));
        assert!(ctx.session_started());
    }

    #[tokio::test]
    async fn test_confirm_unsupported_sets_its_marker() {
        let h = harness(vec![NluParse::intent("UnsupportedIntent", 0.9)]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("do it", &mut ctx).await;
        assert_eq!(out.text(), "I can't do that here.");
        assert_eq!(
            out.outcome,
            TurnOutcome::ConfirmRejected {
                intent: "UnsupportedIntent".to_string(),
                outcome: ConfirmOutcome::Unsupported,
            }
        );
        assert!(ctx.flag("confirm_unsupported"));
        assert!(!ctx.contains_key("confirm_failure"));
        assert!(ctx.session_started());
    }

    #[tokio::test]
    async fn test_confirm_unspecified_stops_without_marker() {
        let h = harness(vec![NluParse::intent("UnspecifiedIntent", 0.9)]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("do it", &mut ctx).await;
        assert!(matches!(out.outcome, TurnOutcome::ConfirmRejected { .. }));
        assert!(!ctx.has_error_markers());
        assert!(!ctx.flag("ready"));
    }

    #[tokio::test]
    async fn test_several_deficient_slots_mark_all_and_ask_first() {
        let h = harness(vec![NluParse::intent("BookIntent", 0.9).with_entity("party", 4)]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("book a table", &mut ctx).await;
        assert_eq!(out.messages, vec!["Which date?".to_string()]);
        assert_eq!(
            out.outcome,
            TurnOutcome::AskedForMore {
                intent: "BookIntent".to_string(),
                slots: vec![
                    ("date".to_string(), ResolveOutcome::Missing),
                    ("venue".to_string(), ResolveOutcome::Ambiguous),
                ],
            }
        );
        assert!(ctx.flag("date_missing"));
        assert!(ctx.flag("venue_ambiguous"));
        assert_eq!(ctx.get("party"), Some(&json!(4)));
        assert!(ctx.session_started());
    }

    #[tokio::test]
    async fn test_handler_payload_cannot_rewrite_session_keys() {
        let h = harness(vec![NluParse::intent("HijackIntent", 0.9)]);
        let mut ctx = fresh();
        h.engine.process_turn_in("hijack", &mut ctx).await;
        let token = ctx.session_token().map(str::to_string);
        assert!(ctx.session_started());
        assert_ne!(token.as_deref(), Some("forged"));
        assert_eq!(ctx.get_str("intent"), Some("HijackIntent"));
        assert!(ctx.flag("in_progress"));
    }

    #[tokio::test]
    async fn test_completed_turn_resets_despite_payload() {
        let h = harness(vec![NluParse::intent("HijackDoneIntent", 0.9)]);
        let mut ctx = fresh();
        h.engine.process_turn_in("hijack", &mut ctx).await;
        assert!(ctx.is_reset());
        assert!(!ctx.has_error_markers());
    }

    #[tokio::test]
    async fn test_close_request_ends_in_progress_session() {
        let h = harness(vec![NluParse::intent("HangUpIntent", 0.9)]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("hang up", &mut ctx).await;
        assert_eq!(
            out.outcome,
            TurnOutcome::Handled {
                intent: "HangUpIntent".to_string(),
                status: HandleStatus::InProgress,
            }
        );
        assert!(ctx.is_reset());
        assert!(!ctx.session_started());
    }

    #[tokio::test]
    async fn test_in_progress_keeps_session_then_completes() {
        let h = harness(vec![
            NluParse::intent("ProgressIntent", 0.9),
            NluParse::entities_only(0.9),
        ]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("start", &mut ctx).await;
        assert_eq!(out.text(), "Working on it (step 1).");
        assert!(ctx.flag("in_progress"));
        assert!(ctx.session_started());

        let out = h.engine.process_turn_in("and?", &mut ctx).await;
        assert_eq!(out.text(), "Done (step 2).");
        assert!(ctx.is_reset());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let h = harness(vec![NluParse::intent("PanicIntent", 0.9)]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("boom", &mut ctx).await;
        assert!(out.is_parsing_error());
        assert!(ctx.is_reset());
    }

    #[tokio::test]
    async fn test_handler_timeout_is_parsing_error() {
        let config = DialogConfig {
            handler_timeout_ms: 20,
            ..DialogConfig::default()
        };
        let h = harness_with(vec![NluParse::intent("SleepyIntent", 0.9)], config);
        let mut ctx = fresh();
        assert!(h.engine.process_turn_in("wait", &mut ctx).await.is_parsing_error());
        assert!(ctx.is_reset());
    }

    // ---- NLU-driven control ----

    #[tokio::test]
    async fn test_ready_reply_returned_verbatim() {
        let h = harness(vec![NluParse::reply(["Hello!", "How can I help?"])]);
        let mut ctx = fresh();
        ctx.insert("artist_missing", true);
        let out = h.engine.process_turn_in("hi", &mut ctx).await;
        assert_eq!(out.messages, vec!["Hello!".to_string(), "How can I help?".to_string()]);
        assert_eq!(out.outcome, TurnOutcome::Replied);
        assert!(!ctx.has_error_markers());
        assert!(ctx.session_started());
    }

    #[tokio::test]
    async fn test_ready_reply_closes_requested_session() {
        let h = harness(vec![NluParse::reply(["Bye!"])]);
        let mut ctx = fresh();
        ctx.ensure_session();
        ctx.close_session_when_done();
        h.engine.process_turn_in("bye", &mut ctx).await;
        assert!(ctx.is_reset());
    }

    #[tokio::test]
    async fn test_follow_up_reconsults_with_empty_message() {
        let h = harness(vec![
            NluParse::reply(["Let me check."]).following_up(),
            NluParse::intent("FindMusic", 0.9).with_entity("artist", "Air"),
        ]);
        let out = h.engine.process_turn_in("play Air", &mut fresh()).await;
        assert_eq!(
            out.messages,
            vec!["Let me check.".to_string(), "Now playing One More Time by Air.".to_string()]
        );
        assert_eq!(*h.nlu.seen.lock().unwrap(), vec!["play Air".to_string(), String::new()]);
    }

    #[tokio::test]
    async fn test_follow_up_replies_survive_later_rejection() {
        let h = harness(vec![
            NluParse::reply(["Let me check."]).following_up(),
            NluParse::unknown(),
        ]);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("play", &mut ctx).await;
        assert!(out.is_parsing_error());
        assert_eq!(
            out.messages,
            vec!["Let me check.".to_string(), DialogConfig::default().fallback_message]
        );
        assert!(ctx.is_reset());
    }

    #[tokio::test]
    async fn test_follow_up_is_bounded() {
        let config = DialogConfig {
            max_iterations: 3,
            ..DialogConfig::default()
        };
        let parses = (0..10).map(|_| NluParse::reply(["..."]).following_up()).collect();
        let h = harness_with(parses, config);
        let mut ctx = fresh();
        let out = h.engine.process_turn_in("loop", &mut ctx).await;
        assert!(out.is_parsing_error());
        assert_eq!(h.nlu.seen.lock().unwrap().len(), 3);
        assert!(ctx.is_reset());
    }

    // ---- action routing ----

    #[tokio::test]
    async fn test_action_subscriber_routes_and_adds_entities() {
        let h = harness(vec![NluParse::intent("music_request", 0.9)]);
        h.bus.connect_any(signals::action("music_request"), |payload| {
            assert_eq!(payload["message"], json!("something by Air"));
            Ok(json!({"intent": "FindMusicIntent", "entities": {"artist": "Air"}}))
        });
        let out = h.engine.process_turn_in("something by Air", &mut fresh()).await;
        assert_eq!(out.text(), "Now playing One More Time by Air.");
    }

    #[tokio::test]
    async fn test_action_subscriber_without_intent_is_ignored() {
        let h = harness(vec![NluParse::intent("find_music", 0.9).with_entity("artist", "Air")]);
        h.bus.connect_any(signals::action("find_music"), |_| Ok(json!("noted")));
        let out = h.engine.process_turn_in("play Air", &mut fresh()).await;
        assert_eq!(out.text(), "Now playing One More Time by Air.");
    }

    // ---- per-user entry point ----

    #[tokio::test]
    async fn test_process_turn_uses_store() {
        let h = harness(vec![NluParse::intent("FindMusic", 0.9)]);
        h.engine.process_turn(Some("bob"), "play some music").await;
        let ctx = h.engine.store().get(&UserId::from("bob")).unwrap();
        assert!(ctx.lock().await.flag("artist_missing"));
    }
}

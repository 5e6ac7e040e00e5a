//! Inbound message plumbing between transports and the engine.
//!
//! A transport (chat platform, console, speech front-end) pushes [`Inbound`]
//! messages into the channel returned by [`AdapterRunner::spawn`]. Each user
//! gets a worker task that handles that user's messages in arrival order;
//! different users are processed in parallel. Replies go back through the
//! message's [`Responder`], which is also stashed in the user's metadata
//! under [`RESPONSE_HANDLE`] so extensions can reach the user later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use navi_core::events::{signals, Sender};
use navi_core::types::UserId;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::context::UserMetadata;
use crate::engine::DialogEngine;
use crate::error::AdapterError;

/// Metadata key holding the user's [`ReplyHandle`].
pub const RESPONSE_HANDLE: &str = "response";

/// Sender name used for signals emitted by adapters.
pub const ADAPTER_SENDER: &str = "adapter";

/// Delivers reply text back over a transport.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn reply(&self, message: &str) -> Result<(), AdapterError>;
}

/// Reply channel stored in user metadata.
#[derive(Clone)]
pub struct ReplyHandle(pub Arc<dyn Responder>);

/// The reply handle last used by this user, if any.
pub fn reply_handle(metadata: &UserMetadata) -> Option<Arc<dyn Responder>> {
    metadata
        .handles
        .get::<ReplyHandle>(RESPONSE_HANDLE)
        .map(|handle| Arc::clone(&handle.0))
}

/// One message received by a transport.
#[derive(Clone)]
pub struct Inbound {
    pub user_id: Option<String>,
    pub text: String,
    pub reply: Arc<dyn Responder>,
}

impl Inbound {
    pub fn new(user_id: Option<&str>, text: impl Into<String>, reply: Arc<dyn Responder>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            text: text.into(),
            reply,
        }
    }
}

/// Split `/name args` into `("name", "args")`. `@bot` suffixes on the name are dropped.
pub fn parse_command(text: &str) -> Option<(&str, &str)> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head);
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some((name, args))
}

/// Drives inbound messages through a [`DialogEngine`].
pub struct AdapterRunner {
    engine: Arc<DialogEngine>,
    queue_capacity: usize,
    worker_idle: Duration,
}

impl AdapterRunner {
    pub fn new(engine: Arc<DialogEngine>) -> Self {
        Self {
            engine,
            queue_capacity: 256,
            worker_idle: Duration::from_secs(300),
        }
    }

    /// Capacity of the shared inbound channel.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// How long a user's worker waits for more messages before it is retired.
    pub fn with_worker_idle(mut self, idle: Duration) -> Self {
        self.worker_idle = idle;
        self
    }

    /// Start dispatching. The returned task ends once every sender is dropped
    /// and all queued messages have been handled.
    pub fn spawn(self) -> (mpsc::Sender<Inbound>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = tokio::spawn(self.dispatch(rx));
        (tx, handle)
    }

    async fn dispatch(self, mut rx: mpsc::Receiver<Inbound>) {
        let (retire_tx, mut retire_rx) = mpsc::unbounded_channel::<Retire>();
        let mut queues: HashMap<UserId, UserQueue> = HashMap::new();
        // Done signals of retired workers that may still be draining.
        let mut retiring: HashMap<UserId, oneshot::Receiver<()>> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut next_generation = 0u64;

        loop {
            tokio::select! {
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else { break };
                    let user = UserId::from_optional(inbound.user_id.as_deref());
                    if let Some(queue) = queues.get(&user) {
                        if queue.sender.send(inbound).is_err() {
                            warn!(user = %user, "User worker is gone; dropping message");
                        }
                        continue;
                    }

                    next_generation += 1;
                    let (sender, receiver) = mpsc::unbounded_channel();
                    let (done_tx, done_rx) = oneshot::channel();
                    let worker = UserWorker {
                        engine: Arc::clone(&self.engine),
                        user: user.clone(),
                        generation: next_generation,
                        idle: self.worker_idle,
                        retire: retire_tx.clone(),
                        predecessor: retiring.remove(&user),
                        _done: done_tx,
                    };
                    if sender.send(inbound).is_ok() {
                        debug!(user = %user, generation = next_generation, "Starting user worker");
                        workers.spawn(worker.run(receiver));
                        queues.insert(
                            user,
                            UserQueue {
                                sender,
                                generation: next_generation,
                                done: done_rx,
                            },
                        );
                    }
                }
                Some(request) = retire_rx.recv() => {
                    let current = queues
                        .get(&request.user)
                        .is_some_and(|queue| queue.generation == request.generation);
                    if current {
                        if let Some(queue) = queues.remove(&request.user) {
                            // Dropping the sender lets the worker drain and exit.
                            debug!(user = %request.user, "Retiring idle user worker");
                            retiring.insert(request.user, queue.done);
                        }
                    }
                }
            }

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "User worker failed");
                }
            }
            retiring.retain(|_, done| matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
        }

        drop(queues);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "User worker failed");
            }
        }
        info!("Adapter runner stopped");
    }

    /// Handle one inbound message and deliver its replies.
    ///
    /// Returns the number of replies delivered.
    pub async fn deliver(engine: &DialogEngine, inbound: &Inbound) -> Result<usize, AdapterError> {
        let user = UserId::from_optional(inbound.user_id.as_deref());
        {
            let metadata = engine.store().metadata(&user);
            let mut metadata = match metadata.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            metadata
                .handles
                .insert(RESPONSE_HANDLE, ReplyHandle(Arc::clone(&inbound.reply)));
        }

        let bus = engine.bus();
        let sender = Sender::named(ADAPTER_SENDER);
        bus.send(
            signals::TEXT_RECEIVED,
            &sender,
            &json!({ "user": user.as_str(), "message": inbound.text }),
        );

        let mut messages = Vec::new();
        if let Some((command, args)) = parse_command(&inbound.text) {
            let payload = json!({
                "user": user.as_str(),
                "command": command,
                "args": args,
                "message": inbound.text,
            });
            messages = bus
                .send(&signals::command(command), &sender, &payload)
                .into_iter()
                .filter_map(|(_, reply)| match reply {
                    Value::String(text) => Some(text),
                    _ => None,
                })
                .collect();
            if !messages.is_empty() {
                debug!(user = %user, command = %command, "Command answered by subscriber");
            }
        }
        if messages.is_empty() {
            messages = engine
                .process_turn(inbound.user_id.as_deref(), &inbound.text)
                .await
                .messages;
        }

        bus.send(
            signals::REPLY_GENERATED,
            &sender,
            &json!({ "user": user.as_str(), "messages": messages }),
        );

        let mut delivered = 0;
        for message in messages.iter().filter(|m| !m.trim().is_empty()) {
            inbound.reply.reply(message).await?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

/// Dispatcher-side handle on a user's worker.
struct UserQueue {
    sender: mpsc::UnboundedSender<Inbound>,
    generation: u64,
    done: oneshot::Receiver<()>,
}

/// A worker asking the dispatcher to stop routing to it.
struct Retire {
    user: UserId,
    generation: u64,
}

/// Processes one user's messages in arrival order.
///
/// Only the dispatcher ends a worker, by dropping its queue sender after a
/// [`Retire`] request, so no message is ever stranded in a closing queue. A
/// replacement worker waits for its predecessor before taking any message.
struct UserWorker {
    engine: Arc<DialogEngine>,
    user: UserId,
    generation: u64,
    idle: Duration,
    retire: mpsc::UnboundedSender<Retire>,
    predecessor: Option<oneshot::Receiver<()>>,
    /// Dropped when the worker finishes, waking any successor.
    _done: oneshot::Sender<()>,
}

impl UserWorker {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Inbound>) {
        if let Some(predecessor) = self.predecessor.take() {
            // Resolves with an error once the previous worker drops its sender.
            let _ = predecessor.await;
        }

        let mut retire_requested = false;
        loop {
            let next = if retire_requested {
                queue.recv().await
            } else {
                match tokio::time::timeout(self.idle, queue.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(user = %self.user, "User worker idle; asking to retire");
                        retire_requested = true;
                        let request = Retire {
                            user: self.user.clone(),
                            generation: self.generation,
                        };
                        // A closed channel means the dispatcher is shutting down
                        // and has already dropped this queue's sender.
                        let _ = self.retire.send(request);
                        continue;
                    }
                }
            };
            match next {
                Some(inbound) => handle_one(&self.engine, &self.user, &inbound).await,
                None => break,
            }
        }
        debug!(user = %self.user, "User worker finished");
    }
}

async fn handle_one(engine: &DialogEngine, user: &UserId, inbound: &Inbound) {
    if let Err(e) = AdapterRunner::deliver(engine, inbound).await {
        warn!(user = %user, error = %e, "Failed to deliver reply");
    }
}

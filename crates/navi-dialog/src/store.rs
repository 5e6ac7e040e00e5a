//! Per-user context storage.
//!
//! Each user's [`UserContext`] sits behind its own async mutex so turns for
//! the same user run one at a time while different users proceed in
//! parallel. The map-level lock is only held for lookup and insertion, never
//! across an `.await`.
//!
//! The store is bounded: contexts idle for longer than the configured TTL are
//! swept, and when `max_users` is reached the least recently used idle
//! context is dropped to make room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use navi_core::config::SessionConfig;
use navi_core::events::{signals, Sender, SignalBus};
use navi_core::types::{Timestamp, UserId};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{Handles, UserContext, UserMetadata};

/// Shared, lockable handle to one user's context.
pub type SharedContext = Arc<tokio::sync::Mutex<UserContext>>;

/// Shared handle to one user's metadata.
pub type SharedMetadata = Arc<Mutex<UserMetadata>>;

/// Storage abstraction for user contexts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the context for `user` if one exists.
    fn get(&self, user: &UserId) -> Option<SharedContext>;

    /// Return the context for `user`, creating and seeding it on first access.
    fn get_or_create(&self, user: &UserId) -> SharedContext;

    /// The user's metadata, created empty on first access.
    fn metadata(&self, user: &UserId) -> SharedMetadata;

    /// Reset the user's context to its minimal form. Returns `false` if unknown.
    async fn reset(&self, user: &UserId) -> bool;

    /// Drop contexts idle longer than the TTL. Returns how many were removed.
    fn evict_idle(&self) -> usize;

    /// Number of contexts currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Slot<T> {
    value: Arc<T>,
    last_access: Timestamp,
}

impl<T> Slot<T> {
    fn new(value: Arc<T>, now: Timestamp) -> Self {
        Self {
            value,
            last_access: now,
        }
    }

    /// Nobody outside the store holds the value.
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.value) == 1
    }
}

/// In-memory [`SessionStore`] with companion metadata and general maps.
pub struct ContextStore {
    contexts: Mutex<HashMap<UserId, Slot<tokio::sync::Mutex<UserContext>>>>,
    metadata: Mutex<HashMap<UserId, Slot<Mutex<UserMetadata>>>>,
    general: Arc<RwLock<Handles>>,
    bus: Arc<SignalBus>,
    config: SessionConfig,
}

impl ContextStore {
    pub fn new(bus: Arc<SignalBus>, config: SessionConfig) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            general: Arc::new(RwLock::new(Handles::new())),
            bus,
            config,
        }
    }

    /// Context for a possibly unknown user; `None` maps to `"any"`.
    pub fn for_user(&self, user: Option<&str>) -> SharedContext {
        self.get_or_create(&UserId::from_optional(user))
    }

    /// Metadata for a possibly unknown user; never reset by session close.
    pub fn for_user_metadata(&self, user: Option<&str>) -> SharedMetadata {
        self.metadata(&UserId::from_optional(user))
    }

    fn metadata_slot(&self, user: &UserId) -> SharedMetadata {
        let now = Timestamp::now();
        let mut metadata = lock_map(&self.metadata);
        if let Some(slot) = metadata.get_mut(user) {
            slot.last_access = now;
            return Arc::clone(&slot.value);
        }
        make_room(&mut metadata, self.config.max_users, "metadata");
        let value = Arc::new(Mutex::new(UserMetadata::new(user.clone())));
        metadata.insert(user.clone(), Slot::new(Arc::clone(&value), now));
        value
    }

    /// Process-wide shared handles (platform clients and the like).
    pub fn general(&self) -> Arc<RwLock<Handles>> {
        Arc::clone(&self.general)
    }

    /// Sweep contexts and metadata idle since before `now - idle_ttl_secs`.
    pub fn evict_idle_at(&self, now: Timestamp) -> usize {
        let ttl = self.config.idle_ttl_secs;
        let expired = |slot_access: Timestamp| slot_access.seconds_until(now) > ttl;

        let removed_contexts = {
            let mut contexts = lock_map(&self.contexts);
            let before = contexts.len();
            contexts.retain(|_, slot| !(slot.is_idle() && expired(slot.last_access)));
            before - contexts.len()
        };
        let removed_metadata = {
            let mut metadata = lock_map(&self.metadata);
            let before = metadata.len();
            metadata.retain(|_, slot| !(slot.is_idle() && expired(slot.last_access)));
            before - metadata.len()
        };

        if removed_contexts + removed_metadata > 0 {
            info!(
                contexts = removed_contexts,
                metadata = removed_metadata,
                "Evicted idle user state"
            );
        }
        removed_contexts
    }

    /// Run [`SessionStore::evict_idle`] on the configured interval until the task is aborted.
    pub fn spawn_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = Duration::from_secs(self.config.eviction_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                store.evict_idle();
            }
        })
    }

    /// Fire `context-created` and merge every object reply into the new context.
    fn seed(&self, user: &UserId, context: &mut UserContext) {
        let payload = json!({ "user": user.as_str() });
        let replies = self
            .bus
            .send(signals::CONTEXT_CREATED, &Sender::Any, &payload);
        for (_, reply) in replies {
            match reply.as_object() {
                Some(defaults) => context.seed_defaults(defaults),
                None if reply.is_null() => {}
                None => warn!(user = %user, "Ignoring non-object context-created reply"),
            }
        }
    }
}

#[async_trait]
impl SessionStore for ContextStore {
    fn get(&self, user: &UserId) -> Option<SharedContext> {
        let mut contexts = lock_map(&self.contexts);
        let slot = contexts.get_mut(user)?;
        slot.last_access = Timestamp::now();
        Some(Arc::clone(&slot.value))
    }

    fn get_or_create(&self, user: &UserId) -> SharedContext {
        let now = Timestamp::now();
        let (context, guard) = {
            let mut contexts = lock_map(&self.contexts);
            if let Some(slot) = contexts.get_mut(user) {
                slot.last_access = now;
                return Arc::clone(&slot.value);
            }
            make_room(&mut contexts, self.config.max_users, "context");

            let context: SharedContext = Arc::new(tokio::sync::Mutex::new(UserContext::new(user)));
            // Held until seeding finishes so concurrent callers never see an unseeded context.
            let guard = Arc::clone(&context).try_lock_owned().ok();
            contexts.insert(user.clone(), Slot::new(Arc::clone(&context), now));
            (context, guard)
        };

        debug!(user = %user, "Created user context");
        if let Some(mut guard) = guard {
            self.seed(user, &mut guard);
        }
        context
    }

    fn metadata(&self, user: &UserId) -> SharedMetadata {
        self.metadata_slot(user)
    }

    async fn reset(&self, user: &UserId) -> bool {
        let Some(context) = self.get(user) else {
            return false;
        };
        context.lock().await.reset();
        true
    }

    fn evict_idle(&self) -> usize {
        self.evict_idle_at(Timestamp::now())
    }

    fn len(&self) -> usize {
        lock_map(&self.contexts).len()
    }
}

fn lock_map<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Evict least recently used idle slots until there is room for one more.
fn make_room<T>(map: &mut HashMap<UserId, Slot<T>>, max: usize, what: &str) {
    while map.len() >= max.max(1) {
        let oldest = map
            .iter()
            .filter(|(_, slot)| slot.is_idle())
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(user, _)| user.clone());
        match oldest {
            Some(user) => {
                debug!(user = %user, kind = what, "Evicting least recently used entry");
                map.remove(&user);
            }
            None => {
                warn!(kind = what, len = map.len(), "Store full and every entry is in use");
                break;
            }
        }
    }
}

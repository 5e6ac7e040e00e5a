//! Intent and handler bindings.
//!
//! Bindings are collected with a [`RegistryBuilder`] at start-up and frozen
//! into a read-only [`IntentRegistry`]. Building the registry announces every
//! binding on the signal bus (`intent_class_<Name>`, `handler_for_<Name>`) so
//! extension modules can discover what is loaded; the engine itself looks
//! bindings up in the table directly.

use std::collections::HashMap;
use std::sync::Arc;

use navi_core::events::{signals, SignalBus, SubscriptionId};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::context::UserContext;
use crate::error::DialogError;
use crate::handler::{HandlerFactory, IntentHandler};
use crate::types::{Intent, IntentSchema};

/// Collects intent schemas, handler factories and action routes.
#[derive(Default)]
pub struct RegistryBuilder {
    intents: HashMap<String, IntentSchema>,
    handlers: HashMap<String, HandlerFactory>,
    routes: HashMap<String, String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an intent type. Each type name may be declared once.
    pub fn register_intent(&mut self, schema: IntentSchema) -> Result<&mut Self, DialogError> {
        let name = schema.name().to_string();
        if self.intents.contains_key(&name) {
            return Err(DialogError::Registry(format!("duplicate intent {}", name)));
        }
        debug!(intent = %name, slots = ?schema.slots(), "Registering intent");
        self.intents.insert(name, schema);
        Ok(self)
    }

    /// Bind a handler factory to an intent type. Each type may have one handler.
    pub fn register_handler(
        &mut self,
        type_name: impl Into<String>,
        factory: HandlerFactory,
    ) -> Result<&mut Self, DialogError> {
        let name = type_name.into();
        if self.handlers.contains_key(&name) {
            return Err(DialogError::Registry(format!(
                "duplicate handler for {}",
                name
            )));
        }
        debug!(intent = %name, "Registering handler");
        self.handlers.insert(name, factory);
        Ok(self)
    }

    /// Declare an intent type together with its handler.
    pub fn register_intent_with(
        &mut self,
        schema: IntentSchema,
        factory: HandlerFactory,
    ) -> Result<&mut Self, DialogError> {
        let name = schema.name().to_string();
        self.register_intent(schema)?;
        self.register_handler(name, factory)
    }

    /// Route an NLU action name to an intent type.
    pub fn route_action(
        &mut self,
        action: impl Into<String>,
        type_name: impl Into<String>,
    ) -> &mut Self {
        self.routes.insert(action.into(), type_name.into());
        self
    }

    /// Freeze the bindings and announce them on `bus`.
    ///
    /// Fails if a handler or route names an intent that was never declared.
    pub fn build(self, bus: &SignalBus) -> Result<IntentRegistry, DialogError> {
        if let Some(name) = self.handlers.keys().find(|n| !self.intents.contains_key(*n)) {
            return Err(DialogError::Registry(format!(
                "handler registered for unknown intent {}",
                name
            )));
        }
        if let Some((action, target)) = self
            .routes
            .iter()
            .find(|(_, target)| !self.intents.contains_key(*target))
        {
            return Err(DialogError::Registry(format!(
                "action {} routed to unknown intent {}",
                action, target
            )));
        }

        let mut announcements = Vec::new();
        for name in self.intents.keys() {
            let answer = json!(name);
            announcements.push(bus.connect_any(signals::intent_class(name), move |_| {
                Ok(answer.clone())
            }));
        }
        for name in self.handlers.keys() {
            let answer = json!(name);
            announcements.push(bus.connect_any(signals::handler_for(name), move |_| {
                Ok(answer.clone())
            }));
        }

        info!(
            intents = self.intents.len(),
            handlers = self.handlers.len(),
            routes = self.routes.len(),
            "Intent registry built"
        );

        Ok(IntentRegistry {
            intents: self.intents,
            handlers: self.handlers,
            routes: self.routes,
            announcements,
        })
    }
}

/// Read-only table of intent schemas and handler factories.
pub struct IntentRegistry {
    intents: HashMap<String, IntentSchema>,
    handlers: HashMap<String, HandlerFactory>,
    routes: HashMap<String, String>,
    announcements: Vec<SubscriptionId>,
}

impl IntentRegistry {
    pub fn schema(&self, type_name: &str) -> Option<&IntentSchema> {
        self.intents.get(type_name)
    }

    /// Build an intent of `type_name`, entities taking precedence over context.
    pub fn construct_intent(
        &self,
        type_name: &str,
        entities: &Map<String, Value>,
        context: &UserContext,
    ) -> Option<Intent> {
        self.intents
            .get(type_name)
            .map(|schema| schema.construct(entities, context.as_map()))
    }

    /// A fresh handler for the intent's type; `None` if nothing is bound.
    pub fn handler_for(&self, intent: &Intent) -> Option<Arc<dyn IntentHandler>> {
        self.handlers.get(intent.type_name()).map(|factory| factory())
    }

    /// Map an NLU intent or action name to a declared intent type.
    ///
    /// Tries an explicit route, then the exact name, then `<Name>Intent` with
    /// `snake_case` names converted to `CamelCase`.
    pub fn resolve_type_name(&self, nlu_name: &str) -> Option<String> {
        if let Some(target) = self.routes.get(nlu_name) {
            return Some(target.clone());
        }
        if self.intents.contains_key(nlu_name) {
            return Some(nlu_name.to_string());
        }
        let suffixed = format!("{}Intent", camel_case(nlu_name));
        self.intents.contains_key(&suffixed).then_some(suffixed)
    }

    pub fn intent_names(&self) -> impl Iterator<Item = &str> {
        self.intents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Remove this registry's announcements from `bus`.
    pub fn withdraw(&self, bus: &SignalBus) {
        for id in &self.announcements {
            bus.disconnect(*id);
        }
    }
}

fn camel_case(name: &str) -> String {
    name.split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::factory_for;
    use crate::types::HandleResponse;
    use async_trait::async_trait;
    use navi_core::events::Sender;
    use navi_core::types::UserId;

    #[derive(Default)]
    struct PlayHandler;

    #[async_trait]
    impl IntentHandler for PlayHandler {
        async fn handle(
            &self,
            _intent: &Intent,
            _context: &UserContext,
        ) -> Result<HandleResponse, HandlerError> {
            Ok(HandleResponse::success())
        }
    }

    fn find_music() -> IntentSchema {
        IntentSchema::new("FindMusicIntent", ["artist"])
    }

    fn built(bus: &SignalBus) -> IntentRegistry {
        let mut builder = RegistryBuilder::new();
        builder
            .register_intent_with(find_music(), factory_for::<PlayHandler>())
            .unwrap()
            .register_intent(IntentSchema::new("WeatherIntent", ["city"]))
            .unwrap()
            .route_action("play_song", "FindMusicIntent");
        builder.build(bus).unwrap()
    }

    // ---- building ----

    #[test]
    fn test_duplicates_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register_intent(find_music()).unwrap();
        let err = builder.register_intent(find_music()).err().unwrap();
        assert_eq!(err.to_string(), "registry error: duplicate intent FindMusicIntent");

        builder
            .register_handler("FindMusicIntent", factory_for::<PlayHandler>())
            .unwrap();
        assert!(builder
            .register_handler("FindMusicIntent", factory_for::<PlayHandler>())
            .is_err());
    }

    #[test]
    fn test_build_rejects_dangling_bindings() {
        let bus = SignalBus::new();
        let mut builder = RegistryBuilder::new();
        builder
            .register_handler("GhostIntent", factory_for::<PlayHandler>())
            .unwrap();
        assert!(builder.build(&bus).is_err());

        let mut builder = RegistryBuilder::new();
        builder.route_action("haunt", "GhostIntent");
        let err = builder.build(&bus).err().unwrap();
        assert!(err.to_string().contains("unknown intent GhostIntent"));
    }

    // ---- announcements ----

    #[test]
    fn test_build_announces_bindings() {
        let bus = SignalBus::new();
        let registry = built(&bus);

        let reply = bus.first_response("handler_for_FindMusicIntent", &Sender::Any, &Value::Null);
        assert_eq!(reply, Some(json!("FindMusicIntent")));
        assert_eq!(bus.receivers("intent_class_WeatherIntent"), 1);
        // Declared without a handler.
        assert!(bus.send("handler_for_WeatherIntent", &Sender::Any, &Value::Null).is_empty());

        registry.withdraw(&bus);
        assert_eq!(bus.receivers("intent_class_FindMusicIntent"), 0);
    }

    #[test]
    fn test_unregistered_handler_signal_is_empty() {
        let bus = SignalBus::new();
        let _registry = RegistryBuilder::new().build(&bus).unwrap();
        assert!(bus
            .send("handler_for_FindMusicIntent", &Sender::Any, &Value::Null)
            .is_empty());
    }

    // ---- lookups ----

    #[test]
    fn test_resolve_type_name() {
        let bus = SignalBus::new();
        let registry = built(&bus);
        assert_eq!(registry.resolve_type_name("play_song").as_deref(), Some("FindMusicIntent"));
        assert_eq!(registry.resolve_type_name("FindMusicIntent").as_deref(), Some("FindMusicIntent"));
        assert_eq!(registry.resolve_type_name("FindMusic").as_deref(), Some("FindMusicIntent"));
        assert_eq!(registry.resolve_type_name("find_music").as_deref(), Some("FindMusicIntent"));
        assert_eq!(registry.resolve_type_name("weather").as_deref(), Some("WeatherIntent"));
        assert!(registry.resolve_type_name("dance").is_none());
    }

    #[test]
    fn test_construct_and_handler_lookup() {
        let bus = SignalBus::new();
        let registry = built(&bus);
        let mut ctx = UserContext::new(&UserId::from("alice"));
        ctx.insert("artist", "Air");

        let intent = registry
            .construct_intent("FindMusicIntent", &Map::new(), &ctx)
            .unwrap();
        assert_eq!(intent.get_str("artist"), Some("Air"));
        assert!(registry.handler_for(&intent).is_some());

        let weather = registry.construct_intent("WeatherIntent", &Map::new(), &ctx).unwrap();
        assert!(registry.handler_for(&weather).is_none());
        assert!(registry.construct_intent("DanceIntent", &Map::new(), &ctx).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("find_music"), "FindMusic");
        assert_eq!(camel_case("weather"), "Weather");
        assert_eq!(camel_case("FindMusic"), "FindMusic");
        assert_eq!(camel_case("__"), "");
    }
}

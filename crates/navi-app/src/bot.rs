//! The demo music bot.
//!
//! Wires a pattern NLU, a single `FindMusicIntent` handler backed by a small
//! in-memory library, the default response catalog, and a few signal
//! subscribers (`/start`, parsing errors, context defaults).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use navi_core::events::{signals, SignalBus};
use navi_core::NaviConfig;
use navi_dialog::{
    factory_for, ContextStore, DialogEngine, DialogError, HandleResponse, HandleStatus,
    HandlerError, Intent, IntentHandler, IntentSchema, PatternNlu, RegistryBuilder,
    ResolveOutcome, ResponseCatalog, ResponseKey, UserContext,
};
use serde_json::json;
use tracing::{info, warn};

pub const FIND_MUSIC: &str = "FindMusicIntent";

const LIBRARY: &[(&str, &str)] = &[
    ("daft punk", "One More Time"),
    ("air", "La femme d'argent"),
    ("justice", "D.A.N.C.E."),
    ("phoenix", "Lisztomania"),
];

/// Looks tracks up in a fixed artist library.
#[derive(Default)]
pub struct FindMusicHandler;

impl FindMusicHandler {
    fn track_for(artist: &str) -> Option<&'static str> {
        let artist = artist.trim().to_lowercase();
        LIBRARY
            .iter()
            .find(|(name, _)| *name == artist)
            .map(|(_, track)| *track)
    }
}

#[async_trait]
impl IntentHandler for FindMusicHandler {
    async fn resolve_slot(
        &self,
        intent: &Intent,
        slot: &str,
        _context: &UserContext,
    ) -> Result<ResolveOutcome, HandlerError> {
        if slot != "artist" {
            return Ok(ResolveOutcome::NotRequired);
        }
        Ok(match intent.get_str("artist") {
            None => ResolveOutcome::Missing,
            Some(artist) if Self::track_for(artist).is_none() => ResolveOutcome::Unsupported,
            Some(_) => ResolveOutcome::Ready,
        })
    }

    async fn handle(
        &self,
        intent: &Intent,
        _context: &UserContext,
    ) -> Result<HandleResponse, HandlerError> {
        let artist = intent.get_str("artist").unwrap_or_default();
        match Self::track_for(artist) {
            Some(track) => {
                info!(artist = %artist, track = %track, "Playing track");
                Ok(HandleResponse::success().with("track", track))
            }
            None => Ok(HandleResponse::failure()),
        }
    }
}

fn pattern_nlu() -> Result<PatternNlu, DialogError> {
    let mut nlu = PatternNlu::new();
    nlu.intent_rule(r"(?i)\b(?:play|put on)\s+(?:some\s+)?music\b", FIND_MUSIC, 0.9)?
        .intent_rule(r"(?i)\b(?:play|put on)\s+(?:some(?:thing)?\s+(?:by|from)\s+)?(?P<artist>.+)$", FIND_MUSIC, 0.8)?
        .reply_rule(r"(?i)^(?:hi|hello|hey)\b", ["Hello! Ask me to play some music."])?
        .reply_rule(r"(?i)^(?:thanks|thank you)\b", ["You're welcome!"])?;
    Ok(nlu)
}

fn default_catalog() -> ResponseCatalog {
    let mut catalog = ResponseCatalog::new();
    catalog
        .add(
            ResponseKey::slot(FIND_MUSIC, "artist", ResolveOutcome::Missing),
            ["Which artist?", "Who would you like to hear?"],
        )
        .add(
            ResponseKey::slot(FIND_MUSIC, "artist", ResolveOutcome::Unsupported),
            ["I don't have anything by {artist}. Another artist?"],
        )
        .add(
            ResponseKey::handle(FIND_MUSIC, HandleStatus::Success),
            ["Now playing {track} by {artist}."],
        )
        .add(
            ResponseKey::handle(FIND_MUSIC, HandleStatus::Failure),
            ["Something went wrong playing {artist}."],
        )
        .add(ResponseKey::key("welcome"), ["Welcome! Try \"play some music\"."]);
    catalog
}

/// Default catalog plus every response module listed in the configuration.
fn load_catalog(config: &NaviConfig) -> Result<ResponseCatalog, DialogError> {
    let mut catalog = default_catalog();
    for path in &config.responses.paths {
        catalog.merge(ResponseCatalog::load(Path::new(path))?);
    }
    Ok(catalog)
}

fn connect_subscribers(bus: &SignalBus, catalog: Arc<ResponseCatalog>) {
    bus.connect_any(signals::CONTEXT_CREATED, |_| Ok(json!({ "language": "en" })));

    let welcome = catalog;
    bus.connect_any(signals::command("start"), move |_| {
        Ok(json!(welcome
            .get(&ResponseKey::key("welcome"))
            .unwrap_or("welcome")))
    });

    bus.connect_any(signals::PARSING_ERROR, |payload| {
        let reason = payload["reason"].as_str().unwrap_or("unknown");
        warn!(reason = %reason, "Could not understand message");
        Ok(json!("Sorry, I didn't get that. Try \"play some music\"."))
    });
}

/// Everything the console front-end needs.
pub struct Bot {
    pub engine: Arc<DialogEngine>,
    pub store: Arc<ContextStore>,
}

/// Assemble the demo bot from configuration.
pub fn build(config: &NaviConfig) -> Result<Bot, DialogError> {
    let bus = Arc::new(SignalBus::new());
    let catalog = Arc::new(load_catalog(config)?);
    connect_subscribers(&bus, Arc::clone(&catalog));

    let mut builder = RegistryBuilder::new();
    builder
        .register_intent_with(
            IntentSchema::new(FIND_MUSIC, ["artist"]),
            factory_for::<FindMusicHandler>(),
        )?
        .route_action("music", FIND_MUSIC);
    let registry = Arc::new(builder.build(&bus)?);

    let store = Arc::new(ContextStore::new(Arc::clone(&bus), config.sessions.clone()));
    let engine = DialogEngine::new(
        Arc::clone(&store) as Arc<dyn navi_dialog::SessionStore>,
        registry,
        catalog,
        Arc::new(pattern_nlu()?),
        bus,
        config.dialog.clone(),
    );
    info!(
        responses = config.responses.paths.len(),
        threshold = config.dialog.confidence_threshold,
        "Bot assembled"
    );

    Ok(Bot {
        engine: Arc::new(engine),
        store,
    })
}

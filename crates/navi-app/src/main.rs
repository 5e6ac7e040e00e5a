//! Navi console binary - composition root.
//!
//! 1. Parse command-line arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Assemble the demo bot (NLU, intents, responses, subscribers)
//! 4. Start idle-context eviction and the adapter runner
//! 5. Pump stdin lines into the runner until EOF, `/quit` or Ctrl-C

mod bot;
mod cli;
mod console;

use std::sync::Arc;

use clap::Parser;
use navi_core::NaviConfig;
use navi_dialog::{AdapterRunner, Responder};

use crate::cli::CliArgs;
use crate::console::ConsoleResponder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = NaviConfig::load_or_default(&config_file);
    args.apply(&mut config);

    // Tracing.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Navi v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");

    let bot = bot::build(&config)?;
    let eviction = bot.store.spawn_eviction();

    let (inbound, runner) = AdapterRunner::new(Arc::clone(&bot.engine)).spawn();
    let responder: Arc<dyn Responder> = Arc::new(ConsoleResponder::new(tokio::io::stdout()));

    println!("Talk to Navi. Type /quit to leave.");
    tokio::select! {
        result = console::run(tokio::io::stdin(), &args.user, inbound, responder) => {
            let sent = result?;
            tracing::info!(messages = sent, "Console input finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    // The inbound sender is gone, so the runner drains its queues and stops.
    if let Err(e) = runner.await {
        tracing::warn!(error = %e, "Adapter runner failed");
    }
    eviction.abort();
    tracing::info!("Navi stopped");

    Ok(())
}

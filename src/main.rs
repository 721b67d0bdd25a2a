//! Edge Translation Service - Main Entry Point
//!
//! Boots the translator: resolves identity and configuration, connects
//! the Sparkplug node, constructs the southbound drivers and devices,
//! and runs until a shutdown signal or a Sparkplug stop request.

use anyhow::Context;
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use tracing::info;
use tracing_subscriber::EnvFilter;

use edgesrv::{wait_for_shutdown, Translator, TranslatorSettings};

/// Command line arguments for the edge translation service
#[derive(Parser)]
#[command(
    name = "edgesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Edge protocol translator publishing Sparkplug B over MQTT"
)]
struct Args {
    /// Bootstrap settings file
    #[arg(short, long, default_value = "config/edgesrv.toml")]
    settings: String,

    /// Override log filter (e.g. debug, edgesrv=trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings: TranslatorSettings = Figment::new()
        .merge(Toml::file(&args.settings))
        .merge(Env::prefixed("EDGESRV_"))
        .extract()
        .context("loading bootstrap settings")?;

    info!(config_url = %settings.config_url, "edge translation service starting");
    let translator = Translator::bootstrap(&settings)
        .await
        .context("translator startup")?;

    let stop_requested = translator.stop_requested();
    tokio::select! {
        _ = wait_for_shutdown() => info!("shutdown signal received"),
        _ = stop_requested.cancelled() => info!("stop requested northbound"),
    }

    translator.stop().await;
    Ok(())
}

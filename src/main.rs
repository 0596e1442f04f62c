mod backend;
mod cache;
mod classifier;
mod config;
mod dedupe;
mod error;
mod lead;
mod pipeline;
mod platform;
mod scheduler;
mod sink;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::{ConfigCache, Snapshot};
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::scheduler::Scheduler;
use crate::sink::WebhookSink;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lead_monitor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Backend: {}", config.backend.kind);
    info!("  Webhook: {}", config.webhook_display());
    info!("  Min message length: {}", config.monitor.min_message_length);

    let backend = backend::from_config(&config).await?;

    // Config-file values serve until the first successful load
    let cache = ConfigCache::new(Snapshot::new(
        config.monitor.chats.clone(),
        config.monitor.keywords.clone(),
        config.monitor.min_message_length,
    ));
    cache.refresh(backend.as_ref()).await;

    let sink = WebhookSink::new(
        &config.webhook.url,
        Duration::from_secs(config.webhook.timeout_secs),
    )?;
    let pipeline = Pipeline::new(
        cache.clone(),
        backend,
        sink,
        config.webhook.max_in_flight,
    );

    let mut scheduler = Scheduler::new().await?;
    crate::scheduler::tasks::register_builtin_tasks(
        &scheduler,
        &pipeline,
        Duration::from_secs(config.monitor.refresh_interval_secs),
    )
    .await?;
    scheduler.start().await?;

    let bot = Bot::new(&config.telegram.bot_token);
    let metadata_timeout = Duration::from_secs(config.telegram.metadata_timeout_secs);
    platform::telegram::verify_chats(&bot, &cache.snapshot().chats, metadata_timeout).await;

    info!("Lead monitor is running");
    platform::telegram::run(bot, pipeline, metadata_timeout).await?;

    scheduler.shutdown().await?;
    Ok(())
}

use std::time::Duration;

use tracing::{debug, info};

use crate::pipeline::Pipeline;
use crate::scheduler::Scheduler;

/// Register the cache refresh and heartbeat jobs
pub async fn register_builtin_tasks(
    scheduler: &Scheduler,
    pipeline: &Pipeline,
    refresh_interval: Duration,
) -> anyhow::Result<()> {
    let backend = pipeline.backend();
    if backend.is_dynamic() {
        let cache = pipeline.cache().clone();
        scheduler
            .add_interval_job(refresh_interval, "cache-refresh", move || {
                let cache = cache.clone();
                let backend = backend.clone();
                Box::pin(async move {
                    cache.refresh(backend.as_ref()).await;
                })
            })
            .await?;
    } else {
        debug!("{} backend is fixed at startup, no cache refresh", backend.kind());
    }

    // Heartbeat: log the pipeline counters every hour
    let stats = pipeline.stats();
    let cache = pipeline.cache().clone();
    scheduler
        .add_cron_job("0 0 * * * *", "heartbeat", move || {
            let stats = stats.clone();
            let refreshed_at = cache.snapshot().refreshed_at;
            Box::pin(async move {
                let loaded = match refreshed_at {
                    Some(at) => format!("config loaded {}", at),
                    None => "config never loaded from backend".to_string(),
                };
                info!("Heartbeat: {} ({})", stats.summary(), loaded);
            })
        })
        .await?;

    Ok(())
}

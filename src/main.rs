//! newsflow binary entrypoint.
//! Composition root: settings, tracing, metrics, the shared bus, the poll
//! scheduler, push adapters and the HTTP router.

use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;

use newsflow::adapters::newswire::start_push_adapters;
use newsflow::adapters::AdapterSet;
use newsflow::config::load_settings_default;
use newsflow::metrics::Metrics;
use newsflow::scheduler::fetch::HttpFetcher;
use newsflow::scheduler::Scheduler;
use newsflow::shutdown::{cancel_on_ctrl_c, CancellationToken};
use newsflow::{telemetry, AppState, EventBus};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    let settings = load_settings_default().context("loading settings")?;
    telemetry::init_tracing(settings.json_logs);
    let metrics = Metrics::init()?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let bus = Arc::new(EventBus::new(settings.bus.clone()));

    let fetcher = HttpFetcher::new(&settings.scheduler).context("building feed http client")?;
    let scheduler = Scheduler::new(
        settings.scheduler.clone(),
        Arc::clone(&bus),
        settings.hub.channel.clone(),
        Arc::new(fetcher),
    )
    .with_granularity(settings.id_granularity);
    let scheduler_stats = scheduler.stats_handle();
    tokio::spawn(scheduler.run(cancel.clone()));

    // Adapters run for the life of the process; the set stops with `cancel`.
    let mut adapters = AdapterSet::new(&cancel);
    start_push_adapters(&settings, Arc::clone(&bus), &mut adapters);
    let adapter_stats = adapters.stats_handles();
    tokio::spawn(async move {
        let token = adapters.cancel_token();
        token.cancelled().await;
        adapters.stop().await;
    });

    tracing::info!(
        feeds = settings.scheduler.feeds.len(),
        websocket_sources = settings.websocket_sources.len(),
        newswire_sources = settings.newswire_sources.len(),
        webhook_signed = !settings.webhook.secret.is_empty(),
        "newsflow started"
    );

    let mut state = AppState::new(&settings, bus, cancel);
    state.hub = state
        .hub
        .with_scheduler_stats(scheduler_stats)
        .with_adapter_stats(adapter_stats);
    let router = newsflow::router(state, Some(&metrics));

    Ok(router.into())
}

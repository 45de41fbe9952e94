use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::adapters::webhook::{self, WebhookState};
use crate::bus::EventBus;
use crate::config::Settings;
use crate::hub::{self, HubState};
use crate::metrics::Metrics;

/// Shared handles behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub hub: HubState,
    pub webhook: WebhookState,
}

impl AppState {
    pub fn new(settings: &Settings, bus: Arc<EventBus>, cancel: CancellationToken) -> Self {
        Self {
            hub: HubState::new(settings, Arc::clone(&bus), cancel),
            webhook: WebhookState::new(
                Arc::clone(&bus),
                settings.webhook.clone(),
                settings.hub.channel.clone(),
            ),
            bus,
        }
    }
}

/// Hub, webhook receiver and (optionally) `/metrics`, with permissive CORS.
pub fn router(state: AppState, metrics: Option<&Metrics>) -> Router {
    let mut app = Router::new()
        .merge(hub::router(state.hub))
        .merge(webhook::router(state.webhook));
    if let Some(m) = metrics {
        app = app.merge(m.router());
    }
    app.layer(CorsLayer::very_permissive())
}

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{dispatcher::Dispatcher, event::KafkaEvent};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

pub fn router(
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    max_body_bytes: usize,
) -> Router {
    Router::new()
        .route("/events", post(events))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(AppState {
            dispatcher,
            shutdown,
        })
}

async fn events(State(state): State<AppState>, Json(event): Json<KafkaEvent>) -> Json<Value> {
    info!(
        "Received event from {} with {} records",
        event.event_source.as_deref().unwrap_or("unknown source"),
        event.record_count()
    );
    let message = state.dispatcher.handle(&event, &state.shutdown).await;
    Json(json!({ "message": message }))
}

async fn health() -> &'static str {
    "OK"
}

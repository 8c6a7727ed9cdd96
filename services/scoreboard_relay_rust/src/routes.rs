//! HTTP routes exposing the connection gateway
//!
//! - `GET /health`
//! - `GET /scoreboard/{channel}/events?clientId=` (server-sent events)
//! - `DELETE /scoreboard/{channel}/clients/{client_id}`
//! - `GET /scoreboard/{channel}/state`

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use scoreboard_rust_core::{ChannelId, ClientId, RelayError, RelayHub};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub sse_keepalive: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/scoreboard/{channel}/events", get(events_handler))
        .route(
            "/scoreboard/{channel}/clients/{client_id}",
            delete(unsubscribe_handler),
        )
        .route("/scoreboard/{channel}/state", get(state_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Debug)]
enum ApiError {
    Relay(RelayError),
    NoState(ChannelId),
    Internal(String),
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError::Relay(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Relay(err) => {
                let status = match &err {
                    RelayError::InvalidClientId(_) | RelayError::InvalidChannelId(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    RelayError::DuplicateClient(_) => StatusCode::CONFLICT,
                    RelayError::UnknownClient(_) => StatusCode::NOT_FOUND,
                    RelayError::SessionStartFailed { .. } | RelayError::UpstreamPollError { .. } => {
                        StatusCode::BAD_GATEWAY
                    }
                    RelayError::DeliveryFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            ApiError::NoState(channel) => (
                StatusCode::NOT_FOUND,
                format!("no state for channel {}", channel),
            ),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.hub.registry();
    Json(json!({
        "status": "healthy",
        "channels": registry.channel_counts().await.len(),
        "clients": registry.client_count().await,
        "sessions": state.hub.sessions().active_channels().len(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    client_id: Option<String>,
}

/// Open an SSE stream of updates for one channel
async fn events_handler(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let channel = ChannelId::parse(&channel)?;
    let accepted = state
        .hub
        .gateway()
        .accept(channel.clone(), query.client_id.as_deref())
        .await?;

    if let Some(err) = &accepted.start_error {
        warn!(client = %accepted.client_id, error = %err, "Streaming before upstream session is up");
    }

    let registered = serde_json::to_string(&json!({
        "clientId": accepted.client_id,
        "channelId": channel,
        "sessionStarted": accepted.start_error.is_none(),
    }))
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    let header = HeaderValue::from_str(accepted.client_id.as_str())
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let first = stream::once(async move { Event::default().event("registered").data(registered) });
    let updates = accepted
        .stream
        .into_stream()
        .map(|payload| Event::default().event("update").data(payload));
    let events = first.chain(updates).map(Ok::<_, Infallible>);

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(state.sse_keepalive))
        .into_response();
    response
        .headers_mut()
        .insert(HeaderName::from_static(CLIENT_ID_HEADER), header);
    Ok(response)
}

/// Explicit unsubscribe; ends the client's stream
async fn unsubscribe_handler(
    State(state): State<AppState>,
    Path((channel, client_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let channel = ChannelId::parse(&channel)?;
    let client = ClientId::parse(&client_id)?;

    match state.hub.registry().channel_of(&client).await {
        Some(subscribed) if subscribed != channel => Err(RelayError::UnknownClient(client).into()),
        _ => {
            if state.hub.gateway().on_close(&client).await {
                info!(client = %client, channel = %channel, "Client unsubscribed");
            }
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

async fn state_handler(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let channel = ChannelId::parse(&channel)?;
    let snapshot = state
        .hub
        .sessions()
        .last_known_state(&channel)
        .ok_or_else(|| ApiError::NoState(channel.clone()))?;
    Ok(Json(json!({
        "channelId": channel,
        "status": state.hub.sessions().status(&channel),
        "state": snapshot,
    })))
}

use crate::channels::types::{OutboundPayload, TextFormat};
use crate::channels::ChannelError;
use crate::state::AppState;
use axum::extract::{Path as AxumPath, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(default)]
    to: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "mediaUrl")]
    media_url: Option<String>,
    #[serde(default, alias = "accountId")]
    account_id: Option<String>,
    #[serde(default)]
    format: TextFormat,
    #[serde(default, alias = "channelData")]
    channel_data: Option<Value>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/channels/{channel}/send", post(send_message))
}

async fn list_channels(State(state): State<Arc<AppState>>) -> Json<Value> {
    let channels = state.service.list_channels().await;
    Json(json!({ "data": { "channels": channels } }))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    AxumPath(channel): AxumPath<String>,
    Json(request): Json<SendRequest>,
) -> Result<Json<Value>, Response> {
    let to = request.to.trim();
    if to.is_empty() {
        return Err(error_response(&ChannelError::invalid_payload("missing to")));
    }
    let account_id = request
        .account_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let payload = OutboundPayload {
        text: request.text,
        media_url: request.media_url,
        format: request.format,
        channel_data: request.channel_data,
    };
    let result = state
        .service
        .send_payload(&channel, account_id, to, &payload)
        .await
        .map_err(|err| error_response(&err))?;
    Ok(Json(json!({ "data": result })))
}

pub(crate) fn error_response(err: &ChannelError) -> Response {
    (
        err.status(),
        Json(json!({ "detail": { "code": err.code(), "message": err.to_string() } })),
    )
        .into_response()
}

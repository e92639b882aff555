use crate::channels::WebhookRequest;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// Router fallback: every path not claimed by the API is offered to the webhook handlers.
pub async fn dispatch_webhook(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = WebhookRequest::new(method, &uri, headers, body);
    match state.webhooks.dispatch(&request).await {
        Some(response) => response.into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": { "code": "NOT_FOUND", "message": "no webhook at this path" } })),
        )
            .into_response(),
    }
}

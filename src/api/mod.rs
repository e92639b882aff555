// API 路由汇总入口：渠道管理接口 + webhook 兜底分发。
pub mod channel;
pub mod webhook;

use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .merge(channel::router())
        .fallback(webhook::dispatch_webhook)
        .with_state(state)
}

mod metrics;

use axum::Json;
use serde_json::{Value, json};

pub use metrics::metrics_ws;

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

use actix_web::{HttpResponse, Responder, get, web};
use serde_json::json;

use crate::app::AppState;

/// Liveness plus a glance at the chain head and realtime load.
#[get("/health/")]
pub async fn health_check(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "height": state.chain.len().await,
        "connections": state.registry.len(),
    }))
}

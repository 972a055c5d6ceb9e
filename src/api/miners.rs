use actix_web::{HttpResponse, Responder, get, web};

use super::models::store_error;
use crate::app::AppState;

#[get("/miners/{miner_id}/")]
pub async fn get_miner(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let miner_id = path.into_inner();
    match state.store.get_miner(&miner_id).await {
        Ok(Some(miner)) => HttpResponse::Ok().json(miner),
        Ok(None) => HttpResponse::NotFound().body(format!("miner {miner_id} not found")),
        Err(e) => store_error("GET /miners/{id}/", &e),
    }
}

use actix_web::{HttpResponse, Responder, get, web};

use super::models::{ChainResponse, ValidateResponse};
use crate::app::AppState;

/// Get the full blockchain.
#[get("/chain/")]
pub async fn get_chain(state: web::Data<AppState>) -> impl Responder {
    let chain = state.chain.snapshot().await;
    HttpResponse::Ok().json(ChainResponse {
        length: chain.len(),
        difficulty: state.chain.difficulty(),
        chain,
    })
}

#[get("/chain/{height}/")]
pub async fn get_block(state: web::Data<AppState>, path: web::Path<u64>) -> impl Responder {
    let height = path.into_inner();
    match state.chain.get(height).await {
        Some(block) => HttpResponse::Ok().json(block),
        None => HttpResponse::NotFound().body(format!("no block at height {height}")),
    }
}

/// Validate the whole chain.
#[get("/validate/")]
pub async fn validate_chain(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(ValidateResponse {
        valid: state.chain.is_valid_chain().await,
        length: state.chain.len().await,
        difficulty: state.chain.difficulty(),
    })
}

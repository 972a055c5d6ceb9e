use actix_web::{HttpResponse, Responder, get, web};

use super::models::StatsResponse;
use crate::app::AppState;

#[get("/stats/")]
pub async fn get_stats(state: web::Data<AppState>) -> impl Responder {
    let chain = state.chain.snapshot().await;

    let last_interval_ms = match chain.as_slice() {
        [.., older, newer] => Some((newer.timestamp - older.timestamp).max(0)),
        _ => None,
    };
    let total_rewards: f64 = chain.iter().map(|b| b.reward).sum();

    HttpResponse::Ok().json(StatsResponse {
        height: chain.len(),
        difficulty: state.chain.difficulty(),
        head_hash: chain.last().map(|b| b.hash.clone()),
        last_interval_ms,
        total_rewards,
        connections: state.registry.len(),
    })
}

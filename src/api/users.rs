use actix_web::{HttpResponse, Responder, get, post, web};
use chrono::Utc;
use log::{info, warn};

use super::models::{CreateMinerRequest, RegisterUserRequest, store_error};
use crate::app::AppState;
use crate::miner::MinerRecord;
use crate::realtime::StateKind;
use crate::user::UserRecord;

/// Ids with this prefix are handed out to realtime guests.
const GUEST_PREFIX: &str = "guest-";

/// Register a user so they can connect with `?user_id=`.
#[post("/users/")]
pub async fn register_user(
    state: web::Data<AppState>,
    body: web::Json<RegisterUserRequest>,
) -> impl Responder {
    let user_id = body.user_id.trim();
    let username = body.username.trim();
    if user_id.is_empty() || username.is_empty() {
        return HttpResponse::BadRequest().body("user_id and username required");
    }
    if user_id.starts_with(GUEST_PREFIX) {
        return HttpResponse::BadRequest().body("user_id prefix is reserved for guests");
    }

    let mut user = UserRecord::new(
        user_id.to_string(),
        username.to_string(),
        Utc::now().timestamp_millis(),
    );
    user.avatar_url = body.avatar_url.clone();

    match state.store.insert_user(&user).await {
        Ok(()) => {
            info!("POST /users/ - registered {} ({})", user.user_id, user.username);
            HttpResponse::Created().json(user)
        }
        Err(e) => {
            warn!("POST /users/ - rejected {user_id}: {e}");
            store_error("POST /users/", &e)
        }
    }
}

#[get("/users/{user_id}/")]
pub async fn get_user(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let user_id = path.into_inner();
    match state.store.get_user(&user_id).await {
        Ok(Some(user)) => HttpResponse::Ok().json(user),
        Ok(None) => HttpResponse::NotFound().body(format!("user {user_id} not found")),
        Err(e) => store_error("GET /users/{id}/", &e),
    }
}

/// Create a powered-off miner owned by the user.
#[post("/users/{user_id}/miners/")]
pub async fn create_miner(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CreateMinerRequest>,
) -> impl Responder {
    let user_id = path.into_inner();
    match state.store.get_user(&user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return HttpResponse::NotFound().body(format!("user {user_id} not found")),
        Err(e) => return store_error("POST /users/{id}/miners/", &e),
    }

    let currency_code = body.currency_code.trim();
    if currency_code.is_empty() {
        return HttpResponse::BadRequest().body("currency_code must not be empty");
    }

    let miner = MinerRecord::new(user_id, body.hash_rate, currency_code.to_string());
    match state.store.insert_miner(&miner).await {
        Ok(()) => {
            info!(
                "POST /users/{}/miners/ - created miner {} (hash_rate={})",
                miner.user_id, miner.id, miner.hash_rate
            );
            HttpResponse::Created().json(miner)
        }
        Err(e) => store_error("POST /users/{id}/miners/", &e),
    }
}

#[get("/users/{user_id}/miners/")]
pub async fn list_miners(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let user_id = path.into_inner();
    match state.store.get_user(&user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return HttpResponse::NotFound().body(format!("user {user_id} not found")),
        Err(e) => return store_error("GET /users/{id}/miners/", &e),
    }
    match state.store.miners_for_user(&user_id).await {
        Ok(miners) => HttpResponse::Ok().json(miners),
        Err(e) => store_error("GET /users/{id}/miners/", &e),
    }
}

/// Live presence of every user the realtime channel knows about, guests included.
#[get("/presence/")]
pub async fn list_presence(state: web::Data<AppState>) -> impl Responder {
    let mut users = state.states.all(StateKind::User);
    users.sort_by(|a, b| a.0.cmp(&b.0));
    let records: Vec<_> = users.into_iter().map(|(_, record)| record).collect();
    HttpResponse::Ok().json(records)
}

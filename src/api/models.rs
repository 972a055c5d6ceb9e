use actix_web::HttpResponse;
use log::error;
use serde::{Deserialize, Serialize};

use crate::blockchain::Block;
use crate::store::StoreError;

/* ---------- Chain API Models ---------- */

#[derive(Serialize)]
pub struct ChainResponse {
    pub length: usize,
    pub difficulty: u32,
    pub chain: Vec<Block>,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub length: usize,
    pub difficulty: u32,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub height: usize,
    pub difficulty: u32,
    pub head_hash: Option<String>,
    pub last_interval_ms: Option<i64>,
    pub total_rewards: f64,
    pub connections: usize,
}

/* ---------- User / Miner API Models ---------- */

#[derive(Deserialize)]
pub struct RegisterUserRequest {
    pub user_id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

fn default_currency() -> String {
    "LUX".to_string()
}

#[derive(Deserialize)]
pub struct CreateMinerRequest {
    #[serde(default)]
    pub hash_rate: u64,
    #[serde(default = "default_currency")]
    pub currency_code: String,
}

/* ---------- TX API Models ---------- */

#[derive(Deserialize)]
pub struct NewTxRequest {
    pub from: String,
    pub to: String,
    pub amount: f64,
    #[serde(default)]
    pub fee: f64,
}

#[derive(Serialize)]
pub struct NewTxResponse {
    pub txid: String,
    pub block_height: u64,
}

/* ---------- Errors ---------- */

/// Status code for a store failure surfaced through the HTTP API.
pub fn store_error(context: &str, e: &StoreError) -> HttpResponse {
    match e {
        StoreError::NotFound(what) => HttpResponse::NotFound().body(format!("{what} not found")),
        StoreError::Conflict(what) => HttpResponse::Conflict().body(format!("{what} already exists")),
        StoreError::Io(_) | StoreError::Serde(_) => {
            error!("{context}: {e}");
            HttpResponse::InternalServerError().body("storage error")
        }
    }
}

use actix_web::{HttpResponse, Responder, post, web};
use log::{debug, info, warn};

use super::models::{NewTxRequest, NewTxResponse, store_error};
use crate::app::AppState;
use crate::transaction::Transaction;

/// Queue a pending transaction for the next block height. Its fee is paid to
/// whichever miner seals that block.
#[post("/transactions/")]
pub async fn post_transaction(
    state: web::Data<AppState>,
    body: web::Json<NewTxRequest>,
) -> impl Responder {
    if let Err(msg) = validate_request(&body) {
        warn!("POST /transactions/ - rejected: {msg}");
        return HttpResponse::BadRequest().body(msg);
    }

    let block_height = state.chain.head().await.map_or(0, |b| b.height + 1);
    let tx = Transaction::new(
        body.from.trim().to_string(),
        body.to.trim().to_string(),
        body.amount,
        body.fee,
        block_height,
    );
    debug!("POST /transactions/ - built txid={}", tx.txid);

    match state.store.insert_transaction(&tx).await {
        Ok(()) => {
            info!(
                "POST /transactions/ - txid={} queued for block #{} (fee={})",
                tx.txid, block_height, tx.fee
            );
            HttpResponse::Created().json(NewTxResponse {
                txid: tx.txid,
                block_height,
            })
        }
        Err(e) => store_error("POST /transactions/", &e),
    }
}

fn validate_request(body: &NewTxRequest) -> Result<(), &'static str> {
    if body.from.trim().is_empty() || body.to.trim().is_empty() {
        return Err("from and to are required");
    }
    if !body.amount.is_finite() || body.amount <= 0.0 {
        return Err("amount must be > 0");
    }
    if !body.fee.is_finite() || body.fee < 0.0 {
        return Err("fee must be >= 0");
    }
    Ok(())
}

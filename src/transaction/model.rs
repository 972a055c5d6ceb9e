use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A value transfer waiting to be included in a block. Its fee is what a
/// non-empty block pays out to the miner that includes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Digest of the content plus a random salt, so identical transfers
    /// submitted together still get distinct ids.
    pub txid: String,
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub fee: f64,
    /// Height of the block this transaction is queued for.
    pub block_height: u64,
    pub created_at: i64, // Unix millis (UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

impl Transaction {
    /// Build a transaction and derive its txid.
    pub fn new(from: String, to: String, amount: f64, fee: f64, block_height: u64) -> Self {
        let created_at = Utc::now().timestamp_millis();
        let payload = serde_json::json!({
            "from": from,
            "to": to,
            "amount": amount,
            "fee": fee,
            "block_height": block_height,
            "created_at": created_at,
            "salt": Uuid::new_v4().to_string(),
        });
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        let txid = hex::encode(hasher.finalize());

        Self {
            txid,
            from,
            to,
            amount,
            fee,
            block_height,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Transaction;

    #[test]
    fn txid_is_hex_sha256() {
        let tx = Transaction::new("alice".into(), "bob".into(), 5.0, 0.25, 3);
        assert_eq!(tx.txid.len(), 64);
        assert!(tx.txid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(tx.block_height, 3);
    }

    #[test]
    fn identical_transfers_get_distinct_ids() {
        let a = Transaction::new("alice".into(), "bob".into(), 5.0, 0.25, 3);
        let b = Transaction::new("alice".into(), "bob".into(), 5.0, 0.25, 3);
        assert_ne!(a.txid, b.txid);
    }
}

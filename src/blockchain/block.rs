use ruint::aliases::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::target::hash_to_u256;
use super::{GENESIS_PREVIOUS_HASH, RewardPolicy};
use crate::transaction::Transaction;

/// A single ledger entry. Built many times per accepted block while mining;
/// never mutated once the chain has accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub timestamp: i64, // Unix millis (UTC)
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub nonce: u64,   // Proof-of-Work nonce
    pub hash: String, // Cached hash of the block
    pub miner_id: String,
    pub reward: f64,
}

impl Block {
    /// Create a block from its defining fields. The reward is left at zero;
    /// `candidate` is the constructor that also prices the block.
    pub fn new(
        height: u64,
        timestamp: i64,
        transactions: Vec<Transaction>,
        previous_hash: String,
        nonce: u64,
        miner_id: String,
    ) -> Self {
        let mut block = Self {
            height,
            timestamp,
            transactions,
            previous_hash,
            nonce,
            hash: String::new(),
            miner_id,
            reward: 0.0,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Build the next mining candidate on top of `previous` (or a genesis
    /// candidate when the chain is empty) and compute its reward.
    pub fn candidate(
        previous: Option<&Block>,
        timestamp: i64,
        transactions: Vec<Transaction>,
        nonce: u64,
        miner_id: &str,
        policy: &RewardPolicy,
    ) -> Self {
        let (height, previous_hash) = match previous {
            Some(prev) => (prev.height + 1, prev.hash.clone()),
            None => (0, GENESIS_PREVIOUS_HASH.to_string()),
        };
        let mut block = Self::new(
            height,
            timestamp,
            transactions,
            previous_hash,
            nonce,
            miner_id.to_string(),
        );
        block.reward = block.compute_reward(previous.map(|p| p.timestamp), policy);
        block
    }

    /// Compute the SHA-256 hash over height, timestamp, transactions,
    /// previous hash and nonce. Miner and reward are not part of the preimage.
    pub fn compute_hash(&self) -> String {
        let txs_json = serde_json::to_string(&self.transactions).unwrap_or_default();
        let preimage = format!(
            "{}:{}:{}:{}:{}",
            self.height, self.timestamp, txs_json, self.previous_hash, self.nonce
        );
        let mut hasher = Sha256::new();
        hasher.update(preimage.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Blocks with transactions pay the sum of their fees. Empty blocks pay
    /// the base reward minus a penalty proportional to the seconds elapsed
    /// since the previous block, floored at zero.
    pub fn compute_reward(&self, previous_timestamp: Option<i64>, policy: &RewardPolicy) -> f64 {
        if !self.transactions.is_empty() {
            return self.transactions.iter().map(|tx| tx.fee).sum();
        }
        let elapsed_ms = previous_timestamp
            .map(|prev| (self.timestamp - prev).max(0))
            .unwrap_or(0);
        let elapsed_secs = elapsed_ms as f64 / 1000.0;
        (policy.base_reward - elapsed_secs * policy.time_penalty_factor).max(0.0)
    }

    pub fn hash_value(&self) -> U256 {
        hash_to_u256(&self.hash)
    }

    /// True when the cached hash matches the content and is strictly below `target`.
    pub fn meets_target(&self, target: U256) -> bool {
        self.hash == self.compute_hash() && self.hash_value() < target
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }
}

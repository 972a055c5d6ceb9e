//! Durable record store consumed by the chain, miners and presence.
//!
//! Every call may fail independently. Callers treat a failure as fatal to
//! the operation in flight and never to the process.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::blockchain::Block;
use crate::miner::{MinerPatch, MinerRecord};
use crate::transaction::Transaction;
use crate::user::{UserPatch, UserRecord};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// All accepted blocks, ascending by height.
    async fn blocks_by_height(&self) -> Result<Vec<Block>, StoreError>;

    async fn block_hash_exists(&self, hash: &str) -> Result<bool, StoreError>;

    /// Insert `block` and mark `consumed` pending transactions confirmed, as
    /// one write. Fails with `Conflict` if the height or hash is taken.
    async fn insert_block(&self, block: &Block, consumed: &[String]) -> Result<(), StoreError>;

    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Pending transactions queued for `height`.
    async fn pending_transactions(&self, height: u64) -> Result<Vec<Transaction>, StoreError>;

    async fn get_miner(&self, id: &str) -> Result<Option<MinerRecord>, StoreError>;

    async fn miners_for_user(&self, user_id: &str) -> Result<Vec<MinerRecord>, StoreError>;

    async fn insert_miner(&self, miner: &MinerRecord) -> Result<(), StoreError>;

    /// Apply `patch` atomically and return the updated record.
    async fn update_miner(&self, id: &str, patch: &MinerPatch) -> Result<MinerRecord, StoreError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    async fn update_user(&self, user_id: &str, patch: &UserPatch)
    -> Result<UserRecord, StoreError>;
}

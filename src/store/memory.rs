use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{Store, StoreError};
use crate::blockchain::Block;
use crate::miner::{MinerPatch, MinerRecord};
use crate::transaction::{Transaction, TxStatus};
use crate::user::{UserPatch, UserRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransactionRow {
    tx: Transaction,
    status: TxStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    blocks: BTreeMap<u64, Block>,
    transactions: BTreeMap<String, TransactionRow>,
    miners: HashMap<String, MinerRecord>,
    users: HashMap<String, UserRecord>,
}

/// Store keeping every table behind one lock, so each call is atomic.
/// With a snapshot path, the tables are written out as JSON after every
/// mutation and read back on `open`.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    path: Option<PathBuf>,
    #[cfg(test)]
    fail_writes: AtomicBool,
    #[cfg(test)]
    write_gate: tokio::sync::RwLock<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            path: None,
            #[cfg(test)]
            fail_writes: AtomicBool::new(false),
            #[cfg(test)]
            write_gate: tokio::sync::RwLock::new(()),
        }
    }

    /// Open a store backed by a snapshot file. A missing file starts empty.
    pub async fn open(path: Option<PathBuf>) -> Result<Self, StoreError> {
        let Some(path) = path else {
            info!("Durable store: memory only (no STORE_PATH)");
            return Ok(Self::new());
        };

        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Tables>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            "Durable store: {} ({} blocks, {} miners, {} users)",
            path.display(),
            tables.blocks.len(),
            tables.miners.len(),
            tables.users.len()
        );

        Ok(Self {
            tables: Mutex::new(tables),
            path: Some(path),
            #[cfg(test)]
            fail_writes: AtomicBool::new(false),
            #[cfg(test)]
            write_gate: tokio::sync::RwLock::new(()),
        })
    }

    /// Make every subsequent write fail with an i/o error.
    #[cfg(test)]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Suspend every write until the returned guard is dropped.
    #[cfg(test)]
    pub async fn pause_writes(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.write_gate.write().await
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        Ok(())
    }

    /// Write the snapshot while the caller still holds the table lock, so
    /// snapshots land in mutation order.
    async fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(tables)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("snapshot written ({} bytes)", bytes.len());
        Ok(())
    }

    /// Run `change` against a copy of the tables and make the copy live only
    /// once its snapshot is written. On any error memory is left untouched.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_writable()?;
        #[cfg(test)]
        let _gate = self.write_gate.read().await;
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *tables = next;
        Ok(out)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn blocks_by_height(&self) -> Result<Vec<Block>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.blocks.values().cloned().collect())
    }

    async fn block_hash_exists(&self, hash: &str) -> Result<bool, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.blocks.values().any(|b| b.hash == hash))
    }

    async fn insert_block(&self, block: &Block, consumed: &[String]) -> Result<(), StoreError> {
        self.commit(|tables| {
            if tables.blocks.contains_key(&block.height) {
                return Err(StoreError::Conflict(format!(
                    "block height {} already stored",
                    block.height
                )));
            }
            if tables.blocks.values().any(|b| b.hash == block.hash) {
                return Err(StoreError::Conflict(format!(
                    "block hash {} already stored",
                    block.hash
                )));
            }
            tables.blocks.insert(block.height, block.clone());
            for txid in consumed {
                if let Some(row) = tables.transactions.get_mut(txid) {
                    row.status = TxStatus::Confirmed;
                }
            }
            Ok(())
        })
        .await
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        self.commit(|tables| {
            if tables.transactions.contains_key(&tx.txid) {
                return Err(StoreError::Conflict(format!("transaction {}", tx.txid)));
            }
            tables.transactions.insert(
                tx.txid.clone(),
                TransactionRow {
                    tx: tx.clone(),
                    status: TxStatus::Pending,
                },
            );
            Ok(())
        })
        .await
    }

    async fn pending_transactions(&self, height: u64) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.tables.lock().await;
        let mut txs: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|row| row.status == TxStatus::Pending && row.tx.block_height == height)
            .map(|row| row.tx.clone())
            .collect();
        txs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.txid.cmp(&b.txid)));
        Ok(txs)
    }

    async fn get_miner(&self, id: &str) -> Result<Option<MinerRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.miners.get(id).cloned())
    }

    async fn miners_for_user(&self, user_id: &str) -> Result<Vec<MinerRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let mut miners: Vec<MinerRecord> = tables
            .miners
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        miners.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(miners)
    }

    async fn insert_miner(&self, miner: &MinerRecord) -> Result<(), StoreError> {
        self.commit(|tables| {
            if tables.miners.contains_key(&miner.id) {
                return Err(StoreError::Conflict(format!("miner {}", miner.id)));
            }
            tables.miners.insert(miner.id.clone(), miner.clone());
            Ok(())
        })
        .await
    }

    async fn update_miner(&self, id: &str, patch: &MinerPatch) -> Result<MinerRecord, StoreError> {
        self.commit(|tables| {
            let miner = tables
                .miners
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("miner {id}")))?;
            patch.apply(miner);
            Ok(miner.clone())
        })
        .await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.get(user_id).cloned())
    }

    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.commit(|tables| {
            if tables.users.contains_key(&user.user_id) {
                return Err(StoreError::Conflict(format!("user {}", user.user_id)));
            }
            tables.users.insert(user.user_id.clone(), user.clone());
            Ok(())
        })
        .await
    }

    async fn update_user(
        &self,
        user_id: &str,
        patch: &UserPatch,
    ) -> Result<UserRecord, StoreError> {
        self.commit(|tables| {
            let user = tables
                .users
                .get_mut(user_id)
                .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
            patch.apply(user);
            Ok(user.clone())
        })
        .await
    }
}

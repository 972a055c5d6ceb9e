use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};
use ruint::aliases::U256;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{Block, GENESIS_PREVIOUS_HASH, RewardPolicy, calculate_target};
use crate::realtime::{ConnectionRegistry, ServerEvent};
use crate::store::{Store, StoreError};

/// Why a candidate was not accepted. Checks run in declaration order and
/// stop at the first failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockRejection {
    #[error("invalid block height: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("invalid previous hash: expected {expected}, got {got}")]
    PreviousHashMismatch { expected: String, got: String },
    #[error("block {0} already exists")]
    DuplicateHash(String),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block rejected: {0}")]
    Rejected(#[from] BlockRejection),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// The single append-only chain, mirrored in memory and backed by the store.
///
/// Every read-validate-append sequence runs under one lock, so two mining
/// loops can never both extend the same head.
pub struct Blockchain {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    chain: Mutex<BTreeMap<u64, Block>>,
    difficulty: u32,
    reward: RewardPolicy,
}

impl Blockchain {
    /// Hydrate the chain from the store (ordered scan by height). Stored
    /// blocks past the first broken link are ignored.
    pub async fn load(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        difficulty: u32,
        reward: RewardPolicy,
    ) -> Result<Self, StoreError> {
        let stored = store.blocks_by_height().await?;
        let total = stored.len();

        let mut chain = BTreeMap::new();
        let mut prev: Option<&Block> = None;
        for block in &stored {
            if let Err(reason) = check_link(prev, block) {
                error!(
                    "stored chain broken at height {}: {reason}; keeping {} blocks",
                    block.height,
                    chain.len()
                );
                break;
            }
            if block.hash != block.compute_hash() {
                error!(
                    "stored block {} has a corrupt hash; keeping {} blocks",
                    block.height,
                    chain.len()
                );
                break;
            }
            chain.insert(block.height, block.clone());
            prev = Some(block);
        }
        info!("Chain hydrated: {}/{} blocks, difficulty {}", chain.len(), total, difficulty);

        Ok(Self {
            store,
            registry,
            chain: Mutex::new(chain),
            difficulty,
            reward,
        })
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn target(&self) -> U256 {
        calculate_target(self.difficulty)
    }

    pub fn reward_policy(&self) -> &RewardPolicy {
        &self.reward
    }

    /// The last accepted block, if any.
    pub async fn head(&self) -> Option<Block> {
        let chain = self.chain.lock().await;
        chain.values().next_back().cloned()
    }

    pub async fn len(&self) -> usize {
        self.chain.lock().await.len()
    }

    pub async fn get(&self, height: u64) -> Option<Block> {
        self.chain.lock().await.get(&height).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Block> {
        self.chain.lock().await.values().cloned().collect()
    }

    /// Validate `candidate` against the current head without appending it.
    pub async fn validate(&self, candidate: &Block) -> Result<(), ChainError> {
        let chain = self.chain.lock().await;
        self.validate_locked(&chain, candidate).await
    }

    async fn validate_locked(
        &self,
        chain: &BTreeMap<u64, Block>,
        candidate: &Block,
    ) -> Result<(), ChainError> {
        check_link(chain.values().next_back(), candidate)?;
        if self.store.block_hash_exists(&candidate.hash).await? {
            return Err(BlockRejection::DuplicateHash(candidate.hash.clone()).into());
        }
        Ok(())
    }

    /// Accept `candidate` as the new head: validate, persist it together with
    /// the pending transactions it consumes, append, then announce it to
    /// every connection.
    pub async fn add_block(&self, candidate: Block) -> Result<(), ChainError> {
        {
            let mut chain = self.chain.lock().await;
            if let Err(e) = self.validate_locked(&chain, &candidate).await {
                match &e {
                    ChainError::Rejected(reason) => {
                        warn!("Invalid block {}: {reason}", candidate.height)
                    }
                    ChainError::Storage(err) => {
                        error!("Error validating block {}: {err}", candidate.height)
                    }
                }
                return Err(e);
            }

            let consumed: Vec<String> = candidate
                .transactions
                .iter()
                .map(|tx| tx.txid.clone())
                .collect();
            if let Err(e) = self.store.insert_block(&candidate, &consumed).await {
                error!("Error adding block {} to the store: {e}", candidate.height);
                return Err(e.into());
            }
            chain.insert(candidate.height, candidate.clone());
        }

        info!(
            "New block #{} hash={} miner={} reward={}",
            candidate.height, candidate.hash, candidate.miner_id, candidate.reward
        );
        self.registry.send_all(
            &ServerEvent::NewBlock {
                height: candidate.height,
                hash: candidate.hash.clone(),
                miner_id: candidate.miner_id.clone(),
                reward: candidate.reward,
                timestamp: candidate.timestamp,
            },
            None,
        );
        Ok(())
    }

    /// Validate the entire in-memory chain: genesis, linkage and hashes.
    pub async fn is_valid_chain(&self) -> bool {
        let chain = self.chain.lock().await;
        let mut prev: Option<&Block> = None;
        for block in chain.values() {
            if check_link(prev, block).is_err() || block.hash != block.compute_hash() {
                return false;
            }
            prev = Some(block);
        }
        true
    }
}

/// Height, then previous-hash linkage of `block` on top of `prev`.
fn check_link(prev: Option<&Block>, block: &Block) -> Result<(), BlockRejection> {
    let (expected_height, expected_prev) = match prev {
        Some(p) => (p.height + 1, p.hash.as_str()),
        None => (0, GENESIS_PREVIOUS_HASH),
    };
    if block.height != expected_height {
        return Err(BlockRejection::HeightMismatch {
            expected: expected_height,
            got: block.height,
        });
    }
    if block.previous_hash != expected_prev {
        return Err(BlockRejection::PreviousHashMismatch {
            expected: expected_prev.to_string(),
            got: block.previous_hash.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::registry::tests::{connection, events};
    use crate::store::MemoryStore;
    use crate::transaction::Transaction;

    async fn chain_with(store: Arc<MemoryStore>) -> (Arc<ConnectionRegistry>, Blockchain) {
        let registry = Arc::new(ConnectionRegistry::new());
        let chain = Blockchain::load(store, registry.clone(), 1, RewardPolicy::default())
            .await
            .unwrap();
        (registry, chain)
    }

    fn next(prev: Option<&Block>, nonce: u64) -> Block {
        Block::candidate(prev, 1_000 + nonce as i64, Vec::new(), nonce, "m1", &RewardPolicy::default())
    }

    #[tokio::test]
    async fn genesis_is_accepted_on_an_empty_chain() {
        let (_, chain) = chain_with(Arc::new(MemoryStore::new())).await;
        let genesis = Block::new(0, 1, Vec::new(), "0".into(), 0, "m1".into());
        chain.add_block(genesis.clone()).await.unwrap();
        assert_eq!(chain.head().await, Some(genesis));
        assert!(chain.is_valid_chain().await);
    }

    #[tokio::test]
    async fn accepted_blocks_are_contiguous_and_linked() {
        let (_, chain) = chain_with(Arc::new(MemoryStore::new())).await;
        let mut prev = None;
        for i in 0..5 {
            let b = next(prev.as_ref(), i);
            chain.add_block(b.clone()).await.unwrap();
            prev = Some(b);
        }
        let blocks = chain.snapshot().await;
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.height, i as u64);
            if i > 0 {
                assert_eq!(b.previous_hash, blocks[i - 1].hash);
            }
        }
        assert!(chain.is_valid_chain().await);
    }

    #[tokio::test]
    async fn rejections_follow_height_then_link_then_uniqueness() {
        let store = Arc::new(MemoryStore::new());
        let (_, chain) = chain_with(store.clone()).await;
        let genesis = next(None, 0);
        chain.add_block(genesis.clone()).await.unwrap();

        // wrong height and wrong previous hash: height is reported
        let bad = Block::new(5, 2, Vec::new(), "nope".into(), 0, "m1".into());
        assert!(matches!(
            chain.add_block(bad).await,
            Err(ChainError::Rejected(BlockRejection::HeightMismatch { expected: 1, got: 5 }))
        ));

        // right height, wrong previous hash
        let bad = Block::new(1, 2, Vec::new(), "nope".into(), 0, "m1".into());
        assert!(matches!(
            chain.add_block(bad).await,
            Err(ChainError::Rejected(BlockRejection::PreviousHashMismatch { .. }))
        ));

        // a stale height-0 candidate after genesis
        assert!(matches!(
            chain.add_block(next(None, 9)).await,
            Err(ChainError::Rejected(BlockRejection::HeightMismatch { expected: 1, got: 0 }))
        ));
        assert_eq!(chain.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_hash_in_store_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (_, chain) = chain_with(store.clone()).await;
        let genesis = next(None, 0);
        chain.add_block(genesis.clone()).await.unwrap();

        // Another writer already stored this exact block at a later height.
        let candidate = next(Some(&genesis), 1);
        let mut sneaky = candidate.clone();
        sneaky.height = 99;
        store.insert_block(&sneaky, &[]).await.unwrap();

        assert!(matches!(
            chain.validate(&candidate).await,
            Err(ChainError::Rejected(BlockRejection::DuplicateHash(_)))
        ));
    }

    #[tokio::test]
    async fn storage_failure_is_a_distinct_error() {
        let store = Arc::new(MemoryStore::new());
        let (_, chain) = chain_with(store.clone()).await;
        store.fail_writes(true);
        let err = chain.add_block(next(None, 0)).await.unwrap_err();
        assert!(matches!(err, ChainError::Storage(_)));
        assert!(chain.head().await.is_none());
    }

    #[tokio::test]
    async fn failed_snapshot_write_does_not_wedge_the_height() {
        let path = std::env::temp_dir().join(format!("minerd-chain-{}.json", uuid::Uuid::new_v4()));
        let store = Arc::new(MemoryStore::open(Some(path.clone())).await.unwrap());
        let (_, chain) = chain_with(store.clone()).await;

        // a directory squatting on the temp file makes the snapshot write fail
        let tmp = path.with_extension("tmp");
        std::fs::create_dir(&tmp).unwrap();
        let genesis = next(None, 0);
        assert!(matches!(
            chain.add_block(genesis.clone()).await,
            Err(ChainError::Storage(StoreError::Io(_)))
        ));
        assert!(chain.head().await.is_none());
        assert!(store.blocks_by_height().await.unwrap().is_empty());

        std::fs::remove_dir(&tmp).unwrap();
        chain.add_block(genesis.clone()).await.unwrap();
        assert_eq!(chain.head().await, Some(genesis.clone()));
        chain.add_block(next(Some(&genesis), 1)).await.unwrap();
        assert_eq!(chain.len().await, 2);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn only_one_of_two_racing_candidates_wins() {
        let (_, chain) = chain_with(Arc::new(MemoryStore::new())).await;
        let chain = Arc::new(chain);
        let genesis = next(None, 0);
        chain.add_block(genesis.clone()).await.unwrap();

        let a = next(Some(&genesis), 1);
        let b = next(Some(&genesis), 2);
        let (ra, rb) = tokio::join!(
            {
                let chain = chain.clone();
                async move { chain.add_block(a).await }
            },
            {
                let chain = chain.clone();
                async move { chain.add_block(b).await }
            }
        );
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);

        // The loser rebuilds on the new head and succeeds.
        let head = chain.head().await.unwrap();
        assert_eq!(head.height, 1);
        chain.add_block(next(Some(&head), 3)).await.unwrap();
        assert_eq!(chain.len().await, 3);
    }

    #[tokio::test]
    async fn acceptance_is_broadcast_and_consumes_transactions() {
        let store = Arc::new(MemoryStore::new());
        let (registry, chain) = chain_with(store.clone()).await;
        let (conn, mut rx) = connection();
        registry.add("watcher", conn);

        let tx = Transaction::new("a".into(), "b".into(), 1.0, 0.5, 0);
        store.insert_transaction(&tx).await.unwrap();
        let genesis =
            Block::candidate(None, 1, vec![tx], 0, "m1", &RewardPolicy::default());
        chain.add_block(genesis).await.unwrap();

        assert!(store.pending_transactions(0).await.unwrap().is_empty());
        let got = events(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["action"], "new_block");
        assert_eq!(got[0]["data"]["height"], 0);
        assert_eq!(got[0]["data"]["reward"], 0.5);
    }

    #[tokio::test]
    async fn hydration_stops_at_a_broken_link() {
        let store = Arc::new(MemoryStore::new());
        let g = next(None, 0);
        let b1 = next(Some(&g), 1);
        let orphan = Block::new(2, 5, Vec::new(), "not-b1".into(), 0, "m1".into());
        store.insert_block(&g, &[]).await.unwrap();
        store.insert_block(&b1, &[]).await.unwrap();
        store.insert_block(&orphan, &[]).await.unwrap();

        let (_, chain) = chain_with(store).await;
        assert_eq!(chain.len().await, 2);
        assert_eq!(chain.head().await, Some(b1));
    }
}

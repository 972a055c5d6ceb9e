//! The proof-of-work loop behind `Miners::start`.
//!
//! Runs as its own task and polls its cancellation token on every attempt,
//! so a `stop` or `power_off` arriving on the owner's connection is never
//! blocked behind it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::service::Miners;
use crate::blockchain::{Block, ChainError};
use crate::transaction::Transaction;

/// Pause after a failed store call before the next attempt.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How long a fetched set of pending transactions is reused while the head
/// stays put.
const PENDING_REFRESH: Duration = Duration::from_secs(1);

pub struct MiningLoop {
    miners: Arc<Miners>,
    miner_id: String,
    owner: String,
    hash_rate: u64,
    run_id: u64,
    token: CancellationToken,
    fail_notice_interval: Duration,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Mined { height: u64 },
    Cancelled,
}

impl MiningLoop {
    pub fn new(
        miners: Arc<Miners>,
        miner_id: String,
        owner: String,
        hash_rate: u64,
        run_id: u64,
        token: CancellationToken,
        fail_notice_interval: Duration,
    ) -> Self {
        Self {
            miners,
            miner_id,
            owner,
            hash_rate,
            run_id,
            token,
            fail_notice_interval,
        }
    }

    pub async fn run(self) {
        let outcome = self.mine().await;
        info!(
            "Miner {} run {} finished: {:?}",
            self.miner_id, self.run_id, outcome
        );
    }

    async fn mine(&self) -> Outcome {
        let chain = self.miners.chain().clone();
        let store = self.miners.store().clone();
        let target = chain.target();
        let policy = *chain.reward_policy();

        let mut nonce: u64 = 0;
        let mut pending: Option<(u64, Instant, Vec<Transaction>)> = None;

        let mut failed_since_notice: u64 = 0;
        let mut last_notice = Instant::now();

        let mut window_start = Instant::now();
        let mut window_attempts: u64 = 0;

        loop {
            if self.token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let head = chain.head().await;
            let next_height = head.as_ref().map_or(0, |b| b.height + 1);

            let cached = pending.as_ref().is_some_and(|(h, fetched, _)| {
                *h == next_height && fetched.elapsed() < PENDING_REFRESH
            });
            if !cached {
                match store.pending_transactions(next_height).await {
                    Ok(txs) => pending = Some((next_height, Instant::now(), txs)),
                    Err(e) => {
                        error!(
                            "Miner {}: failed to load pending transactions: {e}",
                            self.miner_id
                        );
                        if self.pause(STORE_RETRY_DELAY).await {
                            return Outcome::Cancelled;
                        }
                        continue;
                    }
                }
            }
            let txs = pending
                .as_ref()
                .map(|(_, _, t)| t.clone())
                .unwrap_or_default();

            let candidate = Block::candidate(
                head.as_ref(),
                Utc::now().timestamp_millis(),
                txs,
                nonce,
                &self.miner_id,
                &policy,
            );

            if candidate.meets_target(target) {
                debug!(
                    "Miner {} found candidate #{} nonce={}",
                    self.miner_id, candidate.height, nonce
                );
                match chain.add_block(candidate.clone()).await {
                    Ok(()) => {
                        if let Err(e) = self
                            .miners
                            .reward(&self.miner_id, &candidate, self.run_id)
                            .await
                        {
                            error!("Miner {}: failed to credit reward: {e}", self.miner_id);
                        }
                        return Outcome::Mined {
                            height: candidate.height,
                        };
                    }
                    // Lost the race or the head moved; rebuild on the new head.
                    Err(ChainError::Rejected(reason)) => {
                        debug!("Miner {} candidate rejected: {reason}", self.miner_id);
                        pending = None;
                    }
                    Err(ChainError::Storage(_)) => {
                        pending = None;
                        if self.pause(STORE_RETRY_DELAY).await {
                            return Outcome::Cancelled;
                        }
                    }
                }
            } else {
                failed_since_notice += 1;
                if last_notice.elapsed() >= self.fail_notice_interval {
                    self.miners.notify_mine_fail(
                        &self.miner_id,
                        &self.owner,
                        failed_since_notice,
                        format!(
                            "Block did not meet target difficulty ({} attempts, last nonce {})",
                            failed_since_notice, nonce
                        ),
                    );
                    failed_since_notice = 0;
                    last_notice = Instant::now();
                }
            }

            nonce = nonce.wrapping_add(1);

            if self.hash_rate == 0 {
                tokio::task::yield_now().await;
                continue;
            }
            window_attempts += 1;
            if window_attempts >= self.hash_rate {
                let remaining = Duration::from_secs(1).saturating_sub(window_start.elapsed());
                if self.pause(remaining).await {
                    return Outcome::Cancelled;
                }
                window_start = Instant::now();
                window_attempts = 0;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Sleep for `delay` unless cancelled first. Returns true on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::mining::MiningLoop;
use super::model::{MinerError, MinerPatch, MinerRecord, MinerStatus};
use crate::blockchain::{Block, Blockchain};
use crate::realtime::{ConnectionRegistry, ServerEvent, StateBroadcaster, StateKind};
use crate::store::Store;

/// A running mining loop. `id` tells a late reward from a finished run
/// apart from one belonging to the current run.
struct MiningRun {
    id: u64,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct SlotState {
    record: MinerRecord,
    run: Option<MiningRun>,
}

/// One loaded miner. Transitions on the same miner are serialised by `state`.
struct MinerSlot {
    owner: String,
    state: Mutex<SlotState>,
}

/// Owns every loaded miner, applies their transitions and runs their
/// mining loops.
pub struct Miners {
    store: Arc<dyn Store>,
    chain: Arc<Blockchain>,
    registry: Arc<ConnectionRegistry>,
    states: Arc<StateBroadcaster>,
    fail_notice_interval: Duration,
    slots: DashMap<String, Arc<MinerSlot>>,
    next_run: AtomicU64,
}

impl Miners {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<Blockchain>,
        registry: Arc<ConnectionRegistry>,
        states: Arc<StateBroadcaster>,
        fail_notice_interval: Duration,
    ) -> Self {
        Self {
            store,
            chain,
            registry,
            states,
            fail_notice_interval,
            slots: DashMap::new(),
            next_run: AtomicU64::new(1),
        }
    }

    pub(crate) fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Load (once) and return the slot for `miner_id`.
    async fn slot(&self, miner_id: &str) -> Result<Arc<MinerSlot>, MinerError> {
        if let Some(slot) = self.slots.get(miner_id) {
            return Ok(slot.value().clone());
        }

        let mut record = self
            .store
            .get_miner(miner_id)
            .await?
            .ok_or(MinerError::NotFound)?;

        // A stored `mining` flag with no loop behind it is left over from a
        // previous process.
        if record.mining {
            warn!("miner {miner_id} was stored as mining with no loop; resetting");
            let patch = MinerPatch {
                mining: Some(false),
                status: Some(if record.active {
                    MinerStatus::Online
                } else {
                    MinerStatus::Offline
                }),
                ..Default::default()
            };
            record = self.store.update_miner(miner_id, &patch).await?;
        }

        let slot = self
            .slots
            .entry(miner_id.to_string())
            .or_insert_with(|| {
                Arc::new(MinerSlot {
                    owner: record.user_id.clone(),
                    state: Mutex::new(SlotState {
                        record: record.clone(),
                        run: None,
                    }),
                })
            })
            .value()
            .clone();
        self.mirror(&record);
        Ok(slot)
    }

    /// Fails with `NotOwner` unless `user_id` owns `miner_id`.
    pub async fn authorize(&self, miner_id: &str, user_id: &str) -> Result<(), MinerError> {
        let slot = self.slot(miner_id).await?;
        if slot.owner != user_id {
            return Err(MinerError::NotOwner);
        }
        Ok(())
    }

    /// Current in-memory record of a loaded miner.
    pub async fn snapshot(&self, miner_id: &str) -> Option<MinerRecord> {
        let slot = self.slots.get(miner_id).map(|s| s.value().clone())?;
        let state = slot.state.lock().await;
        Some(state.record.clone())
    }

    /// Whether a mining loop is currently registered for `miner_id`.
    pub async fn is_running(&self, miner_id: &str) -> bool {
        let Some(slot) = self.slots.get(miner_id).map(|s| s.value().clone()) else {
            return false;
        };
        let state = slot.state.lock().await;
        state.run.is_some()
    }

    pub async fn power_on(&self, miner_id: &str) -> Result<MinerRecord, MinerError> {
        let slot = self.slot(miner_id).await?;
        let mut state = slot.state.lock().await;
        let patch = state.record.power_on()?;
        let record = self.persist(&mut state, &patch).await?;
        info!("Miner {miner_id} powered on");
        self.publish(&record, "Powered on");
        Ok(record)
    }

    /// Powering off also ends any mining run, in the same persisted write.
    pub async fn power_off(&self, miner_id: &str) -> Result<MinerRecord, MinerError> {
        let slot = self.slot(miner_id).await?;
        let (record, run) = {
            let mut state = slot.state.lock().await;
            let patch = state.record.power_off()?;
            let record = self.persist(&mut state, &patch).await?;
            let run = state.run.take();
            if let Some(run) = &run {
                run.token.cancel();
            }
            (record, run)
        };
        info!("Miner {miner_id} powered off");
        self.publish(&record, "Powered off");
        join(run).await;
        Ok(record)
    }

    /// Flip the miner into mining and spawn its loop. Returns as soon as the
    /// loop is scheduled; finding a block is not part of this call.
    pub async fn start(self: &Arc<Self>, miner_id: &str) -> Result<MinerRecord, MinerError> {
        let slot = self.slot(miner_id).await?;
        let mut state = slot.state.lock().await;
        let patch = state.record.start()?;
        let record = self.persist(&mut state, &patch).await?;
        self.publish(&record, "Started mining");

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mining = MiningLoop::new(
            self.clone(),
            record.id.clone(),
            record.user_id.clone(),
            record.hash_rate,
            run_id,
            token.clone(),
            self.fail_notice_interval,
        );
        let task = tokio::spawn(mining.run());
        state.run = Some(MiningRun {
            id: run_id,
            token,
            task: Some(task),
        });
        drop(state);

        info!("Miner {miner_id} started mining (run {run_id})");
        Ok(record)
    }

    /// Clear the mining flag and cancel the loop; it exits at its next check.
    pub async fn stop(&self, miner_id: &str) -> Result<MinerRecord, MinerError> {
        let slot = self.slot(miner_id).await?;
        let (record, run) = {
            let mut state = slot.state.lock().await;
            let patch = state.record.stop()?;
            let record = self.persist(&mut state, &patch).await?;
            let run = state.run.take();
            if let Some(run) = &run {
                run.token.cancel();
            }
            (record, run)
        };
        info!("Miner {miner_id} stopped mining");
        self.publish(&record, "Stopped mining");
        join(run).await;
        Ok(record)
    }

    /// Credit the reward of an accepted block. If `run_id` is still the
    /// current run, this also ends it (implicit stop).
    pub async fn reward(
        &self,
        miner_id: &str,
        block: &Block,
        run_id: u64,
    ) -> Result<MinerRecord, MinerError> {
        let slot = self.slot(miner_id).await?;
        let mut state = slot.state.lock().await;
        let current = state.run.as_ref().is_some_and(|run| run.id == run_id);
        let patch = state.record.reward(block.reward, current);
        let record = self.persist(&mut state, &patch).await?;
        if current {
            // The caller is this run's own task; nothing to join.
            state.run = None;
        }
        drop(state);

        info!(
            "Miner {miner_id} rewarded {} for block #{} (balance {})",
            block.reward, block.height, record.balance
        );
        self.mirror(&record);
        if let Ok(miner) = serde_json::to_value(&record) {
            self.registry.send_to(
                &record.user_id,
                &ServerEvent::MinerMineSuccess {
                    miner,
                    height: block.height,
                    reward: block.reward,
                },
            );
        }
        Ok(record)
    }

    pub(crate) fn notify_mine_fail(&self, miner_id: &str, owner: &str, attempts: u64, message: String) {
        self.registry.send_to(
            owner,
            &ServerEvent::MinerMineFail {
                miner_id: miner_id.to_string(),
                attempts,
                message,
            },
        );
    }

    /// Stop every running loop owned by `user_id`. Returns how many stopped.
    pub async fn stop_all_for_user(&self, user_id: &str) -> usize {
        let owned: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.value().owner == user_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut stopped = 0;
        for miner_id in owned {
            match self.stop(&miner_id).await {
                Ok(_) => stopped += 1,
                Err(MinerError::NotMining) => {}
                Err(e) => error!("failed to stop miner {miner_id} for {user_id}: {e}"),
            }
        }
        stopped
    }

    async fn persist(
        &self,
        state: &mut SlotState,
        patch: &MinerPatch,
    ) -> Result<MinerRecord, MinerError> {
        let updated = self
            .store
            .update_miner(&state.record.id, patch)
            .await
            .inspect_err(|e| error!("Failed to persist miner {}: {e}", state.record.id))?;
        state.record = updated.clone();
        Ok(updated)
    }

    fn mirror(&self, record: &MinerRecord) {
        let value = match serde_json::to_value(record) {
            Ok(v) => v,
            Err(e) => {
                error!("failed to encode miner {}: {e}", record.id);
                return;
            }
        };
        if let Err(e) = self.states.set(StateKind::Miner, &record.id, value) {
            error!("failed to mirror miner {}: {e}", record.id);
        }
    }

    /// Mirror and push the record to its owner: one message per transition.
    fn publish(&self, record: &MinerRecord, message: &str) {
        self.mirror(record);
        self.states
            .announce(StateKind::Miner, &record.id, Some(message.to_string()));
    }
}

async fn join(run: Option<MiningRun>) {
    if let Some(task) = run.and_then(|r| r.task) {
        if let Err(e) = task.await {
            error!("mining task ended abnormally: {e}");
        }
    }
}

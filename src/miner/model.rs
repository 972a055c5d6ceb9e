use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinerStatus {
    Offline,
    Online,
    Mining,
}

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Miner not found")]
    NotFound,
    #[error("Miner not found")]
    NotOwner,
    #[error("Miner is already powered on")]
    AlreadyActive,
    #[error("Miner is already powered off")]
    AlreadyInactive,
    #[error("Miner is not powered on")]
    NotActive,
    #[error("Miner is already mining")]
    AlreadyMining,
    #[error("Miner is not mining")]
    NotMining,
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl MinerError {
    /// Expected rejections, as opposed to storage failures.
    pub fn is_validation(&self) -> bool {
        !matches!(self, MinerError::Storage(_))
    }
}

/// One user's mining rig as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerRecord {
    pub id: String,
    pub user_id: String,
    /// Attempts per second; 0 means unpaced.
    pub hash_rate: u64,
    pub active: bool,
    pub mining: bool,
    pub status: MinerStatus,
    pub currency_code: String,
    pub balance: f64,
}

impl MinerRecord {
    pub fn new(user_id: String, hash_rate: u64, currency_code: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            hash_rate,
            active: false,
            mining: false,
            status: MinerStatus::Offline,
            currency_code,
            balance: 0.0,
        }
    }

    /// mining => active
    pub fn is_consistent(&self) -> bool {
        !self.mining || self.active
    }

    pub fn power_on(&self) -> Result<MinerPatch, MinerError> {
        if self.active {
            return Err(MinerError::AlreadyActive);
        }
        Ok(MinerPatch {
            active: Some(true),
            status: Some(MinerStatus::Online),
            ..Default::default()
        })
    }

    /// Power-off always clears `mining`, in the same write.
    pub fn power_off(&self) -> Result<MinerPatch, MinerError> {
        if !self.active {
            return Err(MinerError::AlreadyInactive);
        }
        Ok(MinerPatch {
            active: Some(false),
            mining: Some(false),
            status: Some(MinerStatus::Offline),
            ..Default::default()
        })
    }

    pub fn start(&self) -> Result<MinerPatch, MinerError> {
        if !self.active {
            return Err(MinerError::NotActive);
        }
        if self.mining {
            return Err(MinerError::AlreadyMining);
        }
        Ok(MinerPatch {
            mining: Some(true),
            status: Some(MinerStatus::Mining),
            ..Default::default()
        })
    }

    pub fn stop(&self) -> Result<MinerPatch, MinerError> {
        if !self.mining {
            return Err(MinerError::NotMining);
        }
        Ok(MinerPatch {
            mining: Some(false),
            status: Some(MinerStatus::Online),
            ..Default::default()
        })
    }

    /// Credit `amount`. With `finish_run` the reward also ends the current
    /// mining run (implicit stop).
    pub fn reward(&self, amount: f64, finish_run: bool) -> MinerPatch {
        let mut patch = MinerPatch {
            balance: Some(self.balance + amount.max(0.0)),
            ..Default::default()
        };
        if finish_run && self.mining {
            patch.mining = Some(false);
            patch.status = Some(if self.active {
                MinerStatus::Online
            } else {
                MinerStatus::Offline
            });
        }
        patch
    }
}

/// Partial update applied by the store in one write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MinerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mining: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MinerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
}

impl MinerPatch {
    pub fn apply(&self, miner: &mut MinerRecord) {
        if let Some(active) = self.active {
            miner.active = active;
        }
        if let Some(mining) = self.mining {
            miner.mining = mining;
        }
        if let Some(status) = self.status {
            miner.status = status;
        }
        if let Some(balance) = self.balance {
            miner.balance = balance;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn miner() -> MinerRecord {
        MinerRecord::new("u1".into(), 0, "LUX".into())
    }

    fn step(
        m: &mut MinerRecord,
        transition: impl FnOnce(&MinerRecord) -> Result<MinerPatch, MinerError>,
    ) -> Result<(), MinerError> {
        transition(&*m)?.apply(m);
        Ok(())
    }

    #[test]
    fn full_cycle_keeps_invariant() {
        let mut m = miner();
        step(&mut m, MinerRecord::power_on).unwrap();
        assert!(m.is_consistent());
        assert_eq!(m.status, MinerStatus::Online);

        step(&mut m, MinerRecord::start).unwrap();
        assert!(m.is_consistent());
        assert_eq!(m.status, MinerStatus::Mining);

        step(&mut m, MinerRecord::stop).unwrap();
        assert_eq!(m.status, MinerStatus::Online);
        assert!(!m.mining);

        step(&mut m, MinerRecord::power_off).unwrap();
        assert_eq!(m.status, MinerStatus::Offline);
        assert!(m.is_consistent());
    }

    #[test]
    fn power_off_while_mining_is_one_patch() {
        let mut m = miner();
        step(&mut m, MinerRecord::power_on).unwrap();
        step(&mut m, MinerRecord::start).unwrap();

        let patch = m.power_off().unwrap();
        assert_eq!(
            patch,
            MinerPatch {
                active: Some(false),
                mining: Some(false),
                status: Some(MinerStatus::Offline),
                balance: None,
            }
        );
        patch.apply(&mut m);
        assert!(!m.active && !m.mining);
        assert!(m.is_consistent());
    }

    #[test]
    fn rejected_transitions() {
        let m = miner();
        assert!(matches!(m.start(), Err(MinerError::NotActive)));
        assert!(matches!(m.stop(), Err(MinerError::NotMining)));
        assert!(matches!(m.power_off(), Err(MinerError::AlreadyInactive)));

        let mut m = miner();
        step(&mut m, MinerRecord::power_on).unwrap();
        assert!(matches!(m.power_on(), Err(MinerError::AlreadyActive)));

        step(&mut m, MinerRecord::start).unwrap();
        let before = m.clone();
        assert!(matches!(m.start(), Err(MinerError::AlreadyMining)));
        assert_eq!(m, before);
    }

    #[test]
    fn reward_credits_and_stops() {
        let mut m = miner();
        step(&mut m, MinerRecord::power_on).unwrap();
        step(&mut m, MinerRecord::start).unwrap();

        m.reward(9.8, true).apply(&mut m);
        assert!((m.balance - 9.8).abs() < 1e-9);
        assert!(!m.mining);
        assert_eq!(m.status, MinerStatus::Online);
    }

    #[test]
    fn stale_reward_only_credits() {
        let mut m = miner();
        step(&mut m, MinerRecord::power_on).unwrap();
        step(&mut m, MinerRecord::start).unwrap();

        m.reward(1.0, false).apply(&mut m);
        assert!((m.balance - 1.0).abs() < 1e-9);
        assert!(m.mining);
    }
}

pub mod block;
pub mod model;
pub mod target;

pub use block::Block;
pub use model::{Blockchain, ChainError};
pub use target::calculate_target;

/// Default Proof-of-Work difficulty (fed into `calculate_target`).
pub const DEFAULT_DIFFICULTY: u32 = 2;

/// `previous_hash` carried by the block at height 0.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Reward paid for an empty block mined with no delay after its predecessor.
pub const DEFAULT_BASE_REWARD: f64 = 10.0;

/// Reward lost per second elapsed since the previous block (empty blocks only).
pub const DEFAULT_TIME_PENALTY_FACTOR: f64 = 0.1;

/// How empty blocks are paid. Blocks carrying transactions always pay their fees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardPolicy {
    pub base_reward: f64,
    pub time_penalty_factor: f64,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            base_reward: DEFAULT_BASE_REWARD,
            time_penalty_factor: DEFAULT_TIME_PENALTY_FACTOR,
        }
    }
}

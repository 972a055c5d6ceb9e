pub mod mining;
pub mod model;
pub mod service;

pub use model::{MinerError, MinerPatch, MinerRecord};
pub use service::Miners;

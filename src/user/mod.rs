pub mod model;

pub use model::{Presence, UserPatch, UserRecord};

//! Update strategies and the cycle that runs them.

pub mod manager;
pub mod result;
pub mod strategy;

pub use manager::{UpdateManager, UpdateSettings};
pub use result::{UpdateError, UpdateResult, UpdateState};
pub use strategy::{UpdateRequest, UpdateStrategy};

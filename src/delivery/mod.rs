//! Delivery queue and retry engine.
//!
//! - `engine`: the queue owner loop (`DeliveryEngine`, `EngineHandle`)
//! - `queue`: per-recipient FIFO ordering
//! - `retry`: attempt budget and backoff delays
//! - `dedup`: bounded window of already seen task ids
//! - `status`: snapshot published for `/status`
//! - `activity`: terminal outcome log
//! - `journal`: pending tasks and seen ids saved across restarts
//! - `clock`: time source, swappable in tests

pub mod activity;
pub mod clock;
pub mod dedup;
pub mod engine;
pub mod journal;
pub mod queue;
pub mod retry;
pub mod status;

pub use activity::FileActivityLog;
#[cfg(test)]
pub use activity::MemoryActivityLog;
pub use clock::TokioClock;
pub use engine::{DeliveryEngine, EngineHandle, EngineSettings};
pub use journal::Journal;

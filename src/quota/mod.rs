//! Quota enforcement: admission, traffic accounting, release

pub mod engine;

pub use engine::{QuotaEngine, TrafficVerdict};

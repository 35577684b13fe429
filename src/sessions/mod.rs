//! Session table: live relay sessions, traffic counters, expiry scans

pub mod table;
pub mod types;

pub use table::SessionTable;
pub use types::Session;

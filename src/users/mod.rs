//! User registry: accounts, enabled flags and quota policy/state

pub mod registry;
pub mod types;

pub use registry::UserRegistry;
pub use types::{QuotaPolicy, User, UserQuota};

//! turn-rs: per-user quota and session tracking for a STUN/TURN relay
//!
//! The authoritative record of which users exist, whether they are enabled,
//! what resource limits apply to them, and the live state of every open
//! relay session, so the relay layer can answer "may this user open one
//! more session?" and "has this user blown its bandwidth budget?" under
//! concurrent load.
//!
//! # Components
//!
//! - **User registry** ([`users`]): accounts with an optional embedded
//!   quota (session ceiling, bandwidth budget, max session lifetime) and
//!   the live counters against those ceilings
//! - **Session table** ([`sessions`]): one record per open relay session
//!   with traffic counters and an activity clock
//! - **Quota engine** ([`quota`]): the only writer of quota counters;
//!   admission with two-phase reserve-then-create, post-hoc bandwidth and
//!   duration accounting, idempotent release
//! - **Reaper** ([`reaper`]): background sweep reclaiming reservations for
//!   sessions abandoned without an explicit close
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use turn_rs::config::Config;
//! use turn_rs::quota::QuotaEngine;
//! use turn_rs::sessions::SessionTable;
//! use turn_rs::users::UserRegistry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let pool = Arc::new(sqlx::SqlitePool::connect(&config.store.database_url).await?);
//!
//!     let registry = UserRegistry::new(
//!         pool.clone(),
//!         chrono::Duration::seconds(config.quota.reset_period_secs),
//!     );
//!     let sessions = SessionTable::new(pool.clone());
//!     registry.init_db().await?;
//!     sessions.init_db().await?;
//!
//!     let engine = QuotaEngine::new(registry, sessions, config.quota.max_conflict_retries);
//!     let session = engine.admit_session("alice", "198.51.100.7:52013").await?;
//!     engine.report_traffic(&session.id, 1024, 2048, 4, 6).await?;
//!     engine.release_session(&session.id).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod quota;
pub mod reaper;
pub mod sessions;
pub mod users;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, TurnError};
pub use quota::{QuotaEngine, TrafficVerdict};
pub use reaper::SessionReaper;
pub use sessions::{Session, SessionTable};
pub use users::{QuotaPolicy, User, UserQuota, UserRegistry};

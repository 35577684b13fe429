//! User registry backed by SQLite
//!
//! Holds one record per user: identity, enabled flag and the embedded quota
//! policy/state. All quota counter movement goes through
//! [`UserRegistry::apply_quota_delta`], which is a single guarded UPDATE so
//! concurrent admissions and releases on the same user cannot lose updates
//! or push `current_sessions` out of bounds.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, TurnError};

use super::types::{QuotaPolicy, User, UserQuota};

type UserRow = (
    String,         // username
    String,         // password
    bool,           // enabled
    String,         // created_at
    String,         // updated_at
    Option<String>, // last_login
    Option<i64>,    // max_sessions
    Option<i64>,    // max_bandwidth
    Option<i64>,    // max_duration
    Option<i64>,    // current_sessions
    Option<i64>,    // used_bandwidth
    Option<String>, // reset_at
    Option<String>, // metadata (JSON)
);

const USER_COLUMNS: &str = "username, password, enabled, created_at, updated_at, last_login, \
     max_sessions, max_bandwidth, max_duration, current_sessions, used_bandwidth, reset_at, \
     metadata";

/// User registry over a shared SQLite pool
#[derive(Clone)]
pub struct UserRegistry {
    db: Arc<SqlitePool>,
    reset_period: Duration,
}

impl UserRegistry {
    /// Create a new registry; `reset_period` is the bandwidth-usage window
    pub fn new(db: Arc<SqlitePool>, reset_period: Duration) -> Self {
        Self { db, reset_period }
    }

    /// Initialize the users table and its indexes
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_login TEXT,
                max_sessions INTEGER,
                max_bandwidth INTEGER,
                max_duration INTEGER,
                current_sessions INTEGER,
                used_bandwidth INTEGER,
                reset_at TEXT,
                metadata TEXT
            )
            "#,
        )
        .execute(&*self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_enabled ON users(enabled)")
            .execute(&*self.db)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_created_at ON users(created_at)")
            .execute(&*self.db)
            .await?;

        Ok(())
    }

    /// Create a new user
    ///
    /// A quota policy seeds the live counters at zero with the first reset
    /// one period from now. Fails with `DuplicateUser` if the username is
    /// taken.
    pub async fn create(
        &self,
        username: &str,
        password_hash: &str,
        policy: Option<QuotaPolicy>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<User> {
        let now = Utc::now();
        let reset_at = now + self.reset_period;
        let metadata_json = match &metadata {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO users (
                username, password, enabled, created_at, updated_at,
                max_sessions, max_bandwidth, max_duration,
                current_sessions, used_bandwidth, reset_at, metadata
            )
            VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(username)
        .bind(password_hash)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(policy.map(|p| p.max_sessions))
        .bind(policy.map(|p| p.max_bandwidth))
        .bind(policy.map(|p| p.max_duration))
        .bind(policy.map(|_| 0i64))
        .bind(policy.map(|_| 0i64))
        .bind(policy.map(|_| reset_at.to_rfc3339()))
        .bind(metadata_json)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(TurnError::DuplicateUser(username.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!("User created: {}", username);
        self.get(username).await
    }

    /// Fetch a user by username
    pub async fn get(&self, username: &str) -> Result<User> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => row_to_user(row),
            None => Err(TurnError::UserNotFound(username.to_string())),
        }
    }

    /// Enable or disable a user
    pub async fn set_enabled(&self, username: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET enabled = ?, updated_at = ? WHERE username = ?
            "#,
        )
        .bind(enabled)
        .bind(Utc::now().to_rfc3339())
        .bind(username)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TurnError::UserNotFound(username.to_string()));
        }

        info!("User {} {}", username, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Replace a user's quota policy
    ///
    /// Setting a policy keeps any live counters (sessions stay reserved);
    /// clearing it removes tracking entirely.
    pub async fn set_quota(&self, username: &str, policy: Option<QuotaPolicy>) -> Result<()> {
        let now = Utc::now();
        let result = match policy {
            Some(p) => {
                sqlx::query(
                    r#"
                    UPDATE users
                    SET max_sessions = ?,
                        max_bandwidth = ?,
                        max_duration = ?,
                        current_sessions = COALESCE(current_sessions, 0),
                        used_bandwidth = COALESCE(used_bandwidth, 0),
                        reset_at = COALESCE(reset_at, ?),
                        updated_at = ?
                    WHERE username = ?
                    "#,
                )
                .bind(p.max_sessions)
                .bind(p.max_bandwidth)
                .bind(p.max_duration)
                .bind((now + self.reset_period).to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(username)
                .execute(&*self.db)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE users
                    SET max_sessions = NULL,
                        max_bandwidth = NULL,
                        max_duration = NULL,
                        current_sessions = NULL,
                        used_bandwidth = NULL,
                        reset_at = NULL,
                        updated_at = ?
                    WHERE username = ?
                    "#,
                )
                .bind(now.to_rfc3339())
                .bind(username)
                .execute(&*self.db)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(TurnError::UserNotFound(username.to_string()));
        }

        Ok(())
    }

    /// Replace a user's credential hash
    ///
    /// The value is opaque to the core; hashing belongs to the auth layer.
    pub async fn set_password(&self, username: &str, password_hash: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET password = ?, updated_at = ? WHERE username = ?
            "#,
        )
        .bind(password_hash)
        .bind(Utc::now().to_rfc3339())
        .bind(username)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TurnError::UserNotFound(username.to_string()));
        }

        info!("Password updated for {}", username);
        Ok(())
    }

    /// Delete a user
    pub async fn delete(&self, username: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TurnError::UserNotFound(username.to_string()));
        }

        info!("User deleted: {}", username);
        Ok(())
    }

    /// List users, newest first
    pub async fn list(&self, offset: i64, limit: i64) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter().map(row_to_user).collect()
    }

    /// Count registered users
    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&*self.db)
            .await?;

        Ok(count.0)
    }

    /// Record a successful login (written by the auth collaborator)
    pub async fn record_login(&self, username: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE users SET last_login = ?, updated_at = ? WHERE username = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(username)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TurnError::UserNotFound(username.to_string()));
        }

        Ok(())
    }

    /// Apply a session-slot and/or bandwidth delta to a user's quota counters
    ///
    /// A positive session delta fails with `QuotaExceeded` when it would
    /// push `current_sessions` past `max_sessions`. Negative deltas clamp at
    /// zero and never fail. Bandwidth deltas accumulate unconditionally.
    /// Users without a quota are untracked: every delta is a no-op.
    ///
    /// Each branch is a single guarded UPDATE, so the bound check and the
    /// write are one atomic statement against the store.
    pub async fn apply_quota_delta(
        &self,
        username: &str,
        session_delta: i64,
        bandwidth_delta: i64,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        if session_delta > 0 {
            let result = sqlx::query(
                r#"
                UPDATE users
                SET current_sessions = current_sessions + ?,
                    updated_at = ?
                WHERE username = ?
                  AND max_sessions IS NOT NULL
                  AND current_sessions + ? <= max_sessions
                "#,
            )
            .bind(session_delta)
            .bind(&now)
            .bind(username)
            .bind(session_delta)
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 0 {
                // Missing user, quota-less user, or ceiling hit
                match self.quota_ceiling(username).await? {
                    None => {}
                    Some(_) => {
                        debug!("Session quota exceeded for {}", username);
                        return Err(TurnError::QuotaExceeded(username.to_string()));
                    }
                }
            }
        } else if session_delta < 0 {
            let result = sqlx::query(
                r#"
                UPDATE users
                SET current_sessions = MAX(current_sessions + ?, 0),
                    updated_at = ?
                WHERE username = ? AND max_sessions IS NOT NULL
                "#,
            )
            .bind(session_delta)
            .bind(&now)
            .bind(username)
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 0 {
                self.quota_ceiling(username).await?;
            }
        }

        if bandwidth_delta != 0 {
            let result = sqlx::query(
                r#"
                UPDATE users
                SET used_bandwidth = MAX(used_bandwidth + ?, 0),
                    updated_at = ?
                WHERE username = ? AND max_sessions IS NOT NULL
                "#,
            )
            .bind(bandwidth_delta)
            .bind(&now)
            .bind(username)
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 0 {
                self.quota_ceiling(username).await?;
            }
        }

        Ok(())
    }

    /// Zero `used_bandwidth` and advance `reset_at` once the period is over
    ///
    /// Idempotent and safe to call opportunistically before every accounting
    /// check; the UPDATE is keyed on the observed `reset_at`, so concurrent
    /// callers perform at most one reset per period.
    pub async fn reset_usage_if_due(&self, username: &str, now: DateTime<Utc>) -> Result<()> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT reset_at FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&*self.db)
                .await?;

        let reset_at_raw = match row {
            None => return Err(TurnError::UserNotFound(username.to_string())),
            Some((None,)) => return Ok(()), // no quota, nothing to reset
            Some((Some(raw),)) => raw,
        };

        let reset_at = parse_ts(&reset_at_raw);
        if now < reset_at {
            return Ok(());
        }

        // Advance by whole periods until the next reset is in the future
        let mut next = reset_at;
        while next <= now {
            next = next + self.reset_period;
        }

        let result = sqlx::query(
            r#"
            UPDATE users
            SET used_bandwidth = 0,
                reset_at = ?,
                updated_at = ?
            WHERE username = ? AND reset_at = ?
            "#,
        )
        .bind(next.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(username)
        .bind(&reset_at_raw)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() > 0 {
            debug!("Bandwidth usage reset for {}, next reset at {}", username, next);
        }
        // rows_affected == 0 means a concurrent caller already reset

        Ok(())
    }

    /// Fetch `max_sessions` for a user, erroring if the user is missing.
    /// `None` means the user has no quota.
    async fn quota_ceiling(&self, username: &str) -> Result<Option<i64>> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT max_sessions FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&*self.db)
                .await?;

        match row {
            None => Err(TurnError::UserNotFound(username.to_string())),
            Some((ceiling,)) => Ok(ceiling),
        }
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Corrupt stored timestamp {:?}, substituting now: {}", raw, e);
            Utc::now()
        })
}

fn row_to_user(row: UserRow) -> Result<User> {
    let (
        username,
        password,
        enabled,
        created_at,
        updated_at,
        last_login,
        max_sessions,
        max_bandwidth,
        max_duration,
        current_sessions,
        used_bandwidth,
        reset_at,
        metadata,
    ) = row;

    // Quota presence is keyed on max_sessions: the sub-record is written and
    // cleared as a unit
    let quota = max_sessions.map(|max_sessions| UserQuota {
        max_sessions,
        max_bandwidth: max_bandwidth.unwrap_or(0),
        max_duration: max_duration.unwrap_or(0),
        current_sessions: current_sessions.unwrap_or(0),
        used_bandwidth: used_bandwidth.unwrap_or(0),
        reset_at: reset_at.as_deref().map(parse_ts).unwrap_or_else(Utc::now),
    });

    let metadata = match metadata {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    Ok(User {
        username,
        password,
        enabled,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        last_login: last_login.as_deref().map(parse_ts),
        quota,
        metadata,
    })
}

//! Session table backed by SQLite
//!
//! One record per currently-open relay session. Counter updates and
//! removals are single statements whose row counts double as atomicity
//! tokens: `record_traffic` reports `SessionNotFound` when the row is gone,
//! and `take` returns the record to exactly one of any racing removers.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, TurnError};

use super::types::Session;

type SessionRow = (
    String,         // id
    String,         // username
    String,         // client_addr
    Option<String>, // relay_addr
    String,         // start_time
    String,         // last_active
    i64,            // bytes_sent
    i64,            // bytes_recv
    i64,            // packets_sent
    i64,            // packets_recv
);

const SESSION_COLUMNS: &str = "id, username, client_addr, relay_addr, start_time, last_active, \
     bytes_sent, bytes_recv, packets_sent, packets_recv";

/// Session table over a shared SQLite pool
#[derive(Clone)]
pub struct SessionTable {
    db: Arc<SqlitePool>,
}

impl SessionTable {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Initialize the sessions table and its indexes
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                client_addr TEXT NOT NULL,
                relay_addr TEXT,
                start_time TEXT NOT NULL,
                last_active TEXT NOT NULL,
                bytes_sent INTEGER NOT NULL DEFAULT 0,
                bytes_recv INTEGER NOT NULL DEFAULT 0,
                packets_sent INTEGER NOT NULL DEFAULT 0,
                packets_recv INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&*self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_username ON sessions(username)")
            .execute(&*self.db)
            .await?;

        // Drives expiry scans
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active)")
            .execute(&*self.db)
            .await?;

        Ok(())
    }

    /// Open a new session with zeroed counters
    pub async fn open(&self, username: &str, client_addr: &str) -> Result<Session> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO sessions (id, username, client_addr, start_time, last_active)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(username)
        .bind(client_addr)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&*self.db)
        .await?;

        debug!("Session {} opened for {} from {}", id, username, client_addr);

        Ok(Session {
            id,
            username: username.to_string(),
            client_addr: client_addr.to_string(),
            relay_addr: None,
            start_time: now,
            last_active: now,
            bytes_sent: 0,
            bytes_recv: 0,
            packets_sent: 0,
            packets_recv: 0,
        })
    }

    /// Fetch a session by id
    pub async fn get(&self, id: &str) -> Result<Session> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok(row_to_session(row)),
            None => Err(TurnError::SessionNotFound(id.to_string())),
        }
    }

    /// Record the relay address once the allocation is made
    pub async fn set_relay_addr(&self, id: &str, relay_addr: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET relay_addr = ? WHERE id = ?")
            .bind(relay_addr)
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TurnError::SessionNotFound(id.to_string()));
        }

        Ok(())
    }

    /// Add traffic counters and bump `last_active`; returns the updated record
    pub async fn record_traffic(
        &self,
        id: &str,
        bytes_sent: i64,
        bytes_recv: i64,
        packets_sent: i64,
        packets_recv: i64,
    ) -> Result<Session> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET bytes_sent = bytes_sent + ?,
                bytes_recv = bytes_recv + ?,
                packets_sent = packets_sent + ?,
                packets_recv = packets_recv + ?,
                last_active = ?
            WHERE id = ?
            "#,
        )
        .bind(bytes_sent)
        .bind(bytes_recv)
        .bind(packets_sent)
        .bind(packets_recv)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TurnError::SessionNotFound(id.to_string()));
        }

        self.get(id).await
    }

    /// Remove a session, returning it iff this call actually deleted the row
    ///
    /// The row count of the DELETE is the idempotency token for quota
    /// release: of any racing removers, exactly one gets `Some`.
    pub async fn take(&self, id: &str) -> Result<Option<Session>> {
        let session = match self.get(id).await {
            Ok(s) => s,
            Err(TurnError::SessionNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            // Lost the race to another remover
            return Ok(None);
        }

        debug!("Session {} removed", id);
        Ok(Some(session))
    }

    /// Ids of sessions idle longer than `threshold`, oldest first
    ///
    /// Bounded batch so the reaper can scan lazily and restart between
    /// batches without holding anything open.
    pub async fn list_expired(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let cutoff = (now - threshold).to_rfc3339();

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM sessions
            WHERE last_active < ?
            ORDER BY last_active ASC
            LIMIT ?
            "#,
        )
        .bind(&cutoff)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Hard-TTL backstop: delete sessions idle longer than `ttl` outright
    ///
    /// Mirrors a store-level TTL index. Quota release is NOT performed here;
    /// run this only after a release sweep has had its chance.
    pub async fn purge_older_than(&self, ttl: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = (now - ttl).to_rfc3339();

        let result = sqlx::query("DELETE FROM sessions WHERE last_active < ?")
            .bind(&cutoff)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    /// Count of currently-open sessions
    pub async fn count_active(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&*self.db)
            .await?;

        Ok(count.0)
    }

    /// All open sessions for one user, newest first
    pub async fn list_for_user(&self, username: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE username = ? ORDER BY start_time DESC"
        ))
        .bind(username)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(row_to_session).collect())
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

fn row_to_session(row: SessionRow) -> Session {
    let (
        id,
        username,
        client_addr,
        relay_addr,
        start_time,
        last_active,
        bytes_sent,
        bytes_recv,
        packets_sent,
        packets_recv,
    ) = row;

    Session {
        id,
        username,
        client_addr,
        relay_addr,
        start_time: parse_ts(&start_time),
        last_active: parse_ts(&last_active),
        bytes_sent,
        bytes_recv,
        packets_sent,
        packets_recv,
    }
}

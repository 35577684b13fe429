//! Quota enforcement engine
//!
//! The only path allowed to move `current_sessions` / `used_bandwidth`, so
//! the counters always reflect the true set of open sessions. Admission is
//! a two-phase reserve-then-create with a compensating rollback; release is
//! idempotent because the session-table removal is the single source of
//! truth for who decrements.

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::error::{Result, TurnError};
use crate::sessions::{Session, SessionTable};
use crate::users::UserRegistry;

/// Outcome of a traffic report
///
/// Advisory, not an error: by the time a ceiling trips the bytes have
/// already crossed the wire, so the counters stay as recorded and the relay
/// layer decides whether to throttle or terminate the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficVerdict {
    WithinLimits,
    /// `used_bandwidth` has crossed `max_bandwidth`
    BandwidthExceeded,
    /// The session has outlived `max_duration`; caller should close it
    DurationExceeded,
}

/// Admission, accounting and release over the registry and session table
#[derive(Clone)]
pub struct QuotaEngine {
    registry: UserRegistry,
    sessions: SessionTable,
    max_conflict_retries: u32,
}

impl QuotaEngine {
    pub fn new(registry: UserRegistry, sessions: SessionTable, max_conflict_retries: u32) -> Self {
        Self {
            registry,
            sessions,
            max_conflict_retries,
        }
    }

    pub fn registry(&self) -> &UserRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Admit a new session for a user
    ///
    /// Fails `UserNotFound` / `UserDisabled` / `QuotaExceeded` without
    /// creating anything. On success the slot is reserved and the session
    /// record exists; if record creation fails after the reservation, the
    /// reservation is rolled back.
    pub async fn admit_session(&self, username: &str, client_addr: &str) -> Result<Session> {
        let user = self.registry.get(username).await?;
        if !user.enabled {
            debug!("Admission rejected, user disabled: {}", username);
            return Err(TurnError::UserDisabled(username.to_string()));
        }

        self.registry.reset_usage_if_due(username, Utc::now()).await?;

        // Phase one: reserve the slot
        self.apply_delta_with_retries(username, 1, 0).await?;

        // Phase two: create the record, rolling the reservation back on
        // failure
        match self.sessions.open(username, client_addr).await {
            Ok(session) => {
                debug!("Session {} admitted for {}", session.id, username);
                Ok(session)
            }
            Err(e) => {
                if let Err(rollback) = self.apply_delta_with_retries(username, -1, 0).await {
                    error!(
                        "Failed to roll back reservation for {} after create failure: {}",
                        username, rollback
                    );
                }
                Err(e)
            }
        }
    }

    /// Record a traffic event and evaluate the user's ceilings
    ///
    /// Counters and `last_active` are always updated first; the verdict is
    /// computed from the state after accumulation. `SessionNotFound` is the
    /// only hard failure.
    pub async fn report_traffic(
        &self,
        session_id: &str,
        bytes_sent: i64,
        bytes_recv: i64,
        packets_sent: i64,
        packets_recv: i64,
    ) -> Result<TrafficVerdict> {
        let session = self
            .sessions
            .record_traffic(session_id, bytes_sent, bytes_recv, packets_sent, packets_recv)
            .await?;

        let now = session.last_active;

        // The owning user may have been deleted mid-session; the traffic is
        // still recorded, there is just no quota left to account against
        if let Err(TurnError::UserNotFound(_)) =
            self.registry.reset_usage_if_due(&session.username, now).await
        {
            warn!(
                "Session {} owner {} no longer exists, skipping accounting",
                session_id, session.username
            );
            return Ok(TrafficVerdict::WithinLimits);
        }

        self.apply_delta_with_retries(&session.username, 0, bytes_sent + bytes_recv)
            .await?;

        let user = match self.registry.get(&session.username).await {
            Ok(user) => user,
            Err(TurnError::UserNotFound(_)) => return Ok(TrafficVerdict::WithinLimits),
            Err(e) => return Err(e),
        };

        let Some(quota) = user.quota else {
            return Ok(TrafficVerdict::WithinLimits);
        };

        if quota.is_bandwidth_exceeded() {
            debug!(
                "Bandwidth ceiling crossed for {}: {} > {}",
                session.username, quota.used_bandwidth, quota.max_bandwidth
            );
            return Ok(TrafficVerdict::BandwidthExceeded);
        }

        if quota.max_duration > 0 && session.age_secs(now) > quota.max_duration {
            debug!(
                "Session {} outlived max_duration ({}s) for {}",
                session_id, quota.max_duration, session.username
            );
            return Ok(TrafficVerdict::DurationExceeded);
        }

        Ok(TrafficVerdict::WithinLimits)
    }

    /// Release a session and its quota reservation
    ///
    /// Idempotent: safe to call from an explicit close and a racing reaper
    /// pass. Only the call whose removal actually deleted the row performs
    /// the decrement; returns whether this call was that one.
    pub async fn release_session(&self, session_id: &str) -> Result<bool> {
        let Some(session) = self.sessions.take(session_id).await? else {
            debug!("Session {} already released", session_id);
            return Ok(false);
        };

        match self.apply_delta_with_retries(&session.username, -1, 0).await {
            Ok(()) => {}
            Err(TurnError::UserNotFound(_)) => {
                warn!(
                    "Released session {} for vanished user {}",
                    session_id, session.username
                );
            }
            Err(e) => return Err(e),
        }

        debug!("Session {} released for {}", session_id, session.username);
        Ok(true)
    }

    /// Apply a quota delta, retrying transient store conflicts a bounded
    /// number of times before surfacing `StoreUnavailable`
    async fn apply_delta_with_retries(
        &self,
        username: &str,
        session_delta: i64,
        bandwidth_delta: i64,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self
                .registry
                .apply_quota_delta(username, session_delta, bandwidth_delta)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt > self.max_conflict_retries {
                        return Err(TurnError::StoreUnavailable(format!(
                            "quota update for {} still conflicted after {} retries: {}",
                            username, self.max_conflict_retries, e
                        )));
                    }
                    warn!(
                        "Quota update conflict for {} (attempt {}): {}",
                        username, attempt, e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

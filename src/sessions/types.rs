use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An active relay session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session id (UUID)
    pub id: String,
    /// Owning user; a lookup key, not an ownership edge
    pub username: String,
    /// Client endpoint of the relayed flow
    pub client_addr: String,
    /// Relay endpoint, assigned once the allocation is made
    pub relay_addr: Option<String>,
    /// Creation time, immutable
    pub start_time: DateTime<Utc>,
    /// Bumped on every traffic report; drives expiry
    pub last_active: DateTime<Utc>,
    pub bytes_sent: i64,
    pub bytes_recv: i64,
    pub packets_sent: i64,
    pub packets_recv: i64,
}

impl Session {
    /// Total bytes relayed in both directions
    pub fn total_bytes(&self) -> i64 {
        self.bytes_sent + self.bytes_recv
    }

    /// Seconds since the session was opened
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_time).num_seconds()
    }

    /// Seconds since the last traffic event
    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_active).num_seconds()
    }
}

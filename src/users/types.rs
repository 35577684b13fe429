use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A user account in the relay service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique username, immutable after creation
    pub username: String,
    /// Opaque credential hash, managed by the auth layer
    #[serde(skip_serializing)]
    pub password: String,
    /// Disabled users are rejected at every admission check
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    /// Quota policy and live counters; absence means unlimited / untracked
    pub quota: Option<UserQuota>,
    /// Opaque key-value passthrough, never interpreted by the core
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Quota policy and usage state for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuota {
    /// Concurrent session ceiling
    pub max_sessions: i64,
    /// Bandwidth ceiling in bytes per reset period (0 = no ceiling)
    pub max_bandwidth: i64,
    /// Maximum lifetime of a single session in seconds (0 = no ceiling)
    pub max_duration: i64,
    /// Live count of open sessions, mutated only by the quota engine
    pub current_sessions: i64,
    /// Cumulative bytes relayed since the last reset
    pub used_bandwidth: i64,
    /// When used_bandwidth is next zeroed
    pub reset_at: DateTime<Utc>,
}

impl UserQuota {
    /// Check if one more session would fit under the ceiling
    pub fn has_session_capacity(&self) -> bool {
        self.current_sessions < self.max_sessions
    }

    /// Check if the bandwidth ceiling has been crossed
    pub fn is_bandwidth_exceeded(&self) -> bool {
        self.max_bandwidth > 0 && self.used_bandwidth > self.max_bandwidth
    }

    /// Remaining session slots
    pub fn sessions_remaining(&self) -> i64 {
        (self.max_sessions - self.current_sessions).max(0)
    }

    /// Remaining bandwidth before the ceiling (i64::MAX when unlimited)
    pub fn bandwidth_remaining(&self) -> i64 {
        if self.max_bandwidth == 0 {
            return i64::MAX;
        }
        (self.max_bandwidth - self.used_bandwidth).max(0)
    }
}

/// Quota ceilings supplied when creating or updating a user.
///
/// Counters and the reset clock are owned by the registry; a policy only
/// carries the ceilings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub max_sessions: i64,
    pub max_bandwidth: i64,
    pub max_duration: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(max_sessions: i64, max_bandwidth: i64) -> UserQuota {
        UserQuota {
            max_sessions,
            max_bandwidth,
            max_duration: 3600,
            current_sessions: 0,
            used_bandwidth: 0,
            reset_at: Utc::now(),
        }
    }

    #[test]
    fn test_has_session_capacity() {
        let mut q = quota(2, 0);
        assert!(q.has_session_capacity());

        q.current_sessions = 2;
        assert!(!q.has_session_capacity());
    }

    #[test]
    fn test_zero_max_sessions_has_no_capacity() {
        let q = quota(0, 0);
        assert!(!q.has_session_capacity());
    }

    #[test]
    fn test_is_bandwidth_exceeded() {
        let mut q = quota(5, 1000);
        assert!(!q.is_bandwidth_exceeded());

        q.used_bandwidth = 1000;
        assert!(!q.is_bandwidth_exceeded()); // at the ceiling, not over

        q.used_bandwidth = 1001;
        assert!(q.is_bandwidth_exceeded());
    }

    #[test]
    fn test_zero_max_bandwidth_is_unlimited() {
        let mut q = quota(5, 0);
        q.used_bandwidth = i64::MAX / 2;
        assert!(!q.is_bandwidth_exceeded());
        assert_eq!(q.bandwidth_remaining(), i64::MAX);
    }

    #[test]
    fn test_sessions_remaining() {
        let mut q = quota(5, 0);
        q.current_sessions = 3;
        assert_eq!(q.sessions_remaining(), 2);

        q.current_sessions = 5;
        assert_eq!(q.sessions_remaining(), 0);
    }

    #[test]
    fn test_bandwidth_remaining() {
        let mut q = quota(5, 1000);
        q.used_bandwidth = 400;
        assert_eq!(q.bandwidth_remaining(), 600);

        q.used_bandwidth = 1200;
        assert_eq!(q.bandwidth_remaining(), 0);
    }

    #[test]
    fn test_password_not_serialized() {
        let user = User {
            username: "alice".to_string(),
            password: "secret-hash".to_string(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_login: None,
            quota: None,
            metadata: None,
        };

        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
        assert!(json.contains("alice"));
    }
}

//! Session reaper
//!
//! Background sweep that reclaims quota reservations for sessions abandoned
//! without an explicit close (crashed or partitioned relay workers). It is
//! the safety net, not the primary close path: explicit close keeps the
//! counters near-real-time, the reaper keeps them honest.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::ReaperConfig;
use crate::error::Result;
use crate::quota::QuotaEngine;

/// Sessions reclaimed per listing batch
const SWEEP_BATCH_SIZE: i64 = 100;

/// Periodic reclaim of idle sessions and their quota reservations
pub struct SessionReaper {
    engine: QuotaEngine,
    sweep_interval: std::time::Duration,
    inactivity_threshold: Duration,
    session_ttl: Duration,
}

impl SessionReaper {
    pub fn new(engine: QuotaEngine, config: &ReaperConfig) -> Self {
        Self {
            engine,
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs),
            inactivity_threshold: Duration::seconds(config.inactivity_threshold_secs),
            session_ttl: Duration::seconds(config.session_ttl_secs),
        }
    }

    /// Run sweeps forever at the configured cadence
    pub async fn run(self) {
        info!(
            "Session reaper running every {:?}, inactivity threshold {}s",
            self.sweep_interval,
            self.inactivity_threshold.num_seconds()
        );

        let mut ticker = tokio::time::interval(self.sweep_interval);
        // The first tick fires immediately; skip it so startup isn't a sweep
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(released) => info!("Reaper released {} idle session(s)", released),
                Err(e) => error!("Reaper sweep failed: {}", e),
            }
        }
    }

    /// One full sweep: release every session idle past the threshold, then
    /// purge anything beyond the hard TTL as a backstop
    ///
    /// Failures on individual sessions are logged and skipped; a batch that
    /// makes no progress ends the sweep rather than spinning on stuck
    /// records. Sessions closed concurrently between listing and release
    /// are treated as already released.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut released = 0u64;

        loop {
            let batch = self
                .engine
                .sessions()
                .list_expired(self.inactivity_threshold, now, SWEEP_BATCH_SIZE)
                .await?;

            if batch.is_empty() {
                break;
            }

            let mut progressed = 0u64;
            for session_id in &batch {
                match self.engine.release_session(session_id).await {
                    Ok(true) => {
                        debug!("Reaped idle session {}", session_id);
                        released += 1;
                        progressed += 1;
                    }
                    Ok(false) => {
                        // Closed by the relay layer between list and release
                        progressed += 1;
                    }
                    Err(e) => {
                        warn!("Failed to reap session {}: {}", session_id, e);
                    }
                }
            }

            if progressed == 0 {
                warn!("Sweep made no progress on {} session(s), deferring", batch.len());
                break;
            }
        }

        let purged = self
            .engine
            .sessions()
            .purge_older_than(self.session_ttl, now)
            .await?;
        if purged > 0 {
            warn!(
                "TTL backstop purged {} session(s) the release sweep could not reclaim",
                purged
            );
        }

        Ok(released)
    }
}

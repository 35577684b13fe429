//! Integration tests across the registry, session table, engine and reaper
//!
//! File-backed SQLite (via tempfile) so every pooled connection sees the
//! same database, which is what the concurrency tests depend on.

use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::sync::Arc;
use turn_rs::config::ReaperConfig;
use turn_rs::quota::{QuotaEngine, TrafficVerdict};
use turn_rs::reaper::SessionReaper;
use turn_rs::sessions::SessionTable;
use turn_rs::users::{QuotaPolicy, UserRegistry};
use turn_rs::TurnError;

async fn setup() -> (QuotaEngine, Arc<SqlitePool>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("turn.db"))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    let pool = Arc::new(pool);

    let registry = UserRegistry::new(pool.clone(), Duration::hours(24));
    let sessions = SessionTable::new(pool.clone());
    registry.init_db().await.unwrap();
    sessions.init_db().await.unwrap();

    (QuotaEngine::new(registry, sessions, 5), pool, dir)
}

fn policy(max_sessions: i64, max_bandwidth: i64, max_duration: i64) -> QuotaPolicy {
    QuotaPolicy {
        max_sessions,
        max_bandwidth,
        max_duration,
    }
}

async fn current_sessions(engine: &QuotaEngine, username: &str) -> i64 {
    engine
        .registry()
        .get(username)
        .await
        .unwrap()
        .quota
        .unwrap()
        .current_sessions
}

#[tokio::test]
async fn full_session_lifecycle() {
    let (engine, _pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", Some(policy(5, 10_000, 3600)), None)
        .await
        .unwrap();

    let session = engine.admit_session("alice", "198.51.100.7:52013").await.unwrap();
    assert_eq!(current_sessions(&engine, "alice").await, 1);

    engine
        .sessions()
        .set_relay_addr(&session.id, "203.0.113.1:3478")
        .await
        .unwrap();

    let verdict = engine
        .report_traffic(&session.id, 1024, 2048, 4, 6)
        .await
        .unwrap();
    assert_eq!(verdict, TrafficVerdict::WithinLimits);

    let stored = engine.sessions().get(&session.id).await.unwrap();
    assert_eq!(stored.total_bytes(), 3072);
    assert_eq!(stored.relay_addr.as_deref(), Some("203.0.113.1:3478"));

    assert!(engine.release_session(&session.id).await.unwrap());
    assert_eq!(current_sessions(&engine, "alice").await, 0);

    // The session is gone: further traffic reports fail hard
    let result = engine.report_traffic(&session.id, 1, 1, 1, 1).await;
    assert!(matches!(result, Err(TurnError::SessionNotFound(_))));
}

#[tokio::test]
async fn concurrent_admits_never_exceed_ceiling() {
    let (engine, _pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", Some(policy(2, 0, 0)), None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.admit_session("alice", &format!("c:{}", i)).await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(TurnError::QuotaExceeded(_)) => rejected += 1,
            Err(e) => panic!("unexpected admission error: {}", e),
        }
    }

    // Exactly max_sessions admissions win
    assert_eq!(admitted, 2);
    assert_eq!(rejected, 6);
    assert_eq!(current_sessions(&engine, "alice").await, 2);
}

#[tokio::test]
async fn two_concurrent_admits_single_slot() {
    let (engine, _pool, _dir) = setup().await;
    engine
        .registry()
        .create("u1", "hash", Some(policy(1, 0, 0)), None)
        .await
        .unwrap();

    let e1 = engine.clone();
    let e2 = engine.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { e1.admit_session("u1", "c:1").await }),
        tokio::spawn(async move { e2.admit_session("u1", "c:2").await }),
    );
    let results = [r1.unwrap(), r2.unwrap()];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let exceeded = results
        .iter()
        .filter(|r| matches!(r, Err(TurnError::QuotaExceeded(_))))
        .count();

    assert_eq!(ok, 1);
    assert_eq!(exceeded, 1);
    assert_eq!(current_sessions(&engine, "u1").await, 1);
}

#[tokio::test]
async fn concurrent_releases_decrement_once() {
    let (engine, _pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", Some(policy(3, 0, 0)), None)
        .await
        .unwrap();

    let s1 = engine.admit_session("alice", "c:1").await.unwrap();
    let _s2 = engine.admit_session("alice", "c:2").await.unwrap();
    assert_eq!(current_sessions(&engine, "alice").await, 2);

    // Explicit close racing a reaper-style release of the same session
    let e1 = engine.clone();
    let e2 = engine.clone();
    let id1 = s1.id.clone();
    let id2 = s1.id.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { e1.release_session(&id1).await }),
        tokio::spawn(async move { e2.release_session(&id2).await }),
    );
    let performed = [r1.unwrap().unwrap(), r2.unwrap().unwrap()];

    assert_eq!(performed.iter().filter(|&&p| p).count(), 1);
    assert_eq!(current_sessions(&engine, "alice").await, 1);
}

#[tokio::test]
async fn bandwidth_ceiling_is_advisory() {
    let (engine, _pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", Some(policy(5, 1000, 0)), None)
        .await
        .unwrap();
    let session = engine.admit_session("alice", "c:1").await.unwrap();

    // 1200 bytes against a 1000-byte budget: the call succeeds, the
    // counters keep the real usage, and the verdict tells the relay layer
    // to react
    let verdict = engine
        .report_traffic(&session.id, 700, 500, 7, 5)
        .await
        .unwrap();
    assert_eq!(verdict, TrafficVerdict::BandwidthExceeded);

    let quota = engine.registry().get("alice").await.unwrap().quota.unwrap();
    assert_eq!(quota.used_bandwidth, 1200);
    assert_eq!(
        engine.sessions().get(&session.id).await.unwrap().total_bytes(),
        1200
    );
}

#[tokio::test]
async fn reaper_reclaims_abandoned_session() {
    let (engine, pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", Some(policy(5, 0, 0)), None)
        .await
        .unwrap();

    let abandoned = engine.admit_session("alice", "c:1").await.unwrap();
    let live = engine.admit_session("alice", "c:2").await.unwrap();
    assert_eq!(current_sessions(&engine, "alice").await, 2);

    // Worker crashed an hour and a half ago; nothing ever closed c:1
    let stale = (Utc::now() - Duration::seconds(5400)).to_rfc3339();
    sqlx::query("UPDATE sessions SET last_active = ? WHERE id = ?")
        .bind(&stale)
        .bind(&abandoned.id)
        .execute(&*pool)
        .await
        .unwrap();

    let reaper = SessionReaper::new(
        engine.clone(),
        &ReaperConfig {
            sweep_interval_secs: 300,
            inactivity_threshold_secs: 3600,
            session_ttl_secs: 7200,
        },
    );

    let released = reaper.sweep(Utc::now()).await.unwrap();
    assert_eq!(released, 1);

    assert!(engine.sessions().get(&abandoned.id).await.is_err());
    assert!(engine.sessions().get(&live.id).await.is_ok());
    assert_eq!(current_sessions(&engine, "alice").await, 1);
}

#[tokio::test]
async fn disabled_user_rejected_without_counter_movement() {
    let (engine, _pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", Some(policy(5, 0, 0)), None)
        .await
        .unwrap();
    engine.registry().set_enabled("alice", false).await.unwrap();

    let result = engine.admit_session("alice", "c:1").await;
    assert!(matches!(result, Err(TurnError::UserDisabled(_))));

    assert_eq!(current_sessions(&engine, "alice").await, 0);
    assert_eq!(engine.sessions().count_active().await.unwrap(), 0);
}

#[tokio::test]
async fn usage_reset_applies_before_accounting() {
    let (engine, pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", Some(policy(5, 1000, 0)), None)
        .await
        .unwrap();
    let session = engine.admit_session("alice", "c:1").await.unwrap();

    // Burn the whole budget
    let verdict = engine
        .report_traffic(&session.id, 600, 600, 6, 6)
        .await
        .unwrap();
    assert_eq!(verdict, TrafficVerdict::BandwidthExceeded);

    // A new period has started: the next report is accounted against a
    // fresh budget
    let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
    sqlx::query("UPDATE users SET reset_at = ? WHERE username = ?")
        .bind(&past)
        .bind("alice")
        .execute(&*pool)
        .await
        .unwrap();

    let verdict = engine
        .report_traffic(&session.id, 100, 100, 1, 1)
        .await
        .unwrap();
    assert_eq!(verdict, TrafficVerdict::WithinLimits);

    let quota = engine.registry().get("alice").await.unwrap().quota.unwrap();
    assert_eq!(quota.used_bandwidth, 200);
    assert!(quota.reset_at > Utc::now());
}

#[tokio::test]
async fn traffic_keeps_session_off_the_reaper_list() {
    let (engine, pool, _dir) = setup().await;
    engine
        .registry()
        .create("alice", "hash", None, None)
        .await
        .unwrap();
    let session = engine.admit_session("alice", "c:1").await.unwrap();

    let stale = (Utc::now() - Duration::seconds(5400)).to_rfc3339();
    sqlx::query("UPDATE sessions SET last_active = ? WHERE id = ?")
        .bind(&stale)
        .bind(&session.id)
        .execute(&*pool)
        .await
        .unwrap();

    // Traffic arrives before the sweep: last_active comes forward again
    engine
        .report_traffic(&session.id, 10, 10, 1, 1)
        .await
        .unwrap();

    let expired = engine
        .sessions()
        .list_expired(Duration::seconds(3600), Utc::now(), 10)
        .await
        .unwrap();
    assert!(expired.is_empty());
}

//! Refresh-gate tests for SessionManager
//!
//! These tests validate that:
//! - A token inside its validity window is served without network calls
//! - Concurrent callers after expiry share one refresh call

use std::sync::Arc;
use std::time::Duration;

use acc_ratings::session::{ManualClock, SessionManager};
use acc_ratings::{AuthApi, Error, MemoryRatingStore};
use chrono::{TimeZone, Utc};

const TTL_SECS: i64 = 300;

fn setup(latency: Option<Duration>) -> (Arc<MemoryRatingStore>, Arc<ManualClock>, Arc<SessionManager>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap(),
    ));
    let mut store =
        MemoryRatingStore::with_clock(clock.clone()).with_token_ttl(chrono::Duration::seconds(TTL_SECS));
    if let Some(latency) = latency {
        store = store.with_latency(latency);
    }
    let store = Arc::new(store);
    store.add_user("ana", "pw");
    let session = Arc::new(SessionManager::new(store.clone()).with_clock(clock.clone()));
    (store, clock, session)
}

#[tokio::test]
async fn token_just_before_expiry_is_served_from_memory() {
    let (store, clock, session) = setup(None);
    session.login("ana", "pw").await.unwrap();
    let issued = session.access_token().await.unwrap();

    clock.advance(chrono::Duration::seconds(TTL_SECS) - chrono::Duration::milliseconds(10));
    let cached = session.access_token().await.unwrap();

    assert_eq!(issued.expose_secret(), cached.expose_secret());
    assert_eq!(store.refresh_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_refresh() {
    let (store, clock, session) = setup(Some(Duration::from_millis(30)));
    session.login("ana", "pw").await.unwrap();
    let stale = session.access_token().await.unwrap();

    clock.advance(chrono::Duration::seconds(TTL_SECS + 1));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.access_token().await })
        })
        .collect();

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(store.refresh_calls(), 1);
    let first = tokens[0].expose_secret().to_string();
    assert!(tokens.iter().all(|t| t.expose_secret() == first));
    assert_ne!(first, stale.expose_secret());
}

#[tokio::test]
async fn concurrent_callers_in_one_task_share_one_refresh() {
    let (store, clock, session) = setup(Some(Duration::from_millis(10)));
    session.login("ana", "pw").await.unwrap();
    clock.advance(chrono::Duration::seconds(TTL_SECS));

    let (a, b, c, d, e) = tokio::join!(
        session.access_token(),
        session.access_token(),
        session.access_token(),
        session.access_token(),
        session.access_token(),
    );
    for result in [a, b, c, d, e] {
        tokio_test::assert_ok!(result);
    }
    assert_eq!(store.refresh_calls(), 1);
}

#[tokio::test]
async fn rejected_refresh_forces_logout_for_every_waiter() {
    let (store, clock, session) = setup(Some(Duration::from_millis(10)));
    session.login("ana", "pw").await.unwrap();
    store.revoke_refresh_tokens();
    clock.advance(chrono::Duration::seconds(TTL_SECS * 2));

    let (a, b, c) = tokio::join!(
        session.access_token(),
        session.access_token(),
        session.access_token(),
    );
    for result in [a, b, c] {
        assert!(matches!(result, Err(Error::NotAuthenticated)));
    }
    assert_eq!(store.refresh_calls(), 1);
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn slow_refresh_times_out_without_dropping_session() {
    let (store, clock, _) = setup(Some(Duration::from_millis(200)));
    let session = SessionManager::new(store.clone())
        .with_clock(clock.clone())
        .with_auth_timeout(Duration::from_millis(500));
    session.login("ana", "pw").await.unwrap();

    let session = session.with_auth_timeout(Duration::from_millis(20));
    clock.advance(chrono::Duration::seconds(TTL_SECS));

    let err = session.access_token().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn login_grant_refreshes_against_the_store() {
    let (store, _, _) = setup(None);
    let grant = store.login("ana", "pw").await.unwrap();
    assert!(grant.refresh_token.is_some());
    assert_eq!(store.login_calls(), 1);
}

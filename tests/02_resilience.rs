mod support;

use std::time::Duration;

use pairgate::PoolError;
use pairgate::gateway::{PoolConfig, PoolEvent, RemovalReason};
use pairgate::resilience::{BreakerConfig, CircuitState, RateLimitConfig};
use pairgate::shared_types::{SendOptions, SessionState};
use pairgate::transport::{CloseReason, ConnectionUpdate, TransportEvent};
use tokio::sync::broadcast::error::TryRecvError;

use support::{connect, harness, next_event};

fn drop_connection(h: &support::Harness, tenant: &str) {
    h.transport.emit(
        tenant,
        TransportEvent::StateChange(ConnectionUpdate::Close(CloseReason::retryable(
            "stream errored",
        ))),
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_then_gives_up_once() {
    let mut h = harness(PoolConfig::default());
    connect(&mut h, "t1").await;

    h.transport.set_failing(true);
    drop_connection(&h, "t1");

    let mut delays = Vec::new();
    let failed = loop {
        let event = next_event(&mut h.events, |e| {
            matches!(
                e,
                PoolEvent::ReconnectScheduled { .. } | PoolEvent::ReconnectFailed { .. }
            )
        })
        .await;
        match event {
            PoolEvent::ReconnectScheduled { delay_ms, .. } => delays.push(delay_ms),
            other => break other,
        }
    };

    assert_eq!(delays, vec![5_000, 10_000, 20_000, 40_000, 60_000]);
    assert!(matches!(failed, PoolEvent::ReconnectFailed { attempts: 5, .. }));

    let removed = next_event(&mut h.events, |e| matches!(e, PoolEvent::SessionRemoved { .. })).await;
    assert!(matches!(
        removed,
        PoolEvent::SessionRemoved {
            reason: RemovalReason::ReconnectFailed,
            ..
        }
    ));

    // Nothing else is scheduled.
    tokio::time::sleep(Duration::from_secs(600)).await;
    loop {
        match h.events.try_recv() {
            Ok(PoolEvent::ReconnectFailed { .. }) | Ok(PoolEvent::ReconnectScheduled { .. }) => {
                panic!("reconnect activity after giving up")
            }
            Ok(_) => continue,
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected: {e:?}"),
        }
    }

    assert_eq!(h.transport.opens(), 1 + 5);
    assert!(h.pool.get_active_sessions().is_empty());
    assert_eq!(h.pool.get_metrics().reconnects_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_attempts() {
    let mut h = harness(PoolConfig::default());
    connect(&mut h, "t1").await;

    drop_connection(&h, "t1");
    next_event(&mut h.events, |e| matches!(e, PoolEvent::ReconnectScheduled { .. })).await;
    assert_eq!(
        h.pool.get_session_status("t1").unwrap().state,
        SessionState::Reconnecting
    );
    assert_eq!(h.pool.get_session_status("t1").unwrap().reconnect_attempts, 1);

    h.transport.set_auto_connect(true);
    next_event(&mut h.events, |e| matches!(e, PoolEvent::Connected { .. })).await;

    let status = h.pool.get_session_status("t1").unwrap();
    assert_eq!(status.state, SessionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(h.transport.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn removal_during_reconnect_stays_removed() {
    let mut h = harness(PoolConfig::default());
    connect(&mut h, "t1").await;

    h.transport.set_open_delay(Duration::from_secs(10));
    h.transport.set_auto_connect(true);
    drop_connection(&h, "t1");
    next_event(&mut h.events, |e| matches!(e, PoolEvent::ReconnectScheduled { .. })).await;

    // The 5s timer has fired and the reconnect handshake is under way.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.transport.opens(), 2);

    h.pool.remove_session("t1").await.unwrap();
    assert!(h.pool.get_active_sessions().is_empty());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(h.pool.get_active_sessions().is_empty());
    assert_eq!(
        h.pool.get_session_status("t1").unwrap().state,
        SessionState::Uninitialized
    );
    assert_eq!(h.transport.opens(), 2);
    // Both the dropped connection and the late one are closed.
    assert_eq!(h.transport.closed_handles(), 2);
}

#[tokio::test(start_paused = true)]
async fn recreate_after_removal_waits_out_the_abandoned_reconnect() {
    let mut h = harness(PoolConfig::default());
    connect(&mut h, "t1").await;

    h.transport.set_open_delay(Duration::from_secs(10));
    h.transport.set_auto_connect(true);
    drop_connection(&h, "t1");
    next_event(&mut h.events, |e| matches!(e, PoolEvent::ReconnectScheduled { .. })).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    h.pool.remove_session("t1").await.unwrap();
    h.pool.get_or_create_session("t1").await.unwrap();
    next_event(&mut h.events, |e| matches!(e, PoolEvent::Connected { .. })).await;

    assert_eq!(h.transport.opens(), 3);
    assert_eq!(h.transport.closed_handles(), 2);
    let active = h.pool.get_active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].state, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_five_failures_and_recovers() {
    let h = harness(PoolConfig::default());
    h.transport.set_failing(true);

    for _ in 0..5 {
        let err = h.pool.get_or_create_session("t1").await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    let err = h.pool.get_or_create_session("t1").await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { remaining_secs: 300, .. }));
    assert_eq!(h.transport.opens(), 5);
    assert_eq!(
        h.pool.get_session_status("t1").unwrap().state,
        SessionState::CircuitOpen
    );
    assert_eq!(h.pool.get_metrics().circuit_trips, 1);

    tokio::time::advance(Duration::from_secs(300)).await;
    h.transport.set_failing(false);

    h.pool.get_or_create_session("t1").await.unwrap();
    assert_eq!(h.transport.opens(), 6);

    let breaker = h.pool.circuit_breaker("t1").unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failures, 0);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_stops_scheduled_reconnects() {
    let mut h = harness(PoolConfig {
        breaker: BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(300),
        },
        ..PoolConfig::default()
    });
    connect(&mut h, "t1").await;

    h.transport.set_failing(true);
    drop_connection(&h, "t1");

    next_event(&mut h.events, |e| matches!(e, PoolEvent::CircuitOpened { .. })).await;
    let removed = next_event(&mut h.events, |e| matches!(e, PoolEvent::SessionRemoved { .. })).await;
    assert!(matches!(
        removed,
        PoolEvent::SessionRemoved {
            reason: RemovalReason::CircuitOpen,
            ..
        }
    ));

    assert_eq!(h.transport.opens(), 1 + 2);
    assert_eq!(
        h.pool.get_session_status("t1").unwrap().state,
        SessionState::CircuitOpen
    );
    assert!(!h.pool.health_check("t1").unwrap().healthy);
}

#[tokio::test(start_paused = true)]
async fn send_is_rate_limited_per_recipient() {
    let mut h = harness(PoolConfig {
        rate_limit: RateLimitConfig {
            max_requests: 2,
            window: Duration::from_millis(1000),
        },
        ..PoolConfig::default()
    });
    connect(&mut h, "t1").await;

    for _ in 0..2 {
        h.pool
            .send_message("t1", "r1", "hi", SendOptions::default())
            .await
            .unwrap();
    }

    let err = h
        .pool
        .send_message("t1", "r1", "hi", SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RATE_LIMITED");
    assert!(err.retryable());
    assert_eq!(err.details()["key"], "t1:r1");

    // Other recipients have their own window.
    h.pool
        .send_message("t1", "r2", "hi", SendOptions::default())
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(1000)).await;
    h.pool
        .send_message("t1", "r1", "hi", SendOptions::default())
        .await
        .unwrap();

    let metrics = h.pool.get_metrics();
    assert_eq!(metrics.rate_limited, 1);
    assert_eq!(metrics.messages_sent, 4);
    assert_eq!(h.transport.messages_sent(), 4);
}

#[tokio::test(start_paused = true)]
async fn gateway_budget_is_shared_across_tenants() {
    let mut h = harness(PoolConfig {
        gateway_rate_limit: RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        },
        ..PoolConfig::default()
    });
    connect(&mut h, "t1").await;
    connect(&mut h, "t2").await;

    h.pool.send_message("t1", "a", "1", SendOptions::default()).await.unwrap();
    h.pool.send_message("t1", "b", "2", SendOptions::default()).await.unwrap();
    h.pool.send_message("t2", "c", "3", SendOptions::default()).await.unwrap();

    let err = h
        .pool
        .send_message("t2", "d", "4", SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::RateLimited { ref key, .. } if key == "gateway:pairgate"));
}

#[tokio::test(start_paused = true)]
async fn gateway_rejection_leaves_recipient_window_untouched() {
    let mut h = harness(PoolConfig {
        rate_limit: RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(120),
        },
        gateway_rate_limit: RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        },
        ..PoolConfig::default()
    });
    connect(&mut h, "t1").await;

    h.pool.send_message("t1", "a", "1", SendOptions::default()).await.unwrap();
    let err = h
        .pool
        .send_message("t1", "b", "2", SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::RateLimited { ref key, .. } if key == "gateway:pairgate"));

    // Gateway budget drains; "b" never used its single per-recipient slot.
    tokio::time::advance(Duration::from_secs(60)).await;
    h.pool.send_message("t1", "b", "2", SendOptions::default()).await.unwrap();
    assert_eq!(h.transport.messages_sent(), 2);
}

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rkv_client::{
    AsyncConnectionPool, AsyncDispatcher, AsyncTrackingCoordinator, Command, ErrorKind, LocalCache,
    ProtocolVersion, Reply, ResultType, Role, TrackingMode, TrackingOptions, TrackingState, Value,
};
use rkv_testkit::{MockServer, Response};
use tokio_util::sync::CancellationToken;

use common::{builder_for, config_for, init_tracing};

fn silent_on(verb: &'static [u8]) -> MockServer {
    MockServer::with_handler(move |_, args| {
        if args[0].as_ref() == verb {
            Some(Response::Silent)
        } else {
            None
        }
    })
    .unwrap()
}

#[tokio::test]
async fn async_roundtrip() {
    init_tracing();
    let server = MockServer::start().unwrap();
    let client = AsyncDispatcher::connect(&config_for(&server, ProtocolVersion::Resp3)).unwrap();
    let cancel = CancellationToken::new();

    let ok = client
        .call_string_async(&Command::new("SET").arg("foo").arg("bar"), &cancel)
        .await
        .unwrap();
    assert_eq!(ok.as_deref(), Some("OK"));

    let value = client
        .call_bytes_async(&Command::new("GET").arg("foo"), &cancel)
        .await
        .unwrap();
    assert_eq!(value, Some(Bytes::from("bar")));

    let n: i64 = client
        .call_number_async(&Command::new("INCR").arg("n"), ResultType::INT64, &cancel)
        .await
        .unwrap();
    assert_eq!(n, 1);

    let replies = client
        .call_pipeline_async(
            &[Command::new("INCR").arg("n"), Command::new("ECHO").arg("x")],
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(replies, vec![Reply::Integer(2), Reply::bulk("x")]);
    assert_eq!(server.sessions().len(), 1);
}

#[tokio::test]
async fn cancellation_aborts_wait_and_discards_connection() {
    let server = silent_on(b"SLOW");
    let client = AsyncDispatcher::connect(&config_for(&server, ProtocolVersion::Resp2)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = client
        .call_reply_async(&Command::new("SLOW"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(client.pool().stats(Role::Master).total, 0);

    let fresh = CancellationToken::new();
    let pong = client
        .call_string_async(&Command::new("PING"), &fresh)
        .await
        .unwrap();
    assert_eq!(pong.as_deref(), Some("PONG"));
    assert_eq!(server.sessions().len(), 2);
    assert_eq!(client.metrics().discarded_total, 1);
}

#[tokio::test]
async fn timeout_discards_connection() {
    let server = silent_on(b"SLOW");
    let config = builder_for(&[&server], ProtocolVersion::Resp2)
        .command_timeout(Duration::from_millis(150))
        .build()
        .unwrap();
    let client = AsyncDispatcher::connect(&config).unwrap();
    let cancel = CancellationToken::new();

    let err = client
        .call_raw_async(&Command::new("SLOW"), ResultType::STRING, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(client.pool().stats(Role::Master).total, 0);
    assert_eq!(client.metrics().timeouts_total, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_share_a_bounded_pool() {
    let server = MockServer::start().unwrap();
    let config = builder_for(&[&server], ProtocolVersion::Resp3)
        .max_idle(2)
        .max_total(2)
        .build()
        .unwrap();
    let client = AsyncDispatcher::connect(&config).unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for _ in 0..25 {
                    client
                        .call_reply_async(&Command::new("INCR").arg("hits"), &cancel)
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let cancel = CancellationToken::new();
    let total: i64 = client
        .call_number_async(&Command::new("GET").arg("hits"), ResultType::INT64, &cancel)
        .await
        .unwrap();
    assert_eq!(total, 100);
    assert!(server.sessions().len() <= 2);
}

#[tokio::test]
async fn checkout_waits_for_checkin() {
    let server = MockServer::start().unwrap();
    let config = builder_for(&[&server], ProtocolVersion::Resp2)
        .max_idle(1)
        .max_total(1)
        .checkout_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let pool = AsyncConnectionPool::new(&config).unwrap();
    let cancel = CancellationToken::new();

    let first = pool.checkout(Role::Master, &cancel).await.unwrap();
    let first_id = first.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            pool.checkout(Role::Master, &cancel).await.map(|conn| conn.id())
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(first);
    assert_eq!(waiter.await.unwrap().unwrap(), first_id);
}

#[tokio::test]
async fn cancelled_checkout_returns_cancelled() {
    let server = MockServer::start().unwrap();
    let config = builder_for(&[&server], ProtocolVersion::Resp2)
        .max_idle(1)
        .max_total(1)
        .build()
        .unwrap();
    let pool = AsyncConnectionPool::new(&config).unwrap();
    let cancel = CancellationToken::new();
    let _held = pool.checkout(Role::Master, &cancel).await.unwrap();

    cancel.cancel();
    let err = pool.checkout(Role::Master, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn async_enable_rolls_back_on_failure() {
    let first = MockServer::start().unwrap();
    let second = MockServer::with_handler(|_, args| {
        let refuse = args.len() >= 3
            && args[1].eq_ignore_ascii_case(b"TRACKING")
            && args[2].eq_ignore_ascii_case(b"ON");
        if refuse {
            Some(Reply::error("ERR tracking refused").into())
        } else {
            None
        }
    })
    .unwrap();
    let third = MockServer::start().unwrap();
    let config = builder_for(&[&first, &second, &third], ProtocolVersion::Resp3)
        .max_idle(3)
        .max_total(3)
        .build()
        .unwrap();
    let pool = AsyncConnectionPool::new(&config).unwrap();
    let cancel = CancellationToken::new();

    let mut leases = Vec::new();
    for _ in 0..3 {
        leases.push(pool.checkout(Role::Master, &cancel).await.unwrap());
    }
    drop(leases);

    let coordinator = AsyncTrackingCoordinator::new(pool.clone());
    let err = coordinator
        .enable(None, TrackingMode::Normal, TrackingOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(coordinator.state(), TrackingState::Off);
    assert!(pool.all_master_connections().iter().all(|h| !h.is_tracking()));
    assert_eq!(first.count(&["CLIENT", "TRACKING", "OFF"]), 1);
    assert_eq!(third.count(&["CLIENT", "TRACKING"]), 0);
}

#[tokio::test]
async fn async_cached_reads() {
    let server = MockServer::start().unwrap();
    let cache = Arc::new(LocalCache::new(64 * 1024));
    let client = AsyncDispatcher::connect(&config_for(&server, ProtocolVersion::Resp3))
        .unwrap()
        .with_cache(Arc::clone(&cache));
    let cancel = CancellationToken::new();

    client
        .call_reply_async(&Command::new("SET").arg("k").arg("v"), &cancel)
        .await
        .unwrap();
    client
        .tracking()
        .enable(None, TrackingMode::Normal, TrackingOptions::default(), &cancel)
        .await
        .unwrap();

    for _ in 0..3 {
        let value = client
            .call_bytes_cached_async(&Command::new("GET").arg("k"), "k", &cancel)
            .await
            .unwrap();
        assert_eq!(value, Some(Bytes::from("v")));
    }
    assert_eq!(server.count(&["GET"]), 1);
    assert_eq!(cache.stats().hits, 2);

    assert_eq!(client.tracking().disable(&cancel).await.unwrap(), TrackingState::Off);
}

#[tokio::test]
async fn async_cached_read_applies_invalidation_without_other_traffic() {
    let server = MockServer::start().unwrap();
    let cache = Arc::new(LocalCache::new(64 * 1024));
    let client = AsyncDispatcher::connect(&config_for(&server, ProtocolVersion::Resp3))
        .unwrap()
        .with_cache(Arc::clone(&cache));
    let cancel = CancellationToken::new();
    let get = Command::new("GET").arg("k");

    client
        .call_reply_async(&Command::new("SET").arg("k").arg("v1"), &cancel)
        .await
        .unwrap();
    client
        .tracking()
        .enable(None, TrackingMode::Normal, TrackingOptions::default(), &cancel)
        .await
        .unwrap();
    let first = client.call_bytes_cached_async(&get, "k", &cancel).await.unwrap();
    assert_eq!(first, Some(Bytes::from("v1")));

    // Another client rewrites the key; the server tells session 0.
    let writer = AsyncDispatcher::connect(&config_for(&server, ProtocolVersion::Resp2)).unwrap();
    writer
        .call_reply_async(&Command::new("SET").arg("k").arg("v2"), &cancel)
        .await
        .unwrap();
    server.clear_log();
    server
        .push(0, vec![Reply::bulk("invalidate"), Reply::Array(vec![Reply::bulk("k")])])
        .unwrap();

    // Only cached reads from here on.

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut fresh = None;
    while Instant::now() < deadline {
        fresh = client.call_bytes_cached_async(&get, "k", &cancel).await.unwrap();
        if fresh.as_deref() == Some(b"v2".as_slice()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fresh, Some(Bytes::from("v2")));
    assert_eq!(cache.stats().invalidations, 1);
    assert_eq!(server.count(&["GET"]), 1);
}

#[tokio::test]
async fn async_enable_gives_up_on_a_leased_master() {
    let first = MockServer::start().unwrap();
    let second = MockServer::start().unwrap();
    let config = builder_for(&[&first, &second], ProtocolVersion::Resp3)
        .max_idle(2)
        .max_total(2)
        .checkout_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let pool = AsyncConnectionPool::new(&config).unwrap();
    let cancel = CancellationToken::new();
    let on_first = pool.checkout(Role::Master, &cancel).await.unwrap();
    let on_second = pool.checkout(Role::Master, &cancel).await.unwrap();
    drop(on_first);

    let coordinator = AsyncTrackingCoordinator::new(pool.clone());
    let started = Instant::now();
    let err = coordinator
        .enable(None, TrackingMode::Normal, TrackingOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(coordinator.state(), TrackingState::Off);
    assert_eq!(first.count(&["CLIENT", "TRACKING", "OFF"]), 1);
    assert_eq!(second.count(&["CLIENT", "TRACKING"]), 0);
    assert!(!on_second.handle().is_tracking());
}

#[tokio::test]
async fn cancelled_checkout_is_not_a_discard() {
    let server = MockServer::start().unwrap();
    let config = builder_for(&[&server], ProtocolVersion::Resp2)
        .max_idle(1)
        .max_total(1)
        .build()
        .unwrap();
    let client = AsyncDispatcher::connect(&config).unwrap();
    let live = CancellationToken::new();
    let held = client.pool().checkout(Role::Master, &live).await.unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = client
        .call_reply_async(&Command::new("PING"), &cancelled)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let metrics = client.metrics();
    assert_eq!(metrics.errors_total, 1);
    assert_eq!(metrics.discarded_total, 0);
    drop(held);
    assert_eq!(client.pool().stats(Role::Master).total, 1);
}

#[tokio::test]
async fn async_call_uses_the_declared_result_type() {
    let server = MockServer::start().unwrap();
    let client = AsyncDispatcher::connect(&config_for(&server, ProtocolVersion::Resp3)).unwrap();
    let cancel = CancellationToken::new();

    let value = client
        .call_async(&Command::new("INCR").arg("n").returns(ResultType::INT64), &cancel)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(1));

    let err = client
        .call_async(&Command::new("GET").arg("n"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedResultType);
    assert_eq!(server.count(&["GET"]), 0);
}

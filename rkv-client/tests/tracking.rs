mod common;

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rkv_client::{
    ConnectionPool, Dispatcher, ErrorKind, ProtocolVersion, Reply, RedirectTarget, Role,
    TrackingCoordinator, TrackingMode, TrackingOptions, TrackingState,
};
use rkv_testkit::{eventually, MockServer, Response, Session};

use common::{builder_for, init_tracing};

fn refuse_tracking_on() -> MockServer {
    MockServer::with_handler(|_, args| {
        if is_tracking_on(args) {
            Some(Reply::error("ERR tracking refused").into())
        } else {
            None
        }
    })
    .unwrap()
}

fn is_tracking_on(args: &[Bytes]) -> bool {
    args.len() >= 3
        && args[0].eq_ignore_ascii_case(b"CLIENT")
        && args[1].eq_ignore_ascii_case(b"TRACKING")
        && args[2].eq_ignore_ascii_case(b"ON")
}

/// Answers `CLIENT TRACKING ON` from the first session late, with `reply`.
fn slow_first_enable(reply: Reply) -> MockServer {
    MockServer::with_handler(move |session: &Session, args| {
        if session.index == 0 && is_tracking_on(args) {
            Some(Response::Delay(Duration::from_millis(300), reply.clone()))
        } else {
            None
        }
    })
    .unwrap()
}

fn two_master_client(server: &MockServer) -> Dispatcher {
    let config = builder_for(&[server], ProtocolVersion::Resp3)
        .max_idle(2)
        .max_total(2)
        .build()
        .unwrap();
    let client = Dispatcher::connect(&config).unwrap();
    client.call_reply(&rkv_client::Command::new("PING")).unwrap();
    client
}

/// One pooled master connection per server, created in server order.
fn warm_pool(servers: &[&MockServer]) -> ConnectionPool {
    let config = builder_for(servers, ProtocolVersion::Resp3)
        .max_idle(servers.len())
        .max_total(servers.len())
        .build()
        .unwrap();
    let pool = ConnectionPool::new(&config).unwrap();
    let leases: Vec<_> = servers
        .iter()
        .map(|_| pool.checkout(Role::Master).unwrap())
        .collect();
    drop(leases);
    for server in servers {
        assert_eq!(server.sessions().len(), 1);
        server.clear_log();
    }
    pool
}

#[test]
fn failed_enable_rolls_back_every_master() {
    init_tracing();
    let first = MockServer::start().unwrap();
    let second = refuse_tracking_on();
    let third = MockServer::start().unwrap();
    let pool = warm_pool(&[&first, &second, &third]);
    let coordinator = TrackingCoordinator::new(pool.clone());

    let err = coordinator
        .enable(Some(RedirectTarget(7)), TrackingMode::Normal, TrackingOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);

    let masters = pool.all_master_connections();
    assert_eq!(masters.len(), 3);
    assert!(masters.iter().all(|handle| !handle.is_tracking()));
    assert!(masters.iter().all(|handle| handle.redirect_target().is_none()));
    assert_eq!(coordinator.state(), TrackingState::Off);

    let first_log: Vec<String> = first.commands().iter().map(|cmd| cmd.line()).collect();
    assert_eq!(
        first_log,
        vec!["CLIENT TRACKING ON REDIRECT 7", "CLIENT TRACKING OFF"]
    );
    assert!(!first.session(0).unwrap().tracking);
    assert_eq!(second.count(&["CLIENT", "TRACKING", "ON"]), 1);
    assert_eq!(second.count(&["CLIENT", "TRACKING", "OFF"]), 0);
    assert_eq!(third.count(&["CLIENT", "TRACKING"]), 0);
}

#[test]
fn enable_reaches_every_master() {
    let servers = [
        MockServer::start().unwrap(),
        MockServer::start().unwrap(),
        MockServer::start().unwrap(),
    ];
    let refs: Vec<&MockServer> = servers.iter().collect();
    let pool = warm_pool(&refs);
    let coordinator = TrackingCoordinator::new(pool.clone());

    let options = TrackingOptions {
        no_loop: true,
        ..TrackingOptions::default()
    };
    let state = coordinator
        .enable(Some(RedirectTarget(42)), TrackingMode::Normal, options)
        .unwrap();
    assert_eq!(
        state,
        TrackingState::On {
            mode: TrackingMode::Normal,
            redirect: Some(RedirectTarget(42)),
        }
    );

    for server in &servers {
        let session = server.session(0).unwrap();
        assert!(session.tracking);
        assert_eq!(session.tracking_args, vec!["ON", "REDIRECT", "42", "NOLOOP"]);
    }
    assert!(pool
        .all_master_connections()
        .iter()
        .all(|handle| handle.redirect_target() == Some(RedirectTarget(42))));
}

#[test]
fn broadcast_enable_is_idempotent() {
    let first = MockServer::start().unwrap();
    let second = MockServer::start().unwrap();
    let pool = warm_pool(&[&first, &second]);
    let coordinator = TrackingCoordinator::new(pool.clone());
    let options = TrackingOptions {
        prefixes: vec!["user:".to_string()],
        ..TrackingOptions::default()
    };

    coordinator
        .enable(None, TrackingMode::Broadcast, options.clone())
        .unwrap();
    let sent = first.commands().len() + second.commands().len();
    assert_eq!(sent, 2);
    assert_eq!(
        first.session(0).unwrap().tracking_args,
        vec!["ON", "BCAST", "PREFIX", "user:"]
    );

    let state = coordinator
        .enable(None, TrackingMode::Broadcast, options)
        .unwrap();
    assert_eq!(
        state,
        TrackingState::On {
            mode: TrackingMode::Broadcast,
            redirect: None,
        }
    );
    assert_eq!(first.commands().len() + second.commands().len(), sent);
}

#[test]
fn disable_turns_every_master_off() {
    let first = MockServer::start().unwrap();
    let second = MockServer::start().unwrap();
    let pool = warm_pool(&[&first, &second]);
    let coordinator = TrackingCoordinator::new(pool.clone());

    coordinator
        .enable(None, TrackingMode::Normal, TrackingOptions::default())
        .unwrap();
    assert_eq!(coordinator.disable().unwrap(), TrackingState::Off);

    assert!(pool.all_master_connections().iter().all(|h| !h.is_tracking()));
    for server in [&first, &second] {
        assert_eq!(server.count(&["CLIENT", "TRACKING", "OFF"]), 1);
        assert!(!server.session(0).unwrap().tracking);
    }

    // Nothing left to turn off.
    first.clear_log();
    assert_eq!(coordinator.disable().unwrap(), TrackingState::Off);
    assert!(first.commands().is_empty());
}

#[test]
fn invalid_options_send_nothing() {
    let server = MockServer::start().unwrap();
    let pool = warm_pool(&[&server]);
    let coordinator = TrackingCoordinator::new(pool);
    let options = TrackingOptions {
        opt_in: true,
        opt_out: true,
        ..TrackingOptions::default()
    };

    let err = coordinator
        .enable(None, TrackingMode::Normal, options)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(server.commands().is_empty());
}

#[test]
fn new_masters_join_an_enabled_group() {
    let server = MockServer::start().unwrap();
    let config = builder_for(&[&server], ProtocolVersion::Resp3)
        .max_idle(2)
        .max_total(2)
        .build()
        .unwrap();
    let client = Dispatcher::connect(&config).unwrap();

    client
        .tracking()
        .enable(None, TrackingMode::Normal, TrackingOptions::default())
        .unwrap();

    // Hold the only connection so the next checkout opens a second one.
    let held = client.pool().checkout(Role::Master).unwrap();
    let fresh = client.pool().checkout(Role::Master).unwrap();
    assert!(fresh.handle().is_tracking());
    assert!(server.session(1).unwrap().tracking);
    drop((held, fresh));

    client.tracking().disable().unwrap();
    let third = client.pool().checkout(Role::Master).unwrap();
    assert!(!third.handle().is_tracking());
}

#[test]
fn repeated_enable_sends_nothing() {
    let server = MockServer::start().unwrap();
    let pool = warm_pool(&[&server]);
    let coordinator = TrackingCoordinator::new(pool);

    coordinator
        .enable(Some(RedirectTarget(7)), TrackingMode::Normal, TrackingOptions::default())
        .unwrap();
    server.clear_log();
    let state = coordinator
        .enable(Some(RedirectTarget(7)), TrackingMode::Normal, TrackingOptions::default())
        .unwrap();
    assert_eq!(
        state,
        TrackingState::On {
            mode: TrackingMode::Normal,
            redirect: Some(RedirectTarget(7)),
        }
    );
    assert!(server.commands().is_empty());
}

#[test]
fn conflicting_enable_is_refused() {
    let server = MockServer::start().unwrap();
    let client = two_master_client(&server);

    client
        .tracking()
        .enable(Some(RedirectTarget(7)), TrackingMode::Normal, TrackingOptions::default())
        .unwrap();
    server.clear_log();

    let err = client
        .tracking()
        .enable(Some(RedirectTarget(9)), TrackingMode::Normal, TrackingOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(server.commands().is_empty());
    assert_eq!(
        client.tracking().state(),
        TrackingState::On {
            mode: TrackingMode::Normal,
            redirect: Some(RedirectTarget(7)),
        }
    );

    // A master opened afterwards still follows the first request.
    let held = client.pool().checkout(Role::Master).unwrap();
    let fresh = client.pool().checkout(Role::Master).unwrap();
    assert_eq!(fresh.handle().redirect_target(), Some(RedirectTarget(7)));
    assert_eq!(server.session(1).unwrap().tracking_args, vec!["ON", "REDIRECT", "7"]);
    drop((held, fresh));
}

#[test]
fn master_opened_during_enable_joins_the_group() {
    init_tracing();
    let server = slow_first_enable(Reply::simple("OK"));
    let client = two_master_client(&server);

    let enabler = {
        let client = client.clone();
        thread::spawn(move || {
            client
                .tracking()
                .enable(None, TrackingMode::Normal, TrackingOptions::default())
        })
    };
    assert!(eventually(Duration::from_secs(2), || {
        server.count(&["CLIENT", "TRACKING", "ON"]) == 1
    }));

    // The first master is leased by the enable, so this opens a second one.
    let fresh = client.pool().checkout(Role::Master).unwrap();
    assert!(fresh.handle().is_tracking());
    drop(fresh);

    let state = enabler.join().unwrap().unwrap();
    assert_eq!(
        state,
        TrackingState::On {
            mode: TrackingMode::Normal,
            redirect: None,
        }
    );
    let masters = client.pool().all_master_connections();
    assert_eq!(masters.len(), 2);
    assert!(masters.iter().all(|handle| handle.is_tracking()));
    assert!(server.session(1).unwrap().tracking);
}

#[test]
fn failed_enable_turns_off_masters_that_joined_midway() {
    let server = slow_first_enable(Reply::error("ERR tracking refused"));
    let client = two_master_client(&server);

    let enabler = {
        let client = client.clone();
        thread::spawn(move || {
            client
                .tracking()
                .enable(None, TrackingMode::Normal, TrackingOptions::default())
        })
    };
    assert!(eventually(Duration::from_secs(2), || {
        server.count(&["CLIENT", "TRACKING", "ON"]) == 1
    }));
    let fresh = client.pool().checkout(Role::Master).unwrap();
    assert!(fresh.handle().is_tracking());
    drop(fresh);

    let err = enabler.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(client.tracking().state(), TrackingState::Off);
    assert!(client
        .pool()
        .all_master_connections()
        .iter()
        .all(|handle| !handle.is_tracking()));
    assert!(!server.session(1).unwrap().tracking);
    let late: Vec<String> = server.commands_for(1).iter().map(|cmd| cmd.line()).collect();
    assert_eq!(late.last().map(String::as_str), Some("CLIENT TRACKING OFF"));

    // The next master opens without tracking.
    let held = client.pool().checkout(Role::Master).unwrap();
    let other = client.pool().checkout(Role::Master).unwrap();
    assert!(!held.handle().is_tracking());
    assert!(!other.handle().is_tracking());
}

#[test]
fn enable_gives_up_on_a_leased_master() {
    let first = MockServer::start().unwrap();
    let second = MockServer::start().unwrap();
    let config = builder_for(&[&first, &second], ProtocolVersion::Resp3)
        .max_idle(2)
        .max_total(2)
        .checkout_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let pool = ConnectionPool::new(&config).unwrap();
    let on_first = pool.checkout(Role::Master).unwrap();
    let on_second = pool.checkout(Role::Master).unwrap();
    drop(on_first);
    let coordinator = TrackingCoordinator::new(pool.clone());

    let started = Instant::now();
    let err = coordinator
        .enable(None, TrackingMode::Normal, TrackingOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(coordinator.state(), TrackingState::Off);
    assert_eq!(first.count(&["CLIENT", "TRACKING", "ON"]), 1);
    assert_eq!(first.count(&["CLIENT", "TRACKING", "OFF"]), 1);
    assert_eq!(second.count(&["CLIENT", "TRACKING"]), 0);
    assert!(!on_second.handle().is_tracking());

    // Once the lease is back, the same call goes through.
    drop(on_second);
    coordinator
        .enable(None, TrackingMode::Normal, TrackingOptions::default())
        .unwrap();
    assert!(pool.all_master_connections().iter().all(|h| h.is_tracking()));
}

#[test]
fn disable_reports_a_leased_master() {
    let first = MockServer::start().unwrap();
    let second = MockServer::start().unwrap();
    let config = builder_for(&[&first, &second], ProtocolVersion::Resp3)
        .max_idle(2)
        .max_total(2)
        .checkout_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let pool = ConnectionPool::new(&config).unwrap();
    let coordinator = TrackingCoordinator::new(pool.clone());
    drop((
        pool.checkout(Role::Master).unwrap(),
        pool.checkout(Role::Master).unwrap(),
    ));
    coordinator
        .enable(None, TrackingMode::Normal, TrackingOptions::default())
        .unwrap();

    let leased = pool.checkout(Role::Master).unwrap();
    let err = coordinator.disable().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(leased.handle().is_tracking());
    drop(leased);

    assert_eq!(coordinator.disable().unwrap(), TrackingState::Off);
    for server in [&first, &second] {
        assert!(!server.session(0).unwrap().tracking);
    }
}

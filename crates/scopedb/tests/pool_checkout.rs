use asupersync::runtime::RuntimeBuilder;
use asupersync::types::CancelKind;
use scopedb::prelude::*;
use scopedb_memory::MemoryDriver;
use std::time::{Duration, Instant};

static USER: EntityType = EntityType::new("users", "id");

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[test]
fn third_session_times_out_until_one_is_closed() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let pool = ConnectionPool::new(
        driver.clone(),
        PoolConfig::new(2).max_overflow(0).pool_timeout(1_000),
    )
    .expect("valid pool config");

    rt.block_on(async {
        let mut first = Session::new(pool.clone(), SessionConfig::default());
        let mut second = Session::new(pool.clone(), SessionConfig::default());
        let mut third = Session::new(pool.clone(), SessionConfig::default());
        unwrap_outcome(first.begin(&cx).await);
        unwrap_outcome(second.begin(&cx).await);
        assert_ne!(first.connection_id(), second.connection_id());

        let started = Instant::now();
        match third.begin(&cx).await {
            Outcome::Err(e) => {
                assert!(e.is_pool_timeout(), "unexpected error: {e}");
                assert!(e.is_retryable());
            }
            _ => panic!("expected pool timeout"),
        }
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1_000), "waited {waited:?}");
        assert!(!third.in_transaction());

        let released = first.connection_id();
        unwrap_outcome(first.close(&cx).await);
        unwrap_outcome(third.begin(&cx).await);
        assert_eq!(third.connection_id(), released);
    });

    let stats = pool.stats();
    assert_eq!(stats.acquire_timeouts, 1);
    assert_eq!(driver.connections_opened(), 2);
}

#[test]
fn committed_sessions_share_one_connection() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.create_table("users", "id", &["name"]);
    let pool = ConnectionPool::new(driver.clone(), PoolConfig::new(1).max_overflow(0))
        .expect("valid pool config");

    rt.block_on(async {
        for name in ["ann", "bob", "cy"] {
            let mut session = Session::new(pool.clone(), SessionConfig::default());
            session
                .add(&Entity::new(&USER).with("name", name))
                .expect("add transient user");
            unwrap_outcome(session.commit(&cx).await);
            unwrap_outcome(session.close(&cx).await);
        }
    });

    assert_eq!(driver.connections_opened(), 1);
    assert_eq!(driver.commits(), 3);
    assert_eq!(driver.rows("users").len(), 3);
    assert_eq!(pool.stats().idle_connections, 1);
}

#[test]
fn dead_connection_is_replaced_behind_pre_ping() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let pool = ConnectionPool::new(driver.clone(), PoolConfig::new(1).pool_pre_ping(true))
        .expect("valid pool config");

    rt.block_on(async {
        let mut session = Session::new(pool.clone(), SessionConfig::default());
        unwrap_outcome(session.begin(&cx).await);
        unwrap_outcome(session.close(&cx).await);

        driver.kill_all();

        let mut session = Session::new(pool.clone(), SessionConfig::default());
        unwrap_outcome(session.begin(&cx).await);
        let rows = unwrap_outcome(
            session
                .execute(&cx, &Statement::raw("SELECT 1", Vec::new()))
                .await,
        );
        assert_eq!(rows.len(), 1);
    });

    assert_eq!(driver.connections_opened(), 2);
}

#[test]
fn cancelled_session_returns_a_reset_connection() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let driver = MemoryDriver::new();
    driver.create_table("users", "id", &["name"]);
    let pool = ConnectionPool::new(driver.clone(), PoolConfig::new(1).max_overflow(0))
        .expect("valid pool config");

    rt.block_on(async {
        let cx = Cx::for_testing();
        let mut session = Session::new(pool.clone(), SessionConfig::default());
        session
            .add(&Entity::new(&USER).with("name", "ann"))
            .expect("add transient user");
        unwrap_outcome(session.flush(&cx, None).await);
        let held = session.connection_id().expect("transaction open");
        assert_eq!(driver.rows("users").len(), 1);

        cx.cancel_with(CancelKind::User, Some("client went away"));
        match session.commit(&cx).await {
            Outcome::Cancelled(_) => {}
            _ => panic!("expected cancellation"),
        }
        drop(session);
        assert_eq!(pool.stats().idle_connections, 1);

        let fresh = Cx::for_testing();
        let mut next = Session::new(pool.clone(), SessionConfig::default());
        unwrap_outcome(next.begin(&fresh).await);
        assert_eq!(next.connection_id(), Some(held));
        assert_eq!(driver.rollbacks(), 1);
        unwrap_outcome(next.close(&fresh).await);
    });

    assert_eq!(driver.commits(), 0);
    assert!(driver.rows("users").is_empty());
    assert_eq!(driver.connections_opened(), 1);
}

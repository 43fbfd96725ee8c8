use asupersync::runtime::RuntimeBuilder;
use scopedb::prelude::*;
use scopedb::{ConnectionId, SessionId};
use scopedb_memory::MemoryDriver;
use std::sync::{Arc, Barrier};

static USER: EntityType = EntityType::new("users", "id");

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn registry(driver: &MemoryDriver, config: PoolConfig) -> ScopeRegistry<MemoryDriver> {
    driver.create_table("users", "id", &["name"]);
    let pool = ConnectionPool::new(driver.clone(), config).expect("valid pool config");
    ScopeRegistry::new(pool, SessionConfig::default())
}

#[test]
fn each_thread_gets_its_own_session_and_connection() {
    let driver = MemoryDriver::new();
    let registry = registry(&driver, PoolConfig::new(2).max_overflow(0));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = ["ann", "bob"]
        .into_iter()
        .map(|name| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || -> (SessionId, Option<ConnectionId>, SessionId) {
                let rt = RuntimeBuilder::current_thread()
                    .build()
                    .expect("create asupersync runtime");
                let cx = Cx::for_testing();
                barrier.wait();
                rt.block_on(async {
                    let handle =
                        unwrap_outcome(registry.session_for(&cx, ScopeKey::current_thread()).await);
                    let again =
                        unwrap_outcome(registry.session_for(&cx, ScopeKey::current_thread()).await);
                    assert!(handle.same_session(&again));

                    let conn = unwrap_outcome(handle.connection_id(&cx).await);
                    // Both threads hold a connection before either commits.
                    barrier.wait();

                    let user = Entity::new(&USER).with("name", name);
                    unwrap_outcome(handle.add(&cx, &user).await);
                    unwrap_outcome(handle.commit(&cx).await);
                    let owner = user.session_id().expect("user is managed");
                    unwrap_outcome(handle.close(&cx).await);
                    (handle.id(), conn, owner)
                })
            })
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().expect("worker thread"))
        .collect();

    assert_ne!(results[0].0, results[1].0);
    assert_ne!(results[0].1, results[1].1);
    for (session, _, owner) in &results {
        assert_eq!(session, owner);
    }
    assert!(registry.is_empty());
    assert_eq!(driver.rows("users").len(), 2);
    assert_eq!(driver.connections_opened(), 2);
}

#[test]
fn closing_a_scope_frees_the_key_for_a_fresh_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let registry = registry(&driver, PoolConfig::new(1));

    rt.block_on(async {
        let first = unwrap_outcome(registry.session_for(&cx, "request-7").await);
        let user = Entity::new(&USER).with("name", "ann");
        unwrap_outcome(first.add(&cx, &user).await);
        unwrap_outcome(first.commit(&cx).await);
        unwrap_outcome(first.close(&cx).await);
        assert!(first.is_closed());
        assert!(!registry.contains(&ScopeKey::from("request-7")));
        assert_eq!(user.state(), EntityState::Detached);

        let second = unwrap_outcome(registry.session_for(&cx, "request-7").await);
        assert!(!second.same_session(&first));
        assert_ne!(second.id(), first.id());
        assert_eq!(unwrap_outcome(second.len(&cx).await), 0);

        let found = unwrap_outcome(second.find(&cx, &USER, 1_i64).await).expect("user row");
        assert!(!found.ptr_eq(&user));
        assert_eq!(found.get("name").expect("loaded name"), Value::from("ann"));
        unwrap_outcome(second.close(&cx).await);
    });

    assert_eq!(driver.connections_opened(), 1);
}

#[test]
fn with_session_scopes_a_unit_of_work() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let registry = registry(&driver, PoolConfig::new(1));
    let user = Entity::new(&USER).with("name", "bob");

    rt.block_on(async {
        let stored = unwrap_outcome(
            registry
                .with_session(&cx, "job", |session| {
                    let user = user.clone();
                    let cx = &cx;
                    async move {
                        match session.add(cx, &user).await {
                            Outcome::Ok(()) => {}
                            Outcome::Err(e) => return Outcome::Err(e),
                            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                            Outcome::Panicked(p) => return Outcome::Panicked(p),
                        }
                        match session.commit(cx).await {
                            Outcome::Ok(()) => session.len(cx).await,
                            Outcome::Err(e) => Outcome::Err(e),
                            Outcome::Cancelled(r) => Outcome::Cancelled(r),
                            Outcome::Panicked(p) => Outcome::Panicked(p),
                        }
                    }
                })
                .await,
        );
        assert_eq!(stored, 1);
    });

    assert!(registry.is_empty());
    assert_eq!(user.state(), EntityState::Detached);
    assert_eq!(driver.commits(), 1);
}

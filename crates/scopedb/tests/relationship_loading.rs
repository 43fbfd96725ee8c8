use asupersync::runtime::RuntimeBuilder;
use scopedb::prelude::*;
use scopedb_memory::MemoryDriver;

static ADDRESS: EntityType = EntityType::new("addresses", "id");
static USER_RELATIONS: [RelationshipInfo; 1] =
    [RelationshipInfo::one_to_many("addresses", &ADDRESS, "user_id")];
static USER: EntityType = EntityType::new("users", "id").with_relationships(&USER_RELATIONS);

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// One user with three addresses. Streets sort opposite to key order.
fn setup() -> (MemoryDriver, Session<MemoryDriver>) {
    let driver = MemoryDriver::new();
    driver.create_table("users", "id", &["name"]);
    driver.create_table("addresses", "id", &["user_id", "street"]);
    let user = driver
        .seed("users", &[("name", Value::from("ann"))])
        .expect("seed user");
    for street in ["3 Elm", "2 Oak", "1 Pine"] {
        driver
            .seed(
                "addresses",
                &[("user_id", Value::from(user)), ("street", Value::from(street))],
            )
            .expect("seed address");
    }
    let pool = ConnectionPool::new(driver.clone(), PoolConfig::new(1)).expect("valid pool config");
    (driver, Session::new(pool, SessionConfig::default()))
}

fn streets(addresses: &[Entity]) -> Vec<String> {
    addresses
        .iter()
        .map(|a| match a.get("street") {
            Ok(Value::Text(street)) => street,
            other => panic!("unexpected street: {other:?}"),
        })
        .collect()
}

#[test]
fn select_in_loads_children_with_one_extra_statement() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (driver, mut session) = setup();

    rt.block_on(async {
        let query = Select::new(&USER).load(Load::select_in("addresses"));
        let users = unwrap_outcome(session.select(&cx, &query).await).all();
        assert_eq!(users.len(), 1);
        assert_eq!(driver.statement_count(), 2);

        let addresses = users[0].loaded_related("addresses").expect("eagerly loaded");
        assert_eq!(streets(&addresses), ["3 Elm", "2 Oak", "1 Pine"]);

        let again = unwrap_outcome(session.related(&cx, &users[0], "addresses").await);
        assert_eq!(again.len(), 3);
        assert!(again[0].ptr_eq(&addresses[0]));
        assert_eq!(driver.statement_count(), 2);
    });
}

#[test]
fn lazy_loading_costs_one_statement_per_parent() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (driver, mut session) = setup();
    driver
        .seed("users", &[("name", Value::from("bob"))])
        .expect("seed second user");

    rt.block_on(async {
        session.enable_n1_detection(2);
        let users = unwrap_outcome(session.select(&cx, &Select::new(&USER)).await).all();
        assert_eq!(users.len(), 2);
        assert!(users[0].loaded_related("addresses").is_none());

        for user in &users {
            unwrap_outcome(session.related(&cx, user, "addresses").await);
        }
        assert_eq!(driver.statement_count(), 1 + users.len());

        let stats = session.n1_stats().expect("detection enabled");
        assert_eq!(stats.total_loads, 2);
        assert_eq!(stats.potential_n1, 1);
    });
}

#[test]
fn lazy_and_eager_loading_agree() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    let load = |strategy: Load| {
        let (_driver, mut session) = setup();
        rt.block_on(async {
            let query = Select::new(&USER).load(strategy);
            let users = unwrap_outcome(session.select(&cx, &query).await).unique();
            let mut pairs = Vec::new();
            for user in &users {
                let addresses = unwrap_outcome(session.related(&cx, user, "addresses").await);
                pairs.push((user.key(), streets(&addresses)));
            }
            pairs
        })
    };

    let lazy = load(Load::lazy("addresses"));
    assert_eq!(lazy, load(Load::select_in("addresses")));
    assert_eq!(lazy, load(Load::joined("addresses")));
}

#[test]
fn joined_load_repeats_the_parent_per_child() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (driver, mut session) = setup();

    rt.block_on(async {
        let query = Select::new(&USER).load(Load::joined("addresses"));
        let result = unwrap_outcome(session.select(&cx, &query).await);
        assert_eq!(result.len(), 3);
        let first = result.iter().next().expect("a row").clone();
        assert!(result.iter().all(|u| u.ptr_eq(&first)));

        let users = result.unique();
        assert_eq!(users.len(), 1);
        let addresses = users[0].loaded_related("addresses").expect("eagerly loaded");
        assert_eq!(streets(&addresses), ["3 Elm", "2 Oak", "1 Pine"]);
    });

    assert_eq!(driver.statement_count(), 1);
}

#[test]
fn committing_expires_loaded_collections() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (driver, mut session) = setup();

    rt.block_on(async {
        let query = Select::new(&USER).load(Load::select_in("addresses"));
        let users = unwrap_outcome(session.select(&cx, &query).await).all();
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(users[0].state(), EntityState::Expired);
        assert!(users[0].loaded_related("addresses").is_none());

        let mark = driver.statement_count();
        let addresses = unwrap_outcome(session.related(&cx, &users[0], "addresses").await);
        assert_eq!(addresses.len(), 3);
        assert_eq!(driver.statement_count(), mark + 2);
    });
}

use gridsync_relay::config::DatabaseConfig;
use gridsync_relay::db::pool;
use gridsync_relay::server::connect_store;
use gridsync_relay::store::CellStore;

fn test_config() -> Option<DatabaseConfig> {
    let Some(database_url) = std::env::var("GRIDSYNC_RELAY_TEST_DATABASE_URL").ok() else {
        eprintln!(
            "skipping db pool integration test: set GRIDSYNC_RELAY_TEST_DATABASE_URL to run it"
        );
        return None;
    };

    Some(DatabaseConfig {
        min_connections: 1,
        max_connections: 2,
        require_tls: false,
        ..DatabaseConfig::new(database_url)
    })
}

#[tokio::test]
async fn pg_pool_connects_within_configured_size() {
    let Some(config) = test_config() else {
        return;
    };

    let pool = pool::connect(&config).await.expect("pool should connect to test database");
    assert!(pool.size() <= config.max_connections);
    let answer: i32 =
        sqlx::query_scalar("SELECT 41 + 1").fetch_one(&pool).await.expect("query should run");
    assert_eq!(answer, 42);
}

#[tokio::test]
async fn configured_database_yields_postgres_store() {
    let Some(config) = test_config() else {
        return;
    };

    let store = connect_store(Some(&config)).await.expect("store should connect and migrate");
    assert!(matches!(store, CellStore::Postgres(_)));
}

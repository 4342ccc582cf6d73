//! End-to-end behavior of the cached data-access stack against a mock ESI
//! server: cache hits, degraded service under outage, and persistence
//! across restarts.

use std::sync::Arc;
use std::time::Duration;

use evacore::api::Eva;
use evacore::auth::{CredentialStore, SessionManager, SsoEndpoints};
use evacore::cache::{CacheStore, PolicyTable};
use evacore::client::EsiClient;
use evacore::config::Config;
use evacore::facade::DataOrigin;
use tempfile::TempDir;

fn eva_against(server: &mockito::Server, cache: Arc<CacheStore>, dir: &TempDir) -> Eva {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = Config {
        client_id: "integration-test".to_string(),
        ..Config::default()
    };
    // Keep retry backoff out of the test wall clock
    config.remote.backoff_base_ms = 1;

    let session = Arc::new(SessionManager::with_parts(
        config.clone(),
        reqwest::Client::new(),
        CredentialStore::at(dir.path().join("credential.json")),
        SsoEndpoints::default(),
    ));
    let client = Arc::new(EsiClient::with_base_url(
        config.clone(),
        reqwest::Client::new(),
        Arc::clone(&session),
        server.url(),
    ));

    Eva::with_parts(cache, PolicyTable::new(config.max_cache_age()), session, client)
}

const STATUS_BODY: &str =
    r#"{"players": 18000, "server_version": "2650601", "start_time": "2026-08-29T11:02:00Z"}"#;

#[tokio::test]
async fn repeat_reads_within_ttl_stay_local() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/status/")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(STATUS_BODY)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let eva = eva_against(&server, Arc::new(CacheStore::in_memory()), &dir);

    let first = eva.server_status().await.unwrap();
    assert_eq!(first.origin, DataOrigin::Remote);
    assert_eq!(first.value.players, 18000);

    for _ in 0..3 {
        let again = eva.server_status().await.unwrap();
        assert_eq!(again.origin, DataOrigin::Cache);
        assert_eq!(again.value.players, 18000);
    }

    let stats = eva.cache_stats();
    assert_eq!(stats.entry_count, 1);
    assert!(stats.hit_count >= 3);
    mock.assert_async().await;
}

#[tokio::test]
async fn outage_degrades_to_stale_data_with_warning() {
    let mut server = mockito::Server::new_async().await;
    let good = server
        .mock("GET", "/v1/status/")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(STATUS_BODY)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let eva = eva_against(&server, Arc::new(CacheStore::in_memory()), &dir);
    // Force every entry stale immediately so the next read goes remote
    eva.set_max_cache_age(Some(Duration::ZERO));

    let first = eva.server_status().await.unwrap();
    assert_eq!(first.origin, DataOrigin::Remote);
    good.assert_async().await;

    // The API goes down
    server.reset_async().await;
    server
        .mock("GET", "/v1/status/")
        .match_query(mockito::Matcher::Any)
        .with_status(503)
        .with_body("downtime")
        .create_async()
        .await;

    let degraded = eva.server_status().await.unwrap();
    assert_eq!(degraded.origin, DataOrigin::StaleFallback);
    assert_eq!(degraded.value.players, 18000);
    assert!(degraded.warning.is_some(), "stale data carries the failure");

    // Service recovers: reads go remote again
    server.reset_async().await;
    server
        .mock("GET", "/v1/status/")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(STATUS_BODY)
        .create_async()
        .await;

    let recovered = eva.server_status().await.unwrap();
    assert_eq!(recovered.origin, DataOrigin::Remote);
    assert!(recovered.warning.is_none());
}

#[tokio::test]
async fn persisted_categories_survive_restart() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/markets/prices/")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"type_id": 34, "average_price": 4.1, "adjusted_price": 4.05}]"#)
        .expect(1)
        .create_async()
        .await;

    let cache_dir = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();

    {
        let eva = eva_against(&server, Arc::new(CacheStore::open(cache_dir.path())), &dir);
        let prices = eva.market_prices().await.unwrap();
        assert_eq!(prices.origin, DataOrigin::Remote);
        assert_eq!(prices.value[0].type_id, 34);
    }

    // Disk writes land on the blocking pool; give them a moment
    tokio::time::sleep(Duration::from_millis(200)).await;

    // "Restart": a fresh store over the same directory promotes the entry
    let eva = eva_against(&server, Arc::new(CacheStore::open(cache_dir.path())), &dir);
    let prices = eva.market_prices().await.unwrap();
    assert_eq!(prices.origin, DataOrigin::Cache);
    assert_eq!(prices.value[0].average_price, Some(4.1));
    mock.assert_async().await;
}

//! Wire-level tests for the search store adapter against a mock server.

use partsync_engine::{EngineConfig, SearchStore};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> EngineConfig {
    EngineConfig {
        search_node: server.uri(),
        ..Default::default()
    }
}

async fn requests_to(server: &MockServer, target: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == target)
        .collect()
}

#[tokio::test]
async fn create_run_index_sends_fixed_settings_and_mappings() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/automotive_parts_20250101_000000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;

    let store = SearchStore::new(&config_for(&server)).unwrap();
    store
        .create_run_index("automotive_parts_20250101_000000")
        .await
        .unwrap();

    let requests = requests_to(&server, "/automotive_parts_20250101_000000").await;
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["settings"]["number_of_shards"], 5);
    assert_eq!(body["settings"]["number_of_replicas"], 0);
    assert_eq!(body["settings"]["refresh_interval"], "-1");
    assert_eq!(body["settings"]["max_result_window"], 50000);
    assert_eq!(body["settings"]["translog"]["sync_interval"], "120s");
    assert_eq!(
        body["settings"]["analysis"]["filter"]["autocomplete_filter"]["max_gram"],
        20
    );
    assert_eq!(body["mappings"]["properties"]["quantity"]["type"], "integer");
    assert_eq!(body["mappings"]["properties"]["importedAt"]["type"], "date");
}

#[tokio::test]
async fn ingest_counts_documents_and_samples_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "took": 5,
            "errors": true,
            "items": [
                {"index": {"status": 201}},
                {"index": {"status": 201}},
                {"index": {"status": 400, "error": {"type": "mapper_parsing_exception"}}}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let shard = dir.path().join("catalog.bulk");
    let action = r#"{"index":{"_index":"automotive_parts_20250101_000000"}}"#;
    let contents = format!(
        "{a}\n{{\"partNumber\":\"P-1\"}}\n{a}\n{{\"partNumber\":\"P-2\"}}\n{a}\n{{\"partNumber\":\"P-3\"}}\n",
        a = action
    );
    std::fs::write(&shard, contents).unwrap();

    let store = SearchStore::new(&config_for(&server)).unwrap();
    let indexed = store.ingest_shard(&shard).await.unwrap();
    assert_eq!(indexed, 2);

    let requests = requests_to(&server, "/_bulk").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get("content-type").unwrap(),
        "application/x-ndjson"
    );
}

#[tokio::test]
async fn ingest_chunks_on_pair_boundaries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "took": 1, "errors": false, "items": []
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let shard = dir.path().join("catalog.bulk");
    let action = r#"{"index":{"_index":"idx"}}"#;
    let mut contents = String::new();
    for i in 0..3 {
        contents.push_str(&format!("{}\n{{\"partNumber\":\"P-{}\"}}\n", action, i));
    }
    std::fs::write(&shard, contents).unwrap();

    let mut config = config_for(&server);
    config.limits.es_chunk_pairs = 2;
    let store = SearchStore::new(&config).unwrap();
    store.ingest_shard(&shard).await.unwrap();

    let requests = requests_to(&server, "/_bulk").await;
    assert_eq!(requests.len(), 2);

    // First chunk: two whole pairs. Second chunk: the remaining pair.
    let first = String::from_utf8(requests[0].body.clone()).unwrap();
    let second = String::from_utf8(requests[1].body.clone()).unwrap();
    assert_eq!(first.lines().count(), 4);
    assert_eq!(second.lines().count(), 2);
    for body in [&first, &second] {
        let lines: Vec<&str> = body.lines().collect();
        for pair in lines.chunks(2) {
            assert!(pair[0].contains("\"index\""));
            assert!(pair[1].contains("partNumber"));
        }
    }
}

#[tokio::test]
async fn empty_shard_issues_no_bulk_request() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let shard = dir.path().join("empty.bulk");
    std::fs::write(&shard, "").unwrap();

    let store = SearchStore::new(&config_for(&server)).unwrap();
    let indexed = store.ingest_shard(&shard).await.unwrap();
    assert_eq!(indexed, 0);

    assert!(requests_to(&server, "/_bulk").await.is_empty());
}

#[tokio::test]
async fn promote_swaps_alias_atomically_and_reports_displaced() {
    let server = MockServer::start().await;
    let run_index = "automotive_parts_20250101_010000";
    let old_index = "automotive_parts_20250101_000000";

    Mock::given(method("POST"))
        .and(path(format!("/{}/_refresh", run_index)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/{}/_settings", run_index)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_alias/automotive_parts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({old_index: {"aliases": {"automotive_parts": {}}}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_aliases"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{}", old_index)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;

    let store = SearchStore::new(&config_for(&server)).unwrap();
    let displaced = store.promote(run_index).await.unwrap();
    assert_eq!(displaced, vec![old_index.to_string()]);

    let aliases = requests_to(&server, "/_aliases").await;
    let body: Value = serde_json::from_slice(&aliases[0].body).unwrap();
    let actions = body["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0]["remove"]["index"], old_index);
    assert_eq!(actions[0]["remove"]["alias"], "automotive_parts");
    assert_eq!(actions[1]["add"]["index"], run_index);
    assert_eq!(actions[1]["add"]["alias"], "automotive_parts");

    // Settings restored for serving before the swap.
    let settings = requests_to(&server, &format!("/{}/_settings", run_index)).await;
    let body: Value = serde_json::from_slice(&settings[0].body).unwrap();
    assert_eq!(body["index"]["refresh_interval"], "5s");
    assert_eq!(body["index"]["translog.durability"], "request");
    assert!(body["index"]["merge.scheduler.max_thread_count"].is_null());

    assert_eq!(store.cleanup_old_indexes(&displaced).await, 1);
}

#[tokio::test]
async fn promote_deletes_legacy_concrete_index_first() {
    let server = MockServer::start().await;
    let run_index = "automotive_parts_20250101_010000";

    Mock::given(method("POST"))
        .and(path(format!("/{}/_refresh", run_index)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/{}/_settings", run_index)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_alias/automotive_parts"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "alias missing"})))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/automotive_parts"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/automotive_parts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_aliases"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;

    let store = SearchStore::new(&config_for(&server)).unwrap();
    let displaced = store.promote(run_index).await.unwrap();
    assert!(displaced.is_empty());

    let aliases = requests_to(&server, "/_aliases").await;
    let body: Value = serde_json::from_slice(&aliases[0].body).unwrap();
    let actions = body["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["add"]["index"], run_index);
}

#[tokio::test]
async fn unhealthy_search_store_reports_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_cluster/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = SearchStore::new(&config_for(&server)).unwrap();
    assert!(store.health().await.is_err());
}

#[tokio::test]
async fn basic_auth_is_attached_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_cluster/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "green"})))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.search_username = Some("sync".to_string());
    config.search_password = Some("secret".to_string());

    let store = SearchStore::new(&config).unwrap();
    store.health().await.unwrap();

    let requests = requests_to(&server, "/_cluster/health").await;
    let auth = requests[0].headers.get("authorization").unwrap();
    let encoded = auth.to_str().unwrap().strip_prefix("Basic ").unwrap();
    assert!(!encoded.is_empty());
}

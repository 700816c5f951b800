//! Warmup dispatch against a mock upstream.


use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use prelay_core::channel::StaticChannelDirectory;
use prelay_core::metrics::{MemoryUsageStore, RatioPricer, UsageRecorder, UsageStore};
use prelay_core::padding::{BundleCache, PaddingBundle};
use prelay_core::warmer::{WarmerConfig, WarmerScheduler};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_for_records(store: &MemoryUsageStore, count: usize) {
    for _ in 0..200 {
        if store.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store never reached {count} records");
}

#[tokio::test]
async fn warmup_refreshes_the_cache_entry_and_records_cost() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-chan-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_warm",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 1450,
                "output_tokens": 1,
                "cache_read_input_tokens": 0,
                "cache_creation_input_tokens": 1400
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let channel = fixtures::channel(1, &server.uri());
    let store = Arc::new(MemoryUsageStore::new());
    let (recorder, _flusher) = UsageRecorder::spawn(
        Arc::clone(&store) as Arc<dyn UsageStore>,
        Arc::new(RatioPricer::standard()),
    );
    let warmer = WarmerScheduler::new(
        Arc::new(StaticChannelDirectory::new([channel.clone()])),
        Arc::new(BundleCache::new()),
        Some(recorder),
        WarmerConfig::default(),
    );

    for _ in 0..10 {
        warmer.observe(&channel);
    }
    warmer.tick().await;
    wait_for_records(&store, 1).await;

    // The warmup request carried the full padding bundle with a breakpoint.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "claude-3-5-haiku-20241022");
    assert_eq!(body["max_tokens"], 1);
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "warmup");
    assert_eq!(
        body["system"][0]["text"],
        PaddingBundle::default_bundle().text()
    );
    assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
    assert!(body.get("stream").is_none());

    // And produced a warmup-tagged usage record with real cost numbers.
    let records = store
        .query_range(Utc.timestamp_opt(0, 0).unwrap(), Utc::now())
        .unwrap();
    let record = &records[0];
    assert!(record.is_warmup);
    assert_eq!(record.model_name, "claude-3-5-haiku-20241022");
    assert_eq!(record.prompt_tokens, 1450);
    assert_eq!(record.cache_creation_tokens, 1400);
    assert!(record.cost_with_cache > 0.0);

    // The warmer stamped the refresh.
    assert!(warmer.activity(1).unwrap().last_warmup_age.is_some());
}

#[tokio::test]
async fn failed_warmup_is_logged_not_propagated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let channel = fixtures::channel(2, &server.uri());
    let store = Arc::new(MemoryUsageStore::new());
    let (recorder, _flusher) = UsageRecorder::spawn(
        Arc::clone(&store) as Arc<dyn UsageStore>,
        Arc::new(RatioPricer::standard()),
    );
    let warmer = WarmerScheduler::new(
        Arc::new(StaticChannelDirectory::new([channel.clone()])),
        Arc::new(BundleCache::new()),
        Some(recorder),
        WarmerConfig::default(),
    );

    for _ in 0..10 {
        warmer.observe(&channel);
    }
    warmer.tick().await;

    // Give the dispatch time to fail; no record must appear and the channel
    // stays armed for the next tick's retry.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.is_empty());
    let snapshot = warmer.activity(2).unwrap();
    assert!(snapshot.warmup_armed);
    assert!(snapshot.last_warmup_age.is_some());
}

#[tokio::test]
async fn channel_override_bundle_is_what_gets_warmed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_warm2",
            "model": "claude-3-5-haiku-20241022",
            "content": [],
            "usage": {"input_tokens": 1100, "output_tokens": 1}
        })))
        .mount(&server)
        .await;

    let mut channel = fixtures::channel(3, &server.uri());
    let override_text = "custom channel preamble ".repeat(400);
    channel.padding_content = Some(override_text.clone());

    let bundles = Arc::new(BundleCache::new());
    bundles.load_channel(&channel).unwrap();
    let warmer = WarmerScheduler::new(
        Arc::new(StaticChannelDirectory::new([channel.clone()])),
        bundles,
        None,
        WarmerConfig::default(),
    );

    for _ in 0..10 {
        warmer.observe(&channel);
    }
    warmer.tick().await;

    for _ in 0..200 {
        if !server.received_requests().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["system"][0]["text"], override_text.as_str());
}

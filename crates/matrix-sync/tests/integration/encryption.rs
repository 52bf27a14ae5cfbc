use std::sync::Arc;

use assert_matches2::assert_matches;
use matrix_sync::{Error, config::SyncSettings, crypto::CryptoError};
use matrix_sync_base::test_utils::{EngineCall, FakeCryptoEngine};
use matrix_sync_test::{BOB, SyncResponseBuilder, test_json};
use serde_json::json;
use wiremock::{
    Mock, ResponseTemplate,
    matchers::{body_partial_json, method, path},
};

use crate::{logged_in_client, mock_sync};

#[tokio::test]
async fn test_sync_feeds_the_engine_and_sends_its_requests() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;

    let mut builder = SyncResponseBuilder::new();
    builder
        .add_change_device(&BOB)
        .add_to_device_event(json!({
            "type": "m.room_key_request",
            "sender": BOB.to_owned(),
            "content": { "action": "request" },
        }))
        .set_one_time_keys_count("signed_curve25519", 50);
    mock_sync(&server, builder.build_json_sync_response(), None).await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/keys/query"))
        .and(body_partial_json(json!({ "device_keys": { "@bob:other.server": [] } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::KEYS_QUERY))
        .expect(1)
        .mount(&server)
        .await;

    let response = client.sync_once(SyncSettings::default()).await.unwrap();

    assert_eq!(response.to_device.len(), 1);
    assert_eq!(response.device_lists.changed, vec![BOB.to_owned()]);

    let calls = engine.calls();
    assert_matches!(
        calls.iter().find(|c| matches!(c, EngineCall::ReceiveSyncChanges { .. })),
        Some(EngineCall::ReceiveSyncChanges { to_device_events: 1, changed })
    );
    assert_eq!(changed, &vec![BOB.to_owned()]);
    assert!(calls.iter().any(|c| matches!(c, EngineCall::MarkRequestAsSent(..))));
    assert!(engine.pending_requests().is_empty());
}

#[tokio::test]
async fn test_pre_sync_flush_comes_first() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;

    mock_sync(&server, json!({ "next_batch": "s1" }), None).await;

    client.sync_once(SyncSettings::default()).await.unwrap();

    let calls = engine.calls();
    assert_eq!(calls[0], EngineCall::GetMissingSessions(Vec::new()));
    assert_eq!(calls[1], EngineCall::OutgoingRequests);
    assert_matches!(&calls[2], EngineCall::ReceiveSyncChanges { .. });
}

#[tokio::test]
async fn test_ingestion_failure_keeps_the_token() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;

    mock_sync(&server, json!({ "next_batch": "s1" }), None).await;
    engine.fail_sync_changes(true);

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();

    assert_matches!(error, Error::Crypto(CryptoError::Ingestion(_)));
    assert_eq!(client.sync_token(), None);

    // The next cycle retries the same response.
    engine.fail_sync_changes(false);
    client.sync_once(SyncSettings::default()).await.unwrap();
    assert_eq!(client.sync_token().as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_failed_wire_calls_dont_fail_the_sync() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;

    let mut builder = SyncResponseBuilder::new();
    builder.set_next_batch("s1").add_change_device(&BOB);
    mock_sync(&server, builder.build_json_sync_response(), None).await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/keys/query"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    client.sync_once(SyncSettings::default()).await.unwrap();

    assert_eq!(client.sync_token().as_deref(), Some("s1"));
    // The key query stays queued for the next drain.
    assert_eq!(engine.pending_requests().len(), 1);
}

use std::{sync::Arc, time::Duration};

use assert_matches2::assert_matches;
use matrix_sync::{Error, ErrorKind, config::SyncSettings};
use matrix_sync_base::test_utils::{EngineCall, FakeCryptoEngine};
use matrix_sync_test::{
    ALICE, BOB, EventFactory, JoinedRoomBuilder, LeftRoomBuilder, SyncResponseBuilder, test_json,
};
use ruma::room_id;
use serde_json::json;
use tokio::time::{sleep, timeout};
use wiremock::{
    Mock, ResponseTemplate,
    matchers::{method, path},
};

use crate::{logged_in_client, mock_sync};

#[tokio::test]
async fn test_concurrent_syncs_share_one_request() {
    let (client, server) = logged_in_client(None).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "next_batch": "s1" }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (first, second) = tokio::join!(
        client.sync_once(SyncSettings::default()),
        client.sync_once(SyncSettings::default()),
    );

    assert_eq!(first.unwrap().next_batch, "s1");
    assert_eq!(second.unwrap().next_batch, "s1");
    assert_eq!(client.sync_token().as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_callers_of_a_failed_shared_sync_see_the_error() {
    let (client, server) = logged_in_client(None).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(&*test_json::NOT_FOUND)
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (first, second) = tokio::join!(
        client.sync_once(SyncSettings::default()),
        client.sync_once(SyncSettings::default()),
    );

    for error in [first.unwrap_err(), second.unwrap_err()] {
        assert_eq!(error.client_api_error_kind(), Some(ErrorKind::NotFound));
    }

    // A new sync can start once the failed one is over.
    server.reset().await;
    mock_sync(&server, json!({ "next_batch": "s1" }), None).await;
    client.sync_once(SyncSettings::default()).await.unwrap();
}

#[tokio::test]
async fn test_same_token_is_a_no_op() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    let room_id = room_id!("!r:x");
    let f = EventFactory::new();

    let mut builder = SyncResponseBuilder::new();
    builder.set_next_batch("s1").add_joined_room(
        JoinedRoomBuilder::new(room_id)
            .add_state_event(f.create(&ALICE, "11"))
            .add_state_event(f.room_name("Test")),
    );
    mock_sync(&server, builder.build_json_sync_response(), None).await;

    client.sync_once(SyncSettings::default()).await.unwrap();

    // The server hands out the same token again, with changes that must not
    // be applied.
    builder
        .set_next_batch("s1")
        .add_joined_room(JoinedRoomBuilder::new(room_id).add_state_event(f.room_name("Renamed")))
        .add_change_device(&BOB);
    mock_sync(&server, builder.build_json_sync_response(), Some("s1")).await;

    let calls_before = engine.calls().len();
    let response = client.sync_once(SyncSettings::default()).await.unwrap();

    assert_eq!(response.next_batch, "s1");
    assert!(response.rooms.is_empty());
    assert_eq!(client.get_room(room_id).unwrap().name().as_deref(), Some("Test"));

    let new_calls = &engine.calls()[calls_before..];
    assert!(!new_calls.iter().any(|c| matches!(c, EngineCall::ReceiveSyncChanges { .. })));
    assert!(engine.pending_requests().is_empty());
}

#[tokio::test]
async fn test_left_rooms_are_removed() {
    let (client, server) = logged_in_client(None).await;
    let room_id = room_id!("!r:x");

    let mut builder = SyncResponseBuilder::new();
    builder.set_next_batch("s1").add_joined_room(
        JoinedRoomBuilder::new(room_id).add_state_event(EventFactory::new().create(&ALICE, "11")),
    );
    mock_sync(&server, builder.build_json_sync_response(), None).await;
    client.sync_once(SyncSettings::default()).await.unwrap();
    assert!(client.get_room(room_id).is_some());

    builder.set_next_batch("s2").add_left_room(LeftRoomBuilder::new(room_id));
    mock_sync(&server, builder.build_json_sync_response(), Some("s1")).await;

    let response = client.sync_once(SyncSettings::default()).await.unwrap();

    assert!(response.rooms.left.contains(room_id));
    assert!(client.get_room(room_id).is_none());
    assert!(client.rooms().is_empty());
}

#[tokio::test]
async fn test_sync_requires_a_session() {
    let server = wiremock::MockServer::start().await;
    let client = crate::test_client_builder(&server).build().unwrap();

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();
    assert_matches!(error, Error::Http(matrix_sync::HttpError::AuthenticationRequired));
}

#[tokio::test]
async fn test_background_sync_follows_the_tokens() {
    let (client, server) = logged_in_client(None).await;

    mock_sync(&server, json!({ "next_batch": "s1" }), None).await;
    mock_sync(&server, json!({ "next_batch": "s2" }), Some("s1")).await;
    mock_sync(&server, json!({ "next_batch": "s2" }), Some("s2")).await;

    let settings = SyncSettings::new().poll_interval(Duration::from_millis(10));
    client.start_background_sync(settings.clone()).await;
    assert!(client.is_background_sync_enabled());

    // Starting it twice doesn't start a second loop.
    client.start_background_sync(settings.clone()).await;

    timeout(Duration::from_secs(5), async {
        while client.sync_token().as_deref() != Some("s2") {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the background sync should reach the second token");

    client.stop_background_sync();
    assert!(!client.is_background_sync_enabled());

    // A restart waits for the previous loop and then runs again.
    client.start_background_sync(settings).await;
    assert!(client.is_background_sync_enabled());
    client.stop_background_sync();
}

#[tokio::test]
async fn test_background_sync_survives_failures() {
    let (client, server) = logged_in_client(None).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "errcode": "M_UNKNOWN",
            "error": "Try again later",
        })))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mock_sync(&server, json!({ "next_batch": "s1" }), None).await;

    client
        .start_background_sync(
            SyncSettings::new()
                .poll_interval(Duration::from_millis(10))
                .ignore_timeout_on_first_sync(true),
        )
        .await;

    timeout(Duration::from_secs(10), async {
        while client.sync_token().is_none() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the background sync should recover");

    assert!(client.is_background_sync_enabled());
    client.stop_background_sync();
}

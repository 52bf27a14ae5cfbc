use std::time::Duration;

use assert_matches2::assert_matches;
use matrix_sync::{
    Client, Error, HttpError, RefreshTokenError, SessionTokens, config::SyncSettings,
};
use matrix_sync_test::{ALICE, EventFactory, JoinedRoomBuilder, SyncResponseBuilder, test_json};
use ruma::room_id;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path, path_regex},
};

use crate::{mock_sync, session, test_client_builder};

async fn refreshing_client(refresh_token: Option<&str>) -> (Client, MockServer) {
    let server = MockServer::start().await;
    let client = test_client_builder(&server).handle_refresh_tokens().build().unwrap();
    client.restore_session(session(refresh_token)).await;

    (client, server)
}

async fn mock_soft_logout_sync(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(&*test_json::UNKNOWN_TOKEN_SOFT_LOGOUT),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_concurrent_soft_logouts_refresh_once() {
    let (client, server) = refreshing_client(Some("abcd")).await;
    let f = EventFactory::new();

    let mut builder = SyncResponseBuilder::new();
    for room_id in [room_id!("!a:x"), room_id!("!b:x")] {
        builder.add_joined_room(
            JoinedRoomBuilder::new(room_id).add_state_event(f.create(&ALICE, "11")),
        );
    }
    mock_sync(&server, builder.build_json_sync_response(), None).await;
    client.sync_once(SyncSettings::default()).await.unwrap();

    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/members$"))
        .and(header("authorization", "Bearer 1234"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(&*test_json::UNKNOWN_TOKEN_SOFT_LOGOUT),
        )
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/members$"))
        .and(header("authorization", "Bearer 5678"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "chunk": [] })))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/refresh"))
        .and(body_partial_json(json!({ "refresh_token": "abcd" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(&*test_json::REFRESH_TOKEN)
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let first = client.get_room(room_id!("!a:x")).unwrap();
    let second = client.get_room(room_id!("!b:x")).unwrap();

    let (a, b) = tokio::join!(first.sync_members(), second.sync_members());
    a.unwrap();
    b.unwrap();

    assert_eq!(
        client.session_tokens(),
        Some(SessionTokens {
            access_token: "5678".to_owned(),
            // The server didn't rotate the refresh token.
            refresh_token: Some("abcd".to_owned()),
        })
    );
}

#[tokio::test]
async fn test_soft_logout_without_refresh_token_is_unauthorized() {
    let (client, server) = refreshing_client(None).await;
    let mut errors = client.subscribe_to_unknown_token_errors();

    mock_soft_logout_sync(&server).await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::REFRESH_TOKEN))
        .expect(0)
        .mount(&server)
        .await;

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();

    assert_matches!(error, Error::Http(HttpError::Unauthorized(_)));
    assert!(errors.try_recv().unwrap().soft_logout);
}

#[tokio::test]
async fn test_refresh_is_off_by_default() {
    let server = MockServer::start().await;
    let client = test_client_builder(&server).build().unwrap();
    client.restore_session(session(Some("abcd"))).await;

    mock_soft_logout_sync(&server).await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::REFRESH_TOKEN))
        .expect(0)
        .mount(&server)
        .await;

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();
    assert_matches!(error, Error::Http(HttpError::Unauthorized(_)));
}

#[tokio::test]
async fn test_failed_refresh_is_returned_and_broadcast() {
    let (client, server) = refreshing_client(Some("abcd")).await;
    let mut errors = client.subscribe_to_unknown_token_errors();

    mock_soft_logout_sync(&server).await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(&*test_json::UNKNOWN_TOKEN))
        .expect(1)
        .mount(&server)
        .await;

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();

    assert_matches!(error, Error::Http(HttpError::RefreshToken(RefreshTokenError::Http(_))));
    assert!(errors.try_recv().unwrap().soft_logout);
    assert_matches!(errors.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(client.access_token().as_deref(), Some("1234"));
}

#[tokio::test]
async fn test_manual_refresh() {
    let (client, server) = refreshing_client(Some("abcd")).await;
    let mut tokens = client.session_tokens_stream();

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "5678",
            "refresh_token": "efgh",
        })))
        .expect(1)
        .mount(&server)
        .await;

    client.refresh_access_token().await.unwrap();

    let update = tokens.next().await.unwrap().unwrap();
    assert_eq!(update.access_token, "5678");
    assert_eq!(update.refresh_token.as_deref(), Some("efgh"));
}

#[tokio::test]
async fn test_manual_refresh_requires_a_refresh_token() {
    let (client, _server) = refreshing_client(None).await;

    assert_matches!(
        client.refresh_access_token().await,
        Err(RefreshTokenError::RefreshTokenRequired)
    );
}

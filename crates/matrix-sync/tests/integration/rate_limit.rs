use std::time::Duration;

use assert_matches2::assert_matches;
use matrix_sync::{
    Client, Error, ErrorKind, HttpError,
    config::{RequestConfig, SyncSettings},
};
use matrix_sync_test::test_json;
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use crate::session;

async fn retrying_client(retry_limit: u64) -> (Client, MockServer) {
    let server = MockServer::start().await;
    let client = Client::builder()
        .homeserver_url(server.uri())
        .request_config(
            RequestConfig::new()
                .retry_limit(retry_limit)
                .rate_limit_delay(Duration::from_millis(10)),
        )
        .build()
        .unwrap();
    client.restore_session(session(None)).await;

    (client, server)
}

#[tokio::test]
async fn test_rate_limited_requests_are_retried() {
    let (client, server) = retrying_client(3).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "errcode": "M_LIMIT_EXCEEDED",
            "error": "Too many requests",
            "retry_after_ms": 20,
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(429).set_body_json(&*test_json::LIMIT_EXCEEDED))
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "next_batch": "s1" })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client.sync_once(SyncSettings::default()).await.unwrap();

    assert_eq!(response.next_batch, "s1");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let (client, server) = retrying_client(2).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(429).set_body_json(&*test_json::LIMIT_EXCEEDED))
        .expect(3)
        .mount(&server)
        .await;

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();

    assert_eq!(
        error.client_api_error_kind(),
        Some(ErrorKind::LimitExceeded { retry_after: None })
    );
    assert_matches!(error, Error::Http(HttpError::RetryLimitExceeded { retries: 2, .. }));
}

#[tokio::test]
async fn test_other_errors_are_not_retried() {
    let (client, server) = retrying_client(3).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(404).set_body_json(&*test_json::NOT_FOUND))
        .expect(1)
        .mount(&server)
        .await;

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();
    assert_matches!(error, Error::Http(HttpError::Api(_)));
}

#[tokio::test]
async fn test_transport_errors_are_retried() {
    // Nothing listens on this port.
    let client = Client::builder()
        .homeserver_url("http://127.0.0.1:1")
        .request_config(
            RequestConfig::new().retry_limit(1).rate_limit_delay(Duration::from_millis(10)),
        )
        .build()
        .unwrap();
    client.restore_session(session(None)).await;

    let error = client.sync_once(SyncSettings::default()).await.unwrap_err();

    assert_matches!(error, Error::Http(HttpError::RetryLimitExceeded { retries: 1, last_error }));
    assert_matches!(*last_error, HttpError::Reqwest(_));
}

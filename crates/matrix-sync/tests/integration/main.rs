use std::sync::Arc;

use matrix_sync::{
    Client, ClientBuilder, Session, SessionMeta, SessionTokens, config::RequestConfig,
};
use matrix_sync_base::test_utils::FakeCryptoEngine;
use ruma::{device_id, user_id};
use serde::Serialize;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path, query_param, query_param_is_missing},
};

mod encryption;
mod rate_limit;
mod refresh_token;
mod room;
mod sync;

matrix_sync_test::init_tracing_for_tests!();

fn session(refresh_token: Option<&str>) -> Session {
    Session {
        meta: SessionMeta {
            user_id: user_id!("@example:localhost").to_owned(),
            device_id: device_id!("DEVICEID").to_owned(),
        },
        tokens: SessionTokens {
            access_token: "1234".to_owned(),
            refresh_token: refresh_token.map(ToOwned::to_owned),
        },
    }
}

/// A [`ClientBuilder`] for the given server, that will never retry any failed
/// requests.
fn test_client_builder(server: &MockServer) -> ClientBuilder {
    Client::builder()
        .homeserver_url(server.uri())
        .request_config(RequestConfig::new().disable_retry())
}

/// A logged in [`Client`] with a fresh mock server, using the given engine if
/// any.
async fn logged_in_client(engine: Option<Arc<FakeCryptoEngine>>) -> (Client, MockServer) {
    let server = MockServer::start().await;

    let mut builder = test_client_builder(&server);
    if let Some(engine) = engine {
        builder = builder.crypto_engine(engine);
    }

    let client = builder.build().unwrap();
    client.restore_session(session(None)).await;

    (client, server)
}

/// Mount a Mock on the given server to handle the `GET /sync` endpoint with
/// an optional `since` param that returns a 200 status code with the given
/// response body.
async fn mock_sync(server: &MockServer, response_body: impl Serialize, since: Option<&str>) {
    let mut builder = Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .and(header("authorization", "Bearer 1234"));

    if let Some(since) = since {
        builder = builder.and(query_param("since", since));
    } else {
        builder = builder.and(query_param_is_missing("since"));
    }

    builder
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(server)
        .await;
}

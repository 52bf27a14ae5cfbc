// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Testing utilities - DO NOT USE IN PRODUCTION.

use std::sync::Arc;

use matrix_sync_base::{SessionMeta, test_utils::FakeCryptoEngine};
use ruma::{device_id, user_id};
use wiremock::MockServer;

use crate::{Client, Session, SessionTokens, config::RequestConfig};

/// The session every logged in test client uses.
pub(crate) fn test_session() -> Session {
    Session {
        meta: SessionMeta {
            user_id: user_id!("@example:localhost").to_owned(),
            device_id: device_id!("DEVICEID").to_owned(),
        },
        tokens: SessionTokens { access_token: "1234".to_owned(), refresh_token: None },
    }
}

/// A [`Client`] talking to a fresh mock homeserver, logged in with
/// [`test_session`] and never retrying failed requests.
pub(crate) async fn logged_in_client(
    engine: Option<Arc<FakeCryptoEngine>>,
) -> (Client, MockServer) {
    let server = MockServer::start().await;

    let mut builder = Client::builder()
        .homeserver_url(server.uri())
        .request_config(RequestConfig::new().disable_retry());

    if let Some(engine) = engine {
        builder = builder.crypto_engine(engine);
    }

    let client = builder.build().unwrap();
    client.restore_session(test_session()).await;

    (client, server)
}

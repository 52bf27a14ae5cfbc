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


use std::sync::Arc;

use eyeball::SharedObservable;
use matrix_sync_base::{
    BaseClient, BaseClientConfig, DEFAULT_STATE_CACHE_CAPACITY, DEFAULT_TIMELINE_CAPACITY,
    MemoryStore, StateStore, crypto::CryptoEngine,
};
use tokio::sync::{Mutex, broadcast};
use tracing::{Span, debug, field::debug, instrument};
use url::Url;

use super::{Client, ClientInner};
use crate::{
    config::RequestConfig,
    error::ClientBuildError,
    http_client::{HttpClient, HttpSend},
};

/// Builder that allows creating and configuring various parts of a [`Client`].
///
/// When setting the `StateStore` it is up to the user to open/connect
/// the storage backend before client creation.
///
/// # Examples
///
/// ```
/// use matrix_sync::Client;
///
/// let client = Client::builder()
///     .homeserver_url("https://matrix.example.org")
///     .handle_refresh_tokens()
///     .build()?;
/// # anyhow::Ok(())
/// ```
#[must_use]
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    homeserver_url: Option<String>,
    http_client: Option<Arc<dyn HttpSend>>,
    request_config: RequestConfig,
    handle_refresh_tokens: bool,
    crypto_engine: Option<Arc<dyn CryptoEngine>>,
    state_store: Option<Arc<dyn StateStore>>,
    state_cache_capacity: usize,
    timeline_capacity: usize,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            homeserver_url: None,
            http_client: None,
            request_config: Default::default(),
            handle_refresh_tokens: false,
            crypto_engine: None,
            state_store: None,
            state_cache_capacity: DEFAULT_STATE_CACHE_CAPACITY,
            timeline_capacity: DEFAULT_TIMELINE_CAPACITY,
        }
    }

    /// Set the homeserver URL to use.
    pub fn homeserver_url(mut self, url: impl AsRef<str>) -> Self {
        self.homeserver_url = Some(url.as_ref().to_owned());
        self
    }

    /// Specify a custom HTTP client to be used by the client.
    ///
    /// By default a `reqwest::Client` is created.
    pub fn http_client(mut self, client: Arc<dyn HttpSend>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Set the default timeout, retries and concurrency limit for every HTTP
    /// request.
    pub fn request_config(mut self, request_config: RequestConfig) -> Self {
        self.request_config = request_config;
        self
    }

    /// Handle [refreshing access tokens] automatically.
    ///
    /// By default, the `Client` forwards any error and doesn't handle errors
    /// with the access token, which means that
    /// [`Client::refresh_access_token()`] needs to be called manually to
    /// refresh access tokens.
    ///
    /// Enabling this setting means that the `Client` will try to refresh the
    /// token automatically when the server answers with a soft logout, which
    /// means that:
    ///
    /// * If refreshing the token fails, the error is forwarded, so any endpoint
    ///   can return [`HttpError::RefreshToken`].
    ///
    /// * The access token and refresh token need to be watched for changes,
    ///   using [`Client::session_tokens_stream()`] for example, to be able to
    ///   [restore the session] later.
    ///
    /// [refreshing access tokens]: https://spec.matrix.org/v1.3/client-server-api/#refreshing-access-tokens
    /// [`HttpError::RefreshToken`]: crate::HttpError::RefreshToken
    /// [restore the session]: Client::restore_session
    pub fn handle_refresh_tokens(mut self) -> Self {
        self.handle_refresh_tokens = true;
        self
    }

    /// Enable end-to-end encryption with the given engine.
    pub fn crypto_engine(mut self, engine: Arc<dyn CryptoEngine>) -> Self {
        self.crypto_engine = Some(engine);
        self
    }

    /// Persist room state in the given store instead of keeping it in memory
    /// only.
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// How many state events are cached per room.
    pub fn state_cache_capacity(mut self, capacity: usize) -> Self {
        self.state_cache_capacity = capacity;
        self
    }

    /// How many timeline events are kept per room.
    pub fn timeline_capacity(mut self, capacity: usize) -> Self {
        self.timeline_capacity = capacity;
        self
    }

    /// Create a [`Client`] with the options set on this builder.
    ///
    /// # Errors
    ///
    /// This method can fail for two general reasons:
    ///
    /// * The homeserver URL is missing or invalid
    /// * The default HTTP client couldn't be built
    #[instrument(skip_all, target = "matrix_sync::client", fields(homeserver))]
    pub fn build(self) -> Result<Client, ClientBuildError> {
        debug!("Starting to build the Client");

        let homeserver_url = self.homeserver_url.ok_or(ClientBuildError::MissingHomeserverUrl)?;
        let homeserver = Url::parse(&homeserver_url)?;

        if homeserver.cannot_be_a_base() {
            return Err(ClientBuildError::InvalidHomeserverUrl);
        }

        Span::current().record("homeserver", debug(&homeserver));

        let inner_http_client = match self.http_client {
            Some(client) => client,
            None => Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("matrix-sync/", env!("CARGO_PKG_VERSION")))
                    .build()?,
            ),
        };

        let store = self.state_store.unwrap_or_else(|| {
            Arc::new(MemoryStore::with_timeline_capacity(self.timeline_capacity))
        });
        let base_config = BaseClientConfig {
            store,
            crypto_engine: self.crypto_engine,
            state_cache_capacity: self.state_cache_capacity,
            timeline_capacity: self.timeline_capacity,
        };

        let (unknown_token_error_sender, _) = broadcast::channel(1);

        let inner = Arc::new(ClientInner {
            homeserver,
            http_client: HttpClient::new(inner_http_client, self.request_config),
            base_client: BaseClient::new(base_config),
            session_tokens: SharedObservable::new(None),
            handle_refresh_tokens: self.handle_refresh_tokens,
            refresh_token_lock: Mutex::new(None),
            unknown_token_error_sender,
            sync_in_flight: Default::default(),
            background_sync: Default::default(),
        });

        debug!("Done building the Client");

        Ok(Client { inner })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;

    use crate::{Client, ClientBuildError};

    #[test]
    fn test_missing_homeserver_url() {
        assert_matches!(Client::builder().build(), Err(ClientBuildError::MissingHomeserverUrl));
    }

    #[test]
    fn test_invalid_homeserver_url() {
        let result = Client::builder().homeserver_url("not a url").build();
        assert_matches!(result, Err(ClientBuildError::Url(_)));

        let result = Client::builder().homeserver_url("mailto:alice@example.org").build();
        assert_matches!(result, Err(ClientBuildError::InvalidHomeserverUrl));
    }

    #[test]
    fn test_build() {
        let client = Client::builder().homeserver_url("https://example.org").build().unwrap();

        assert_eq!(client.homeserver().as_str(), "https://example.org/");
        assert!(client.session_tokens().is_none());
        assert!(!client.encryption().is_enabled());
    }
}

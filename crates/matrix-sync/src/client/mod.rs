// Copyright 2020 Damir Jelić
// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex as StdMutex},
};

use bytes::Bytes;
use eyeball::{SharedObservable, Subscriber};
use http::{Method, StatusCode};
use matrix_sync_base::{BaseClient, SessionMeta, StrippedRoom};
use ruma::{DeviceId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    Room,
    config::RequestConfig,
    error::{ApiError, ErrorKind, HttpError, HttpResult, RefreshTokenError},
    http_client::{ApiRequest, HttpClient},
    sync::{BackgroundSync, SyncFuture},
};

mod builder;

pub use self::builder::ClientBuilder;

/// Wrapper struct for ErrorKind::UnknownToken
#[derive(Debug, Clone)]
pub struct UnknownToken {
    /// Whether or not the session was soft logged out
    pub soft_logout: bool,
}

/// The access token and, if the server handed one out, the refresh token of a
/// session.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[cfg(not(tarpaulin_include))]
impl Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens").finish_non_exhaustive()
    }
}

/// A user session, as obtained from a login.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub meta: SessionMeta,
    #[serde(flatten)]
    pub tokens: SessionTokens,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// An async/await enabled Matrix client.
///
/// All of the state is held in an `Arc` so the `Client` can be cloned freely.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    /// The URL of the homeserver to connect to.
    homeserver: Url,
    /// The underlying HTTP client.
    pub(crate) http_client: HttpClient,
    /// User session data.
    base_client: BaseClient,
    session_tokens: SharedObservable<Option<SessionTokens>>,
    /// Whether to try to refresh the access token automatically when an
    /// `M_UNKNOWN_TOKEN` error is encountered.
    handle_refresh_tokens: bool,
    /// Lock making sure we're only doing one token refresh at a time.
    ///
    /// Holds the access token of the last refresh attempt and its outcome.
    refresh_token_lock: Mutex<Option<(String, Result<(), RefreshTokenError>)>>,
    /// Client API UnknownToken error publisher. Allows the subscriber logout
    /// the user when any request fails because of an invalid access token
    pub(crate) unknown_token_error_sender: broadcast::Sender<UnknownToken>,
    /// The sync call in flight, if any.
    pub(crate) sync_in_flight: StdMutex<Option<SyncFuture>>,
    pub(crate) background_sync: BackgroundSync,
}

#[cfg(not(tarpaulin_include))]
impl Debug for Client {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "Client")
    }
}

impl Client {
    /// Create a new [`ClientBuilder`].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn base_client(&self) -> &BaseClient {
        &self.inner.base_client
    }

    /// The homeserver of the client.
    pub fn homeserver(&self) -> &Url {
        &self.inner.homeserver
    }

    /// The default request config of the client.
    pub fn request_config(&self) -> RequestConfig {
        self.inner.http_client.request_config
    }

    /// Restore a previously logged in session.
    ///
    /// This installs the user and device of the session and its tokens, and
    /// picks up the sync token from the state store, if any.
    #[instrument(skip_all, fields(user_id = ?session.meta.user_id))]
    pub async fn restore_session(&self, session: Session) {
        let Session { meta, tokens } = session;

        self.inner.session_tokens.set(Some(tokens));
        self.base_client().set_session_meta(meta);
        self.base_client().load_sync_token().await;

        debug!("Restored the session");
    }

    /// Get the meta information of the session, if the client is logged in.
    pub fn session_meta(&self) -> Option<&SessionMeta> {
        self.base_client().session_meta()
    }

    /// The user ID of the logged in user, if any.
    pub fn user_id(&self) -> Option<&UserId> {
        self.session_meta().map(|s| s.user_id.as_ref())
    }

    /// The device ID of the logged in device, if any.
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.session_meta().map(|s| s.device_id.as_ref())
    }

    /// The current session tokens.
    pub fn session_tokens(&self) -> Option<SessionTokens> {
        self.inner.session_tokens.get()
    }

    /// The current access token.
    pub fn access_token(&self) -> Option<String> {
        self.inner.session_tokens.read().as_ref().map(|t| t.access_token.clone())
    }

    /// Get changes to the session tokens, e.g. after a refresh.
    ///
    /// Persist the new tokens to be able to [restore the session] later.
    ///
    /// [restore the session]: Client::restore_session
    pub fn session_tokens_stream(&self) -> Subscriber<Option<SessionTokens>> {
        self.inner.session_tokens.subscribe()
    }

    /// Subscribes a new receiver to client UnknownToken errors
    pub fn subscribe_to_unknown_token_errors(&self) -> broadcast::Receiver<UnknownToken> {
        self.inner.unknown_token_error_sender.subscribe()
    }

    /// The sync token of the last successful sync.
    pub fn sync_token(&self) -> Option<String> {
        self.base_client().sync_token()
    }

    /// Get a joined room with the given room id.
    pub fn get_room(&self, room_id: &RoomId) -> Option<Room> {
        self.base_client().get_room(room_id).map(|room| Room::new(self.clone(), room))
    }

    /// All the joined rooms of this client.
    pub fn rooms(&self) -> Vec<Room> {
        self.base_client().rooms().into_iter().map(|room| Room::new(self.clone(), room)).collect()
    }

    /// Get a room this user is invited to.
    pub fn get_invited_room(&self, room_id: &RoomId) -> Option<StrippedRoom> {
        self.base_client().get_invited_room(room_id)
    }

    /// All the rooms this user is invited to.
    pub fn invited_rooms(&self) -> Vec<StrippedRoom> {
        self.base_client().invited_rooms()
    }

    /// Children of joined spaces that the user didn't join yet.
    pub fn space_children(&self) -> Vec<StrippedRoom> {
        self.base_client().space_children()
    }

    /// Refresh the access token.
    ///
    /// When support for [refreshing access tokens] is activated on both the
    /// homeserver and the client, access tokens have an expiration date and
    /// need to be refreshed periodically. To activate support for refresh
    /// tokens in the [`Client`], it needs to be done at login with the
    /// `refresh_token` parameter.
    ///
    /// This method doesn't need to be called if
    /// [`ClientBuilder::handle_refresh_tokens()`] is called during construction
    /// of the `Client`. Otherwise, it should be called once when a refresh
    /// token is available and an `M_UNKNOWN_TOKEN` error is received. If this
    /// call fails with another `M_UNKNOWN_TOKEN` error, it means that the
    /// session needs to be logged in again.
    ///
    /// If a refresh is already in flight, this waits for it and returns its
    /// outcome instead of starting another one.
    ///
    /// [refreshing access tokens]: https://spec.matrix.org/v1.3/client-server-api/#refreshing-access-tokens
    pub async fn refresh_access_token(&self) -> Result<(), RefreshTokenError> {
        let Some(access_token) = self.access_token() else {
            return Err(RefreshTokenError::RefreshTokenRequired);
        };

        let lock = self.inner.refresh_token_lock.try_lock().ok();

        if let Some(mut guard) = lock {
            let result = self.send_refresh_request().await;
            *guard = Some((access_token, result.clone()));
            result
        } else {
            match &*self.inner.refresh_token_lock.lock().await {
                Some((_, result)) => result.clone(),
                None => Ok(()),
            }
        }
    }

    /// Refresh the access token because the server rejected `failed_token`.
    ///
    /// Concurrent callers that saw the same token fail share one refresh.
    async fn refresh_after_unknown_token(&self, failed_token: &str) -> Result<(), RefreshTokenError> {
        let mut guard = self.inner.refresh_token_lock.lock().await;

        if self.access_token().as_deref() != Some(failed_token) {
            debug!("The access token was refreshed in the meantime");
            return Ok(());
        }

        if let Some((token, result)) = &*guard {
            if token == failed_token {
                return result.clone();
            }
        }

        let result = self.send_refresh_request().await;
        *guard = Some((failed_token.to_owned(), result.clone()));

        result
    }

    async fn send_refresh_request(&self) -> Result<(), RefreshTokenError> {
        let Some(tokens) = self.session_tokens() else {
            return Err(RefreshTokenError::RefreshTokenRequired);
        };
        let refresh_token =
            tokens.refresh_token.clone().ok_or(RefreshTokenError::RefreshTokenRequired)?;

        let request = ApiRequest {
            method: Method::POST,
            url: self.endpoint(&["refresh"], &[]).map_err(|e| RefreshTokenError::Http(e.into()))?,
            body: Some(Bytes::from(json!({ "refresh_token": refresh_token }).to_string())),
            expected_statuses: &[StatusCode::OK],
        };

        // The refresh request never triggers another refresh.
        let response = self
            .inner
            .http_client
            .send(request, None, self.request_config().skip_auth())
            .await
            .map_err(|e| RefreshTokenError::Http(e.into()))?;

        let response: RefreshResponse = serde_json::from_slice(response.body())
            .map_err(|e| RefreshTokenError::InvalidResponse(e.into()))?;

        self.inner.session_tokens.set(Some(SessionTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(tokens.refresh_token),
        }));

        info!("Refreshed the access token");

        Ok(())
    }

    /// The URL of a client API endpoint of the homeserver.
    pub(crate) fn endpoint(&self, path: &[&str], query: &[(&str, String)]) -> HttpResult<Url> {
        let mut url = self.homeserver().clone();

        url.path_segments_mut()
            .map_err(|_| HttpError::InvalidHomeserverUrl)?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(path);

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        Ok(url)
    }

    /// Call a client API endpoint of the homeserver.
    ///
    /// Rate limited calls and transport errors are retried, see
    /// [`RequestConfig`]. If the access token was soft logged out and the
    /// client handles refresh tokens, the token is refreshed and the call is
    /// made once more. Any other `401` fails with [`HttpError::Unauthorized`]
    /// and is broadcast to [`Client::subscribe_to_unknown_token_errors`].
    pub(crate) async fn call(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        body: Option<&JsonValue>,
        expected_statuses: &[StatusCode],
        config: Option<RequestConfig>,
    ) -> HttpResult<http::Response<Bytes>> {
        let config = config.unwrap_or(self.inner.http_client.request_config);
        let url = self.endpoint(path, query)?;
        let body = body.map(|b| serde_json::to_vec(b).map(Bytes::from)).transpose()?;

        let request = |url: Url| ApiRequest {
            method: method.clone(),
            url,
            body: body.clone(),
            expected_statuses,
        };

        let access_token = self.access_token();
        if access_token.is_none() && !config.skip_auth {
            return Err(HttpError::AuthenticationRequired);
        }

        let response = self
            .inner
            .http_client
            .send(request(url.clone()), access_token.as_deref(), config)
            .await;

        let Err(HttpError::Api(error)) = &response else {
            return response;
        };

        if error.status != StatusCode::UNAUTHORIZED {
            return response;
        }

        let soft_logout = matches!(error.kind(), Some(ErrorKind::UnknownToken { soft_logout: true }));
        let can_refresh = self.inner.handle_refresh_tokens
            && !config.skip_auth
            && self.session_tokens().is_some_and(|t| t.refresh_token.is_some());

        match access_token {
            Some(failed_token) if soft_logout && can_refresh => {
                debug!("The access token was soft logged out, refreshing it");

                if let Err(refresh_error) = self.refresh_after_unknown_token(&failed_token).await {
                    self.broadcast_unknown_token(error);
                    return Err(refresh_error.into());
                }

                let response = self
                    .inner
                    .http_client
                    .send(request(url), self.access_token().as_deref(), config)
                    .await;

                self.handle_unauthorized(response)
            }
            _ => self.handle_unauthorized(response),
        }
    }

    fn handle_unauthorized(
        &self,
        response: HttpResult<http::Response<Bytes>>,
    ) -> HttpResult<http::Response<Bytes>> {
        match response {
            Err(HttpError::Api(error)) if error.status == StatusCode::UNAUTHORIZED => {
                self.broadcast_unknown_token(&error);
                Err(HttpError::Unauthorized(error))
            }
            response => response,
        }
    }

    fn broadcast_unknown_token(&self, error: &ApiError) {
        if let Some(ErrorKind::UnknownToken { soft_logout }) = error.kind() {
            warn!(soft_logout, "The access token was rejected");
            _ = self.inner.unknown_token_error_sender.send(UnknownToken { soft_logout });
        }
    }
}

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


//! Error conditions.

use std::{sync::Arc, time::Duration};

use as_variant::as_variant;
use bytes::Bytes;
use http::StatusCode;
use matrix_sync_base::{Error as SdkBaseError, StoreError, crypto::CryptoError};
use reqwest::Error as ReqwestError;
use ruma::OwnedRoomId;
use serde::Deserialize;
use serde_json::Error as JsonError;
use thiserror::Error;
use tokio::task::JoinError;
use url::ParseError as UrlParseError;

/// Result type of the matrix-sync crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result type of a pure HTTP request.
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// The `errcode` of a standard client API error body, with the fields of the
/// kinds this crate reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// `M_UNKNOWN_TOKEN`
    UnknownToken {
        /// The session can be resumed with a refresh token.
        soft_logout: bool,
    },
    /// `M_LIMIT_EXCEEDED`
    LimitExceeded {
        /// How long the server wants us to wait before retrying.
        retry_after: Option<Duration>,
    },
    /// `M_NOT_FOUND`
    NotFound,
    /// Any other `errcode`.
    Other(String),
}

#[derive(Deserialize)]
struct StandardErrorBody {
    errcode: String,
    #[serde(default)]
    soft_logout: bool,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

/// A response of the homeserver with a status the caller didn't expect.
#[derive(Clone, Debug, Error)]
#[error("the server returned {status}: {}", String::from_utf8_lossy(body))]
pub struct ApiError {
    pub status: StatusCode,
    /// The raw response body.
    pub body: Bytes,
}

impl ApiError {
    pub fn new(status: StatusCode, body: Bytes) -> Self {
        Self { status, body }
    }

    /// The kind of the error, if the body is a standard client API error.
    pub fn kind(&self) -> Option<ErrorKind> {
        let body: StandardErrorBody = serde_json::from_slice(&self.body).ok()?;

        Some(match body.errcode.as_str() {
            "M_UNKNOWN_TOKEN" => ErrorKind::UnknownToken { soft_logout: body.soft_logout },
            "M_LIMIT_EXCEEDED" => ErrorKind::LimitExceeded {
                retry_after: body.retry_after_ms.map(Duration::from_millis),
            },
            "M_NOT_FOUND" => ErrorKind::NotFound,
            _ => ErrorKind::Other(body.errcode),
        })
    }
}

/// An HTTP error, representing either a connection error or a response the
/// caller didn't expect.
#[derive(Error, Debug)]
pub enum HttpError {
    /// An error at the HTTP layer.
    #[error(transparent)]
    Reqwest(#[from] ReqwestError),

    /// The request couldn't be built.
    #[error(transparent)]
    Http(#[from] http::Error),

    /// The body of the request couldn't be serialized.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// Queried endpoint requires authentication but was called on an anonymous
    /// client.
    #[error("the queried endpoint requires authentication but was called before logging in")]
    AuthenticationRequired,

    /// The homeserver URL can't have path segments appended.
    #[error("the homeserver URL can't be used as a base URL")]
    InvalidHomeserverUrl,

    /// The server answered with a status nobody handles.
    #[error(transparent)]
    Api(ApiError),

    /// The access token isn't valid anymore and couldn't be refreshed.
    #[error("the access token was rejected: {0}")]
    Unauthorized(ApiError),

    /// The request was retried as often as allowed.
    #[error("giving up after {retries} retries, last error: {last_error}")]
    RetryLimitExceeded {
        retries: u64,
        last_error: Box<HttpError>,
    },

    /// An error occurred while refreshing the access token.
    #[error(transparent)]
    RefreshToken(#[from] RefreshTokenError),
}

impl HttpError {
    /// If `self` is an [`ApiError`], in any of the variants carrying one,
    /// returns it.
    pub fn as_api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) | Self::Unauthorized(e) => Some(e),
            Self::RetryLimitExceeded { last_error, .. } => last_error.as_api_error(),
            _ => None,
        }
    }

    /// The kind of the client API error the server returned, if any.
    pub fn client_api_error_kind(&self) -> Option<ErrorKind> {
        self.as_api_error().and_then(ApiError::kind)
    }

    /// The status code of the response, if there was one.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.as_api_error().map(|e| e.status)
    }
}

/// Errors that can happen when refreshing an access token.
///
/// This is usually only returned by [`Client::refresh_access_token()`], unless
/// [handling refresh tokens] is activated for the `Client`.
///
/// [`Client::refresh_access_token()`]: crate::Client::refresh_access_token()
/// [handling refresh tokens]: crate::ClientBuilder::handle_refresh_tokens()
#[derive(Debug, Error, Clone)]
pub enum RefreshTokenError {
    /// Tried to send a refresh token request without a refresh token.
    #[error("missing refresh token")]
    RefreshTokenRequired,

    /// The refresh request failed.
    #[error("the access token couldn't be refreshed: {0}")]
    Http(Arc<HttpError>),

    /// The refresh response couldn't be parsed.
    #[error("the refresh response is malformed: {0}")]
    InvalidResponse(Arc<JsonError>),
}

/// Internal representation of errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Error doing an HTTP request.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A JSON payload couldn't be (de)serialized.
    #[error(transparent)]
    SerdeJson(#[from] JsonError),

    /// An error occurred in the state store.
    #[error(transparent)]
    StateStore(#[from] StoreError),

    /// The cryptographic engine failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// An event couldn't be decrypted.
    #[error("the event couldn't be decrypted: {0}")]
    Decryption(CryptoError),

    /// The room isn't known to the client.
    #[error("the room {0} isn't known")]
    UnknownRoom(OwnedRoomId),

    /// The room is encrypted but the client has no cryptographic engine.
    #[error("the room is encrypted but no crypto engine is configured")]
    NoCryptoEngine,

    /// The history visibility of a room couldn't be determined, so it isn't
    /// known who may receive the room key.
    #[error("the history visibility of the room couldn't be determined")]
    UndeterminedHistoryVisibility,

    /// The sync this call was waiting for failed.
    #[error("the shared sync failed: {0}")]
    SharedSync(Arc<Error>),

    /// The task running a sync cycle panicked.
    #[error("the sync task didn't finish: {0}")]
    SyncTask(#[from] JoinError),
}

impl Error {
    /// If `self` is an HTTP error, or a shared sync that failed because of
    /// one, returns it.
    pub fn as_http_error(&self) -> Option<&HttpError> {
        match self {
            Self::Http(e) => Some(e),
            Self::SharedSync(e) => e.as_http_error(),
            _ => None,
        }
    }

    /// The kind of the client API error the server returned, if any.
    pub fn client_api_error_kind(&self) -> Option<ErrorKind> {
        self.as_http_error().and_then(HttpError::client_api_error_kind)
    }

    /// If `self` is a failed shared sync, returns the error of the sync.
    pub fn as_shared_sync_error(&self) -> Option<&Error> {
        as_variant!(self, Self::SharedSync).map(|e| &**e)
    }
}

impl From<SdkBaseError> for Error {
    fn from(e: SdkBaseError) -> Self {
        match e {
            SdkBaseError::StateStore(e) => Self::StateStore(e),
            SdkBaseError::Crypto(e) => Self::Crypto(e),
            SdkBaseError::Json(e) => Self::SerdeJson(e),
            SdkBaseError::UnknownRoom(room_id) => Self::UnknownRoom(room_id),
        }
    }
}

impl From<ReqwestError> for Error {
    fn from(e: ReqwestError) -> Self {
        Error::Http(HttpError::Reqwest(e))
    }
}

/// Errors that can happen in [`ClientBuilder::build`].
///
/// [`ClientBuilder::build`]: crate::ClientBuilder::build
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// No homeserver URL was configured.
    #[error("no homeserver URL was configured")]
    MissingHomeserverUrl,

    /// The homeserver URL is invalid.
    #[error(transparent)]
    Url(#[from] UrlParseError),

    /// The homeserver URL can't be used as a base URL, e.g. `mailto:` URLs.
    #[error("the homeserver URL can't be used as a base URL")]
    InvalidHomeserverUrl,

    /// Error building the default HTTP client.
    #[error(transparent)]
    Http(#[from] HttpError),
}

impl From<ReqwestError> for ClientBuildError {
    fn from(e: ReqwestError) -> Self {
        Self::Http(HttpError::Reqwest(e))
    }
}

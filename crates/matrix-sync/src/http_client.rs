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
    num::NonZeroUsize,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, header};
use matrix_sync_base::AsyncTraitDeps;
use rand::Rng;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, field::debug, instrument, trace, warn};
use url::Url;

use crate::{
    config::RequestConfig,
    error::{ApiError, ErrorKind, HttpError},
};

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_RETRY_LIMIT: u64 = 5;
pub(crate) const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// Abstraction around the http layer. The allows implementors to use different
/// http libraries.
#[async_trait]
pub trait HttpSend: AsyncTraitDeps {
    /// The method abstracting sending request types and receiving response
    /// types.
    ///
    /// This is called by the client every time it wants to send anything to a
    /// homeserver. Implementations must not retry on their own.
    ///
    /// # Arguments
    ///
    /// * `request` - The http request to send.
    ///
    /// * `timeout` - A timeout for the full request > response cycle.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use matrix_sync::{async_trait, bytes::Bytes, HttpError, HttpSend};
    ///
    /// #[derive(Debug)]
    /// struct Client(reqwest::Client);
    ///
    /// impl Client {
    ///     async fn response_to_http_response(
    ///         &self,
    ///         mut response: reqwest::Response,
    ///     ) -> Result<http::Response<Bytes>, HttpError> {
    ///         // Convert the reqwest response to a http one.
    ///         todo!()
    ///     }
    /// }
    ///
    /// #[async_trait]
    /// impl HttpSend for Client {
    ///     async fn send_request(
    ///         &self,
    ///         request: http::Request<Bytes>,
    ///         timeout: Duration,
    ///     ) -> Result<http::Response<Bytes>, HttpError> {
    ///         Ok(self
    ///             .response_to_http_response(
    ///                 self.0
    ///                     .execute(reqwest::Request::try_from(request)?)
    ///                     .await?,
    ///             )
    ///             .await?)
    ///     }
    /// }
    /// ```
    async fn send_request(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, HttpError>;
}

#[derive(Clone, Debug)]
struct MaybeSemaphore(Arc<Option<Semaphore>>);

#[allow(dead_code)] // false-positive lint: we never use it but only hold it for the drop
struct MaybeSemaphorePermit<'a>(Option<SemaphorePermit<'a>>);

impl MaybeSemaphore {
    fn new(max: Option<NonZeroUsize>) -> Self {
        let inner = max.map(|i| Semaphore::new(i.into()));
        MaybeSemaphore(Arc::new(inner))
    }

    async fn acquire(&self) -> MaybeSemaphorePermit<'_> {
        match self.0.as_ref() {
            Some(inner) => {
                // This can only ever error if the semaphore was closed,
                // which we never do, so we can safely ignore any error case
                MaybeSemaphorePermit(inner.acquire().await.ok())
            }
            None => MaybeSemaphorePermit(None),
        }
    }
}

/// The delay to wait before retrying a rate limited request.
///
/// Without a hint from the server the delay grows by a random factor between
/// one and two on every `429`, and goes back to the initial delay on any other
/// response.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RateLimitState {
    initial: Duration,
    current: Duration,
}

impl RateLimitState {
    pub(crate) fn new(initial: Duration) -> Self {
        Self { initial, current: initial }
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    /// Record a `429` response and return how long to wait before retrying.
    pub(crate) fn on_rate_limited(&mut self, retry_after: Option<Duration>) -> Duration {
        self.on_rate_limited_with(retry_after, &mut rand::thread_rng())
    }

    fn on_rate_limited_with(&mut self, retry_after: Option<Duration>, rng: &mut impl Rng) -> Duration {
        self.current = match retry_after {
            Some(delay) => delay,
            None => {
                let current = u64::try_from(self.current.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rng.gen_range(current..=current.saturating_mul(2)))
            }
        };

        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// The raw parts of one homeserver call.
#[derive(Debug)]
pub(crate) struct ApiRequest<'a> {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
    pub expected_statuses: &'a [StatusCode],
}

#[derive(Debug)]
pub(crate) struct HttpClient {
    pub(crate) inner: Arc<dyn HttpSend>,
    pub(crate) request_config: RequestConfig,
    concurrent_request_semaphore: MaybeSemaphore,
    rate_limit: StdMutex<RateLimitState>,
    next_request_id: AtomicU64,
}

impl HttpClient {
    pub(crate) fn new(inner: Arc<dyn HttpSend>, request_config: RequestConfig) -> Self {
        HttpClient {
            inner,
            request_config,
            concurrent_request_semaphore: MaybeSemaphore::new(
                request_config.max_concurrent_requests,
            ),
            rate_limit: StdMutex::new(RateLimitState::new(request_config.rate_limit_delay)),
            next_request_id: AtomicU64::new(0),
        }
    }

    fn get_request_id(&self) -> String {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        format!("REQ-{request_id}")
    }

    fn build_request(
        request: &ApiRequest<'_>,
        access_token: Option<&str>,
    ) -> Result<http::Request<Bytes>, HttpError> {
        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str())
            .header(header::ACCEPT, "application/json");

        if let Some(access_token) = access_token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {access_token}"));
        }

        let body = match &request.body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                body.clone()
            }
            None => Bytes::new(),
        };

        Ok(builder.body(body)?)
    }

    /// Send a request until the server answers with one of the expected
    /// statuses.
    ///
    /// `429` responses and transport errors are retried up to the retry limit
    /// of the config, any other status fails with [`HttpError::Api`].
    #[instrument(
        skip(self, request, access_token, config),
        fields(method = %request.method, path = request.url.path(), request_id, status, retries)
    )]
    pub(crate) async fn send(
        &self,
        request: ApiRequest<'_>,
        access_token: Option<&str>,
        config: RequestConfig,
    ) -> Result<http::Response<Bytes>, HttpError> {
        let span = tracing::Span::current();
        span.record("request_id", self.get_request_id());

        let access_token = if config.skip_auth { None } else { access_token };
        let mut retries = 0;

        loop {
            let http_request = Self::build_request(&request, access_token)?;

            let response = {
                // will be automatically dropped at the end of this scope
                let _handle = self.concurrent_request_semaphore.acquire().await;
                self.inner.send_request(http_request, config.timeout).await
            };

            let (error, delay) = match response {
                Ok(response) => {
                    let status = response.status();
                    span.record("status", status.as_u16());

                    if request.expected_statuses.contains(&status) {
                        self.rate_limit.lock().unwrap().reset();
                        debug!("Got response");
                        return Ok(response);
                    }

                    let error = ApiError::new(status, response.into_body());

                    if status != StatusCode::TOO_MANY_REQUESTS {
                        self.rate_limit.lock().unwrap().reset();
                        debug!("Got an unexpected response: {error}");
                        return Err(HttpError::Api(error));
                    }

                    let retry_after = match error.kind() {
                        Some(ErrorKind::LimitExceeded { retry_after }) => retry_after,
                        _ => None,
                    };
                    let delay = self.rate_limit.lock().unwrap().on_rate_limited(retry_after);

                    (HttpError::Api(error), delay)
                }
                Err(error @ HttpError::Reqwest(_)) => {
                    (error, self.rate_limit.lock().unwrap().current())
                }
                Err(error) => return Err(error),
            };

            if retries >= config.retry_limit {
                if retries == 0 {
                    return Err(error);
                }

                warn!(retries, "Giving up on the request: {error}");
                return Err(HttpError::RetryLimitExceeded { retries, last_error: Box::new(error) });
            }

            retries += 1;
            span.record("retries", retries);
            trace!(delay = debug(delay), "Retrying the request after: {error}");

            tokio::time::sleep(delay).await;
        }
    }
}

async fn response_to_http_response(
    mut response: reqwest::Response,
) -> Result<http::Response<Bytes>, reqwest::Error> {
    let status = response.status();
    let headers = std::mem::take(response.headers_mut());
    let body = response.bytes().await?;

    let mut http_response = http::Response::new(body);
    *http_response.status_mut() = status;
    *http_response.headers_mut() = headers;

    Ok(http_response)
}

#[async_trait]
impl HttpSend for reqwest::Client {
    async fn send_request(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, HttpError> {
        let mut request = reqwest::Request::try_from(request)?;
        *request.timeout_mut() = Some(timeout);

        let response = self.execute(request).await?;

        Ok(response_to_http_response(response).await?)
    }
}

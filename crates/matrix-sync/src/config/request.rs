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


use std::{
    fmt::{self, Debug},
    num::NonZeroUsize,
    time::Duration,
};

use crate::http_client::{DEFAULT_RATE_LIMIT_DELAY, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_LIMIT};

/// Configuration for requests the `Client` makes.
///
/// This sets how often a request should be repeated when the server rate
/// limits us or can't be reached, and how long a single attempt is allowed to
/// take.
///
/// # Examples
///
/// ```
/// use matrix_sync::config::RequestConfig;
/// use std::time::Duration;
///
/// // Fail after a single attempt, which may take up to 30s.
/// let request_config = RequestConfig::new()
///     .disable_retry()
///     .timeout(Duration::from_secs(30));
/// ```
#[derive(Copy, Clone)]
pub struct RequestConfig {
    pub(crate) timeout: Duration,
    pub(crate) retry_limit: u64,
    pub(crate) rate_limit_delay: Duration,
    pub(crate) max_concurrent_requests: Option<NonZeroUsize>,
    pub(crate) skip_auth: bool,
}

#[cfg(not(tarpaulin_include))]
impl Debug for RequestConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { timeout, retry_limit, rate_limit_delay, max_concurrent_requests, skip_auth } =
            self;

        let mut res = fmt.debug_struct("RequestConfig");
        res.field("timeout", timeout)
            .field("retry_limit", retry_limit)
            .field("rate_limit_delay", rate_limit_delay);

        if let Some(max) = max_concurrent_requests {
            res.field("max_concurrent_requests", max);
        }

        if *skip_auth {
            res.field("skip_auth", &true);
        }

        res.finish()
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            rate_limit_delay: DEFAULT_RATE_LIMIT_DELAY,
            max_concurrent_requests: Default::default(),
            skip_auth: false,
        }
    }
}

impl RequestConfig {
    /// Create a new default `RequestConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// This is a convince method to disable the retries of a request. Setting
    /// the `retry_limit` to `0` has the same effect.
    #[must_use]
    pub fn disable_retry(mut self) -> Self {
        self.retry_limit = 0;
        self
    }

    /// The number of times a request should be retried. The default is 5.
    #[must_use]
    pub fn retry_limit(mut self, retry_limit: u64) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// The delay before the first retry of a rate limited request, if the
    /// server doesn't tell us how long to wait.
    ///
    /// Later retries wait up to twice as long as the previous one.
    #[must_use]
    pub fn rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    /// The total limit of request that are pending or run concurrently.
    /// Any additional request beyond that number will be waiting until another
    /// concurrent requests finished. Requests are queued fairly.
    #[must_use]
    pub fn max_concurrent_requests(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.max_concurrent_requests = limit;
        self
    }

    /// Set the timeout duration for all HTTP requests.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Don't send the access token, e.g. for the refresh request.
    #[must_use]
    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RequestConfig;

    #[test]
    fn smoketest() {
        let cfg = RequestConfig::new()
            .skip_auth()
            .rate_limit_delay(Duration::from_millis(250))
            .retry_limit(4)
            .timeout(Duration::from_secs(600));

        assert!(cfg.skip_auth);
        assert_eq!(cfg.retry_limit, 4);
        assert_eq!(cfg.rate_limit_delay, Duration::from_millis(250));
        assert_eq!(cfg.timeout, Duration::from_secs(600));
    }

    #[test]
    fn testing_retry_settings() {
        let mut cfg = RequestConfig::new();
        assert_eq!(cfg.retry_limit, 5);
        cfg = cfg.retry_limit(10);
        assert_eq!(cfg.retry_limit, 10);
        cfg = cfg.disable_retry();
        assert_eq!(cfg.retry_limit, 0);
    }
}

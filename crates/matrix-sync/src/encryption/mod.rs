// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! End-to-end encryption related types
//!
//! The cryptographic engine itself lives behind the [`CryptoEngine`] trait,
//! this module moves the requests it produces over the wire and hands the
//! responses back to it.

use futures_util::{StreamExt, stream};
use http::{Method, StatusCode};
use matrix_sync_base::crypto::{CryptoEngine, OutgoingRequest, OutgoingRequests};
use serde_json::json;
use tracing::{debug, instrument, trace, warn};

use crate::{Client, Error, HttpError, HttpResult, Result};

/// How many wire calls of one drain may be in flight at the same time.
const MAX_CONCURRENT_REQUESTS: usize = 20;

impl Client {
    /// Get the encryption manager of the client.
    pub fn encryption(&self) -> Encryption {
        Encryption::new(self.clone())
    }
}

/// A high-level API to manage the client's encryption.
///
/// To get this, use [`Client::encryption()`].
#[derive(Debug, Clone)]
pub struct Encryption {
    /// The underlying client.
    client: Client,
}

impl Encryption {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Whether the client was configured with a cryptographic engine.
    pub fn is_enabled(&self) -> bool {
        self.client.base_client().crypto().is_some()
    }

    /// Send out all the requests the cryptographic engine has queued up.
    ///
    /// A request that couldn't be sent is logged and stays queued in the
    /// engine, it will be picked up by the next drain. Only a failure of the
    /// engine itself is returned.
    pub async fn send_outgoing_requests(&self) -> Result<()> {
        let Some(queue) = self.client.base_client().crypto() else {
            return Ok(());
        };

        let engine = queue.acquire().await;
        let requests = engine.outgoing_requests().await?;

        self.dispatch(&*engine, requests).await?;

        Ok(())
    }

    /// Send out the queued requests before a sync.
    ///
    /// The sync might not return for quite a while due to the timeout, so
    /// anything left over from the last run, e.g. because the client was
    /// closed after a sync but before the requests were sent out, goes out
    /// first.
    #[instrument(skip(self))]
    pub(crate) async fn flush_outgoing_requests(&self) -> Result<()> {
        let Some(queue) = self.client.base_client().crypto() else {
            return Ok(());
        };

        let engine = queue.acquire().await;

        // This is needed because sometimes we need to automatically claim
        // some one-time keys to unwedge an existing Olm session.
        let mut requests = Vec::new();
        if let Some(request) = engine.get_missing_sessions(&[]).await? {
            requests.push(request);
        }
        requests.extend(engine.outgoing_requests().await?);

        self.dispatch(&*engine, requests).await?;

        Ok(())
    }

    /// Send out `requests`, failing on the first request that didn't make it.
    ///
    /// The requests that did make it are still marked as sent.
    pub(crate) async fn dispatch_strict(
        &self,
        engine: &dyn CryptoEngine,
        requests: Vec<OutgoingRequest>,
    ) -> Result<()> {
        match self.dispatch(engine, requests).await?.into_iter().next() {
            Some(error) => Err(Error::Http(error)),
            None => Ok(()),
        }
    }

    /// Send out `requests` concurrently and mark the successful ones as sent,
    /// one after another.
    ///
    /// Returns the errors of the requests that couldn't be sent. The caller
    /// must hold the ticket `engine` was obtained from.
    pub(crate) async fn dispatch(
        &self,
        engine: &dyn CryptoEngine,
        requests: Vec<OutgoingRequest>,
    ) -> Result<Vec<HttpError>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = requests.len(), "Sending out E2EE requests");

        let responses: Vec<_> = stream::iter(requests)
            .map(|request| async move {
                let response = self.send_outgoing_request(&request).await;
                (request, response)
            })
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await;

        let mut errors = Vec::new();

        for (request, response) in responses {
            match response {
                Ok(body) => {
                    engine
                        .mark_request_as_sent(request.request_id(), request.request_type(), &body)
                        .await?;
                }
                Err(error) => {
                    warn!(
                        request_id = ?request.request_id(),
                        request_type = ?request.request_type(),
                        ?error,
                        "Error when sending out an outgoing E2EE request"
                    );
                    errors.push(error);
                }
            }
        }

        Ok(errors)
    }

    /// Send a single request, returning the raw response body.
    async fn send_outgoing_request(&self, request: &OutgoingRequest) -> HttpResult<String> {
        trace!(request_id = ?request.request_id(), "Sending an outgoing E2EE request");

        let ok = &[StatusCode::OK];

        let response = match &request.request {
            OutgoingRequests::ToDevice(r) => {
                let body = json!({ "messages": r.messages });
                self.client
                    .call(
                        Method::PUT,
                        &["sendToDevice", &r.event_type, r.txn_id.as_str()],
                        &[],
                        Some(&body),
                        ok,
                        None,
                    )
                    .await?
            }
            OutgoingRequests::KeysUpload(r) => {
                self.client
                    .call(Method::POST, &["keys", "upload"], &[], Some(&r.body), ok, None)
                    .await?
            }
            OutgoingRequests::KeysQuery(r) => {
                self.client
                    .call(Method::POST, &["keys", "query"], &[], Some(&r.body), ok, None)
                    .await?
            }
            OutgoingRequests::KeysClaim(r) => {
                self.client
                    .call(Method::POST, &["keys", "claim"], &[], Some(&r.body), ok, None)
                    .await?
            }
            OutgoingRequests::KeysBackup(r) => {
                let body = json!({ "rooms": r.rooms });
                self.client
                    .call(
                        Method::PUT,
                        &["room_keys", "keys"],
                        &[("version", r.version.clone())],
                        Some(&body),
                        ok,
                        None,
                    )
                    .await?
            }
            OutgoingRequests::RoomMessage(r) => {
                self.client
                    .call(
                        Method::PUT,
                        &["rooms", r.room_id.as_str(), "send", &r.event_type, r.txn_id.as_str()],
                        &[],
                        Some(&r.content),
                        ok,
                        None,
                    )
                    .await?
            }
            OutgoingRequests::SignatureUpload(r) => {
                self.client
                    .call(
                        Method::POST,
                        &["keys", "signatures", "upload"],
                        &[],
                        Some(&r.body),
                        ok,
                        None,
                    )
                    .await?
            }
        };

        Ok(String::from_utf8_lossy(response.body()).into_owned())
    }
}

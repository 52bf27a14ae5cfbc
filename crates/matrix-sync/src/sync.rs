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

//! The long-poll `/sync` of the client, once or in a background loop.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use http::{Method, StatusCode};
pub use matrix_sync_base::sync::*;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tracing::{debug, error, instrument, trace, warn};

use crate::{
    Client, Error, Result,
    config::{SyncSettings, SyncToken},
};

/// The outcome of the sync in flight, shared by every caller waiting for it.
pub(crate) type SyncFuture = Shared<BoxFuture<'static, Result<SyncResponse, Arc<Error>>>>;

/// The state of the background sync loop.
#[derive(Debug, Default)]
pub(crate) struct BackgroundSync {
    /// Checked by the loop between two cycles.
    enabled: AtomicBool,
    /// The running loop, if any.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Synchronize the client's state with the latest state on the server.
    ///
    /// Only one sync runs at a time: if a sync is already in flight, this
    /// waits for it and returns its result instead of starting another one,
    /// the `settings` of the later call are ignored then. A caller that
    /// joined a sync which failed gets an [`Error::SharedSync`].
    ///
    /// The sync runs on its own task, it completes and advances the sync
    /// token even if every caller stops waiting for it.
    ///
    /// # Arguments
    ///
    /// * `settings` - Settings for the sync call.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use matrix_sync::{Client, config::SyncSettings};
    /// # async {
    /// # let client = Client::builder().homeserver_url("http://localhost:8080").build()?;
    /// let response = client.sync_once(SyncSettings::default()).await?;
    ///
    /// for room_id in response.rooms.joined.keys() {
    ///     println!("Got news from {room_id}");
    /// }
    /// # anyhow::Ok(()) };
    /// ```
    pub async fn sync_once(&self, settings: SyncSettings) -> Result<SyncResponse> {
        let (future, started_here) = {
            let mut in_flight = self.inner.sync_in_flight.lock().unwrap();

            match in_flight.clone() {
                Some(future) => {
                    debug!("A sync is already in flight, waiting for it");
                    (future, false)
                }
                None => {
                    let client = self.clone();
                    let task = tokio::spawn(async move {
                        let result = client.sync_cycle(settings).await.map_err(Arc::new);
                        client.inner.sync_in_flight.lock().unwrap().take();
                        result
                    });

                    let future = task
                        .map(|result| result.unwrap_or_else(|e| Err(Arc::new(e.into()))))
                        .boxed()
                        .shared();

                    *in_flight = Some(future.clone());
                    (future, true)
                }
            }
        };

        future.await.map_err(|error| {
            if started_here {
                Arc::try_unwrap(error).unwrap_or_else(Error::SharedSync)
            } else {
                Error::SharedSync(error)
            }
        })
    }

    /// One sync cycle, see [`Client::sync_once`].
    #[instrument(skip_all)]
    async fn sync_cycle(&self, settings: SyncSettings) -> Result<SyncResponse> {
        if let Err(e) = self.encryption().flush_outgoing_requests().await {
            error!(error = ?e, "Error while sending outgoing E2EE requests");
        }

        let since = match settings.token {
            SyncToken::Specific(token) => Some(token),
            SyncToken::NoToken => None,
            SyncToken::ReusePrevious => self.sync_token(),
        };

        let mut query = Vec::new();
        if let Some(since) = &since {
            query.push(("since", since.clone()));
        }
        if let Some(timeout) = settings.timeout {
            query.push(("timeout", timeout.as_millis().to_string()));
        }
        if let Some(filter) = settings.filter {
            query.push(("filter", filter));
        }
        if settings.full_state {
            query.push(("full_state", "true".to_owned()));
        }
        query.push(("set_presence", settings.set_presence.as_str().to_owned()));

        let mut request_config = self.request_config();
        if let Some(timeout) = settings.timeout {
            request_config.timeout += timeout;
        }

        trace!(?since, "Sending the sync request");

        let response = self
            .call(Method::GET, &["sync"], &query, None, &[StatusCode::OK], Some(request_config))
            .await?;
        let response: SyncEventsResponse = serde_json::from_slice(response.body())?;

        if self.sync_token().as_deref() == Some(response.next_batch.as_str()) {
            debug!("The sync token didn't change, nothing to do");
            return Ok(SyncResponse::unchanged(response.next_batch));
        }

        let to_device = self.base_client().receive_crypto_sync_changes(&response).await?;
        self.encryption().send_outgoing_requests().await?;

        let mut processed = self.base_client().receive_sync_response(response).await?;
        processed.to_device = to_device;

        Ok(processed)
    }

    /// Keep syncing in the background until
    /// [`stop_background_sync`](Self::stop_background_sync) is called.
    ///
    /// A failed sync is logged and retried after a delay, it never stops the
    /// loop. Calling this while the loop runs does nothing. After a stop, this
    /// waits for the previous loop to finish its last sync before a new one is
    /// started.
    ///
    /// # Arguments
    ///
    /// * `settings` - Settings for the sync calls. The token is only used for
    ///   the first sync, later ones continue from the previous response.
    pub async fn start_background_sync(&self, settings: SyncSettings) {
        let mut handle = self.inner.background_sync.handle.lock().await;

        if let Some(running) = &*handle {
            if !running.is_finished() && self.is_background_sync_enabled() {
                debug!("The background sync is already running");
                return;
            }
        }

        if let Some(previous) = handle.take() {
            debug!("Waiting for the previous background sync to finish");

            if let Err(e) = previous.await {
                warn!("The previous background sync didn't finish cleanly: {e}");
            }
        }

        self.inner.background_sync.enabled.store(true, Ordering::SeqCst);

        let client = self.clone();
        *handle = Some(tokio::spawn(client.background_sync_loop(settings)));
    }

    /// Stop the background sync loop.
    ///
    /// A sync in flight isn't aborted, the loop exits once it's done.
    pub fn stop_background_sync(&self) {
        debug!("Stopping the background sync");
        self.inner.background_sync.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether the background sync loop is supposed to run.
    pub fn is_background_sync_enabled(&self) -> bool {
        self.inner.background_sync.enabled.load(Ordering::SeqCst)
    }

    #[instrument(skip_all)]
    async fn background_sync_loop(self, mut settings: SyncSettings) {
        let timeout = settings.timeout;
        if settings.ignore_timeout_on_first_sync {
            settings.timeout = None;
        }

        let poll_interval = settings.poll_interval;
        let error_delay = poll_interval.max(self.request_config().rate_limit_delay);

        while self.is_background_sync_enabled() {
            match self.sync_once(settings.clone()).await {
                Ok(response) => {
                    settings.token = SyncToken::Specific(response.next_batch);
                    settings.timeout = timeout;

                    if !poll_interval.is_zero() {
                        sleep(poll_interval).await;
                    }
                }
                Err(error) => {
                    error!(?error, "The background sync failed, retrying");
                    sleep(error_delay).await;
                }
            }
        }

        debug!("The background sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches2::assert_matches;
    use matrix_sync_test::{ALICE, EventFactory, JoinedRoomBuilder, SyncResponseBuilder, test_json};
    use ruma::room_id;
    use serde_json::json;
    use wiremock::{
        Mock, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    use crate::{Error, config::SyncSettings, test_utils::logged_in_client};

    #[tokio::test]
    async fn test_sync_query_parameters() {
        let (client, server) = logged_in_client(None).await;

        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .and(query_param("since", "s1"))
            .and(query_param("timeout", "500"))
            .and(query_param("filter", "f"))
            .and(query_param("full_state", "true"))
            .and(query_param("set_presence", "offline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "next_batch": "s2" })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = SyncSettings::new()
            .token("s1")
            .timeout(Duration::from_millis(500))
            .filter("f".to_owned())
            .full_state(true)
            .set_presence(ruma::presence::PresenceState::Offline);

        let response = client.sync_once(settings).await.unwrap();

        assert_eq!(response.next_batch, "s2");
        assert_eq!(client.sync_token().as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_the_token() {
        let (client, server) = logged_in_client(None).await;
        let mut builder = SyncResponseBuilder::new();
        builder.set_next_batch("s1");

        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(builder.build_json_sync_response()),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        client.sync_once(SyncSettings::default()).await.unwrap();

        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(ResponseTemplate::new(404).set_body_json(&*test_json::NOT_FOUND))
            .mount(&server)
            .await;

        let error = client.sync_once(SyncSettings::default()).await.unwrap_err();
        assert_matches!(error, Error::Http(_));
        assert_eq!(client.sync_token().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_malformed_sync_response_keeps_the_token() {
        let (client, server) = logged_in_client(None).await;

        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rooms": {} })))
            .mount(&server)
            .await;

        let error = client.sync_once(SyncSettings::default()).await.unwrap_err();
        assert_matches!(error, Error::SerdeJson(_));
        assert_eq!(client.sync_token(), None);
    }

    #[tokio::test]
    async fn test_sync_populates_rooms() {
        let (client, server) = logged_in_client(None).await;
        let room_id = room_id!("!r:x");

        let f = EventFactory::new();
        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(
            JoinedRoomBuilder::new(room_id)
                .add_state_event(f.create(&ALICE, "11"))
                .add_state_event(f.room_name("Test")),
        );

        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(builder.build_json_sync_response()),
            )
            .mount(&server)
            .await;

        let response = client.sync_once(SyncSettings::default()).await.unwrap();

        assert!(response.rooms.joined.contains_key(room_id));

        let room = client.get_room(room_id).unwrap();
        assert_eq!(room.version().unwrap().as_str(), "11");
        assert_eq!(room.name().as_deref(), Some("Test"));
    }
}

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

//! High-level room API

use std::ops::Deref;

use http::{Method, StatusCode};
use matrix_sync_base::{
    Room as BaseRoom,
    crypto::{ClearEvent, CryptoError, EncryptionSettings},
    deserialized_responses::{EncryptionInfo, TimelineEvent},
    events::{
        AnySyncTimelineEvent, HistoryVisibility, RoomHistoryVisibilityEventContent,
        SyncStateEvent,
    },
};
use ruma::{OwnedDeviceId, OwnedEventId, RoomId, TransactionId, UserId, serde::Raw};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue, value::to_raw_value};
use tracing::{debug, instrument, warn};

use crate::{Client, Error, Result};

#[derive(Deserialize)]
struct MembersResponse {
    chunk: Vec<Raw<SyncStateEvent>>,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: OwnedEventId,
}

/// A joined room, with the client attached to talk to the homeserver about
/// it.
#[derive(Debug, Clone)]
pub struct Room {
    inner: BaseRoom,
    pub(crate) client: Client,
}

impl Deref for Room {
    type Target = BaseRoom;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Room {
    pub(crate) fn new(client: Client, room: BaseRoom) -> Self {
        Self { inner: room, client }
    }

    /// Get the client this room belongs to.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Sync the member list with the server.
    #[instrument(skip_all, fields(room_id = ?self.room_id()))]
    pub async fn sync_members(&self) -> Result<()> {
        let response = self
            .client
            .call(
                Method::GET,
                &["rooms", self.room_id().as_str(), "members"],
                &[],
                None,
                &[StatusCode::OK],
                None,
            )
            .await?;
        let response: MembersResponse = serde_json::from_slice(response.body())?;

        debug!(count = response.chunk.len(), "Received the member list");

        self.client.base_client().receive_members(self.room_id(), &response.chunk).await?;

        Ok(())
    }

    /// The history visibility of the room, asking the homeserver if no
    /// `m.room.history_visibility` event was seen yet.
    ///
    /// Fails with [`Error::UndeterminedHistoryVisibility`] if the setting
    /// can't be fetched or isn't one of the known ones.
    async fn history_visibility_or_fetch(&self) -> Result<HistoryVisibility> {
        let history_visibility = match self.history_visibility() {
            Some(history_visibility) => history_visibility,
            None => self.fetch_history_visibility().await?,
        };

        if !history_visibility.is_known() {
            warn!(
                history_visibility = history_visibility.as_str(),
                "Unknown history visibility, not sharing the room key"
            );
            return Err(Error::UndeterminedHistoryVisibility);
        }

        Ok(history_visibility)
    }

    async fn fetch_history_visibility(&self) -> Result<HistoryVisibility> {
        let response = self
            .client
            .call(
                Method::GET,
                &["rooms", self.room_id().as_str(), "state", "m.room.history_visibility", ""],
                &[],
                None,
                &[StatusCode::OK],
                None,
            )
            .await;

        match response {
            Ok(response) => serde_json::from_slice::<RoomHistoryVisibilityEventContent>(
                response.body(),
            )
            .map(|content| content.history_visibility)
            .map_err(|e| {
                warn!("The history visibility of the room is malformed: {e}");
                Error::UndeterminedHistoryVisibility
            }),
            // Rooms without the event use the protocol default.
            Err(e) if e.status_code() == Some(StatusCode::NOT_FOUND) => {
                Ok(HistoryVisibility::default())
            }
            Err(e) => {
                warn!("Couldn't fetch the history visibility of the room: {e}");
                Err(Error::UndeterminedHistoryVisibility)
            }
        }
    }

    /// Send an event of the given type to this room.
    ///
    /// If the room is encrypted, the event is encrypted first. This makes sure
    /// every member that may read it has a 1:1 session and got the current
    /// room key, and creates a new room key if the last one was discarded.
    ///
    /// Returns the ID of the sent event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of the event, e.g. `m.room.message`.
    ///
    /// * `content` - The content of the event.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use matrix_sync::{Client, ruma::room_id};
    /// # use serde_json::json;
    /// # async {
    /// # let client = Client::builder().homeserver_url("http://localhost:8080").build()?;
    /// # let room_id = room_id!("!test:localhost");
    /// if let Some(room) = client.get_room(room_id) {
    ///     let content = json!({ "msgtype": "m.text", "body": "Hello world" });
    ///     room.send("m.room.message", content).await?;
    /// }
    /// # anyhow::Ok(()) };
    /// ```
    #[instrument(skip(self, content), fields(room_id = ?self.room_id()))]
    pub async fn send(&self, event_type: &str, content: JsonValue) -> Result<OwnedEventId> {
        let Some(encryption) = self.encryption_settings() else {
            return self.send_raw(event_type, &content).await;
        };

        let queue = self.client.base_client().crypto().ok_or(Error::NoCryptoEngine)?;

        if !self.are_members_synced() {
            self.sync_members().await?;
        }

        let history_visibility = self.history_visibility_or_fetch().await?;
        let plaintext = serde_json::to_string(&content)?;

        let encrypted = {
            let engine = queue.acquire().await;
            let dispatcher = self.client.encryption();

            // Membership changes are published while the sync holds the
            // engine, so the member list is only read with the ticket in hand.
            let mut recipients = self.joined_user_ids();
            if history_visibility != HistoryVisibility::Joined {
                recipients.extend(self.invited_user_ids());
            }

            let settings = EncryptionSettings::new(&encryption, history_visibility);

            if let Some(request) = engine.get_missing_sessions(&recipients).await? {
                dispatcher.dispatch(&*engine, vec![request]).await?;
            }

            let requests = engine.share_room_key(self.room_id(), &recipients, settings).await?;

            // Using a room key that didn't reach everyone would produce
            // undecryptable messages.
            if let Err(e) = dispatcher.dispatch_strict(&*engine, requests).await {
                warn!("Couldn't share the room key, discarding it");
                engine.discard_room_key(self.room_id()).await?;
                return Err(e);
            }

            engine.encrypt(self.room_id(), event_type, &plaintext).await?
        };

        let encrypted: JsonValue = serde_json::from_str(&encrypted)?;

        self.send_raw("m.room.encrypted", &encrypted).await
    }

    /// Send an event to the room as is, without encrypting it.
    async fn send_raw(&self, event_type: &str, content: &JsonValue) -> Result<OwnedEventId> {
        let txn_id = TransactionId::new();

        let response = self
            .client
            .call(
                Method::PUT,
                &["rooms", self.room_id().as_str(), "send", event_type, txn_id.as_str()],
                &[],
                Some(content),
                &[StatusCode::OK],
                None,
            )
            .await?;
        let response: SendResponse = serde_json::from_slice(response.body())?;

        Ok(response.event_id)
    }

    /// Try to decrypt a timeline event of this room.
    ///
    /// Events that aren't `m.room.encrypted` are returned as they are. A
    /// decrypted event keeps the ID, timestamp and sender of the original, with
    /// the type and content of the plaintext.
    ///
    /// Fails with [`Error::Decryption`] if the cryptographic engine can't
    /// decrypt the event, e.g. because the room key was withheld.
    #[instrument(skip_all, fields(room_id = ?self.room_id()))]
    pub async fn decrypt_event(&self, event: &Raw<AnySyncTimelineEvent>) -> Result<TimelineEvent> {
        if event.get_field::<String>("type")?.as_deref() != Some("m.room.encrypted") {
            return Ok(TimelineEvent::new(event.clone()));
        }

        let queue = self.client.base_client().crypto().ok_or(Error::NoCryptoEngine)?;

        let decrypted = {
            let engine = queue.acquire().await;
            engine
                .decrypt_room_event(event.json().get(), self.room_id())
                .await
                .map_err(Error::Decryption)?
        };

        let clear: ClearEvent = serde_json::from_str(&decrypted.clear_event)
            .map_err(|e| Error::Decryption(CryptoError::Json(e)))?;

        let mut event: JsonMap<String, JsonValue> = serde_json::from_str(event.json().get())?;

        let sender =
            event.get("sender").and_then(JsonValue::as_str).and_then(|s| UserId::parse(s).ok());
        let sender_device = event
            .get("content")
            .and_then(|c| c.get("device_id"))
            .and_then(JsonValue::as_str)
            .map(OwnedDeviceId::from);

        event.insert("type".to_owned(), clear.event_type.into());
        event.insert("content".to_owned(), clear.content);
        event.remove("state_key");

        Ok(TimelineEvent {
            event: Raw::from_json(to_raw_value(&event)?),
            encryption_info: Some(EncryptionInfo {
                sender_curve25519_key: decrypted.sender_curve25519_key,
                claimed_ed25519_key: decrypted.claimed_ed25519_key,
                forwarding_curve25519_key_chain: decrypted.forwarding_curve25519_chain,
                sender,
                sender_device,
            }),
        })
    }
}

impl Client {
    /// Send an event to the joined room with the given ID, encrypting it if
    /// the room is encrypted.
    ///
    /// See [`Room::send`].
    pub async fn send_message_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId> {
        let room = self.get_room(room_id).ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;
        room.send(event_type, content).await
    }

    /// Decrypt an event of the joined room with the given ID.
    ///
    /// See [`Room::decrypt_event`].
    pub async fn decrypt_message_event(
        &self,
        room_id: &RoomId,
        event: &Raw<AnySyncTimelineEvent>,
    ) -> Result<TimelineEvent> {
        let room = self.get_room(room_id).ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;
        room.decrypt_event(event).await
    }
}

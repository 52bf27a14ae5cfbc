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

//! The contract between the sync client and the cryptographic engine.
//!
//! The engine is an opaque state machine owning all Olm/Megolm session
//! material. It hands out [`OutgoingRequest`]s, learns about their outcome
//! through [`CryptoEngine::mark_request_as_sent`], and encrypts or decrypts
//! room events on demand. Payloads cross the boundary as serialized JSON,
//! which keeps the contract independent of any particular engine.
//!
//! The engine is not safe for concurrent mutation, so the client only ever
//! touches it through a [`CryptoRequestQueue`].

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{
    AsyncTraitDeps,
    events::{HistoryVisibility, RoomEncryptionEventContent},
};

mod queue;

pub use queue::{CryptoRequestQueue, CryptoTicket};
pub use crate::sync::DeviceLists;

/// Errors the cryptographic engine can report.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The engine couldn't process the to-device events or device-list changes
    /// of a sync.
    #[error("the engine failed to ingest the sync changes: {0}")]
    Ingestion(String),

    /// An event couldn't be encrypted, e.g. because no room key was shared.
    #[error("the event couldn't be encrypted: {0}")]
    Encryption(String),

    /// An event couldn't be decrypted, e.g. because the room key is unknown or
    /// was withheld.
    #[error("the event couldn't be decrypted: {0}")]
    Decryption(String),

    /// The engine doesn't know the request that was marked as sent.
    #[error("unknown outgoing request {0}")]
    UnknownRequest(OwnedTransactionId),

    /// A payload handed to or returned by the engine was malformed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The engine's own storage failed.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// The kind of an [`OutgoingRequest`], reported back with its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    KeysQuery,
    KeysClaim,
    KeysUpload,
    ToDevice,
    SignatureUpload,
    KeysBackup,
    RoomMessage,
}

/// `PUT /_matrix/client/v3/sendToDevice/{eventType}/{txnId}`
#[derive(Clone, Debug, PartialEq)]
pub struct ToDeviceRequest {
    pub event_type: String,
    pub txn_id: OwnedTransactionId,
    /// `user id -> device id (or "*") -> content`
    pub messages: JsonValue,
}

/// `POST /_matrix/client/v3/keys/upload`
#[derive(Clone, Debug, PartialEq)]
pub struct KeysUploadRequest {
    pub body: JsonValue,
}

/// `POST /_matrix/client/v3/keys/query`
#[derive(Clone, Debug, PartialEq)]
pub struct KeysQueryRequest {
    pub body: JsonValue,
}

/// `POST /_matrix/client/v3/keys/claim`
#[derive(Clone, Debug, PartialEq)]
pub struct KeysClaimRequest {
    pub body: JsonValue,
}

/// `PUT /_matrix/client/v3/room_keys/keys?version={version}`
#[derive(Clone, Debug, PartialEq)]
pub struct KeysBackupRequest {
    pub version: String,
    /// `room id -> { sessions: session id -> key backup data }`
    pub rooms: JsonValue,
}

/// `PUT /_matrix/client/v3/rooms/{roomId}/send/{eventType}/{txnId}`
///
/// The content is sent as-is, the engine already prepared it.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomMessageRequest {
    pub room_id: OwnedRoomId,
    pub txn_id: OwnedTransactionId,
    pub event_type: String,
    pub content: JsonValue,
}

/// `POST /_matrix/client/v3/keys/signatures/upload`
#[derive(Clone, Debug, PartialEq)]
pub struct SignatureUploadRequest {
    pub body: JsonValue,
}

/// The payload of an [`OutgoingRequest`].
#[derive(Clone, Debug, PartialEq)]
pub enum OutgoingRequests {
    ToDevice(ToDeviceRequest),
    KeysUpload(KeysUploadRequest),
    KeysQuery(KeysQueryRequest),
    KeysClaim(KeysClaimRequest),
    KeysBackup(KeysBackupRequest),
    RoomMessage(RoomMessageRequest),
    SignatureUpload(SignatureUploadRequest),
}

/// A request the engine needs sent to the homeserver.
///
/// It stays pending inside the engine until it's marked as sent, so a request
/// whose wire call failed is handed out again by the next
/// [`CryptoEngine::outgoing_requests`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingRequest {
    /// The unique id of the request, assigned by the engine.
    pub request_id: OwnedTransactionId,
    pub request: OutgoingRequests,
}

impl OutgoingRequest {
    pub fn new(request_id: OwnedTransactionId, request: OutgoingRequests) -> Self {
        Self { request_id, request }
    }

    pub fn request_id(&self) -> &TransactionId {
        &self.request_id
    }

    pub fn request_type(&self) -> RequestType {
        match &self.request {
            OutgoingRequests::ToDevice(_) => RequestType::ToDevice,
            OutgoingRequests::KeysUpload(_) => RequestType::KeysUpload,
            OutgoingRequests::KeysQuery(_) => RequestType::KeysQuery,
            OutgoingRequests::KeysClaim(_) => RequestType::KeysClaim,
            OutgoingRequests::KeysBackup(_) => RequestType::KeysBackup,
            OutgoingRequests::RoomMessage(_) => RequestType::RoomMessage,
            OutgoingRequests::SignatureUpload(_) => RequestType::SignatureUpload,
        }
    }
}

/// The result of [`CryptoEngine::receive_sync_changes`].
#[derive(Clone, Debug, Default)]
pub struct SyncChangesResult {
    /// The, now possibly decrypted, to-device events, serialized.
    pub to_device_events: Vec<String>,
}

/// A decrypted room event, as returned by the engine.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The minimal clear event: `{ "type": ..., "content": ... }`.
    pub clear_event: String,
    pub sender_curve25519_key: String,
    pub claimed_ed25519_key: Option<String>,
    pub forwarding_curve25519_chain: Vec<String>,
}

/// Settings for a new outgoing group session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionSettings {
    pub algorithm: String,
    /// How long the session should be used before rotating it.
    pub rotation_period: Duration,
    /// How many messages should be sent before rotating the session.
    pub rotation_period_msgs: u64,
    /// Decides which members receive the room key.
    pub history_visibility: HistoryVisibility,
    /// Only share the room key with trusted devices.
    pub only_allow_trusted_devices: bool,
}

impl EncryptionSettings {
    /// The default rotation period of a group session, one week.
    pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(60 * 60 * 24 * 7);
    /// The default number of messages encrypted with one group session.
    pub const DEFAULT_ROTATION_PERIOD_MSGS: u64 = 100;

    /// Create settings from the room's `m.room.encryption` content.
    pub fn new(content: &RoomEncryptionEventContent, history_visibility: HistoryVisibility) -> Self {
        Self {
            algorithm: content.algorithm.clone(),
            rotation_period: content
                .rotation_period_ms
                .map(Duration::from_millis)
                .unwrap_or(Self::DEFAULT_ROTATION_PERIOD),
            rotation_period_msgs: content
                .rotation_period_msgs
                .unwrap_or(Self::DEFAULT_ROTATION_PERIOD_MSGS),
            history_visibility,
            only_allow_trusted_devices: false,
        }
    }
}

/// Serialized one-time key counts, keyed by algorithm.
pub type OneTimeKeyCounts = BTreeMap<String, u64>;

/// The cryptographic engine, seen from the sync client.
///
/// Implementations are expected to be driven by one caller at a time, see
/// [`CryptoRequestQueue`].
#[async_trait]
pub trait CryptoEngine: AsyncTraitDeps {
    /// Get the requests that need to be sent to the homeserver.
    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>, CryptoError>;

    /// Mark a request as sent, handing over the raw response body.
    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        request_type: RequestType,
        response_body: &str,
    ) -> Result<(), CryptoError>;

    /// Feed the E2EE related parts of a sync response into the engine.
    ///
    /// `to_device_events` is a serialized JSON array.
    async fn receive_sync_changes(
        &self,
        to_device_events: String,
        device_changes: DeviceLists,
        one_time_key_counts: OneTimeKeyCounts,
        unused_fallback_keys: Option<Vec<String>>,
    ) -> Result<SyncChangesResult, CryptoError>;

    /// Encrypt the serialized `content` of an event of the given type for the
    /// room, returning the serialized `m.room.encrypted` content.
    async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &str,
    ) -> Result<String, CryptoError>;

    /// Decrypt a serialized `m.room.encrypted` event of the given room.
    async fn decrypt_room_event(
        &self,
        event: &str,
        room_id: &RoomId,
    ) -> Result<DecryptedRoomEvent, CryptoError>;

    /// Get a key claim request for users we don't have 1:1 sessions with yet.
    async fn get_missing_sessions(
        &self,
        users: &[OwnedUserId],
    ) -> Result<Option<OutgoingRequest>, CryptoError>;

    /// Get the to-device requests that share the room key of the current
    /// group session of the room with the given users, creating a new session
    /// if there's none.
    async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        settings: EncryptionSettings,
    ) -> Result<Vec<OutgoingRequest>, CryptoError>;

    /// Invalidate the current group session of the room, the next
    /// [`share_room_key`](Self::share_room_key) call creates a new one.
    async fn discard_room_key(&self, room_id: &RoomId) -> Result<(), CryptoError>;

    /// Start tracking the devices of the given users.
    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> Result<(), CryptoError>;
}

/// Users whose membership in some room changed during one sync.
#[derive(Debug, Default)]
pub(crate) struct MembershipChanges {
    /// Rooms whose group session must not be used anymore.
    pub(crate) invalidated_rooms: Vec<OwnedRoomId>,
    /// Users whose devices must be tracked.
    pub(crate) tracked_users: Vec<OwnedUserId>,
}

impl MembershipChanges {
    pub(crate) fn invalidate(&mut self, room_id: &RoomId) {
        if !self.invalidated_rooms.iter().any(|r| r == room_id) {
            self.invalidated_rooms.push(room_id.to_owned());
        }
    }

    pub(crate) fn track(&mut self, user_id: &UserId) {
        if !self.tracked_users.iter().any(|u| u == user_id) {
            self.tracked_users.push(user_id.to_owned());
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.invalidated_rooms.is_empty() && self.tracked_users.is_empty()
    }
}

/// The `{ "type", "content" }` pair inside a decrypted event.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClearEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: JsonValue,
}

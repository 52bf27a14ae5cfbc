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

//! Testing utilities for the sync client core.
//!
//! [`FakeCryptoEngine`] is a scripted, in-memory stand-in for a real
//! cryptographic engine. It "encrypts" by wrapping the serialized plaintext,
//! and it tracks group sessions, 1:1 sessions and issued requests closely
//! enough to observe how the client drives it.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, serde::Raw};
use serde_json::{Value as JsonValue, json};
use tokio::sync::Notify;

use crate::crypto::{
    ClearEvent, CryptoEngine, CryptoError, DecryptedRoomEvent, DeviceLists, EncryptionSettings,
    KeysClaimRequest, KeysQueryRequest, OneTimeKeyCounts, OutgoingRequest, OutgoingRequests,
    RequestType, SyncChangesResult, ToDeviceRequest,
};

/// Create a `Raw<T>` from arbitrary JSON.
pub fn raw<T>(json: JsonValue) -> Raw<T> {
    Raw::from_json(serde_json::value::to_raw_value(&json).expect("JSON values always serialize"))
}

/// A call the [`FakeCryptoEngine`] received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    OutgoingRequests,
    MarkRequestAsSent(OwnedTransactionId, RequestType),
    ReceiveSyncChanges { to_device_events: usize, changed: Vec<OwnedUserId> },
    Encrypt(OwnedRoomId, String),
    DecryptRoomEvent(OwnedRoomId),
    GetMissingSessions(Vec<OwnedUserId>),
    ShareRoomKey(OwnedRoomId, Vec<OwnedUserId>),
    DiscardRoomKey(OwnedRoomId),
    UpdateTrackedUsers(Vec<OwnedUserId>),
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<EngineCall>,
    /// Requests handed out by `outgoing_requests` until marked as sent.
    pending: Vec<OutgoingRequest>,
    /// Every request ever handed out and not yet marked as sent.
    issued: BTreeMap<OwnedTransactionId, RequestType>,
    claims: BTreeMap<OwnedTransactionId, Vec<OwnedUserId>>,
    sessions: BTreeSet<OwnedUserId>,
    /// Room -> users the current group session was shared with.
    group_sessions: BTreeMap<OwnedRoomId, BTreeSet<OwnedUserId>>,
    session_counter: u64,
    tracked_users: BTreeSet<OwnedUserId>,
    fail_decryption: bool,
    fail_encryption: bool,
    fail_sync_changes: bool,
    fail_tracking: bool,
    discard_pause: Option<Arc<CallPause>>,
}

/// Holds calls of the [`FakeCryptoEngine`] in the middle of their execution.
#[derive(Debug, Default)]
pub struct CallPause {
    /// Notified when a call reached the pause.
    pub reached: Notify,
    /// Notify this to let the paused call finish.
    pub release: Notify,
}

/// An in-memory [`CryptoEngine`] for tests.
#[derive(Debug, Default)]
pub struct FakeCryptoEngine {
    state: Mutex<FakeState>,
}

impl FakeCryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The serialized ciphertext this engine produces, and knows how to
    /// decrypt, for the given event.
    pub fn fake_ciphertext(event_type: &str, content: &JsonValue) -> String {
        json!({ "type": event_type, "content": content }).to_string()
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Queue a request that will be handed out by `outgoing_requests`.
    pub fn add_outgoing_request(&self, request: OutgoingRequests) -> OwnedTransactionId {
        let mut state = self.state.lock().unwrap();
        let request = OutgoingRequest::new(TransactionId::new(), request);
        let id = request.request_id.clone();

        state.issued.insert(id.clone(), request.request_type());
        state.pending.push(request);

        id
    }

    /// The requests that weren't marked as sent yet.
    pub fn pending_requests(&self) -> Vec<OutgoingRequest> {
        self.state.lock().unwrap().pending.clone()
    }

    /// Whether the room has a group session that can be used to encrypt.
    pub fn has_group_session(&self, room_id: &RoomId) -> bool {
        self.state.lock().unwrap().group_sessions.contains_key(room_id)
    }

    pub fn tracked_users(&self) -> BTreeSet<OwnedUserId> {
        self.state.lock().unwrap().tracked_users.clone()
    }

    pub fn fail_decryption(&self, fail: bool) {
        self.state.lock().unwrap().fail_decryption = fail;
    }

    pub fn fail_encryption(&self, fail: bool) {
        self.state.lock().unwrap().fail_encryption = fail;
    }

    pub fn fail_sync_changes(&self, fail: bool) {
        self.state.lock().unwrap().fail_sync_changes = fail;
    }

    /// Pause every following `discard_room_key` call, while it holds the
    /// engine, until the returned pause is released.
    pub fn pause_discards(&self) -> Arc<CallPause> {
        let pause = Arc::new(CallPause::default());
        self.state.lock().unwrap().discard_pause = Some(pause.clone());
        pause
    }

    /// Make `update_tracked_users` fail.
    pub fn fail_tracking(&self, fail: bool) {
        self.state.lock().unwrap().fail_tracking = fail;
    }
}

impl FakeState {
    fn issue(&mut self, request: OutgoingRequests) -> OutgoingRequest {
        let request = OutgoingRequest::new(TransactionId::new(), request);
        self.issued.insert(request.request_id.clone(), request.request_type());
        request
    }
}

#[async_trait]
impl CryptoEngine for FakeCryptoEngine {
    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>, CryptoError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::OutgoingRequests);
        Ok(state.pending.clone())
    }

    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        request_type: RequestType,
        response_body: &str,
    ) -> Result<(), CryptoError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::MarkRequestAsSent(request_id.to_owned(), request_type));

        // The response has to be JSON, whatever the request was.
        let _: JsonValue = serde_json::from_str(response_body)?;

        if state.issued.remove(request_id).is_none() {
            return Err(CryptoError::UnknownRequest(request_id.to_owned()));
        }

        state.pending.retain(|r| &*r.request_id != request_id);

        if let Some(users) = state.claims.remove(request_id) {
            state.sessions.extend(users);
        }

        Ok(())
    }

    async fn receive_sync_changes(
        &self,
        to_device_events: String,
        device_changes: DeviceLists,
        _one_time_key_counts: OneTimeKeyCounts,
        _unused_fallback_keys: Option<Vec<String>>,
    ) -> Result<SyncChangesResult, CryptoError> {
        let mut state = self.state.lock().unwrap();
        let events: Vec<JsonValue> = serde_json::from_str(&to_device_events)?;

        state.calls.push(EngineCall::ReceiveSyncChanges {
            to_device_events: events.len(),
            changed: device_changes.changed.clone(),
        });

        if state.fail_sync_changes {
            return Err(CryptoError::Ingestion("the store is locked".to_owned()));
        }

        if !device_changes.changed.is_empty() {
            let device_keys: BTreeMap<_, _> =
                device_changes.changed.iter().map(|u| (u.clone(), json!([]))).collect();
            let request = state.issue(OutgoingRequests::KeysQuery(KeysQueryRequest {
                body: json!({ "device_keys": device_keys }),
            }));
            state.pending.push(request);
        }

        Ok(SyncChangesResult { to_device_events: events.iter().map(|e| e.to_string()).collect() })
    }

    async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &str,
    ) -> Result<String, CryptoError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Encrypt(room_id.to_owned(), event_type.to_owned()));

        if state.fail_encryption {
            return Err(CryptoError::Encryption("the session was wedged".to_owned()));
        }

        if !state.group_sessions.contains_key(room_id) {
            return Err(CryptoError::Encryption(format!(
                "no outgoing group session for {room_id}"
            )));
        }

        let content: JsonValue = serde_json::from_str(content)?;

        Ok(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": Self::fake_ciphertext(event_type, &content),
            "sender_key": "WVZBVbMuBiCGS6XT6MuASBG4bjqSmp5Lh29Glvlbm3U",
            "device_id": "FAKEDEVICE",
            "session_id": format!("session-{}", state.session_counter),
        })
        .to_string())
    }

    async fn decrypt_room_event(
        &self,
        event: &str,
        room_id: &RoomId,
    ) -> Result<DecryptedRoomEvent, CryptoError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::DecryptRoomEvent(room_id.to_owned()));

        if state.fail_decryption {
            return Err(CryptoError::Decryption("the room key was withheld".to_owned()));
        }

        let event: JsonValue = serde_json::from_str(event)?;
        let content = &event["content"];

        let clear: ClearEvent = content["ciphertext"]
            .as_str()
            .and_then(|c| serde_json::from_str(c).ok())
            .ok_or_else(|| CryptoError::Decryption("unknown megolm session".to_owned()))?;

        Ok(DecryptedRoomEvent {
            clear_event: serde_json::to_string(&clear)?,
            sender_curve25519_key: content["sender_key"].as_str().unwrap_or_default().to_owned(),
            claimed_ed25519_key: Some("nE6W2fCblxDcOFmeEtCHNl8/l8bXcu7GKyAswA4r3mM".to_owned()),
            forwarding_curve25519_chain: Vec::new(),
        })
    }

    async fn get_missing_sessions(
        &self,
        users: &[OwnedUserId],
    ) -> Result<Option<OutgoingRequest>, CryptoError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::GetMissingSessions(users.to_vec()));

        let claiming: BTreeSet<_> = state.claims.values().flatten().cloned().collect();
        let missing: Vec<_> = users
            .iter()
            .filter(|u| !state.sessions.contains(*u) && !claiming.contains(*u))
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(None);
        }

        let one_time_keys: BTreeMap<_, _> =
            missing.iter().map(|u| (u.clone(), json!({ "*": "signed_curve25519" }))).collect();
        let request = state.issue(OutgoingRequests::KeysClaim(KeysClaimRequest {
            body: json!({ "one_time_keys": one_time_keys }),
        }));
        state.claims.insert(request.request_id.clone(), missing);

        Ok(Some(request))
    }

    async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        _settings: EncryptionSettings,
    ) -> Result<Vec<OutgoingRequest>, CryptoError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::ShareRoomKey(room_id.to_owned(), users.to_vec()));

        if !state.group_sessions.contains_key(room_id) {
            state.session_counter += 1;
        }

        let shared_with = state.group_sessions.entry(room_id.to_owned()).or_default();
        let recipients: Vec<_> = users.iter().filter(|u| !shared_with.contains(*u)).cloned().collect();

        if recipients.is_empty() {
            return Ok(Vec::new());
        }

        shared_with.extend(recipients.iter().cloned());

        let messages: BTreeMap<_, _> = recipients
            .iter()
            .map(|u| (u.clone(), json!({ "*": { "algorithm": "m.olm.v1.curve25519-aes-sha2" } })))
            .collect();
        let request = state.issue(OutgoingRequests::ToDevice(ToDeviceRequest {
            event_type: "m.room.encrypted".to_owned(),
            txn_id: TransactionId::new(),
            messages: json!(messages),
        }));

        Ok(vec![request])
    }

    async fn discard_room_key(&self, room_id: &RoomId) -> Result<(), CryptoError> {
        let pause = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(EngineCall::DiscardRoomKey(room_id.to_owned()));
            state.discard_pause.clone()
        };

        if let Some(pause) = pause {
            pause.reached.notify_one();
            pause.release.notified().await;
        }

        self.state.lock().unwrap().group_sessions.remove(room_id);
        Ok(())
    }

    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> Result<(), CryptoError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::UpdateTrackedUsers(users.to_vec()));

        if state.fail_tracking {
            return Err(CryptoError::Backend("the device list store is gone".into()));
        }

        state.tracked_users.extend(users.iter().cloned());
        Ok(())
    }
}

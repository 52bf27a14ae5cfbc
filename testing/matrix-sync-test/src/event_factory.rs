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

use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use ruma::{OwnedUserId, RoomId, UserId};
use serde_json::{Value as JsonValue, json};

use crate::ALICE;

/// A factory for sync events in their JSON form.
///
/// Every event gets a unique event ID and a strictly increasing timestamp.
#[derive(Debug)]
pub struct EventFactory {
    next_id: AtomicU64,
    sender: OwnedUserId,
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFactory {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(0), sender: (*ALICE).to_owned() }
    }

    /// Set the sender of every event created afterwards.
    pub fn sender(mut self, sender: &UserId) -> Self {
        self.sender = sender.to_owned();
        self
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, SeqCst)
    }

    /// A state event with an arbitrary type and content.
    pub fn state(&self, event_type: &str, state_key: &str, content: JsonValue) -> JsonValue {
        let n = self.next();

        json!({
            "type": event_type,
            "state_key": state_key,
            "content": content,
            "event_id": format!("$state{n}:server.name"),
            "sender": self.sender,
            "origin_server_ts": 1_700_000_000_000u64 + n,
            "unsigned": { "age": 1234 },
        })
    }

    /// A message-like event with an arbitrary type and content.
    pub fn message_like(&self, event_type: &str, content: JsonValue) -> JsonValue {
        let n = self.next();

        json!({
            "type": event_type,
            "content": content,
            "event_id": format!("$event{n}:server.name"),
            "sender": self.sender,
            "origin_server_ts": 1_700_000_000_000u64 + n,
        })
    }

    /// A stripped state event, as found in the `invite_state` of a room.
    pub fn stripped(&self, event_type: &str, state_key: &str, content: JsonValue) -> JsonValue {
        json!({
            "type": event_type,
            "state_key": state_key,
            "content": content,
            "sender": self.sender,
        })
    }

    pub fn create(&self, creator: &UserId, room_version: &str) -> JsonValue {
        self.state(
            "m.room.create",
            "",
            json!({ "creator": creator, "room_version": room_version }),
        )
    }

    pub fn member(&self, user_id: &UserId, membership: &str) -> JsonValue {
        self.state("m.room.member", user_id.as_str(), json!({ "membership": membership }))
    }

    pub fn room_name(&self, name: &str) -> JsonValue {
        self.state("m.room.name", "", json!({ "name": name }))
    }

    pub fn room_topic(&self, topic: &str) -> JsonValue {
        self.state("m.room.topic", "", json!({ "topic": topic }))
    }

    pub fn room_encryption(&self) -> JsonValue {
        self.state(
            "m.room.encryption",
            "",
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "rotation_period_ms": 604800000,
                "rotation_period_msgs": 100,
            }),
        )
    }

    pub fn history_visibility(&self, visibility: &str) -> JsonValue {
        self.state("m.room.history_visibility", "", json!({ "history_visibility": visibility }))
    }

    pub fn tombstone(&self, replacement_room: &RoomId) -> JsonValue {
        self.state(
            "m.room.tombstone",
            "",
            json!({
                "body": "This room has been replaced",
                "replacement_room": replacement_room,
            }),
        )
    }

    pub fn space_child(&self, child: &RoomId, via: &[&str]) -> JsonValue {
        self.state("m.space.child", child.as_str(), json!({ "via": via }))
    }

    pub fn text_msg(&self, body: &str) -> JsonValue {
        self.message_like("m.room.message", json!({ "msgtype": "m.text", "body": body }))
    }

    /// An `m.room.encrypted` event wrapping an opaque ciphertext.
    pub fn encrypted(&self, ciphertext: &str) -> JsonValue {
        self.message_like(
            "m.room.encrypted",
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "ciphertext": ciphertext,
                "device_id": "NFPHCMHFBA",
                "sender_key": "WVZBVbMuBiCGS6XT6MuASBG4bjqSmp5Lh29Glvlbm3U",
                "session_id": "XzhRjvoZB8yY9ZVqRrgrUxUr8O0S3T7Xcu1FU9wRYIg",
            }),
        )
    }
}

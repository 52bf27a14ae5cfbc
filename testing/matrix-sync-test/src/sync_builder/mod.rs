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

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId, UserId};
use serde_json::{Value as JsonValue, json};

mod invited_room;
mod joined_room;
mod left_room;

pub use invited_room::InvitedRoomBuilder;
pub use joined_room::JoinedRoomBuilder;
pub use left_room::LeftRoomBuilder;

/// The `SyncResponseBuilder` struct can be used to easily generate valid sync
/// responses for testing. The generated JSON can be served by a mock
/// homeserver or deserialized directly.
#[derive(Default)]
pub struct SyncResponseBuilder {
    /// Updates to joined rooms.
    joined_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Updates to invited rooms.
    invited_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Updates to left rooms.
    left_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Internal counter to enable the `next_batch` of each sync response to
    /// vary.
    batch_counter: i64,
    /// Overrides the generated `next_batch` of the next response.
    next_batch: Option<String>,
    changed_device_lists: Vec<OwnedUserId>,
    left_device_lists: Vec<OwnedUserId>,
    to_device_events: Vec<JsonValue>,
    one_time_keys_count: BTreeMap<String, u64>,
}

impl SyncResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a joined room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_joined_room(&mut self, room: JoinedRoomBuilder) -> &mut Self {
        self.invited_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.joined_rooms.insert(room.room_id.clone(), room.build());
        self
    }

    /// Add an invited room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_invited_room(&mut self, room: InvitedRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.invited_rooms.insert(room.room_id.clone(), room.build());
        self
    }

    /// Add a left room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_left_room(&mut self, room: LeftRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.invited_rooms.remove(&room.room_id);
        self.left_rooms.insert(room.room_id.clone(), room.build());
        self
    }

    pub fn add_change_device(&mut self, user_id: &UserId) -> &mut Self {
        self.changed_device_lists.push(user_id.to_owned());
        self
    }

    pub fn add_left_device(&mut self, user_id: &UserId) -> &mut Self {
        self.left_device_lists.push(user_id.to_owned());
        self
    }

    /// Add a to device event.
    pub fn add_to_device_event(&mut self, event: JsonValue) -> &mut Self {
        self.to_device_events.push(event);
        self
    }

    pub fn set_one_time_keys_count(&mut self, algorithm: &str, count: u64) -> &mut Self {
        self.one_time_keys_count.insert(algorithm.to_owned(), count);
        self
    }

    /// Use the given token as the `next_batch` of the next response instead of
    /// a generated one.
    pub fn set_next_batch(&mut self, next_batch: &str) -> &mut Self {
        self.next_batch = Some(next_batch.to_owned());
        self
    }

    /// Builds a sync response as a JSON Value containing the events we queued
    /// so far.
    ///
    /// The next response returned by `build_json_sync_response` will then be
    /// empty if no further events were queued.
    pub fn build_json_sync_response(&mut self) -> JsonValue {
        self.batch_counter += 1;
        let next_batch = self.next_batch.take().unwrap_or_else(|| self.generate_sync_token());

        let body = json!({
            "device_one_time_keys_count": self.one_time_keys_count,
            "next_batch": next_batch,
            "device_lists": {
                "changed": self.changed_device_lists,
                "left": self.left_device_lists,
            },
            "rooms": {
                "invite": self.invited_rooms,
                "join": self.joined_rooms,
                "leave": self.left_rooms,
            },
            "to_device": {
                "events": self.to_device_events,
            },
        });

        // Clear state so that the next sync response will be empty if nothing
        // was added.
        self.clear();

        body
    }

    fn generate_sync_token(&self) -> String {
        format!("t392-516_47314_0_7_1_1_1_11444_{}", self.batch_counter)
    }

    pub fn clear(&mut self) {
        self.invited_rooms.clear();
        self.joined_rooms.clear();
        self.left_rooms.clear();
        self.changed_device_lists.clear();
        self.left_device_lists.clear();
        self.to_device_events.clear();
        self.one_time_keys_count.clear();
    }
}

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

use ruma::{OwnedRoomId, RoomId};
use serde_json::{Value as JsonValue, json};

use crate::DEFAULT_TEST_ROOM_ID;

pub struct LeftRoomBuilder {
    pub(super) room_id: OwnedRoomId,
    state: Vec<JsonValue>,
    timeline: Vec<JsonValue>,
}

impl LeftRoomBuilder {
    /// Create a new `LeftRoomBuilder` for the given room ID.
    ///
    /// If the room ID is [`DEFAULT_TEST_ROOM_ID`],
    /// [`LeftRoomBuilder::default()`] can be used instead.
    pub fn new(room_id: &RoomId) -> Self {
        Self { room_id: room_id.to_owned(), state: Vec::new(), timeline: Vec::new() }
    }

    /// Add an event to the timeline.
    pub fn add_timeline_event(mut self, event: JsonValue) -> Self {
        self.timeline.push(event);
        self
    }

    /// Add an event to the state.
    pub fn add_state_event(mut self, event: JsonValue) -> Self {
        self.state.push(event);
        self
    }

    pub(super) fn build(self) -> JsonValue {
        json!({
            "state": { "events": self.state },
            "timeline": { "events": self.timeline, "limited": false },
        })
    }
}

impl Default for LeftRoomBuilder {
    fn default() -> Self {
        Self::new(&DEFAULT_TEST_ROOM_ID)
    }
}

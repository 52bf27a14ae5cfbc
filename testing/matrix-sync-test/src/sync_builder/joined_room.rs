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

pub struct JoinedRoomBuilder {
    pub(super) room_id: OwnedRoomId,
    state: Vec<JsonValue>,
    timeline: Vec<JsonValue>,
    limited: bool,
    prev_batch: Option<String>,
    notification_count: u64,
    highlight_count: u64,
    summary: Option<JsonValue>,
}

impl JoinedRoomBuilder {
    /// Create a new `JoinedRoomBuilder` for the given room ID.
    ///
    /// If the room ID is [`DEFAULT_TEST_ROOM_ID`],
    /// [`JoinedRoomBuilder::default()`] can be used instead.
    pub fn new(room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.to_owned(),
            state: Vec::new(),
            timeline: Vec::new(),
            limited: false,
            prev_batch: None,
            notification_count: 0,
            highlight_count: 0,
            summary: None,
        }
    }

    /// Add an event to the timeline.
    pub fn add_timeline_event(mut self, event: JsonValue) -> Self {
        self.timeline.push(event);
        self
    }

    /// Add events in bulk to the timeline.
    pub fn add_timeline_bulk<I>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = JsonValue>,
    {
        self.timeline.extend(events);
        self
    }

    /// Set the timeline as limited.
    pub fn set_timeline_limited(mut self) -> Self {
        self.limited = true;
        self
    }

    /// Set the `prev_batch` of the timeline.
    pub fn set_timeline_prev_batch(mut self, prev_batch: &str) -> Self {
        self.prev_batch = Some(prev_batch.to_owned());
        self
    }

    /// Add an event to the state.
    pub fn add_state_event(mut self, event: JsonValue) -> Self {
        self.state.push(event);
        self
    }

    /// Add events in bulk to the state.
    pub fn add_state_bulk<I>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = JsonValue>,
    {
        self.state.extend(events);
        self
    }

    /// Set the unread notification counts of the room.
    pub fn set_unread_notifications(mut self, notification_count: u64, highlight_count: u64) -> Self {
        self.notification_count = notification_count;
        self.highlight_count = highlight_count;
        self
    }

    /// Set the room summary.
    pub fn set_room_summary(mut self, summary: JsonValue) -> Self {
        self.summary = Some(summary);
        self
    }

    pub(super) fn build(self) -> JsonValue {
        json!({
            "summary": self.summary.unwrap_or_else(|| json!({})),
            "state": { "events": self.state },
            "timeline": {
                "events": self.timeline,
                "limited": self.limited,
                "prev_batch": self.prev_batch,
            },
            "unread_notifications": {
                "notification_count": self.notification_count,
                "highlight_count": self.highlight_count,
            },
        })
    }
}

impl Default for JoinedRoomBuilder {
    fn default() -> Self {
        Self::new(&DEFAULT_TEST_ROOM_ID)
    }
}

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

//! The `/sync` response as it arrives on the wire, and the processed summary
//! handed back to applications.

use std::collections::{BTreeMap, BTreeSet};

use ruma::{OwnedRoomId, OwnedUserId, serde::Raw};
use serde::{Deserialize, Serialize};

use crate::{
    deserialized_responses::TimelineEvent,
    events::{AnySyncTimelineEvent, AnyToDeviceEvent, StrippedStateEvent, SyncStateEvent},
};

/// The body of a `GET /_matrix/client/v3/sync` response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncEventsResponse {
    /// The batch token to supply in the `since` param of the next request.
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
    #[serde(default)]
    pub to_device: ToDevice,
    #[serde(default)]
    pub device_lists: DeviceLists,
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
    /// `None` if the server doesn't support fallback keys at all.
    #[serde(default, alias = "org.matrix.msc2732.device_unused_fallback_key_types")]
    pub device_unused_fallback_key_types: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub summary: RoomSummary,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub unread_notifications: UnreadNotificationsCount,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: InviteState,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LeftRoom {
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct State {
    #[serde(default)]
    pub events: Vec<Raw<SyncStateEvent>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InviteState {
    #[serde(default)]
    pub events: Vec<Raw<StrippedStateEvent>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<Raw<AnySyncTimelineEvent>>,
    /// The server skipped events between the previous response and this one.
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub prev_batch: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoomSummary {
    #[serde(rename = "m.heroes", default)]
    pub heroes: Option<Vec<OwnedUserId>>,
    #[serde(rename = "m.joined_member_count", default)]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count", default)]
    pub invited_member_count: Option<u64>,
}

/// Counts of unread notifications for a room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotificationsCount {
    #[serde(default)]
    pub highlight_count: u64,
    #[serde(default)]
    pub notification_count: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ToDevice {
    #[serde(default)]
    pub events: Vec<Raw<AnyToDeviceEvent>>,
}

/// Users whose devices changed, or who no longer share an encrypted room
/// with us, since the previous sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

impl DeviceLists {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.left.is_empty()
    }
}

/// Updates to one joined room, as seen by one sync.
#[derive(Clone, Debug, Default)]
pub struct JoinedRoomUpdate {
    /// The timeline events of this sync, in order.
    pub timeline: Vec<TimelineEvent>,
    /// Whether the timeline was limited, see [`Timeline::limited`].
    pub limited: bool,
    pub unread_notifications: UnreadNotificationsCount,
}

/// The rooms touched by a sync.
#[derive(Clone, Debug, Default)]
pub struct RoomUpdates {
    pub joined: BTreeMap<OwnedRoomId, JoinedRoomUpdate>,
    pub invited: BTreeSet<OwnedRoomId>,
    pub left: BTreeSet<OwnedRoomId>,
}

impl RoomUpdates {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.invited.is_empty() && self.left.is_empty()
    }
}

/// A processed sync response.
#[derive(Clone, Debug, Default)]
pub struct SyncResponse {
    /// The batch token to supply in the `since` param of the next `/sync`
    /// request.
    pub next_batch: String,
    pub rooms: RoomUpdates,
    /// To-device events, as returned by the cryptographic engine.
    pub to_device: Vec<Raw<AnyToDeviceEvent>>,
    pub device_lists: DeviceLists,
}

impl SyncResponse {
    /// A response for a sync that didn't change anything.
    pub fn unchanged(next_batch: String) -> Self {
        Self { next_batch, ..Default::default() }
    }
}

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

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId, serde::Raw};
use tracing::warn;

use crate::events::{AnyStateEventContent, MembershipState, StrippedStateEvent};

/// Why we know about a room we haven't joined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrippedRoomKind {
    /// We were invited to the room.
    Invited,
    /// The room is a child of a space we joined.
    SpaceChild {
        /// The space room.
        parent: OwnedRoomId,
        /// Servers that can be used to join the room.
        via: Vec<String>,
        suggested: bool,
    },
}

/// What the stripped state tells us about a room.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StrippedRoomInfo {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub is_encrypted: bool,
    /// The `type` of the room, e.g. `m.space`.
    pub room_type: Option<String>,
    /// The sender of our own invite.
    pub inviter: Option<OwnedUserId>,
}

/// A lightweight view of a room we haven't joined, built from unauthoritative
/// state.
#[derive(Clone, Debug)]
pub struct StrippedRoom {
    room_id: OwnedRoomId,
    kind: StrippedRoomKind,
    info: StrippedRoomInfo,
}

impl StrippedRoom {
    /// Build the view of an invited room from its `invite_state`.
    ///
    /// Malformed events are skipped.
    pub(crate) fn from_invite_state(
        room_id: &RoomId,
        own_user_id: Option<&UserId>,
        events: &[Raw<StrippedStateEvent>],
    ) -> Self {
        let mut info = StrippedRoomInfo::default();

        for raw in events {
            let event = match raw.deserialize() {
                Ok(e) => e,
                Err(e) => {
                    warn!(?room_id, "Couldn't deserialize a stripped state event: {e}");
                    continue;
                }
            };

            match event.content {
                AnyStateEventContent::RoomName(c) => {
                    info.name = (!c.name.is_empty()).then_some(c.name);
                }
                AnyStateEventContent::RoomTopic(c) => {
                    info.topic = (!c.topic.is_empty()).then_some(c.topic);
                }
                AnyStateEventContent::RoomAvatar(c) => info.avatar_url = c.url,
                AnyStateEventContent::RoomEncryption(_) => info.is_encrypted = true,
                AnyStateEventContent::RoomCreate(c) => info.room_type = c.room_type,
                AnyStateEventContent::RoomMember(c)
                    if c.membership == MembershipState::Invite
                        && own_user_id.is_some_and(|u| u.as_str() == event.state_key) =>
                {
                    info.inviter = Some(event.sender);
                }
                _ => {}
            }
        }

        Self { room_id: room_id.to_owned(), kind: StrippedRoomKind::Invited, info }
    }

    pub(crate) fn space_child(
        room_id: &RoomId,
        parent: &RoomId,
        via: Vec<String>,
        suggested: bool,
    ) -> Self {
        Self {
            room_id: room_id.to_owned(),
            kind: StrippedRoomKind::SpaceChild { parent: parent.to_owned(), via, suggested },
            info: StrippedRoomInfo::default(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn kind(&self) -> &StrippedRoomKind {
        &self.kind
    }

    pub fn info(&self) -> &StrippedRoomInfo {
        &self.info
    }

    pub fn name(&self) -> Option<&str> {
        self.info.name.as_deref()
    }

    pub fn inviter(&self) -> Option<&UserId> {
        self.info.inviter.as_deref()
    }
}

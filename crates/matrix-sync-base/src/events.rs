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

//! The event types the sync client understands.
//!
//! Each event category is a closed sum type. Decoding switches on the wire
//! `type` string and falls back to a `Custom` variant carrying the raw content,
//! so unknown event types never fail a sync.

use std::{collections::BTreeMap, fmt};

use ruma::{
    EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId,
    RoomVersionId, UserId,
};
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::Value as JsonValue;

/// The membership state of a user in a room.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    /// The user is banned.
    Ban,
    /// The user has been invited.
    Invite,
    /// The user has joined.
    Join,
    /// The user has requested to join.
    Knock,
    /// The user has left.
    Leave,
}

impl MembershipState {
    /// The wire representation of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Knock => "knock",
            Self::Leave => "leave",
        }
    }

    /// Whether a member in this state was removed from the room.
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Leave | Self::Ban)
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who can see the history of a room.
///
/// This decides which members receive the room key of an outgoing group
/// session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HistoryVisibility {
    /// Members see history from the point they were invited.
    Invited,
    /// Members see history from the point they joined.
    Joined,
    /// Members see all history once they joined.
    Shared,
    /// Anyone can see the history.
    WorldReadable,
    /// A setting this crate doesn't know. Who may read the history is
    /// indeterminate.
    Custom(String),
}

impl HistoryVisibility {
    /// The wire representation of this setting.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Invited => "invited",
            Self::Joined => "joined",
            Self::Shared => "shared",
            Self::WorldReadable => "world_readable",
            Self::Custom(s) => s,
        }
    }

    /// Whether this is one of the settings of the Matrix protocol.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<String> for HistoryVisibility {
    fn from(s: String) -> Self {
        match s.as_str() {
            "invited" => Self::Invited,
            "joined" => Self::Joined,
            "shared" => Self::Shared,
            "world_readable" => Self::WorldReadable,
            _ => Self::Custom(s),
        }
    }
}

impl From<HistoryVisibility> for String {
    fn from(visibility: HistoryVisibility) -> Self {
        match visibility {
            HistoryVisibility::Custom(s) => s,
            known => known.as_str().to_owned(),
        }
    }
}

impl Default for HistoryVisibility {
    /// Rooms without a `m.room.history_visibility` event are `shared`.
    fn default() -> Self {
        Self::Shared
    }
}

/// The content of an event whose type isn't known to this crate.
#[derive(Clone, Debug, PartialEq)]
pub struct CustomEventContent {
    /// The wire `type` of the event.
    pub event_type: String,
    /// The untouched content.
    pub content: JsonValue,
}

/// A reference to the room this room replaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousRoom {
    pub room_id: OwnedRoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,
}

/// `m.room.create`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreateEventContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<OwnedUserId>,
    #[serde(default = "default_room_version")]
    pub room_version: RoomVersionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<PreviousRoom>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
}

fn default_room_version() -> RoomVersionId {
    RoomVersionId::V1
}

/// `m.room.member`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMemberEventContent {
    pub membership: MembershipState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
}

/// `m.room.name`
///
/// A redacted name event has no `name`, which clears the name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomNameEventContent {
    #[serde(default)]
    pub name: String,
}

/// `m.room.topic`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTopicEventContent {
    #[serde(default)]
    pub topic: String,
}

/// `m.room.avatar`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAvatarEventContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `m.room.encryption`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEncryptionEventContent {
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

/// `m.room.history_visibility`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomHistoryVisibilityEventContent {
    pub history_visibility: HistoryVisibility,
}

/// `m.room.tombstone`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTombstoneEventContent {
    #[serde(default)]
    pub body: String,
    pub replacement_room: OwnedRoomId,
}

/// `m.space.child`
///
/// The child room is the state key of the event. An empty `via` list removes
/// the child from the space.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceChildEventContent {
    #[serde(default)]
    pub via: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default)]
    pub suggested: bool,
}

/// The content of any state event.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyStateEventContent {
    RoomCreate(RoomCreateEventContent),
    RoomMember(RoomMemberEventContent),
    RoomName(RoomNameEventContent),
    RoomTopic(RoomTopicEventContent),
    RoomAvatar(RoomAvatarEventContent),
    RoomEncryption(RoomEncryptionEventContent),
    RoomHistoryVisibility(RoomHistoryVisibilityEventContent),
    RoomTombstone(RoomTombstoneEventContent),
    SpaceChild(SpaceChildEventContent),
    Custom(CustomEventContent),
}

impl AnyStateEventContent {
    /// Decode the content of a state event of the given type.
    pub fn from_parts(event_type: &str, content: JsonValue) -> serde_json::Result<Self> {
        use serde_json::from_value;

        Ok(match event_type {
            "m.room.create" => Self::RoomCreate(from_value(content)?),
            "m.room.member" => Self::RoomMember(from_value(content)?),
            "m.room.name" => Self::RoomName(from_value(content)?),
            "m.room.topic" => Self::RoomTopic(from_value(content)?),
            "m.room.avatar" => Self::RoomAvatar(from_value(content)?),
            "m.room.encryption" => Self::RoomEncryption(from_value(content)?),
            "m.room.history_visibility" => Self::RoomHistoryVisibility(from_value(content)?),
            "m.room.tombstone" => Self::RoomTombstone(from_value(content)?),
            "m.space.child" => Self::SpaceChild(from_value(content)?),
            _ => Self::Custom(CustomEventContent { event_type: event_type.to_owned(), content }),
        })
    }

    /// The wire `type` of the event this content belongs to.
    pub fn event_type(&self) -> &str {
        match self {
            Self::RoomCreate(_) => "m.room.create",
            Self::RoomMember(_) => "m.room.member",
            Self::RoomName(_) => "m.room.name",
            Self::RoomTopic(_) => "m.room.topic",
            Self::RoomAvatar(_) => "m.room.avatar",
            Self::RoomEncryption(_) => "m.room.encryption",
            Self::RoomHistoryVisibility(_) => "m.room.history_visibility",
            Self::RoomTombstone(_) => "m.room.tombstone",
            Self::SpaceChild(_) => "m.space.child",
            Self::Custom(c) => &c.event_type,
        }
    }
}

/// `m.room.message`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomMessageEventContent {
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl RoomMessageEventContent {
    /// A plain `m.text` message.
    pub fn text_plain(body: impl Into<String>) -> Self {
        Self { msgtype: "m.text".to_owned(), body: body.into(), extra: BTreeMap::new() }
    }
}

/// `m.room.encrypted`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomEncryptedEventContent {
    pub algorithm: String,
    #[serde(default)]
    pub ciphertext: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The content of any message-like event.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyMessageLikeEventContent {
    RoomMessage(RoomMessageEventContent),
    RoomEncrypted(RoomEncryptedEventContent),
    Custom(CustomEventContent),
}

impl AnyMessageLikeEventContent {
    /// Decode the content of a message-like event of the given type.
    pub fn from_parts(event_type: &str, content: JsonValue) -> serde_json::Result<Self> {
        use serde_json::from_value;

        Ok(match event_type {
            "m.room.message" => Self::RoomMessage(from_value(content)?),
            "m.room.encrypted" => Self::RoomEncrypted(from_value(content)?),
            _ => Self::Custom(CustomEventContent { event_type: event_type.to_owned(), content }),
        })
    }

    /// The wire `type` of the event this content belongs to.
    pub fn event_type(&self) -> &str {
        match self {
            Self::RoomMessage(_) => "m.room.message",
            Self::RoomEncrypted(_) => "m.room.encrypted",
            Self::Custom(c) => &c.event_type,
        }
    }
}

/// A state event as it appears in the `state` or `timeline` of a sync
/// response.
#[derive(Clone, Debug)]
pub struct SyncStateEvent {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    pub state_key: String,
    pub content: AnyStateEventContent,
}

impl SyncStateEvent {
    pub fn event_type(&self) -> &str {
        self.content.event_type()
    }

    /// The user this event is about, if it's a member event with a valid
    /// state key.
    pub fn member_user_id(&self) -> Option<OwnedUserId> {
        match &self.content {
            AnyStateEventContent::RoomMember(_) => UserId::parse(&self.state_key).ok(),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct SyncStateEventDeHelper {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: JsonValue,
    state_key: String,
    event_id: OwnedEventId,
    sender: OwnedUserId,
    origin_server_ts: MilliSecondsSinceUnixEpoch,
}

impl<'de> Deserialize<'de> for SyncStateEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper = SyncStateEventDeHelper::deserialize(deserializer)?;
        let content = AnyStateEventContent::from_parts(&helper.event_type, helper.content)
            .map_err(de::Error::custom)?;

        Ok(Self {
            event_id: helper.event_id,
            sender: helper.sender,
            origin_server_ts: helper.origin_server_ts,
            state_key: helper.state_key,
            content,
        })
    }
}

/// A minimal, unauthoritative state event, as found in the invite state of a
/// room.
#[derive(Clone, Debug)]
pub struct StrippedStateEvent {
    pub sender: OwnedUserId,
    pub state_key: String,
    pub content: AnyStateEventContent,
}

#[derive(Deserialize)]
struct StrippedStateEventDeHelper {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: JsonValue,
    state_key: String,
    sender: OwnedUserId,
}

impl<'de> Deserialize<'de> for StrippedStateEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper = StrippedStateEventDeHelper::deserialize(deserializer)?;
        let content = AnyStateEventContent::from_parts(&helper.event_type, helper.content)
            .map_err(de::Error::custom)?;

        Ok(Self { sender: helper.sender, state_key: helper.state_key, content })
    }
}

/// A message-like event from the timeline of a sync response.
#[derive(Clone, Debug)]
pub struct SyncMessageLikeEvent {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    pub content: AnyMessageLikeEventContent,
}

#[derive(Deserialize)]
struct SyncMessageLikeEventDeHelper {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: JsonValue,
    event_id: OwnedEventId,
    sender: OwnedUserId,
    origin_server_ts: MilliSecondsSinceUnixEpoch,
}

impl<'de> Deserialize<'de> for SyncMessageLikeEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper = SyncMessageLikeEventDeHelper::deserialize(deserializer)?;
        let content = AnyMessageLikeEventContent::from_parts(&helper.event_type, helper.content)
            .map_err(de::Error::custom)?;

        Ok(Self {
            event_id: helper.event_id,
            sender: helper.sender,
            origin_server_ts: helper.origin_server_ts,
            content,
        })
    }
}

/// Any event from the timeline of a sync response.
///
/// Events carrying a `state_key` are state events, everything else is
/// message-like.
#[derive(Clone, Debug)]
pub enum AnySyncTimelineEvent {
    State(SyncStateEvent),
    MessageLike(SyncMessageLikeEvent),
}

impl AnySyncTimelineEvent {
    pub fn event_id(&self) -> &EventId {
        match self {
            Self::State(e) => &e.event_id,
            Self::MessageLike(e) => &e.event_id,
        }
    }

    pub fn sender(&self) -> &UserId {
        match self {
            Self::State(e) => &e.sender,
            Self::MessageLike(e) => &e.sender,
        }
    }

    pub fn origin_server_ts(&self) -> MilliSecondsSinceUnixEpoch {
        match self {
            Self::State(e) => e.origin_server_ts,
            Self::MessageLike(e) => e.origin_server_ts,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::State(e) => e.event_type(),
            Self::MessageLike(e) => e.content.event_type(),
        }
    }
}

impl<'de> Deserialize<'de> for AnySyncTimelineEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;

        if value.get("state_key").is_some() {
            serde_json::from_value(value).map(Self::State).map_err(de::Error::custom)
        } else {
            serde_json::from_value(value).map(Self::MessageLike).map_err(de::Error::custom)
        }
    }
}

/// A to-device event, opaque to everything but the cryptographic engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnyToDeviceEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: OwnedUserId,
    #[serde(default)]
    pub content: JsonValue,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use matrix_sync_test::{ALICE, EventFactory};
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_state_event_falls_back_to_custom() {
        let f = EventFactory::new();
        let event: SyncStateEvent = serde_json::from_value(f.state(
            "org.example.custom",
            "",
            json!({ "answer": 42 }),
        ))
        .unwrap();

        assert_let!(AnyStateEventContent::Custom(custom) = &event.content);
        assert_eq!(custom.event_type, "org.example.custom");
        assert_eq!(custom.content["answer"], 42);
        assert_eq!(event.event_type(), "org.example.custom");
    }

    #[test]
    fn create_event_defaults_to_room_version_one() {
        let content: RoomCreateEventContent = serde_json::from_value(json!({})).unwrap();
        assert_eq!(content.room_version, RoomVersionId::V1);
        assert!(content.creator.is_none());
    }

    #[test]
    fn member_event_knows_its_user() {
        let f = EventFactory::new();
        let event: SyncStateEvent = serde_json::from_value(f.member(&ALICE, "ban")).unwrap();

        assert_eq!(event.member_user_id().as_deref(), Some(*ALICE));
        assert_let!(AnyStateEventContent::RoomMember(content) = event.content);
        assert_eq!(content.membership, MembershipState::Ban);
        assert!(content.membership.is_removal());
    }

    #[test]
    fn malformed_known_content_is_an_error() {
        let f = EventFactory::new();
        let result = serde_json::from_value::<SyncStateEvent>(f.state(
            "m.room.member",
            ALICE.as_str(),
            json!({ "membership": 3 }),
        ));

        result.unwrap_err();
    }

    #[test]
    fn timeline_events_are_split_on_state_key() {
        let f = EventFactory::new();

        let state: AnySyncTimelineEvent =
            serde_json::from_value(f.room_name("Holiday plans")).unwrap();
        assert_let!(AnySyncTimelineEvent::State(state) = state);
        assert_let!(AnyStateEventContent::RoomName(name) = state.content);
        assert_eq!(name.name, "Holiday plans");

        let message: AnySyncTimelineEvent = serde_json::from_value(f.text_msg("hello")).unwrap();
        assert_eq!(message.event_type(), "m.room.message");
        assert_let!(AnySyncTimelineEvent::MessageLike(message) = message);
        assert_let!(AnyMessageLikeEventContent::RoomMessage(content) = message.content);
        assert_eq!(content.body, "hello");
        assert_eq!(content.msgtype, "m.text");
    }

    #[test]
    fn unknown_history_visibility_is_kept_as_custom() {
        let visibility: HistoryVisibility = serde_json::from_value(json!("everybody")).unwrap();
        assert_eq!(visibility, HistoryVisibility::Custom("everybody".to_owned()));
        assert!(!visibility.is_known());
        assert_eq!(serde_json::to_value(&visibility).unwrap(), json!("everybody"));

        assert_eq!(
            serde_json::from_value::<HistoryVisibility>(json!("world_readable")).unwrap(),
            HistoryVisibility::WorldReadable
        );
        assert_eq!(
            serde_json::to_value(HistoryVisibility::WorldReadable).unwrap(),
            json!("world_readable")
        );
    }
}

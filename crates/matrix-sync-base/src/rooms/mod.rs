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

//! Local mirrors of the rooms the user is in or was invited to.

use std::{
    collections::{BTreeMap, VecDeque},
    num::NonZeroUsize,
};

use eyeball::{SharedObservable, Subscriber};
use lru::LruCache;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, RoomVersionId, UserId, serde::Raw};
use tracing::debug;

use crate::{
    deserialized_responses::TimelineEvent,
    events::{
        AnyStateEventContent, HistoryVisibility, MembershipState, PreviousRoom,
        RoomCreateEventContent, RoomEncryptionEventContent, RoomTombstoneEventContent,
        SyncStateEvent,
    },
    sync::{RoomSummary, UnreadNotificationsCount},
};

mod stripped;

pub use stripped::{StrippedRoom, StrippedRoomInfo, StrippedRoomKind};

/// How many state events a room keeps in its state cache by default.
pub const DEFAULT_STATE_CACHE_CAPACITY: usize = 512;
/// How many timeline events a room keeps by default.
pub const DEFAULT_TIMELINE_CAPACITY: usize = 512;

/// A member of a room, as described by its latest `m.room.member` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomMember {
    pub user_id: OwnedUserId,
    pub membership: MembershipState,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// `(event type, state key)`
pub type StateKey = (String, String);

/// A bounded cache of the latest state events of a room.
#[derive(Clone, Debug)]
pub struct StateCache {
    events: LruCache<StateKey, Raw<SyncStateEvent>>,
}

impl StateCache {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { events: LruCache::new(capacity) }
    }

    fn insert(&mut self, event_type: &str, state_key: &str, event: Raw<SyncStateEvent>) {
        self.events.put((event_type.to_owned(), state_key.to_owned()), event);
    }

    /// Get the cached state event with the given type and state key.
    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&Raw<SyncStateEvent>> {
        self.events.peek(&(event_type.to_owned(), state_key.to_owned()))
    }

    /// All cached state events of the given type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<Raw<SyncStateEvent>> {
        self.events
            .iter()
            .filter(|((t, _), _)| t == event_type)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The summary of a room, as sent by the server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomSummaryInfo {
    pub heroes: Vec<OwnedUserId>,
    pub joined_member_count: u64,
    pub invited_member_count: u64,
}

/// All the information we know about a joined room.
#[derive(Clone, Debug)]
pub struct RoomInfo {
    pub(crate) room_id: OwnedRoomId,
    pub(crate) create: Option<RoomCreateEventContent>,
    pub(crate) name: Option<String>,
    pub(crate) topic: Option<String>,
    pub(crate) avatar_url: Option<String>,
    pub(crate) encryption: Option<RoomEncryptionEventContent>,
    pub(crate) history_visibility: Option<HistoryVisibility>,
    pub(crate) tombstone: Option<RoomTombstoneEventContent>,
    /// Keyed by user, so only the latest member event of a user counts.
    pub(crate) members: BTreeMap<OwnedUserId, RoomMember>,
    /// Whether the full member list was fetched from the server.
    pub(crate) members_synced: bool,
    pub(crate) state_cache: StateCache,
    pub(crate) timeline: VecDeque<TimelineEvent>,
    timeline_capacity: usize,
    pub(crate) prev_batch: Option<String>,
    pub(crate) notification_counts: UnreadNotificationsCount,
    pub(crate) summary: RoomSummaryInfo,
}

impl RoomInfo {
    pub(crate) fn new(room_id: &RoomId, state_cache_capacity: usize, timeline_capacity: usize) -> Self {
        Self {
            room_id: room_id.to_owned(),
            create: None,
            name: None,
            topic: None,
            avatar_url: None,
            encryption: None,
            history_visibility: None,
            tombstone: None,
            members: BTreeMap::new(),
            members_synced: false,
            state_cache: StateCache::new(state_cache_capacity),
            timeline: VecDeque::new(),
            timeline_capacity: timeline_capacity.max(1),
            prev_batch: None,
            notification_counts: UnreadNotificationsCount::default(),
            summary: RoomSummaryInfo::default(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Whether the room has a valid `m.room.create` event.
    pub fn has_create_event(&self) -> bool {
        self.create.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Apply a state event to the room.
    ///
    /// Returns the previous membership of the user if this is a member event.
    pub(crate) fn handle_state_event(
        &mut self,
        event: &SyncStateEvent,
        raw: &Raw<SyncStateEvent>,
    ) -> Option<Option<MembershipState>> {
        self.state_cache.insert(event.event_type(), &event.state_key, raw.clone());

        match &event.content {
            AnyStateEventContent::RoomCreate(c) => {
                self.create = Some(c.clone());
            }
            AnyStateEventContent::RoomMember(c) => {
                let Some(user_id) = event.member_user_id() else {
                    debug!(
                        state_key = event.state_key.as_str(),
                        "Ignoring a member event with an invalid state key"
                    );
                    return None;
                };

                let previous = self.members.insert(
                    user_id.clone(),
                    RoomMember {
                        user_id,
                        membership: c.membership.clone(),
                        display_name: c.displayname.clone(),
                        avatar_url: c.avatar_url.clone(),
                    },
                );

                return Some(previous.map(|m| m.membership));
            }
            AnyStateEventContent::RoomName(c) => {
                self.name = (!c.name.is_empty()).then(|| c.name.clone());
            }
            AnyStateEventContent::RoomTopic(c) => {
                self.topic = (!c.topic.is_empty()).then(|| c.topic.clone());
            }
            AnyStateEventContent::RoomAvatar(c) => {
                self.avatar_url = c.url.clone();
            }
            AnyStateEventContent::RoomEncryption(c) => {
                self.encryption = Some(c.clone());
            }
            AnyStateEventContent::RoomHistoryVisibility(c) => {
                self.history_visibility = Some(c.history_visibility.clone());
            }
            AnyStateEventContent::RoomTombstone(c) => {
                self.tombstone = Some(c.clone());
            }
            AnyStateEventContent::SpaceChild(_) | AnyStateEventContent::Custom(_) => {}
        }

        None
    }

    pub(crate) fn add_timeline_event(&mut self, event: TimelineEvent) {
        if self.timeline.len() == self.timeline_capacity {
            self.timeline.pop_front();
        }

        self.timeline.push_back(event);
    }

    pub(crate) fn clear_timeline(&mut self) {
        self.timeline.clear();
    }

    pub(crate) fn update_summary(&mut self, summary: &RoomSummary) {
        if let Some(heroes) = &summary.heroes {
            self.summary.heroes = heroes.clone();
        }
        if let Some(count) = summary.joined_member_count {
            self.summary.joined_member_count = count;
        }
        if let Some(count) = summary.invited_member_count {
            self.summary.invited_member_count = count;
        }
    }

    fn user_ids_with(&self, membership: MembershipState) -> Vec<OwnedUserId> {
        self.members
            .values()
            .filter(|m| m.membership == membership)
            .map(|m| m.user_id.clone())
            .collect()
    }
}

/// The underlying room data structure collecting state for joined rooms.
///
/// Cheap to clone, all clones observe the same [`RoomInfo`].
#[derive(Clone, Debug)]
pub struct Room {
    room_id: OwnedRoomId,
    info: SharedObservable<RoomInfo>,
}

impl Room {
    pub(crate) fn new(info: RoomInfo) -> Self {
        Self { room_id: info.room_id.clone(), info: SharedObservable::new(info) }
    }

    /// Get the unique room id of the room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Clone the inner `RoomInfo`.
    pub fn clone_info(&self) -> RoomInfo {
        self.info.get()
    }

    /// Get a stream of changes to the inner `RoomInfo`.
    pub fn subscribe_info(&self) -> Subscriber<RoomInfo> {
        self.info.subscribe()
    }

    /// Replace the inner `RoomInfo`, notifying subscribers.
    pub(crate) fn set_room_info(&self, info: RoomInfo) {
        self.info.set(info);
    }

    /// The room version, from the `m.room.create` event.
    pub fn version(&self) -> Option<RoomVersionId> {
        self.info.read().create.as_ref().map(|c| c.room_version.clone())
    }

    pub fn creator(&self) -> Option<OwnedUserId> {
        self.info.read().create.as_ref().and_then(|c| c.creator.clone())
    }

    /// The room this room replaced, if any.
    pub fn predecessor(&self) -> Option<PreviousRoom> {
        self.info.read().create.as_ref().and_then(|c| c.predecessor.clone())
    }

    /// The room that replaced this room, if any.
    pub fn successor(&self) -> Option<OwnedRoomId> {
        self.info.read().tombstone.as_ref().map(|t| t.replacement_room.clone())
    }

    pub fn name(&self) -> Option<String> {
        self.info.read().name.clone()
    }

    pub fn topic(&self) -> Option<String> {
        self.info.read().topic.clone()
    }

    pub fn avatar_url(&self) -> Option<String> {
        self.info.read().avatar_url.clone()
    }

    /// Is the room encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.info.read().is_encrypted()
    }

    /// Get the `m.room.encryption` content that enabled end to end encryption
    /// in the room.
    pub fn encryption_settings(&self) -> Option<RoomEncryptionEventContent> {
        self.info.read().encryption.clone()
    }

    /// The history visibility of the room, if an event setting it was seen.
    pub fn history_visibility(&self) -> Option<HistoryVisibility> {
        self.info.read().history_visibility.clone()
    }

    /// Whether the full member list of the room is known.
    pub fn are_members_synced(&self) -> bool {
        self.info.read().members_synced
    }

    /// Get the member with the given user id.
    pub fn get_member(&self, user_id: &UserId) -> Option<RoomMember> {
        self.info.read().members.get(user_id).cloned()
    }

    /// The users with the given membership.
    pub fn members_with(&self, membership: MembershipState) -> Vec<OwnedUserId> {
        self.info.read().user_ids_with(membership)
    }

    pub fn joined_user_ids(&self) -> Vec<OwnedUserId> {
        self.members_with(MembershipState::Join)
    }

    pub fn invited_user_ids(&self) -> Vec<OwnedUserId> {
        self.members_with(MembershipState::Invite)
    }

    pub fn left_user_ids(&self) -> Vec<OwnedUserId> {
        self.members_with(MembershipState::Leave)
    }

    pub fn banned_user_ids(&self) -> Vec<OwnedUserId> {
        self.members_with(MembershipState::Ban)
    }

    pub fn knocking_user_ids(&self) -> Vec<OwnedUserId> {
        self.members_with(MembershipState::Knock)
    }

    /// The cached timeline of the room, oldest first.
    pub fn timeline(&self) -> Vec<TimelineEvent> {
        self.info.read().timeline.iter().cloned().collect()
    }

    pub fn prev_batch(&self) -> Option<String> {
        self.info.read().prev_batch.clone()
    }

    /// Get the cached state event with the given type and state key.
    pub fn get_state_event(&self, event_type: &str, state_key: &str) -> Option<Raw<SyncStateEvent>> {
        self.info.read().state_cache.get(event_type, state_key).cloned()
    }

    pub fn unread_notification_counts(&self) -> UnreadNotificationsCount {
        self.info.read().notification_counts
    }

    pub fn summary(&self) -> RoomSummaryInfo {
        self.info.read().summary.clone()
    }
}

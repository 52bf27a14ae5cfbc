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

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::RwLock,
};

use async_trait::async_trait;
use ruma::{OwnedRoomId, RoomId, serde::Raw};
use tracing::debug;

use super::{ESSENTIAL_STATE_TYPES, Result, StateStore};
use crate::{
    events::{AnySyncTimelineEvent, StrippedStateEvent, SyncStateEvent},
    rooms::DEFAULT_TIMELINE_CAPACITY,
};

type StateKey = (String, String);

/// In-Memory, non-persistent implementation of the `StateStore`.
///
/// Default if no other is configured at startup. Only the latest events of
/// each room's timeline are kept.
#[derive(Debug)]
pub struct MemoryStore {
    sync_token: RwLock<Option<String>>,
    room_state: RwLock<HashMap<OwnedRoomId, BTreeMap<StateKey, Raw<SyncStateEvent>>>>,
    room_timeline: RwLock<HashMap<OwnedRoomId, VecDeque<Raw<AnySyncTimelineEvent>>>>,
    stripped_room_state: RwLock<HashMap<OwnedRoomId, Vec<Raw<StrippedStateEvent>>>>,
    timeline_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_timeline_capacity(DEFAULT_TIMELINE_CAPACITY)
    }
}

impl MemoryStore {
    /// Create a new empty MemoryStore
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty MemoryStore keeping at most `capacity` timeline
    /// events per room.
    pub fn with_timeline_capacity(capacity: usize) -> Self {
        Self {
            sync_token: Default::default(),
            room_state: Default::default(),
            room_timeline: Default::default(),
            stripped_room_state: Default::default(),
            timeline_capacity: capacity.max(1),
        }
    }

    /// The number of timeline events stored for the room.
    pub fn timeline_len(&self, room_id: &RoomId) -> usize {
        self.room_timeline.read().unwrap().get(room_id).map_or(0, VecDeque::len)
    }

    /// The stripped state stored for the room.
    pub fn stripped_state(&self, room_id: &RoomId) -> Vec<Raw<StrippedStateEvent>> {
        self.stripped_room_state.read().unwrap().get(room_id).cloned().unwrap_or_default()
    }
}

fn state_key_of(event: &Raw<SyncStateEvent>) -> Option<StateKey> {
    let event_type = event.get_field::<String>("type").ok().flatten()?;
    let state_key = event.get_field::<String>("state_key").ok().flatten()?;
    Some((event_type, state_key))
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_state(&self, room_id: &RoomId, events: &[Raw<SyncStateEvent>]) -> Result<()> {
        let mut room_state = self.room_state.write().unwrap();
        let state = room_state.entry(room_id.to_owned()).or_default();

        for event in events {
            if let Some(key) = state_key_of(event) {
                state.insert(key, event.clone());
            } else {
                debug!(?room_id, "Not storing a state event without type or state key");
            }
        }

        Ok(())
    }

    async fn save_timeline(
        &self,
        room_id: &RoomId,
        events: &[Raw<AnySyncTimelineEvent>],
        limited: bool,
    ) -> Result<()> {
        let mut room_timeline = self.room_timeline.write().unwrap();
        let timeline = room_timeline.entry(room_id.to_owned()).or_default();

        if limited {
            timeline.clear();
        }

        for event in events {
            if timeline.len() == self.timeline_capacity {
                timeline.pop_front();
            }
            timeline.push_back(event.clone());
        }

        Ok(())
    }

    async fn save_stripped_state(
        &self,
        room_id: &RoomId,
        events: &[Raw<StrippedStateEvent>],
    ) -> Result<()> {
        self.stripped_room_state.write().unwrap().insert(room_id.to_owned(), events.to_vec());
        Ok(())
    }

    async fn load_essential_state(&self, room_id: &RoomId) -> Result<Vec<Raw<SyncStateEvent>>> {
        Ok(self
            .room_state
            .read()
            .unwrap()
            .get(room_id)
            .map(|state| {
                state
                    .iter()
                    .filter(|((event_type, _), _)| ESSENTIAL_STATE_TYPES.contains(&event_type.as_str()))
                    .map(|(_, event)| event.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_room(&self, room_id: &RoomId) -> Result<()> {
        self.room_state.write().unwrap().remove(room_id);
        self.room_timeline.write().unwrap().remove(room_id);
        self.stripped_room_state.write().unwrap().remove(room_id);
        Ok(())
    }

    async fn save_sync_token(&self, token: &str) -> Result<()> {
        *self.sync_token.write().unwrap() = Some(token.to_owned());
        Ok(())
    }

    async fn sync_token(&self) -> Result<Option<String>> {
        Ok(self.sync_token.read().unwrap().clone())
    }
}

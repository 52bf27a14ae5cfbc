// Copyright 2020 Damir Jelić
// Copyright 2020 The Matrix.org Foundation C.I.C.
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
    collections::BTreeMap,
    fmt,
    sync::{Arc, OnceLock, RwLock as StdRwLock},
    time::Instant,
};

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId, serde::Raw};
use serde_json::value::RawValue;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    SessionMeta,
    crypto::{CryptoEngine, CryptoRequestQueue, CryptoTicket, MembershipChanges},
    deserialized_responses::TimelineEvent,
    error::{Error, Result},
    events::{
        AnyStateEventContent, AnySyncTimelineEvent, AnyToDeviceEvent, MembershipState,
        StrippedStateEvent, SyncStateEvent,
    },
    rooms::{
        DEFAULT_STATE_CACHE_CAPACITY, DEFAULT_TIMELINE_CAPACITY, Room, RoomInfo, StrippedRoom,
    },
    store::{MemoryStore, StateStore},
    sync::{
        InvitedRoom, JoinedRoom, JoinedRoomUpdate, RoomUpdates, SyncEventsResponse, SyncResponse,
        Timeline,
    },
};

/// Configuration of a [`BaseClient`].
#[derive(Clone)]
pub struct BaseClientConfig {
    /// Where room state is persisted.
    pub store: Arc<dyn StateStore>,
    /// The cryptographic engine, `None` disables end-to-end encryption.
    pub crypto_engine: Option<Arc<dyn CryptoEngine>>,
    pub state_cache_capacity: usize,
    pub timeline_capacity: usize,
}

impl Default for BaseClientConfig {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            crypto_engine: None,
            state_cache_capacity: DEFAULT_STATE_CACHE_CAPACITY,
            timeline_capacity: DEFAULT_TIMELINE_CAPACITY,
        }
    }
}

impl fmt::Debug for BaseClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseClientConfig")
            .field("state_cache_capacity", &self.state_cache_capacity)
            .field("timeline_capacity", &self.timeline_capacity)
            .finish_non_exhaustive()
    }
}

/// A no IO Client implementation.
///
/// This Client is a state machine that receives responses and events and
/// accordingly updates its state.
#[derive(Clone)]
pub struct BaseClient {
    session_meta: Arc<OnceLock<SessionMeta>>,
    sync_token: Arc<StdRwLock<Option<String>>>,
    rooms: Arc<StdRwLock<BTreeMap<OwnedRoomId, Room>>>,
    stripped_rooms: Arc<StdRwLock<BTreeMap<OwnedRoomId, StrippedRoom>>>,
    space_children: Arc<StdRwLock<BTreeMap<OwnedRoomId, StrippedRoom>>>,
    store: Arc<dyn StateStore>,
    crypto: Option<Arc<CryptoRequestQueue>>,
    /// Serializes everything that replaces room infos.
    room_info_lock: Arc<Mutex<()>>,
    state_cache_capacity: usize,
    timeline_capacity: usize,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseClient")
            .field("session_meta", &self.session_meta)
            .field("sync_token", &self.sync_token)
            .field("crypto", &self.crypto)
            .finish_non_exhaustive()
    }
}

/// Everything one sync response changes, collected before any of it is
/// published.
#[derive(Default)]
struct StateChanges {
    room_infos: BTreeMap<OwnedRoomId, RoomInfo>,
    state: BTreeMap<OwnedRoomId, Vec<Raw<SyncStateEvent>>>,
    /// The new events and whether they were `limited`.
    timeline: BTreeMap<OwnedRoomId, (Vec<Raw<AnySyncTimelineEvent>>, bool)>,
    invited_rooms: BTreeMap<OwnedRoomId, (StrippedRoom, Vec<Raw<StrippedStateEvent>>)>,
    /// `None` removes the space child view.
    space_children: BTreeMap<OwnedRoomId, Option<StrippedRoom>>,
    left_rooms: Vec<OwnedRoomId>,
    membership: MembershipChanges,
}

/// Reinterpret the JSON of a raw event as another event type.
fn cast_raw<T, U>(raw: &Raw<T>) -> Raw<U> {
    Raw::from_json(raw.json().to_owned())
}

impl BaseClient {
    /// Create a new client.
    pub fn new(config: BaseClientConfig) -> Self {
        Self {
            session_meta: Default::default(),
            sync_token: Default::default(),
            rooms: Default::default(),
            stripped_rooms: Default::default(),
            space_children: Default::default(),
            store: config.store,
            crypto: config.crypto_engine.map(|engine| Arc::new(CryptoRequestQueue::new(engine))),
            room_info_lock: Default::default(),
            state_cache_capacity: config.state_cache_capacity,
            timeline_capacity: config.timeline_capacity,
        }
    }

    /// Set the meta of the session.
    ///
    /// The meta can only be set once, later calls are ignored.
    pub fn set_session_meta(&self, session_meta: SessionMeta) {
        if self.session_meta.set(session_meta).is_err() {
            warn!("The session meta was already set, ignoring the new one");
        }
    }

    /// Get the session meta information.
    ///
    /// If the client is currently logged in, this will return a
    /// [`SessionMeta`] object which contains the user ID and device ID.
    /// Otherwise it returns `None`.
    pub fn session_meta(&self) -> Option<&SessionMeta> {
        self.session_meta.get()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.session_meta().map(|m| m.user_id.as_ref())
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The queue guarding the cryptographic engine, if there is one.
    pub fn crypto(&self) -> Option<&CryptoRequestQueue> {
        self.crypto.as_deref()
    }

    /// The current sync token that should be used for the next sync call.
    pub fn sync_token(&self) -> Option<String> {
        self.sync_token.read().unwrap().clone()
    }

    /// Seed the sync token from the store, unless one is already known.
    pub async fn load_sync_token(&self) {
        match self.store.sync_token().await {
            Ok(Some(token)) => {
                let mut current = self.sync_token.write().unwrap();
                if current.is_none() {
                    debug!(token, "Restored the sync token from the store");
                    *current = Some(token);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Couldn't load the sync token from the store: {e}"),
        }
    }

    /// Get the room with the given room id.
    pub fn get_room(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.read().unwrap().get(room_id).cloned()
    }

    /// All the joined rooms the client knows about.
    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.read().unwrap().values().cloned().collect()
    }

    /// Get the view of a room we were invited to.
    pub fn get_invited_room(&self, room_id: &RoomId) -> Option<StrippedRoom> {
        self.stripped_rooms.read().unwrap().get(room_id).cloned()
    }

    pub fn invited_rooms(&self) -> Vec<StrippedRoom> {
        self.stripped_rooms.read().unwrap().values().cloned().collect()
    }

    /// The children of joined spaces that we haven't joined ourselves.
    pub fn space_children(&self) -> Vec<StrippedRoom> {
        self.space_children.read().unwrap().values().cloned().collect()
    }

    /// Feed the E2EE related parts of a sync response into the cryptographic
    /// engine.
    ///
    /// Returns the to-device events as processed by the engine, or untouched
    /// if there's no engine.
    pub async fn receive_crypto_sync_changes(
        &self,
        response: &SyncEventsResponse,
    ) -> Result<Vec<Raw<AnyToDeviceEvent>>> {
        let Some(queue) = self.crypto() else {
            return Ok(response.to_device.events.clone());
        };

        let to_device_events = serde_json::to_string(&response.to_device.events)?;

        let result = {
            let engine = queue.acquire().await;
            engine
                .receive_sync_changes(
                    to_device_events,
                    response.device_lists.clone(),
                    response.device_one_time_keys_count.clone(),
                    response.device_unused_fallback_key_types.clone(),
                )
                .await?
        };

        result
            .to_device_events
            .into_iter()
            .map(|event| Ok::<_, Error>(Raw::from_json(RawValue::from_string(event)?)))
            .collect()
    }

    /// Receive a response from a sync call and reconcile the local room views
    /// with it.
    ///
    /// Room changes are computed first, then the cryptographic engine learns
    /// about membership changes, and only then are the new room views
    /// published and the sync token advanced. If the engine fails, nothing is
    /// changed.
    #[instrument(skip_all, fields(next_batch = %response.next_batch))]
    pub async fn receive_sync_response(&self, response: SyncEventsResponse) -> Result<SyncResponse> {
        // The server might respond multiple times with the same sync token, in
        // that case we already received this response and there's nothing to
        // do.
        if self.sync_token().as_deref() == Some(response.next_batch.as_str()) {
            info!("Got the same sync response twice, nothing to do");
            return Ok(SyncResponse::unchanged(response.next_batch));
        }

        let now = Instant::now();
        let _guard = self.room_info_lock.lock().await;

        let SyncEventsResponse { next_batch, rooms, device_lists, .. } = response;

        let mut changes = StateChanges::default();
        let mut updates = RoomUpdates::default();

        for (room_id, joined_room) in rooms.join {
            if let Some(update) = self.handle_joined_room(&room_id, joined_room, &mut changes).await
            {
                updates.joined.insert(room_id, update);
            }
        }

        for (room_id, invited_room) in rooms.invite {
            self.handle_invited_room(&room_id, invited_room, &mut changes);
            updates.invited.insert(room_id);
        }

        for room_id in rooms.leave.into_keys() {
            changes.left_rooms.push(room_id.clone());
            updates.left.insert(room_id);
        }

        // The engine stays ours until the new member lists are published, a
        // room key shared in between would reach members that just left.
        let ticket = self.acquire_for_membership_changes(&changes.membership).await;
        if let Some(engine) = &ticket {
            apply_membership_changes(&**engine, &changes.membership).await?;
        }
        self.apply_changes(changes, ticket).await;

        *self.sync_token.write().unwrap() = Some(next_batch.clone());

        if let Err(e) = self.store.save_sync_token(&next_batch).await {
            warn!("Couldn't persist the sync token: {e}");
        }

        info!("Processed a sync response in {:?}", now.elapsed());

        Ok(SyncResponse { next_batch, rooms: updates, to_device: Vec::new(), device_lists })
    }

    /// Receive the full member list of a room, e.g. from a
    /// `GET /rooms/{roomId}/members` response.
    #[instrument(skip(self, members))]
    pub async fn receive_members(
        &self,
        room_id: &RoomId,
        members: &[Raw<SyncStateEvent>],
    ) -> Result<()> {
        let _guard = self.room_info_lock.lock().await;

        let room = self.get_room(room_id).ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;
        let mut info = room.clone_info();
        let mut membership = MembershipChanges::default();

        for raw in members {
            let event = match raw.deserialize() {
                Ok(event) => event,
                Err(e) => {
                    warn!("Couldn't deserialize a member event: {e}");
                    continue;
                }
            };

            if !matches!(event.content, AnyStateEventContent::RoomMember(_)) {
                continue;
            }

            let previous = info.handle_state_event(&event, raw);

            // A full member list contains every member that ever left, so only
            // a removal of someone we knew as a member counts.
            if let Some(Some(previous)) = &previous {
                handle_membership_transition(room_id, Some(previous), &event, &mut membership);
            } else if let Some(None) = &previous {
                if let Some((user_id, MembershipState::Join)) = member_state(&event) {
                    membership.track(&user_id);
                }
            }
        }

        info.members_synced = true;

        {
            let ticket = self.acquire_for_membership_changes(&membership).await;
            if let Some(engine) = &ticket {
                apply_membership_changes(&**engine, &membership).await?;
            }
            room.set_room_info(info);
        }

        if let Err(e) = self.store.save_state(room_id, members).await {
            warn!(?room_id, "Couldn't persist the member list: {e}");
        }

        debug!(count = members.len(), "Received the member list");

        Ok(())
    }

    async fn handle_joined_room(
        &self,
        room_id: &RoomId,
        joined_room: JoinedRoom,
        changes: &mut StateChanges,
    ) -> Option<JoinedRoomUpdate> {
        let existing = self.get_room(room_id);

        let mut info = match &existing {
            Some(room) => room.clone_info(),
            None => {
                let mut info =
                    RoomInfo::new(room_id, self.state_cache_capacity, self.timeline_capacity);
                self.apply_cached_state(&mut info).await;
                info
            }
        };

        let was_encrypted = info.is_encrypted();
        let mut membership = MembershipChanges::default();
        let mut space_children = BTreeMap::new();

        let state_events = self.handle_state(
            &mut info,
            &joined_room.state.events,
            &mut membership,
            &mut space_children,
        );

        let (timeline, timeline_state) = self.handle_timeline(
            &mut info,
            &joined_room.timeline,
            &mut membership,
            &mut space_children,
        );

        if !info.has_create_event() {
            warn!(?room_id, "Skipping a joined room without a valid m.room.create event");
            return None;
        }

        if !was_encrypted && info.is_encrypted() {
            debug!(?room_id, "The room became encrypted, tracking all its members");

            for member in info.members.values() {
                if matches!(member.membership, MembershipState::Join | MembershipState::Invite) {
                    membership.track(&member.user_id);
                }
            }
        }

        info.update_summary(&joined_room.summary);
        info.notification_counts = joined_room.unread_notifications;

        if let Some(prev_batch) = &joined_room.timeline.prev_batch {
            info.prev_batch = Some(prev_batch.clone());
        }

        for room_id in &membership.invalidated_rooms {
            changes.membership.invalidate(room_id);
        }
        for user_id in &membership.tracked_users {
            changes.membership.track(user_id);
        }
        changes.space_children.extend(space_children);

        let mut persisted_state = joined_room.state.events;
        persisted_state.extend(timeline_state);

        changes.state.insert(room_id.to_owned(), persisted_state);
        changes.timeline.insert(
            room_id.to_owned(),
            (timeline.iter().map(|e| e.event.clone()).collect(), joined_room.timeline.limited),
        );
        changes.room_infos.insert(room_id.to_owned(), info);

        trace!(?room_id, new_state_events = state_events, "Handled a joined room");

        Some(JoinedRoomUpdate {
            timeline,
            limited: joined_room.timeline.limited,
            unread_notifications: joined_room.unread_notifications,
        })
    }

    /// Apply the persisted state of a room we don't have in memory yet.
    ///
    /// This is what we knew about the room before, so it doesn't produce
    /// membership transitions.
    async fn apply_cached_state(&self, info: &mut RoomInfo) {
        let cached = match self.store.load_essential_state(info.room_id()).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(room_id = ?info.room_id(), "Couldn't load the cached state of a room: {e}");
                return;
            }
        };

        for raw in &cached {
            match raw.deserialize() {
                Ok(event) => {
                    info.handle_state_event(&event, raw);
                }
                Err(e) => debug!("Skipping a malformed cached state event: {e}"),
            }
        }
    }

    /// Apply the `state` section of a joined room, returning the number of
    /// applied events.
    fn handle_state(
        &self,
        info: &mut RoomInfo,
        events: &[Raw<SyncStateEvent>],
        membership: &mut MembershipChanges,
        space_children: &mut BTreeMap<OwnedRoomId, Option<StrippedRoom>>,
    ) -> usize {
        let mut applied = 0;

        for raw in events {
            let event = match raw.deserialize() {
                Ok(event) => event,
                Err(e) => {
                    warn!(room_id = ?info.room_id(), "Couldn't deserialize a state event: {e}");
                    continue;
                }
            };

            self.apply_state_event(info, &event, raw, membership, space_children);
            applied += 1;
        }

        applied
    }

    /// Append the timeline of a joined room, applying the state events it
    /// carries.
    ///
    /// Returns the timeline and the state events found in it.
    fn handle_timeline(
        &self,
        info: &mut RoomInfo,
        timeline: &Timeline,
        membership: &mut MembershipChanges,
        space_children: &mut BTreeMap<OwnedRoomId, Option<StrippedRoom>>,
    ) -> (Vec<TimelineEvent>, Vec<Raw<SyncStateEvent>>) {
        if timeline.limited {
            info.clear_timeline();
            info.members_synced = false;
        }

        let mut events = Vec::with_capacity(timeline.events.len());
        let mut state = Vec::new();

        for raw in &timeline.events {
            match raw.deserialize() {
                Ok(AnySyncTimelineEvent::State(event)) => {
                    let raw_state = cast_raw(raw);
                    self.apply_state_event(info, &event, &raw_state, membership, space_children);
                    state.push(raw_state);
                }
                Ok(AnySyncTimelineEvent::MessageLike(_)) => {}
                Err(e) => {
                    warn!(room_id = ?info.room_id(), "Couldn't deserialize a timeline event: {e}");
                }
            }

            let event = TimelineEvent::new(raw.clone());
            info.add_timeline_event(event.clone());
            events.push(event);
        }

        (events, state)
    }

    fn apply_state_event(
        &self,
        info: &mut RoomInfo,
        event: &SyncStateEvent,
        raw: &Raw<SyncStateEvent>,
        membership: &mut MembershipChanges,
        space_children: &mut BTreeMap<OwnedRoomId, Option<StrippedRoom>>,
    ) {
        if let Some(previous) = info.handle_state_event(event, raw) {
            handle_membership_transition(info.room_id(), previous.as_ref(), event, membership);
        }

        if let AnyStateEventContent::SpaceChild(content) = &event.content {
            let Ok(child) = RoomId::parse(&event.state_key) else {
                debug!(state_key = event.state_key.as_str(), "Invalid space child state key");
                return;
            };

            let view = (!content.via.is_empty()).then(|| {
                StrippedRoom::space_child(
                    &child,
                    info.room_id(),
                    content.via.clone(),
                    content.suggested,
                )
            });

            space_children.insert(child, view);
        }
    }

    fn handle_invited_room(
        &self,
        room_id: &RoomId,
        invited_room: InvitedRoom,
        changes: &mut StateChanges,
    ) {
        let events = invited_room.invite_state.events;
        let room = StrippedRoom::from_invite_state(room_id, self.user_id(), &events);

        changes.invited_rooms.insert(room_id.to_owned(), (room, events));
    }

    /// Wait for exclusive access to the cryptographic engine if it has to
    /// learn about membership changes.
    async fn acquire_for_membership_changes(
        &self,
        changes: &MembershipChanges,
    ) -> Option<CryptoTicket<'_>> {
        if changes.is_empty() {
            return None;
        }

        Some(self.crypto()?.acquire().await)
    }

    /// Publish the new room views and persist them.
    ///
    /// The `ticket` is released once the views are published, before anything
    /// is persisted. Persistence is best effort, failures are only logged.
    async fn apply_changes(&self, changes: StateChanges, ticket: Option<CryptoTicket<'_>>) {
        let StateChanges {
            room_infos,
            state,
            timeline,
            invited_rooms,
            space_children,
            left_rooms,
            membership: _,
        } = changes;

        {
            let mut rooms = self.rooms.write().unwrap();
            let mut stripped_rooms = self.stripped_rooms.write().unwrap();
            let mut known_space_children = self.space_children.write().unwrap();

            for (room_id, view) in space_children {
                match view {
                    Some(view) if !rooms.contains_key(&room_id) && !room_infos.contains_key(&room_id) => {
                        known_space_children.insert(room_id, view);
                    }
                    _ => {
                        known_space_children.remove(&room_id);
                    }
                }
            }

            for (room_id, info) in room_infos {
                stripped_rooms.remove(&room_id);
                known_space_children.remove(&room_id);

                match rooms.get(&room_id) {
                    Some(room) => room.set_room_info(info),
                    None => {
                        rooms.insert(room_id, Room::new(info));
                    }
                }
            }

            for (room_id, (room, _)) in &invited_rooms {
                stripped_rooms.insert(room_id.clone(), room.clone());
            }

            for room_id in &left_rooms {
                rooms.remove(room_id);
                stripped_rooms.remove(room_id);
            }
        }

        drop(ticket);

        for (room_id, events) in state {
            if let Err(e) = self.store.save_state(&room_id, &events).await {
                warn!(?room_id, "Couldn't persist room state: {e}");
            }
        }

        for (room_id, (events, limited)) in timeline {
            if let Err(e) = self.store.save_timeline(&room_id, &events, limited).await {
                warn!(?room_id, "Couldn't persist the room timeline: {e}");
            }
        }

        for (room_id, (_, events)) in invited_rooms {
            if let Err(e) = self.store.save_stripped_state(&room_id, &events).await {
                warn!(?room_id, "Couldn't persist the invite state: {e}");
            }
        }

        for room_id in left_rooms {
            if let Err(e) = self.store.remove_room(&room_id).await {
                warn!(?room_id, "Couldn't remove a left room from the store: {e}");
            }
        }
    }
}

/// Let the cryptographic engine know about membership changes.
///
/// The caller must hold the ticket `engine` was obtained from.
async fn apply_membership_changes(
    engine: &dyn CryptoEngine,
    changes: &MembershipChanges,
) -> Result<()> {
    for room_id in &changes.invalidated_rooms {
        debug!(?room_id, "A member left, discarding the current room key");
        engine.discard_room_key(room_id).await?;
    }

    if !changes.tracked_users.is_empty() {
        engine.update_tracked_users(&changes.tracked_users).await?;
    }

    Ok(())
}

/// The user and new membership of a member event.
fn member_state(event: &SyncStateEvent) -> Option<(OwnedUserId, MembershipState)> {
    match &event.content {
        AnyStateEventContent::RoomMember(c) => {
            event.member_user_id().map(|user_id| (user_id, c.membership.clone()))
        }
        _ => None,
    }
}

/// Record what a membership change means for the room's group session.
///
/// Members that stop being members invalidate the current group session,
/// members that join get their devices tracked.
fn handle_membership_transition(
    room_id: &RoomId,
    previous: Option<&MembershipState>,
    event: &SyncStateEvent,
    changes: &mut MembershipChanges,
) {
    let Some((user_id, membership)) = member_state(event) else {
        return;
    };

    if membership.is_removal() && !previous.is_some_and(MembershipState::is_removal) {
        debug!(?room_id, ?user_id, %membership, "A member was removed from the room");
        changes.invalidate(room_id);
    } else if membership == MembershipState::Join && previous != Some(&MembershipState::Join) {
        changes.track(&user_id);
    }
}

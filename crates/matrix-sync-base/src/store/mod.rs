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

//! The persistence layer of the sync client.
//!
//! The in-memory room views are the source of truth, a [`StateStore`] only
//! makes them durable. The client calls the store opportunistically and never
//! lets a store failure change the outcome of a sync.

use async_trait::async_trait;
use ruma::{RoomId, serde::Raw};
use thiserror::Error;

use crate::{
    AsyncTraitDeps,
    events::{AnySyncTimelineEvent, StrippedStateEvent, SyncStateEvent},
};

mod memory_store;

pub use memory_store::MemoryStore;

/// State store specific error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error happened in the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// An error happened while serializing or deserializing some data.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The store is locked, e.g. because another process is using it.
    #[error("The store is locked")]
    Locked,
}

impl StoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `StoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A `StateStore` specific result type.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// The state event types that are needed to rebuild a room view.
pub const ESSENTIAL_STATE_TYPES: &[&str] = &[
    "m.room.create",
    "m.room.encryption",
    "m.room.history_visibility",
    "m.room.name",
    "m.room.topic",
    "m.room.avatar",
    "m.room.tombstone",
    "m.room.member",
];

/// An abstract state store trait that can be used to implement different
/// stores for the sync client.
#[async_trait]
pub trait StateStore: AsyncTraitDeps {
    /// Persist state events of a joined room.
    async fn save_state(&self, room_id: &RoomId, events: &[Raw<SyncStateEvent>]) -> Result<()>;

    /// Persist timeline events of a joined room.
    ///
    /// If `limited` is set the events don't follow the stored ones, and the
    /// stored timeline is dropped before they are appended.
    async fn save_timeline(
        &self,
        room_id: &RoomId,
        events: &[Raw<AnySyncTimelineEvent>],
        limited: bool,
    ) -> Result<()>;

    /// Persist the stripped state of an invited room, replacing what was
    /// stored for it before.
    async fn save_stripped_state(
        &self,
        room_id: &RoomId,
        events: &[Raw<StrippedStateEvent>],
    ) -> Result<()>;

    /// Load the latest essential state events of a room, see
    /// [`ESSENTIAL_STATE_TYPES`].
    async fn load_essential_state(&self, room_id: &RoomId) -> Result<Vec<Raw<SyncStateEvent>>>;

    /// Forget everything about a room.
    async fn remove_room(&self, room_id: &RoomId) -> Result<()>;

    /// Persist the sync token.
    async fn save_sync_token(&self, token: &str) -> Result<()>;

    /// Get the last persisted sync token.
    async fn sync_token(&self) -> Result<Option<String>>;
}

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

//! The IO-free core of the sync client.
//!
//! This crate knows how to turn a `/sync` response into local room views and
//! how to drive a cryptographic engine through a strictly ordered queue, but it
//! never talks to a homeserver itself. The `matrix-sync` crate wires it up to
//! the network.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations)]

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};

pub use crate::error::{Error, Result};

mod client;
pub mod crypto;
pub mod deserialized_responses;
mod error;
pub mod events;
mod rooms;
pub mod store;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use client::{BaseClient, BaseClientConfig};
pub use rooms::{
    Room, RoomInfo, RoomMember, StrippedRoom, StrippedRoomInfo, StrippedRoomKind,
    DEFAULT_STATE_CACHE_CAPACITY, DEFAULT_TIMELINE_CAPACITY,
};
pub use store::{MemoryStore, StateStore, StoreError};

/// Super trait that is used for our store and engine traits, this one will
/// get the correct `Send` and `Sync` bounds for implementors of the traits.
pub trait AsyncTraitDeps: std::fmt::Debug + Send + Sync {}
impl<T: std::fmt::Debug + Send + Sync> AsyncTraitDeps for T {}

/// The Matrix user session info.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// The ID of the session's user.
    pub user_id: OwnedUserId,
    /// The ID of the client device.
    pub device_id: OwnedDeviceId,
}

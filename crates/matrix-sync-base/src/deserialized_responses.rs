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

//! SDK-specific variations of response types.

use ruma::{OwnedDeviceId, OwnedEventId, OwnedUserId, serde::Raw};
use serde::{Deserialize, Serialize};

use crate::events::AnySyncTimelineEvent;

/// Information about the sender of an encrypted event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    /// The Curve25519 key of the device that sent the event.
    pub sender_curve25519_key: String,
    /// The Ed25519 key the sending device claims to own.
    pub claimed_ed25519_key: Option<String>,
    /// Curve25519 keys of the devices a forwarded room key passed through.
    pub forwarding_curve25519_key_chain: Vec<String>,
    pub sender: Option<OwnedUserId>,
    pub sender_device: Option<OwnedDeviceId>,
}

/// A timeline event, possibly the decrypted form of an `m.room.encrypted`
/// event.
#[derive(Clone, Debug)]
pub struct TimelineEvent {
    /// The actual event.
    pub event: Raw<AnySyncTimelineEvent>,
    /// The encryption info about the event. Will be `None` if the event was
    /// not encrypted.
    pub encryption_info: Option<EncryptionInfo>,
}

impl TimelineEvent {
    /// Create a new `TimelineEvent` from the given raw event.
    pub fn new(event: Raw<AnySyncTimelineEvent>) -> Self {
        Self { event, encryption_info: None }
    }

    /// Get the event id of this `TimelineEvent` if the event has any valid
    /// id.
    pub fn event_id(&self) -> Option<OwnedEventId> {
        self.event.get_field::<OwnedEventId>("event_id").ok().flatten()
    }

    /// The wire `type` of this event, if it has a valid one.
    pub fn event_type(&self) -> Option<String> {
        self.event.get_field::<String>("type").ok().flatten()
    }
}

impl From<Raw<AnySyncTimelineEvent>> for TimelineEvent {
    fn from(event: Raw<AnySyncTimelineEvent>) -> Self {
        Self::new(event)
    }
}

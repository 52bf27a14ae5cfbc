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

//! Helpers to write tests for the `matrix-sync` crates.
//!
//! Everything in here produces plain JSON, so the helpers can be fed to a mock
//! homeserver as well as deserialized directly into the typed responses.

use once_cell::sync::Lazy;
use ruma::{RoomId, UserId, room_id, user_id};

mod event_factory;
mod sync_builder;
pub mod test_json;

pub use self::{
    event_factory::EventFactory,
    sync_builder::{InvitedRoomBuilder, JoinedRoomBuilder, LeftRoomBuilder, SyncResponseBuilder},
};

#[doc(hidden)]
pub mod __macro_support {
    pub use ctor::ctor;
    pub use tracing_subscriber;
}

/// Install a `tracing` subscriber for the test binary this is invoked in.
///
/// The filter is read from `RUST_LOG`, defaulting to `info`.
#[macro_export]
macro_rules! init_tracing_for_tests {
    () => {
        #[$crate::__macro_support::ctor]
        fn init_logging() {
            use $crate::__macro_support::tracing_subscriber::{
                EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
            };

            let _ = $crate::__macro_support::tracing_subscriber::registry()
                .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .with(fmt::layer().with_test_writer())
                .try_init();
        }
    };
}

pub static ALICE: Lazy<&UserId> = Lazy::new(|| user_id!("@alice:server.name"));
pub static BOB: Lazy<&UserId> = Lazy::new(|| user_id!("@bob:other.server"));
pub static CAROL: Lazy<&UserId> = Lazy::new(|| user_id!("@carol:other.server"));

/// The room ID most tests use when they only need one room.
pub static DEFAULT_TEST_ROOM_ID: Lazy<&RoomId> =
    Lazy::new(|| room_id!("!SVkFJHzfwvuaIEawgC:localhost"));

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
#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use async_trait::async_trait;
pub use bytes;
pub use matrix_sync_base::{
    Room as BaseRoom, RoomInfo, RoomMember, SessionMeta, StateStore, StoreError, StrippedRoom,
    StrippedRoomInfo, StrippedRoomKind, crypto, deserialized_responses, events,
    store::MemoryStore,
};
pub use reqwest;
pub use ruma;

mod client;
pub mod config;
pub mod encryption;
mod error;
mod http_client;
pub mod room;
pub mod sync;
#[cfg(test)]
mod test_utils;

pub use client::{Client, ClientBuilder, Session, SessionTokens, UnknownToken};
pub use encryption::Encryption;
pub use error::{
    ApiError, ClientBuildError, Error, ErrorKind, HttpError, HttpResult, RefreshTokenError, Result,
};
pub use http_client::HttpSend;
pub use room::Room;

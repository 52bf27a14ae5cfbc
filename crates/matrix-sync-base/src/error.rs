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

//! Error conditions.

use ruma::OwnedRoomId;
use thiserror::Error;

use crate::{crypto::CryptoError, store::StoreError};

/// Result type of the sync client core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal representation of errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The room isn't known to the client.
    #[error("The room {0} is not known")]
    UnknownRoom(OwnedRoomId),

    /// A generic error returned when the state store fails not due to
    /// IO or (de)serialization.
    #[error(transparent)]
    StateStore(#[from] StoreError),

    /// The cryptographic engine rejected an operation.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// An event or response couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

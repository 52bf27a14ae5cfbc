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

//! Test data for the matrix-sync crates.
//!
//! Exporting each const allows all the test data to have a single source of
//! truth.

use once_cell::sync::Lazy;
use serde_json::{Value as JsonValue, json};

pub mod api_responses;

pub use api_responses::{
    KEYS_CLAIM, KEYS_QUERY, KEYS_UPLOAD, LIMIT_EXCEEDED, NOT_FOUND, REFRESH_TOKEN,
    UNKNOWN_TOKEN, UNKNOWN_TOKEN_SOFT_LOGOUT,
};

/// An empty response.
pub static EMPTY: Lazy<JsonValue> = Lazy::new(|| json!({}));

/// A response with only an event ID.
pub static EVENT_ID: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "event_id": "$h29iv0s8:example.com"
    })
});

// Copyright 2021 The matrix-mio developers
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

//! A Matrix client library with persistent storage and end-to-end
//! encryption.
//!
//! The [`Client`] drives a long-poll sync loop against a homeserver and
//! keeps everything it learns on disk: room state, timelines, known
//! devices, and the Olm/Megolm session state needed to read and write
//! encrypted rooms.
//!
//! ```no_run
//! use matrix_mio::{Client, SyncSettings};
//! use url::Url;
//!
//! # async fn run() -> matrix_mio::Result<()> {
//! let client = Client::new(Url::parse("https://example.org")?, "./state")?;
//! client.login_password("alice", "secret").await?;
//!
//! client.sync_once(&SyncSettings::default()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations)]

mod client;
pub mod crypto;
mod error;
pub mod events;
mod http_client;
pub mod rooms;
mod session;
mod store;
mod sync;

pub use client::Client;
pub use error::{Error, HttpError, MatrixError, Result};
pub use http_client::HttpClient;
pub use session::Session;
pub use store::{ClientConfig, StoreError};
pub use sync::{SyncPauseGuard, SyncSettings};

pub use ruma::{
    device_id, event_id, room_id, user_id, DeviceId, EventId, OwnedDeviceId, OwnedEventId,
    OwnedRoomId, OwnedUserId, RoomId, UserId,
};

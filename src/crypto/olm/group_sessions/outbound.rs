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

//! Outbound group sessions.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use ruma::{
    EventEncryptionAlgorithm, OwnedDeviceId, OwnedRoomId, OwnedUserId, SecondsSinceUnixEpoch,
};
use serde::{Deserialize, Serialize};
use vodozemac::megolm::{GroupSessionPickle, SessionConfig};

use crate::events::EncryptionContent;

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings for an encrypted room, taken from its `m.room.encryption` state.
///
/// These determine the algorithm and when the outbound group session gets
/// rotated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long a session may be used before it is rotated.
    pub sessions_max_age: Duration,
    /// How many messages a session may encrypt before it is rotated.
    pub sessions_max_messages: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            sessions_max_age: ROTATION_PERIOD,
            sessions_max_messages: ROTATION_MESSAGES,
        }
    }
}

impl From<&EncryptionContent> for EncryptionSettings {
    fn from(content: &EncryptionContent) -> Self {
        Self {
            algorithm: content.algorithm.as_str().into(),
            sessions_max_age: content
                .rotation_period_ms
                .map_or(ROTATION_PERIOD, Duration::from_millis),
            sessions_max_messages: content.rotation_period_msgs.unwrap_or(ROTATION_MESSAGES),
        }
    }
}

/// The devices a session was delivered to, per user.
pub type SharedTo = BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>;

/// An outbound group session for one room.
///
/// Replaced, never rewound: the message count only grows, and the set of
/// devices the session was shared with only grows, until the session is
/// rotated away.
pub struct OutboundGroupSession {
    inner: vodozemac::megolm::GroupSession,
    session_id: String,
    pub room_id: OwnedRoomId,
    pub creation_time: SecondsSinceUnixEpoch,
    /// How many events this session has encrypted.
    pub message_count: u64,
    /// Which devices already received this session's key.
    pub shared_to: SharedTo,
}

impl OutboundGroupSession {
    pub fn new(room_id: OwnedRoomId) -> Self {
        let inner = vodozemac::megolm::GroupSession::new(SessionConfig::version_1());
        let session_id = inner.session_id();

        Self {
            inner,
            session_id,
            room_id,
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: 0,
            shared_to: SharedTo::new(),
        }
    }

    /// The unique identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The exportable session key at the current ratchet index.
    ///
    /// Capture this before encrypting the event it should let receivers
    /// decrypt.
    pub fn session_key(&self) -> String {
        self.inner.session_key().to_base64()
    }

    /// The index the next encrypted message will use.
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// Check whether the session must be replaced under the given settings.
    ///
    /// A session expires once it encrypted enough messages or has been
    /// around longer than the configured maximum age.
    pub fn expired(&self, settings: &EncryptionSettings) -> bool {
        if self.message_count >= settings.sessions_max_messages {
            return true;
        }

        let created = Duration::from_secs(self.creation_time.get().into());
        let now = Duration::from_secs(SecondsSinceUnixEpoch::now().get().into());

        now.checked_sub(created)
            .map(|elapsed| elapsed >= settings.sessions_max_age)
            .unwrap_or(true)
    }

    /// Encrypt a plaintext, returning the base64 Megolm ciphertext.
    pub fn encrypt(&mut self, plaintext: &str) -> String {
        self.message_count += 1;
        self.inner.encrypt(plaintext).to_base64()
    }

    /// Record that a device received this session's key.
    pub fn mark_shared_with(&mut self, user_id: &ruma::UserId, device_id: &ruma::DeviceId) {
        self.shared_to
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned());
    }

    /// Has the session already been delivered to the given device?
    pub fn is_shared_with(&self, user_id: &ruma::UserId, device_id: &ruma::DeviceId) -> bool {
        self.shared_to
            .get(user_id)
            .is_some_and(|devices| devices.contains(device_id))
    }

    /// Pickle the session for storage.
    pub fn pickle(&self) -> PickledOutboundGroupSession {
        PickledOutboundGroupSession {
            pickle: self.inner.pickle(),
            room_id: self.room_id.clone(),
            creation_time: self.creation_time,
            message_count: self.message_count,
            shared_to: self.shared_to.clone(),
        }
    }

    /// Restore a session from its pickled form.
    pub fn from_pickle(pickle: PickledOutboundGroupSession) -> Self {
        let inner = vodozemac::megolm::GroupSession::from_pickle(pickle.pickle);
        let session_id = inner.session_id();

        Self {
            inner,
            session_id,
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: pickle.message_count,
            shared_to: pickle.shared_to,
        }
    }
}

impl std::fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// The stored form of an [`OutboundGroupSession`].
#[derive(Serialize, Deserialize)]
pub struct PickledOutboundGroupSession {
    pub pickle: GroupSessionPickle,
    pub room_id: OwnedRoomId,
    pub creation_time: SecondsSinceUnixEpoch,
    pub message_count: u64,
    #[serde(default)]
    pub shared_to: SharedTo,
}

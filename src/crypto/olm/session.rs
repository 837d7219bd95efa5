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

//! 1:1 Olm sessions.

use ruma::SecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use vodozemac::olm::{OlmMessage, PreKeyMessage, SessionPickle};

use crate::{
    crypto::error::OlmError,
    events::OlmCiphertext,
};

/// A double ratchet session with one device of a peer.
///
/// Multiple sessions with the same device may exist; when encrypting, the
/// one with the lexicographically smallest session id wins so that both
/// sides converge on the same session. Sessions are never explicitly
/// deleted, old ones just stop being used.
pub struct Session {
    inner: vodozemac::olm::Session,
    session_id: String,
    /// The curve25519 key of the peer device.
    pub sender_key: String,
    pub creation_time: SecondsSinceUnixEpoch,
    pub last_use_time: SecondsSinceUnixEpoch,
}

impl Session {
    pub(crate) fn new(inner: vodozemac::olm::Session, sender_key: String) -> Self {
        let now = SecondsSinceUnixEpoch::now();
        let session_id = inner.session_id();

        Self {
            inner,
            session_id,
            sender_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// The unique identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Encrypt a plaintext, returning the wire form `(type, body)` pair.
    pub fn encrypt(&mut self, plaintext: &str) -> OlmCiphertext {
        let message = self.inner.encrypt(plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        let (message_type, body) = match message {
            OlmMessage::PreKey(m) => (0, m.to_base64()),
            OlmMessage::Normal(m) => (1, m.to_base64()),
        };

        OlmCiphertext { message_type, body }
    }

    /// Decrypt an Olm message with this session.
    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<String, OlmError> {
        let plaintext = self.inner.decrypt(message)?;
        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(String::from_utf8_lossy(&plaintext).into_owned())
    }

    /// Check whether the given prekey message was created for this session.
    pub fn matches(&self, message: &PreKeyMessage) -> bool {
        self.session_id == message.session_id()
    }

    /// Pickle the session for storage.
    pub fn pickle(&self) -> PickledSession {
        PickledSession {
            pickle: self.inner.pickle(),
            sender_key: self.sender_key.clone(),
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from its pickled form.
    pub fn from_pickle(pickle: PickledSession) -> Self {
        let inner = vodozemac::olm::Session::from_pickle(pickle.pickle);
        let session_id = inner.session_id();

        Self {
            inner,
            session_id,
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

/// The stored form of a [`Session`].
#[derive(Serialize, Deserialize)]
pub struct PickledSession {
    pub pickle: SessionPickle,
    pub sender_key: String,
    pub creation_time: SecondsSinceUnixEpoch,
    pub last_use_time: SecondsSinceUnixEpoch,
}

/// Build the wire [`OlmMessage`] from its `(type, body)` parts.
pub fn message_from_parts(ciphertext: &OlmCiphertext) -> Result<OlmMessage, OlmError> {
    match ciphertext.message_type {
        0 => Ok(OlmMessage::PreKey(PreKeyMessage::from_base64(
            &ciphertext.body,
        )?)),
        1 => Ok(OlmMessage::Normal(vodozemac::olm::Message::from_base64(
            &ciphertext.body,
        )?)),
        _ => Err(OlmError::UnsupportedAlgorithm),
    }
}

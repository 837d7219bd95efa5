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

//! Inbound group sessions.

use std::collections::BTreeMap;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use vodozemac::megolm::{
    ExportedSessionKey, InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::{
    crypto::error::MegolmError,
    events::ForwardedRoomKeyContent,
};

/// What a message index was first seen with.
///
/// The same index must always map to the same pair; a contradiction means
/// someone replayed a ciphertext under a new event.
pub type MessageIndices = BTreeMap<u32, (OwnedEventId, MilliSecondsSinceUnixEpoch)>;

/// An inbound group session, used to decrypt Megolm room messages.
pub struct InboundGroupSession {
    inner: vodozemac::megolm::InboundGroupSession,
    session_id: String,
    pub room_id: OwnedRoomId,
    /// The curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The ed25519 key of the device that started the session. For directly
    /// received sessions this is anchored by the Olm envelope the key came
    /// in; for forwarded sessions it is only what the forwarder claims.
    pub signing_key: String,
    /// The curve25519 keys of the devices the session was relayed through,
    /// empty for directly received sessions.
    pub forwarding_chains: Vec<String>,
    /// Whether the session arrived as a forward or an import rather than
    /// directly from its creator.
    pub imported: bool,
    /// The replay protection book-keeping.
    pub message_indices: MessageIndices,
}

impl InboundGroupSession {
    /// Create a session from a directly received session key.
    pub fn new(
        sender_key: &str,
        signing_key: &str,
        room_id: &ruma::RoomId,
        session_key: &str,
    ) -> Result<Self, MegolmError> {
        let key = SessionKey::from_base64(session_key)
            .map_err(|e| MegolmError::InvalidSessionKey(e.to_string()))?;
        let inner = vodozemac::megolm::InboundGroupSession::new(&key, SessionConfig::version_1());
        let session_id = inner.session_id();

        Ok(Self {
            inner,
            session_id,
            room_id: room_id.to_owned(),
            sender_key: sender_key.to_owned(),
            signing_key: signing_key.to_owned(),
            forwarding_chains: Vec::new(),
            imported: false,
            message_indices: MessageIndices::new(),
        })
    }

    /// Create a session from a forwarded session key.
    pub fn from_forwarded(content: &ForwardedRoomKeyContent) -> Result<Self, MegolmError> {
        let key = ExportedSessionKey::from_base64(&content.session_key)
            .map_err(|e| MegolmError::InvalidSessionKey(e.to_string()))?;
        let inner =
            vodozemac::megolm::InboundGroupSession::import(&key, SessionConfig::version_1());
        let session_id = inner.session_id();

        Ok(Self {
            inner,
            session_id,
            room_id: content.room_id.clone(),
            sender_key: content.session_creator_curve25519.clone(),
            signing_key: content.creator_supposed_ed25519.clone(),
            forwarding_chains: content.curve25519_forward_chain.clone(),
            imported: true,
            message_indices: MessageIndices::new(),
        })
    }

    /// The unique identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The first message index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.inner.first_known_index()
    }

    /// Decrypt a base64 Megolm ciphertext, returning the plaintext and the
    /// ratchet index the message was encrypted at.
    pub fn decrypt(&mut self, ciphertext: &str) -> Result<(String, u32), MegolmError> {
        let message = MegolmMessage::from_base64(ciphertext)?;
        let decrypted = self.inner.decrypt(&message)?;

        Ok((
            String::from_utf8_lossy(&decrypted.plaintext).into_owned(),
            decrypted.message_index,
        ))
    }

    /// Apply the replay check for a decrypted message.
    ///
    /// Returns `true` when the index was recorded for the first time; the
    /// caller must persist the store before handing the plaintext out, since
    /// losing this record would later flag the legitimate event as a replay.
    pub fn check_replay(
        &mut self,
        message_index: u32,
        event_id: &ruma::EventId,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> Result<bool, MegolmError> {
        match self.message_indices.get(&message_index) {
            Some((known_id, known_ts))
                if &**known_id != event_id || *known_ts != timestamp =>
            {
                Err(MegolmError::PossibleReplayAttack {
                    index: message_index,
                })
            }
            Some(_) => Ok(false),
            None => {
                self.message_indices
                    .insert(message_index, (event_id.to_owned(), timestamp));
                Ok(true)
            }
        }
    }

    /// Export the session key at the earliest index we can decrypt from.
    pub fn export(&self) -> String {
        self.inner.export_at_first_known_index().to_base64()
    }

    /// Pickle the session for storage.
    pub fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.pickle(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            signing_key: self.signing_key.clone(),
            forwarding_chains: self.forwarding_chains.clone(),
            imported: self.imported,
            message_indices: self.message_indices.clone(),
        }
    }

    /// Restore a session from its pickled form.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let inner = vodozemac::megolm::InboundGroupSession::from_pickle(pickle.pickle);
        let session_id = inner.session_id();

        Self {
            inner,
            session_id,
            room_id: pickle.room_id,
            sender_key: pickle.sender_key,
            signing_key: pickle.signing_key,
            forwarding_chains: pickle.forwarding_chains,
            imported: pickle.imported,
            message_indices: pickle.message_indices,
        }
    }
}

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("imported", &self.imported)
            .finish()
    }
}

/// The stored form of an [`InboundGroupSession`].
#[derive(Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    pub pickle: InboundGroupSessionPickle,
    pub room_id: OwnedRoomId,
    pub sender_key: String,
    pub signing_key: String,
    #[serde(default)]
    pub forwarding_chains: Vec<String>,
    #[serde(default)]
    pub imported: bool,
    #[serde(default)]
    pub message_indices: MessageIndices,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{event_id, room_id, uint};

    use super::*;
    use crate::crypto::olm::group_sessions::OutboundGroupSession;

    fn session() -> (OutboundGroupSession, InboundGroupSession) {
        let room_id = room_id!("!room:example.org");
        let outbound = OutboundGroupSession::new(room_id.to_owned());
        let inbound = InboundGroupSession::new(
            "sender_curve",
            "starter_ed",
            room_id,
            &outbound.session_key(),
        )
        .unwrap();

        (outbound, inbound)
    }

    #[test]
    fn decrypts_what_the_outbound_encrypts() {
        let (mut outbound, mut inbound) = session();

        let ciphertext = outbound.encrypt("payload");
        let (plaintext, index) = inbound.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext, "payload");
        assert_eq!(index, 0);
    }

    #[test]
    fn replay_with_a_different_event_is_detected() {
        let (mut outbound, mut inbound) = session();

        let ciphertext = outbound.encrypt("payload");
        let (_, index) = inbound.decrypt(&ciphertext).unwrap();

        let first = event_id!("$first:example.org");
        let ts = MilliSecondsSinceUnixEpoch(uint!(1000));

        assert!(inbound.check_replay(index, first, ts).unwrap());
        // Seeing the very same event again is fine.
        assert!(!inbound.check_replay(index, first, ts).unwrap());

        let second = event_id!("$second:example.org");
        let error = inbound.check_replay(index, second, ts).unwrap_err();
        assert_matches!(error, MegolmError::PossibleReplayAttack { index: 0 });

        // The stored mapping is left untouched by the failed check.
        assert_eq!(inbound.message_indices[&index].0, first.to_owned());
    }

    #[test]
    fn exported_sessions_decrypt_from_the_export_index() {
        let (mut outbound, inbound) = session();

        let early = outbound.encrypt("early");
        let _ = outbound.encrypt("skipped");

        let content = ForwardedRoomKeyContent {
            algorithm: crate::crypto::MEGOLM_V1_ALGORITHM.to_owned(),
            room_id: inbound.room_id.clone(),
            session_creator_curve25519: inbound.sender_key.clone(),
            creator_supposed_ed25519: inbound.signing_key.clone(),
            session_id: inbound.session_id().to_owned(),
            session_key: inbound.export(),
            curve25519_forward_chain: vec!["relay_curve".to_owned()],
        };

        let mut forwarded = InboundGroupSession::from_forwarded(&content).unwrap();

        assert!(forwarded.imported);
        assert_eq!(forwarded.forwarding_chains, vec!["relay_curve".to_owned()]);
        assert_eq!(forwarded.first_known_index(), 0);

        let (plaintext, index) = forwarded.decrypt(&early).unwrap();
        assert_eq!(plaintext, "early");
        assert_eq!(index, 0);
    }

    #[test]
    fn pickle_round_trip_keeps_indices() {
        let (mut outbound, mut inbound) = session();

        let ciphertext = outbound.encrypt("payload");
        let (_, index) = inbound.decrypt(&ciphertext).unwrap();
        inbound
            .check_replay(index, event_id!("$e:example.org"), MilliSecondsSinceUnixEpoch(uint!(1)))
            .unwrap();

        let json = serde_json::to_string(&inbound.pickle()).unwrap();
        let restored = InboundGroupSession::from_pickle(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.message_indices, inbound.message_indices);
    }
}

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

//! The crypto session store.
//!
//! Exclusively owns the account and every live Olm and Megolm session, as
//! one `e2e.json` file holding the pickled (then JSON encoded) state. Every
//! mutating helper persists before returning: replaying an operation on top
//! of a stale ratchet is never recoverable, so a failed save is fatal to
//! the operation that caused it.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use vodozemac::olm::AccountPickle;

use super::{
    error::CryptoStoreError,
    olm::{
        group_sessions::{PickledInboundGroupSession, PickledOutboundGroupSession},
        Account, InboundGroupSession, OutboundGroupSession, PickledSession, Session,
    },
};
use crate::{
    events::GroupSessionRequest,
    store::{read_json, write_json_atomic},
};

/// The key of an inbound group session:
/// `(room_id, sender_curve25519, session_id)`.
pub type InboundGroupKey = (OwnedRoomId, String, String);

/// Result of a crypto store operation.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

pub struct SessionStore {
    path: PathBuf,
    pub account: Account,
    /// Whether our signed device keys ever reached the server.
    pub device_keys_uploaded: bool,
    /// Olm sessions established by our peers, keyed by their curve25519.
    inbound_sessions: HashMap<String, Vec<Session>>,
    /// Olm sessions we established, keyed by the peer's curve25519.
    outbound_sessions: HashMap<String, Vec<Session>>,
    inbound_group_sessions: HashMap<InboundGroupKey, InboundGroupSession>,
    outbound_group_sessions: HashMap<OwnedRoomId, OutboundGroupSession>,
    /// Session requests we sent and still wait on, by request id.
    pub sent_session_requests: BTreeMap<String, GroupSessionRequest>,
}

#[derive(Serialize, Deserialize)]
struct PickledSessionStore {
    account: AccountPickle,
    device_keys_uploaded: bool,
    inbound_sessions: HashMap<String, Vec<PickledSession>>,
    outbound_sessions: HashMap<String, Vec<PickledSession>>,
    inbound_group_sessions: Vec<PickledInboundGroupSession>,
    outbound_group_sessions: Vec<PickledOutboundGroupSession>,
    #[serde(default)]
    sent_session_requests: BTreeMap<String, GroupSessionRequest>,
}

impl SessionStore {
    /// Load the store from disk, or create a fresh account when no file
    /// exists yet.
    pub fn open(path: PathBuf) -> Result<Self> {
        let pickled: Option<PickledSessionStore> = read_json(&path)?;

        let Some(pickled) = pickled else {
            return Ok(Self {
                path,
                account: Account::new(),
                device_keys_uploaded: false,
                inbound_sessions: HashMap::new(),
                outbound_sessions: HashMap::new(),
                inbound_group_sessions: HashMap::new(),
                outbound_group_sessions: HashMap::new(),
                sent_session_requests: BTreeMap::new(),
            });
        };

        let unpickle_all = |map: HashMap<String, Vec<PickledSession>>| -> HashMap<String, Vec<Session>> {
            map.into_iter()
                .map(|(key, sessions)| {
                    (key, sessions.into_iter().map(Session::from_pickle).collect())
                })
                .collect()
        };

        let inbound_group_sessions = pickled
            .inbound_group_sessions
            .into_iter()
            .map(|pickle| {
                let session = InboundGroupSession::from_pickle(pickle);
                let key = (
                    session.room_id.clone(),
                    session.sender_key.clone(),
                    session.session_id().to_owned(),
                );
                (key, session)
            })
            .collect();

        let outbound_group_sessions = pickled
            .outbound_group_sessions
            .into_iter()
            .map(|pickle| {
                let session = OutboundGroupSession::from_pickle(pickle);
                (session.room_id.clone(), session)
            })
            .collect();

        Ok(Self {
            path,
            account: Account::from_pickle(pickled.account),
            device_keys_uploaded: pickled.device_keys_uploaded,
            inbound_sessions: unpickle_all(pickled.inbound_sessions),
            outbound_sessions: unpickle_all(pickled.outbound_sessions),
            inbound_group_sessions,
            outbound_group_sessions,
            sent_session_requests: pickled.sent_session_requests,
        })
    }

    /// Persist the whole store atomically.
    pub fn save(&self) -> Result<()> {
        let pickle_all = |map: &HashMap<String, Vec<Session>>| -> HashMap<String, Vec<PickledSession>> {
            map.iter()
                .map(|(key, sessions)| {
                    (key.clone(), sessions.iter().map(Session::pickle).collect())
                })
                .collect()
        };

        let pickled = PickledSessionStore {
            account: self.account.pickle(),
            device_keys_uploaded: self.device_keys_uploaded,
            inbound_sessions: pickle_all(&self.inbound_sessions),
            outbound_sessions: pickle_all(&self.outbound_sessions),
            inbound_group_sessions: self
                .inbound_group_sessions
                .values()
                .map(InboundGroupSession::pickle)
                .collect(),
            outbound_group_sessions: self
                .outbound_group_sessions
                .values()
                .map(OutboundGroupSession::pickle)
                .collect(),
            sent_session_requests: self.sent_session_requests.clone(),
        };

        write_json_atomic(&self.path, &pickled)?;
        Ok(())
    }

    // Olm 1:1 sessions.

    pub fn inbound_sessions_mut(&mut self, sender_key: &str) -> Option<&mut Vec<Session>> {
        self.inbound_sessions.get_mut(sender_key)
    }

    /// The outbound session to use for the given peer: the one with the
    /// lexicographically smallest session id.
    pub fn outbound_session_mut(&mut self, peer_curve25519: &str) -> Option<&mut Session> {
        self.outbound_sessions
            .get_mut(peer_curve25519)?
            .iter_mut()
            .min_by(|a, b| a.session_id().cmp(b.session_id()))
    }

    pub fn has_outbound_session(&self, peer_curve25519: &str) -> bool {
        self.outbound_sessions
            .get(peer_curve25519)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    pub fn add_inbound_session(&mut self, sender_key: &str, session: Session) -> Result<()> {
        self.inbound_sessions
            .entry(sender_key.to_owned())
            .or_default()
            .push(session);
        self.save()
    }

    pub fn add_outbound_session(&mut self, peer_curve25519: &str, session: Session) -> Result<()> {
        self.outbound_sessions
            .entry(peer_curve25519.to_owned())
            .or_default()
            .push(session);
        self.save()
    }

    // Megolm sessions.

    pub fn inbound_group_session(&self, key: &InboundGroupKey) -> Option<&InboundGroupSession> {
        self.inbound_group_sessions.get(key)
    }

    pub fn inbound_group_session_mut(
        &mut self,
        key: &InboundGroupKey,
    ) -> Option<&mut InboundGroupSession> {
        self.inbound_group_sessions.get_mut(key)
    }

    /// Look up an inbound group session by `(sender_key, session_id)` alone,
    /// across rooms. Used to answer session requests.
    pub fn find_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Option<&InboundGroupSession> {
        self.inbound_group_sessions.get(&(
            room_id.to_owned(),
            sender_key.to_owned(),
            session_id.to_owned(),
        ))
    }

    /// Install an inbound group session, unless one already exists for the
    /// key. An existing session is never overwritten: a later forwarded key
    /// must not override an earlier directly received one.
    ///
    /// Returns whether the session was installed.
    pub fn add_inbound_group_session(&mut self, session: InboundGroupSession) -> Result<bool> {
        let key = (
            session.room_id.clone(),
            session.sender_key.clone(),
            session.session_id().to_owned(),
        );

        if self.inbound_group_sessions.contains_key(&key) {
            return Ok(false);
        }

        self.inbound_group_sessions.insert(key, session);
        self.save()?;
        Ok(true)
    }

    pub fn outbound_group_session(&self, room_id: &RoomId) -> Option<&OutboundGroupSession> {
        self.outbound_group_sessions.get(room_id)
    }

    pub fn outbound_group_session_mut(
        &mut self,
        room_id: &RoomId,
    ) -> Option<&mut OutboundGroupSession> {
        self.outbound_group_sessions.get_mut(room_id)
    }

    /// Install (or replace, on rotation) the outbound session of a room.
    pub fn put_outbound_group_session(&mut self, session: OutboundGroupSession) -> Result<()> {
        self.outbound_group_sessions
            .insert(session.room_id.clone(), session);
        self.save()
    }

    /// Drop a room's outbound session, forcing a rotation on the next
    /// encryption in that room.
    pub fn drop_outbound_group_session(&mut self, room_id: &RoomId) -> Result<()> {
        if self.outbound_group_sessions.remove(room_id).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// The room ids whose outbound session was already shared with the
    /// given device.
    pub fn rooms_shared_with_device(
        &self,
        user_id: &ruma::UserId,
        device_id: &ruma::DeviceId,
    ) -> Vec<OwnedRoomId> {
        self.outbound_group_sessions
            .iter()
            .filter(|(_, session)| session.is_shared_with(user_id, device_id))
            .map(|(room_id, _)| room_id.clone())
            .collect()
    }

    // Session requests.

    /// Do we already have an open request for this session?
    pub fn has_sent_session_request(&self, key: (&RoomId, &str, &str)) -> bool {
        self.sent_session_requests
            .values()
            .any(|request| request.compare_key() == key)
    }

    pub fn record_sent_session_request(&mut self, request: GroupSessionRequest) -> Result<()> {
        self.sent_session_requests
            .insert(request.request_id.clone(), request);
        self.save()
    }

    /// Take the open request matching the given session, if any.
    pub fn take_sent_session_request(
        &mut self,
        key: (&RoomId, &str, &str),
    ) -> Result<Option<GroupSessionRequest>> {
        let request_id = self
            .sent_session_requests
            .values()
            .find(|request| request.compare_key() == key)
            .map(|request| request.request_id.clone());

        match request_id {
            Some(id) => {
                let request = self.sent_session_requests.remove(&id);
                self.save()?;
                Ok(request)
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("device_keys_uploaded", &self.device_keys_uploaded)
            .field("inbound_group_sessions", &self.inbound_group_sessions.len())
            .field("outbound_group_sessions", &self.outbound_group_sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::*;

    fn store(dir: &std::path::Path) -> SessionStore {
        SessionStore::open(dir.join("e2e.json")).unwrap()
    }

    #[test]
    fn fresh_store_has_a_new_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(!store.device_keys_uploaded);
        assert!(!store.account.ed25519().is_empty());
    }

    #[test]
    fn save_and_reload_keeps_the_account_and_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let room_id = room_id!("!room:example.org");

        let (ed25519, session_id) = {
            let mut store = store(dir.path());
            store.device_keys_uploaded = true;

            let outbound = OutboundGroupSession::new(room_id.to_owned());
            let inbound = InboundGroupSession::new(
                &store.account.curve25519(),
                &store.account.ed25519(),
                room_id,
                &outbound.session_key(),
            )
            .unwrap();
            let session_id = inbound.session_id().to_owned();

            store.add_inbound_group_session(inbound).unwrap();
            store.put_outbound_group_session(outbound).unwrap();

            (store.account.ed25519(), session_id)
        };

        let store = store(dir.path());
        assert!(store.device_keys_uploaded);
        assert_eq!(store.account.ed25519(), ed25519);

        let key = (
            room_id.to_owned(),
            store.account.curve25519(),
            session_id,
        );
        assert!(store.inbound_group_session(&key).is_some());
        assert!(store.outbound_group_session(room_id).is_some());
    }

    #[test]
    fn direct_sessions_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let room_id = room_id!("!room:example.org");

        let outbound = OutboundGroupSession::new(room_id.to_owned());
        let direct = InboundGroupSession::new(
            "creator_curve",
            "direct_ed",
            room_id,
            &outbound.session_key(),
        )
        .unwrap();

        assert!(store.add_inbound_group_session(direct).unwrap());

        let late = InboundGroupSession::new(
            "creator_curve",
            "other_ed",
            room_id,
            &outbound.session_key(),
        )
        .unwrap();
        let key = (
            room_id.to_owned(),
            "creator_curve".to_owned(),
            late.session_id().to_owned(),
        );

        assert!(!store.add_inbound_group_session(late).unwrap());
        assert_eq!(store.inbound_group_session(&key).unwrap().signing_key, "direct_ed");
    }
}

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

//! Rooms and their state.

pub mod timeline;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use ruma::{OwnedRoomId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use self::timeline::{Gap, Timeline};
use crate::{
    crypto::EncryptionSettings,
    events::{Membership, StateContent, StateEvent},
    store::{encode_file_name, read_json, write_json_atomic, Result as StoreResult},
};

/// What the room state records about one member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberInfo {
    pub membership: Membership,
    pub display_name: Option<String>,
}

/// The part of a room's state the client keeps indexed.
///
/// Holds the membership snapshot that rekeying target sets are computed
/// from, and the room's encryption settings once `m.room.encryption` was
/// seen. Encryption is never unset again: the settings only get replaced.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomState {
    pub members: BTreeMap<OwnedUserId, MemberInfo>,
    pub encryption: Option<EncryptionSettings>,
    pub name: Option<String>,
    pub created: bool,
}

impl RoomState {
    /// Apply one state event.
    pub fn register(&mut self, event: &StateEvent) {
        match &event.content {
            StateContent::Member(content) => {
                let Ok(user_id) = ruma::UserId::parse(&event.state_key) else {
                    warn!(
                        state_key = event.state_key.as_str(),
                        "Ignoring a member event with an invalid state key"
                    );
                    return;
                };

                self.members.insert(
                    user_id,
                    MemberInfo {
                        membership: content.membership,
                        display_name: content.displayname.clone(),
                    },
                );
            }
            StateContent::Encryption(content) => {
                self.encryption = Some(EncryptionSettings::from(content));
            }
            StateContent::Create(_) => self.created = true,
            StateContent::Name(content) => self.name = Some(content.name.clone()),
            StateContent::Unknown { .. } => {}
        }
    }

    /// Is the room end-to-end encrypted?
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// The users a new group session must reach: everyone joined or
    /// invited.
    pub fn encryption_targets(&self) -> Vec<OwnedUserId> {
        self.members
            .iter()
            .filter(|(_, info)| {
                matches!(info.membership, Membership::Join | Membership::Invite)
            })
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct RoomSnapshot {
    id: OwnedRoomId,
    invited: bool,
    left: bool,
    summary_heroes: Vec<OwnedUserId>,
    summary_joined: u64,
    summary_invited: u64,
    unread_notifications: u64,
    unread_highlights: u64,
    state: RoomState,
}

/// A room the client is or was part of.
#[derive(Clone, Debug)]
pub struct Room {
    pub id: OwnedRoomId,
    /// We are invited but haven't joined.
    pub invited: bool,
    /// We left or were removed.
    pub left: bool,
    pub summary_heroes: Vec<OwnedUserId>,
    pub summary_joined: u64,
    pub summary_invited: u64,
    pub unread_notifications: u64,
    pub unread_highlights: u64,
    pub state: RoomState,
    pub timeline: Timeline,
}

impl Room {
    fn dir(base_dir: &Path, id: &RoomId) -> PathBuf {
        base_dir.join("rooms").join(encode_file_name(id.as_str()))
    }

    pub(crate) fn new(base_dir: &Path, id: OwnedRoomId) -> Self {
        let dir = Self::dir(base_dir, &id);

        Self {
            id,
            invited: false,
            left: false,
            summary_heroes: Vec::new(),
            summary_joined: 0,
            summary_invited: 0,
            unread_notifications: 0,
            unread_highlights: 0,
            state: RoomState::default(),
            timeline: Timeline::new(dir),
        }
    }

    /// Load a room from its directory, or start it fresh when nothing was
    /// persisted yet.
    pub(crate) fn load(base_dir: &Path, id: OwnedRoomId) -> StoreResult<Self> {
        let dir = Self::dir(base_dir, &id);

        let Some(snapshot) = read_json::<RoomSnapshot>(&dir.join("state.json"))? else {
            return Ok(Self::new(base_dir, id));
        };

        Ok(Self {
            id,
            invited: snapshot.invited,
            left: snapshot.left,
            summary_heroes: snapshot.summary_heroes,
            summary_joined: snapshot.summary_joined,
            summary_invited: snapshot.summary_invited,
            unread_notifications: snapshot.unread_notifications,
            unread_highlights: snapshot.unread_highlights,
            state: snapshot.state,
            timeline: Timeline::load(dir)?,
        })
    }

    /// Persist the room's state snapshot.
    pub(crate) fn save_state(&self, base_dir: &Path) -> StoreResult<()> {
        let snapshot = RoomSnapshot {
            id: self.id.clone(),
            invited: self.invited,
            left: self.left,
            summary_heroes: self.summary_heroes.clone(),
            summary_joined: self.summary_joined,
            summary_invited: self.summary_invited,
            unread_notifications: self.unread_notifications,
            unread_highlights: self.unread_highlights,
            state: self.state.clone(),
        };

        write_json_atomic(&Self::dir(base_dir, &self.id).join("state.json"), &snapshot)
    }

    /// The room ids of every room persisted under the base directory.
    pub(crate) fn stored_rooms(base_dir: &Path) -> StoreResult<Vec<OwnedRoomId>> {
        let rooms_dir = base_dir.join("rooms");

        let entries = match std::fs::read_dir(&rooms_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();

        for entry in entries.filter_map(|e| e.ok()) {
            let state = entry.path().join("state.json");

            if let Some(snapshot) = read_json::<RoomSnapshot>(&state)? {
                ids.push(snapshot.id);
            }
        }

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id};
    use serde_json::json;

    use super::*;

    fn member_event(user: &str, membership: &str) -> StateEvent {
        StateEvent::from_value(&json!({
            "sender": user,
            "state_key": user,
            "type": "m.room.member",
            "content": { "membership": membership },
        }))
        .unwrap()
    }

    #[test]
    fn membership_snapshot_drives_encryption_targets() {
        let mut state = RoomState::default();

        state.register(&member_event("@alice:example.org", "join"));
        state.register(&member_event("@bob:example.org", "invite"));
        state.register(&member_event("@carol:example.org", "leave"));

        let targets = state.encryption_targets();
        assert_eq!(
            targets,
            vec![
                user_id!("@alice:example.org").to_owned(),
                user_id!("@bob:example.org").to_owned(),
            ]
        );

        state.register(&member_event("@bob:example.org", "ban"));
        assert_eq!(state.encryption_targets().len(), 1);
    }

    #[test]
    fn encryption_settings_come_from_state() {
        let mut state = RoomState::default();
        assert!(!state.is_encrypted());

        let event = StateEvent::from_value(&json!({
            "sender": "@alice:example.org",
            "state_key": "",
            "type": "m.room.encryption",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "rotation_period_msgs": 7u64,
            },
        }))
        .unwrap();

        state.register(&event);
        assert!(state.is_encrypted());
        assert_eq!(state.encryption.as_ref().unwrap().sessions_max_messages, 7);
    }

    #[test]
    fn room_round_trips_through_its_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let room_id = room_id!("!snapshot:example.org");

        {
            let mut room = Room::new(dir.path(), room_id.to_owned());
            room.invited = true;
            room.summary_joined = 3;
            room.state.register(&member_event("@alice:example.org", "join"));
            room.save_state(dir.path()).unwrap();
        }

        let room = Room::load(dir.path(), room_id.to_owned()).unwrap();
        assert!(room.invited);
        assert_eq!(room.summary_joined, 3);
        assert_eq!(room.state.members.len(), 1);

        assert_eq!(Room::stored_rooms(dir.path()).unwrap(), vec![room_id.to_owned()]);
    }
}

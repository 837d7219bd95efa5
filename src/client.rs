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

//! The client.
//!
//! [`Client`] owns every subsystem by value: the HTTP transport, the crypto
//! state machine, the device registry (inside the machine), the room map
//! and the sync cursor. Mutable subsystems sit behind their own lock, and
//! every mutating flow persists its state before handing control back.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
};

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    crypto::OlmMachine,
    error::{Error, Result},
    events::{MessageContent, RoomContent, TimelineEvent},
    http_client::HttpClient,
    rooms::Room,
    session::Session,
    store::ClientConfig,
    sync::process_timeline_value,
};

const DEFAULT_DEVICE_DISPLAY_NAME: &str = "matrix-mio";

pub(crate) struct ClientInner {
    pub(crate) http: HttpClient,
    pub(crate) base_dir: PathBuf,
    pub(crate) session: StdRwLock<Option<Session>>,
    pub(crate) sync_token: StdMutex<Option<String>>,
    pub(crate) rooms: Mutex<BTreeMap<OwnedRoomId, Room>>,
    pub(crate) olm: Mutex<Option<OlmMachine>>,
    pub(crate) pause: watch::Sender<bool>,
    pub(crate) pause_rx: watch::Receiver<bool>,
}

/// A Matrix client.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client for the given homeserver, storing its state under
    /// `base_dir`.
    pub fn new(homeserver: Url, base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::build(homeserver, base_dir.into(), None)
    }

    /// Restore a client from a previously saved base directory.
    ///
    /// Returns `None` when no client was ever saved there.
    pub fn restore(base_dir: impl Into<PathBuf>) -> Result<Option<Self>> {
        let base_dir = base_dir.into();

        let Some(config) = ClientConfig::load(&base_dir)? else {
            return Ok(None);
        };

        let homeserver = config.homeserver.clone();
        Self::build(homeserver, base_dir, Some(config)).map(Some)
    }

    fn build(homeserver: Url, base_dir: PathBuf, config: Option<ClientConfig>) -> Result<Self> {
        let http = HttpClient::new(homeserver)?;
        let (pause, pause_rx) = watch::channel(false);

        let mut session = None;
        let mut sync_token = None;
        let mut olm = None;
        let mut rooms = BTreeMap::new();

        if let Some(config) = config {
            sync_token = config.next_batch;

            if let (Some(user_id), Some(device_id), Some(access_token)) =
                (config.user_id, config.device_id, config.access_token)
            {
                http.set_access_token(Some(access_token.clone()));
                olm = Some(OlmMachine::open(&base_dir, user_id.clone(), device_id.clone())?);
                session = Some(Session {
                    access_token,
                    user_id,
                    device_id,
                });
            }

            for room_id in Room::stored_rooms(&base_dir)? {
                let room = Room::load(&base_dir, room_id.clone())?;
                rooms.insert(room_id, room);
            }
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_dir,
                session: StdRwLock::new(session),
                sync_token: StdMutex::new(sync_token),
                rooms: Mutex::new(rooms),
                olm: Mutex::new(olm),
                pause,
                pause_rx,
            }),
        })
    }

    /// The current session, if the client is logged in.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().unwrap().clone()
    }

    /// The homeserver the client talks to.
    pub fn homeserver(&self) -> Url {
        self.inner.http.homeserver()
    }

    /// The sync cursor of the last handled sync response.
    pub fn sync_token(&self) -> Option<String> {
        self.inner.sync_token.lock().unwrap().clone()
    }

    pub(crate) fn save_config(&self) -> Result<()> {
        let session = self.session();

        let config = ClientConfig {
            homeserver: self.homeserver(),
            user_id: session.as_ref().map(|s| s.user_id.clone()),
            device_id: session.as_ref().map(|s| s.device_id.clone()),
            access_token: session.map(|s| s.access_token),
            next_batch: self.sync_token(),
        };

        config.save(&self.inner.base_dir).map_err(Error::Store)
    }

    // Authentication.

    /// Log in with a caller-provided auth dict.
    ///
    /// A stored device id is reused unless the dict names one, and the
    /// server's `.well-known` homeserver discovery is honoured. On success
    /// the device keys are uploaded and our own user is tracked.
    pub async fn login(&self, mut auth: Value) -> Result<Session> {
        if let Some(auth) = auth.as_object_mut() {
            if !auth.contains_key("device_id") {
                if let Some(device_id) = self.session().map(|s| s.device_id) {
                    auth.insert("device_id".to_owned(), Value::String(device_id.to_string()));
                }
            }

            auth.entry("initial_device_display_name".to_owned())
                .or_insert_with(|| Value::String(DEFAULT_DEVICE_DISPLAY_NAME.to_owned()));
        }

        let reply = self.inner.http.login(&auth).await?;

        if let Some(base_url) = reply["well_known"]["m.homeserver"]["base_url"].as_str() {
            match Url::parse(base_url) {
                Ok(url) => {
                    info!(homeserver = base_url, "Following the well-known homeserver");
                    self.inner.http.set_homeserver(url);
                }
                Err(e) => warn!(error = %e, "Ignoring an invalid well-known homeserver"),
            }
        }

        let session = Session {
            user_id: serde_json::from_value(reply["user_id"].clone())?,
            device_id: serde_json::from_value(reply["device_id"].clone())?,
            access_token: serde_json::from_value(reply["access_token"].clone())?,
        };

        self.inner
            .http
            .set_access_token(Some(session.access_token.clone()));

        let mut machine = OlmMachine::open(
            &self.inner.base_dir,
            session.user_id.clone(),
            session.device_id.clone(),
        )?;

        machine.upload_device_keys(&self.inner.http).await?;
        machine
            .registry
            .ensure_tracked(&self.inner.http, [session.user_id.clone()])
            .await?;

        *self.inner.olm.lock().await = Some(machine);
        *self.inner.session.write().unwrap() = Some(session.clone());
        self.save_config()?;

        Ok(session)
    }

    /// Log in with a username and password.
    pub async fn login_password(&self, user: &str, password: &str) -> Result<Session> {
        self.login(json!({
            "type": "m.login.password",
            "user": user,
            "password": password,
        }))
        .await
    }

    /// Log in with a login token.
    pub async fn login_token(&self, user: &str, token: &str) -> Result<Session> {
        self.login(json!({
            "type": "m.login.token",
            "user": user,
            "token": token,
        }))
        .await
    }

    /// End the current session on the server.
    pub async fn logout(&self) -> Result<()> {
        self.inner.http.logout().await?;
        self.clear_session()
    }

    /// End every session of the account, on every device.
    pub async fn logout_all(&self) -> Result<()> {
        self.inner.http.logout_all().await?;
        self.clear_session()
    }

    fn clear_session(&self) -> Result<()> {
        self.inner.http.set_access_token(None);
        *self.inner.session.write().unwrap() = None;
        self.save_config()
    }

    // Rooms.

    /// A snapshot of the given room, if the client knows it.
    pub async fn room(&self, room_id: &RoomId) -> Option<Room> {
        self.inner.rooms.lock().await.get(room_id).cloned()
    }

    /// The ids of every known room.
    pub async fn room_ids(&self) -> Vec<OwnedRoomId> {
        self.inner.rooms.lock().await.keys().cloned().collect()
    }

    /// Send a message to a room, transparently encrypting it when the room
    /// has encryption enabled.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        content: MessageContent,
    ) -> Result<OwnedEventId> {
        self.send_room_event(room_id, "m.room.message", serde_json::to_value(content)?)
            .await
    }

    /// Send a room event of the given type.
    ///
    /// In an encrypted room the event is wrapped into an `m.room.encrypted`
    /// envelope first; the room's current members are the key targets.
    pub async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<OwnedEventId> {
        let encryption = {
            let rooms = self.inner.rooms.lock().await;
            let room = rooms
                .get(room_id)
                .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;

            room.state
                .encryption
                .clone()
                .map(|settings| (settings, room.state.encryption_targets()))
        };

        let (event_type, content) = match encryption {
            Some((settings, targets)) => {
                let mut olm = self.inner.olm.lock().await;
                let machine = olm.as_mut().ok_or(Error::AuthenticationRequired)?;

                let encrypted = machine
                    .encrypt_room_event(
                        &self.inner.http,
                        room_id,
                        &targets,
                        &settings,
                        event_type,
                        &content,
                    )
                    .await?;

                ("m.room.encrypted".to_owned(), serde_json::to_value(encrypted)?)
            }
            None => (event_type.to_owned(), content),
        };

        let txn_id = Uuid::new_v4().to_string();
        let reply = self
            .inner
            .http
            .send_room_event(room_id, &event_type, &txn_id, &content)
            .await?;

        Ok(serde_json::from_value(reply["event_id"].clone())?)
    }

    /// Send a state event to a room.
    pub async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Result<OwnedEventId> {
        let reply = self
            .inner
            .http
            .send_state_event(room_id, event_type, state_key, &content)
            .await?;

        Ok(serde_json::from_value(reply["event_id"].clone())?)
    }

    /// Enable Megolm encryption in a room with the default rotation
    /// settings.
    pub async fn enable_encryption(&self, room_id: &RoomId) -> Result<OwnedEventId> {
        self.send_state_event(
            room_id,
            "m.room.encryption",
            None,
            json!({ "algorithm": crate::crypto::MEGOLM_V1_ALGORITHM }),
        )
        .await
    }

    /// Fetch one batch of older events for the room's most recent gap.
    ///
    /// Returns the fetched events. The gap is resolved when the server runs
    /// out of events, or when the batch reaches the last event known before
    /// the gap or the room's creation event.
    pub async fn fill_gap(&self, room_id: &RoomId, limit: u32) -> Result<Vec<TimelineEvent>> {
        let gap = {
            let rooms = self.inner.rooms.lock().await;
            let room = rooms
                .get(room_id)
                .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;
            room.timeline.gaps.last().cloned()
        };

        let Some(gap) = gap else {
            return Ok(Vec::new());
        };

        let reply = self
            .inner
            .http
            .room_messages(room_id, &gap.fill_token, limit)
            .await?;

        let chunk = reply["chunk"].as_array().cloned().unwrap_or_default();

        let mut olm = self.inner.olm.lock().await;
        let mut rooms = self.inner.rooms.lock().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;

        if chunk.is_empty() {
            room.timeline.resolve_gap(&gap.event_after)?;
            return Ok(Vec::new());
        }

        let mut fetched = Vec::new();
        let mut reached_known = false;

        for value in &chunk {
            if let Some(machine) = olm.as_mut() {
                process_timeline_value(&self.inner.http, machine, room, value).await?;
            }

            if let Ok(event) = TimelineEvent::from_value(value) {
                if Some(&event.event_id) == gap.event_before.as_ref() {
                    reached_known = true;
                }

                if matches!(
                    &event.content,
                    RoomContent::Unknown { event_type, .. } if event_type == "m.room.create"
                ) {
                    reached_known = true;
                }

                fetched.push(event);
            }
        }

        if reached_known {
            room.timeline.resolve_gap(&gap.event_after)?;
        } else if let Some(end) = reply["end"].as_str() {
            for stored in room.timeline.gaps.iter_mut() {
                if stored.event_after == gap.event_after {
                    stored.fill_token = end.to_owned();
                }
            }
        }

        room.save_state(&self.inner.base_dir)?;

        Ok(fetched)
    }

    // Trust decisions.

    /// Trust a device: parked session requests from it are answered, once.
    pub async fn trust_device(
        &self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> Result<()> {
        let mut olm = self.inner.olm.lock().await;
        let machine = olm.as_mut().ok_or(Error::AuthenticationRequired)?;

        machine
            .trust_device(&self.inner.http, user_id, device_id)
            .await
    }

    /// Block a device: it stops receiving new room keys, and every group
    /// session it already received is rotated away.
    pub async fn block_device(
        &self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> Result<()> {
        let mut olm = self.inner.olm.lock().await;
        let machine = olm.as_mut().ok_or(Error::AuthenticationRequired)?;

        machine.block_device(user_id, device_id)
    }

    /// The trust state of a device, if it is known.
    pub async fn device_trust(
        &self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> Option<crate::crypto::TrustState> {
        let olm = self.inner.olm.lock().await;
        olm.as_ref()?
            .registry
            .get(user_id, device_id)
            .map(|device| device.trust)
    }

    /// Forget users we no longer share an encrypted room with.
    pub async fn drop_tracked_users(
        &self,
        users: impl IntoIterator<Item = OwnedUserId>,
    ) -> Result<()> {
        let mut olm = self.inner.olm.lock().await;

        if let Some(machine) = olm.as_mut() {
            machine.registry.drop_users(users).map_err(Error::Store)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("homeserver", &self.homeserver())
            .field("session", &self.session())
            .finish()
    }
}

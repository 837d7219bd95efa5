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

//! Device tracking.
//!
//! The registry holds every device we know about, keyed by user. A user
//! being present in the map means we track them; `ensure_tracked` queries
//! the ones we don't know yet. Device entries are accepted only when their
//! self-signature verifies and, for devices seen before, when the ed25519
//! key is unchanged (trust on first use).

use std::collections::{BTreeMap, HashMap};

use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    device::{Device, TrustState},
    error::QueriedDeviceError,
    json::verify_signed_json,
};
use crate::{
    error::Error,
    events::GroupSessionRequest,
    http_client::{HttpClient, KEY_REQUEST_TIMEOUT},
    store::{read_json, write_json_atomic, StoreError},
};

pub struct DeviceRegistry {
    path: std::path::PathBuf,
    own_user_id: OwnedUserId,
    own_device_id: OwnedDeviceId,
    devices: HashMap<OwnedUserId, BTreeMap<OwnedDeviceId, Device>>,
}

#[derive(Serialize, Deserialize)]
struct StoredRegistry {
    devices: HashMap<OwnedUserId, BTreeMap<OwnedDeviceId, Device>>,
}

impl DeviceRegistry {
    /// Load the registry, inserting our own device built from the given
    /// identity keys if it isn't stored yet.
    pub fn open(
        path: std::path::PathBuf,
        own_user_id: OwnedUserId,
        own_device_id: OwnedDeviceId,
        own_ed25519: String,
        own_curve25519: String,
    ) -> Result<Self, StoreError> {
        let stored: Option<StoredRegistry> = read_json(&path)?;

        let mut registry = Self {
            path,
            own_user_id: own_user_id.clone(),
            own_device_id: own_device_id.clone(),
            devices: stored.map(|s| s.devices).unwrap_or_default(),
        };

        let own = registry
            .devices
            .entry(own_user_id.clone())
            .or_default()
            .entry(own_device_id.clone());

        own.or_insert_with(|| Device {
            user_id: own_user_id,
            device_id: own_device_id,
            ed25519: own_ed25519,
            curve25519: own_curve25519,
            algorithms: vec![
                super::OLM_V1_ALGORITHM.to_owned(),
                super::MEGOLM_V1_ALGORITHM.to_owned(),
            ],
            display_name: None,
            // The device we are driving doesn't need a manual decision.
            trust: TrustState::Trusted,
            pending_session_requests: BTreeMap::new(),
        });

        registry.save()?;
        Ok(registry)
    }

    pub fn save(&self) -> Result<(), StoreError> {
        write_json_atomic(
            &self.path,
            &StoredRegistry {
                devices: self.devices.clone(),
            },
        )
    }

    // Lookups.

    /// All devices of our own user.
    pub fn own(&self) -> &BTreeMap<OwnedDeviceId, Device> {
        self.devices
            .get(&self.own_user_id)
            .expect("the registry always contains our own user")
    }

    /// The device this client is driving.
    pub fn current(&self) -> &Device {
        self.own()
            .get(&self.own_device_id)
            .expect("the registry always contains our own device")
    }

    pub fn is_tracked(&self, user_id: &UserId) -> bool {
        self.devices.contains_key(user_id)
    }

    pub fn devices_of(&self, user_id: &UserId) -> impl Iterator<Item = &Device> {
        self.devices.get(user_id).into_iter().flat_map(|d| d.values())
    }

    pub fn get(&self, user_id: &UserId, device_id: &ruma::DeviceId) -> Option<&Device> {
        self.devices.get(user_id)?.get(device_id)
    }

    fn get_mut(&mut self, user_id: &UserId, device_id: &ruma::DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(user_id)?.get_mut(device_id)
    }

    /// Find a device of the given user by its curve25519 key.
    pub fn device_by_curve(&self, user_id: &UserId, curve25519: &str) -> Option<&Device> {
        self.devices_of(user_id).find(|d| d.curve25519 == curve25519)
    }

    /// Find any known device by its curve25519 key, used for forward chain
    /// checks where the owning user isn't known.
    pub fn any_device_by_curve(&self, curve25519: &str) -> Option<&Device> {
        self.devices
            .values()
            .flat_map(|devices| devices.values())
            .find(|d| d.curve25519 == curve25519)
    }

    /// All tracked users.
    pub fn tracked_users(&self) -> impl Iterator<Item = &OwnedUserId> {
        self.devices.keys()
    }

    // Queries.

    /// Make sure every listed user is tracked, querying the ones we don't
    /// know about yet.
    pub async fn ensure_tracked(
        &mut self,
        http: &HttpClient,
        users: impl IntoIterator<Item = OwnedUserId>,
    ) -> Result<(), Error> {
        let missing: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> = users
            .into_iter()
            .filter(|user| !self.is_tracked(user))
            .map(|user| (user, Vec::new()))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        self.query(http, missing, None).await
    }

    /// Re-query users the server flagged as changed. Only users we already
    /// track are refreshed; the sync token anchors the partial update.
    pub async fn update(
        &mut self,
        http: &HttpClient,
        changed: impl IntoIterator<Item = OwnedUserId>,
        token: Option<&str>,
    ) -> Result<(), Error> {
        let stale: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> = changed
            .into_iter()
            .filter(|user| self.is_tracked(user))
            .map(|user| (user, Vec::new()))
            .collect();

        if stale.is_empty() {
            return Ok(());
        }

        self.query(http, stale, token).await
    }

    /// POST `/keys/query` for the given device selection and apply every
    /// accepted entry. An empty device list requests all of a user's
    /// devices.
    pub async fn query(
        &mut self,
        http: &HttpClient,
        devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
        token: Option<&str>,
    ) -> Result<(), Error> {
        if devices.is_empty() {
            return Ok(());
        }

        info!(?devices, "Querying device keys");

        let mut body = json!({
            "device_keys": devices,
            "timeout": KEY_REQUEST_TIMEOUT.as_millis() as u64,
        });

        if let Some(token) = token {
            body["token"] = token.into();
        }

        let reply = http.keys_query(&body).await?;

        if let Some(failures) = reply.get("failures").filter(|f| {
            f.as_object().is_some_and(|o| !o.is_empty())
        }) {
            warn!(?failures, "Failed querying devices from some servers");
        }

        let empty = serde_json::Map::new();
        let device_keys = reply
            .get("device_keys")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        for (user_id, user_devices) in device_keys {
            let Ok(user_id) = UserId::parse(user_id.as_str()) else {
                warn!(
                    user_id = user_id.as_str(),
                    "The server returned devices for an invalid user id"
                );
                continue;
            };

            // Being listed in the reply is what marks the user as tracked,
            // even if every entry ends up rejected.
            self.devices.entry(user_id.clone()).or_default();

            let Some(user_devices) = user_devices.as_object() else {
                continue;
            };

            for (device_id, entry) in user_devices {
                let device_id: OwnedDeviceId = device_id.as_str().into();

                if user_id == self.own_user_id && device_id == self.own_device_id {
                    continue;
                }

                if let Err(e) = self.accept_queried_device(&user_id, &device_id, entry) {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        error = %e,
                        "Rejected a queried device"
                    );
                }
            }
        }

        self.save().map_err(Error::Store)?;
        Ok(())
    }

    /// The acceptance policy for one `device_keys.<user>.<device>` entry.
    pub(crate) fn accept_queried_device(
        &mut self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
        entry: &Value,
    ) -> Result<(), QueriedDeviceError> {
        let entry_user = entry.get("user_id").and_then(Value::as_str).unwrap_or("");
        if entry_user != user_id.as_str() {
            return Err(QueriedDeviceError::UserIdMismatch {
                queried: user_id.to_owned(),
                entry: entry_user.to_owned(),
            });
        }

        let entry_device = entry.get("device_id").and_then(Value::as_str).unwrap_or("");
        if entry_device != device_id.as_str() {
            return Err(QueriedDeviceError::DeviceIdMismatch {
                queried: device_id.to_owned(),
                entry: entry_device.to_owned(),
            });
        }

        let keys = entry.get("keys");

        let ed25519 = keys
            .and_then(|k| k.get(format!("ed25519:{device_id}")))
            .and_then(Value::as_str)
            .ok_or_else(|| QueriedDeviceError::MissingKey("ed25519".to_owned()))?
            .to_owned();

        verify_signed_json(entry, user_id, device_id, &ed25519)?;

        // Trust on first use: the signing key of a known device never
        // changes, whatever a later query claims.
        if let Some(known) = self.get(user_id, device_id) {
            if known.ed25519 != ed25519 {
                return Err(QueriedDeviceError::Ed25519Changed {
                    stored: known.ed25519.clone(),
                    queried: ed25519,
                });
            }
        }

        let curve25519 = keys
            .and_then(|k| k.get(format!("curve25519:{device_id}")))
            .and_then(Value::as_str)
            .ok_or_else(|| QueriedDeviceError::MissingKey("curve25519".to_owned()))?
            .to_owned();

        let algorithms = entry
            .get("algorithms")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let display_name = entry
            .get("unsigned")
            .and_then(|u| u.get("device_display_name"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let (trust, pending) = match self.get(user_id, device_id) {
            Some(known) => (known.trust, known.pending_session_requests.clone()),
            None => {
                debug!(
                    user_id = user_id.as_str(),
                    device_id = device_id.as_str(),
                    "Found a new device"
                );
                (TrustState::Unset, BTreeMap::new())
            }
        };

        self.devices.entry(user_id.to_owned()).or_default().insert(
            device_id.to_owned(),
            Device {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                ed25519,
                curve25519,
                algorithms,
                display_name,
                trust,
                pending_session_requests: pending,
            },
        );

        Ok(())
    }

    /// Forget users we no longer share an encrypted room with.
    pub fn drop_users(
        &mut self,
        users: impl IntoIterator<Item = OwnedUserId>,
    ) -> Result<(), StoreError> {
        let mut dropped = false;

        for user in users {
            if user == self.own_user_id {
                continue;
            }

            dropped |= self.devices.remove(&user).is_some();
        }

        if dropped {
            self.save()?;
        }

        Ok(())
    }

    // Trust decisions.

    /// Mark a device as trusted.
    ///
    /// Returns the session requests that were parked on the device; the
    /// caller replays each of them exactly once.
    pub fn trust(
        &mut self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> Result<Vec<GroupSessionRequest>, StoreError> {
        let Some(device) = self.get_mut(user_id, device_id) else {
            return Ok(Vec::new());
        };

        device.trust = TrustState::Trusted;
        let pending = std::mem::take(&mut device.pending_session_requests);

        self.save()?;
        Ok(pending.into_values().collect())
    }

    /// Mark a device as blocked.
    pub fn block(
        &mut self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> Result<(), StoreError> {
        if let Some(device) = self.get_mut(user_id, device_id) {
            device.trust = TrustState::Blocked;
            self.save()?;
        }

        Ok(())
    }

    /// Park a session request on the device that sent it, to be replayed if
    /// the device is trusted later.
    pub fn park_session_request(
        &mut self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
        request: GroupSessionRequest,
    ) -> Result<(), StoreError> {
        if let Some(device) = self.get_mut(user_id, device_id) {
            device
                .pending_session_requests
                .insert(request.request_id.clone(), request);
            self.save()?;
        }

        Ok(())
    }

    /// Remove a parked request after its cancellation arrived.
    pub fn cancel_session_request(
        &mut self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
        request_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(device) = self.get_mut(user_id, device_id) {
            if device.pending_session_requests.remove(request_id).is_some() {
                self.save()?;
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("own_user_id", &self.own_user_id)
            .field("own_device_id", &self.own_device_id)
            .field("tracked_users", &self.devices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;
    use crate::crypto::{json::sign_json, olm::Account};

    fn registry(dir: &std::path::Path) -> DeviceRegistry {
        let account = Account::new();
        DeviceRegistry::open(
            dir.join("devices.json"),
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            account.ed25519(),
            account.curve25519(),
        )
        .unwrap()
    }

    /// Build a signed `device_keys` entry the way a server would relay it.
    fn signed_entry(account: &Account, user_id: &UserId, device_id: &ruma::DeviceId) -> Value {
        let mut entry = json!({
            "user_id": user_id,
            "device_id": device_id,
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                (format!("curve25519:{device_id}")): account.curve25519(),
                (format!("ed25519:{device_id}")): account.ed25519(),
            },
            "unsigned": { "device_display_name": "bob's phone" },
        });

        sign_json(account, user_id, device_id, &mut entry).unwrap();
        entry
    }

    #[test]
    fn own_device_exists_and_is_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let current = registry.current();
        assert_eq!(current.device_id, "ALICEDEVICE");
        assert!(current.is_trusted());
    }

    #[test]
    fn valid_entries_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path());

        let bob = user_id!("@bob:example.org");
        let bob_account = Account::new();
        let entry = signed_entry(&bob_account, bob, device_id!("BOBDEVICE"));

        registry
            .accept_queried_device(bob, device_id!("BOBDEVICE"), &entry)
            .unwrap();

        let device = registry.get(bob, device_id!("BOBDEVICE")).unwrap();
        assert_eq!(device.ed25519, bob_account.ed25519());
        assert_eq!(device.display_name.as_deref(), Some("bob's phone"));
        assert_eq!(device.trust, TrustState::Unset);
    }

    #[test]
    fn mismatched_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path());

        let bob = user_id!("@bob:example.org");
        let entry = signed_entry(&Account::new(), user_id!("@eve:example.org"), device_id!("BOBDEVICE"));

        let error = registry
            .accept_queried_device(bob, device_id!("BOBDEVICE"), &entry)
            .unwrap_err();
        assert!(matches!(error, QueriedDeviceError::UserIdMismatch { .. }));
    }

    #[test]
    fn changed_ed25519_is_rejected_and_keeps_the_stored_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path());

        let bob = user_id!("@bob:example.org");
        let original = Account::new();
        let entry = signed_entry(&original, bob, device_id!("BOBDEVICE"));
        registry
            .accept_queried_device(bob, device_id!("BOBDEVICE"), &entry)
            .unwrap();

        let replacement = Account::new();
        let entry = signed_entry(&replacement, bob, device_id!("BOBDEVICE"));

        let error = registry
            .accept_queried_device(bob, device_id!("BOBDEVICE"), &entry)
            .unwrap_err();
        assert!(matches!(error, QueriedDeviceError::Ed25519Changed { .. }));

        let stored = registry.get(bob, device_id!("BOBDEVICE")).unwrap();
        assert_eq!(stored.ed25519, original.ed25519());
    }

    #[test]
    fn tampered_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path());

        let bob = user_id!("@bob:example.org");
        let mut entry = signed_entry(&Account::new(), bob, device_id!("BOBDEVICE"));
        entry["algorithms"] = json!(["m.megolm.v1.aes-sha2"]);

        let error = registry
            .accept_queried_device(bob, device_id!("BOBDEVICE"), &entry)
            .unwrap_err();
        assert!(matches!(error, QueriedDeviceError::Signature(_)));
    }

    #[test]
    fn trust_drains_pending_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path());

        let bob = user_id!("@bob:example.org");
        let entry = signed_entry(&Account::new(), bob, device_id!("BOBDEVICE"));
        registry
            .accept_queried_device(bob, device_id!("BOBDEVICE"), &entry)
            .unwrap();

        let request = GroupSessionRequest::new(
            device_id!("BOBDEVICE").to_owned(),
            ruma::room_id!("!room:example.org").to_owned(),
            "creator".to_owned(),
            "session".to_owned(),
        );
        registry
            .park_session_request(bob, device_id!("BOBDEVICE"), request.clone())
            .unwrap();

        let replayed = registry.trust(bob, device_id!("BOBDEVICE")).unwrap();
        assert_eq!(replayed, vec![request]);

        // A second trust call has nothing left to replay.
        assert!(registry.trust(bob, device_id!("BOBDEVICE")).unwrap().is_empty());
        assert!(registry
            .get(bob, device_id!("BOBDEVICE"))
            .unwrap()
            .pending_session_requests
            .is_empty());
    }
}

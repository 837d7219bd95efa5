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

//! The Olm state machine.
//!
//! Orchestrates the account, the session store and the device registry:
//! encrypting and decrypting to-device payloads over Olm, and room events
//! over Megolm. Key distribution lives in the `key_sharing` sibling module
//! as further methods on [`OlmMachine`].

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use ruma::{
    EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, RoomId, UserId,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vodozemac::olm::OlmMessage;

use super::{
    device::Device,
    error::{MegolmError, OlmError, SignatureError, VerificationError},
    json::{canonical_json, sign_json, verify_signed_json},
    olm::{
        message_from_parts, EncryptionSettings, InboundGroupSession, OutboundGroupSession,
    },
    registry::DeviceRegistry,
    store::{InboundGroupKey, SessionStore},
    MEGOLM_V1_ALGORITHM, OLM_V1_ALGORITHM,
};
use crate::{
    error::Error,
    events::{MegolmContent, OlmCiphertext, OlmContent},
    http_client::HttpClient,
};

/// The result of decrypting an Olm to-device event.
///
/// Decryption and verification are orthogonal: the payload is present even
/// when binding checks failed, the failures just ride along.
#[derive(Debug)]
pub struct OlmDecryptionResult {
    /// The decrypted payload.
    pub payload: Value,
    /// Binding violations found while verifying the payload.
    pub verification_errors: Vec<VerificationError>,
    /// The curve25519 key of the sending device, from the envelope.
    pub sender_curve25519: String,
    /// The ed25519 key the payload claims for the sender. Only anchored
    /// when `verification_errors` is empty.
    pub claimed_ed25519: String,
}

/// The result of decrypting a Megolm room event.
#[derive(Debug)]
pub struct MegolmDecryptionResult {
    /// The decrypted payload, `{"type", "content", "room_id"}`.
    pub payload: Value,
    /// Trust and binding violations; multiple may apply at once.
    pub verification_errors: Vec<VerificationError>,
    /// The forward chain of the session the event was decrypted with.
    pub forward_chain: Vec<String>,
}

/// The central crypto state machine of one client.
pub struct OlmMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    pub(crate) store: SessionStore,
    pub(crate) registry: DeviceRegistry,
}

impl OlmMachine {
    /// Open the crypto state for the given identity, creating a fresh
    /// account when none is stored under the base directory yet.
    pub fn open(
        base_dir: &Path,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    ) -> Result<Self, Error> {
        let store = SessionStore::open(base_dir.join("e2e.json"))?;

        let registry = DeviceRegistry::open(
            base_dir.join("devices.json"),
            user_id.clone(),
            device_id.clone(),
            store.account.ed25519(),
            store.account.curve25519(),
        )
        .map_err(Error::Store)?;

        Ok(Self {
            user_id,
            device_id,
            store,
            registry,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &ruma::DeviceId {
        &self.device_id
    }

    /// Our own curve25519 identity key.
    pub fn own_curve25519(&self) -> String {
        self.store.account.curve25519()
    }

    /// Our own ed25519 signing key.
    pub fn own_ed25519(&self) -> String {
        self.store.account.ed25519()
    }

    // Key uploads.

    /// The signed `device_keys` payload for `/keys/upload`.
    fn signed_device_keys(&self) -> Result<Value, SignatureError> {
        let mut keys = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": [OLM_V1_ALGORITHM, MEGOLM_V1_ALGORITHM],
            "keys": {
                (format!("curve25519:{}", self.device_id)): self.store.account.curve25519(),
                (format!("ed25519:{}", self.device_id)): self.store.account.ed25519(),
            },
        });

        sign_json(&self.store.account, &self.user_id, &self.device_id, &mut keys)?;
        Ok(keys)
    }

    /// Upload our signed device keys, once per account lifetime, and top up
    /// the one-time key pool afterwards.
    pub async fn upload_device_keys(&mut self, http: &HttpClient) -> Result<(), Error> {
        if self.store.device_keys_uploaded {
            return Ok(());
        }

        let device_keys = self.signed_device_keys()?;
        let reply = http
            .keys_upload(&json!({ "device_keys": device_keys }))
            .await?;

        info!("Uploaded the signed device keys");
        self.store.device_keys_uploaded = true;
        self.store.save()?;

        let uploaded = reply["one_time_key_counts"]["signed_curve25519"]
            .as_u64()
            .unwrap_or(0);
        self.replenish_one_time_keys(http, uploaded).await
    }

    fn generate_signed_one_time_keys(
        &mut self,
        count: usize,
    ) -> Result<Vec<(String, Value)>, SignatureError> {
        self.store.account.generate_one_time_keys(count);

        let mut signed = Vec::new();

        for (key_id, key) in self.store.account.one_time_keys() {
            let mut dict = json!({ "key": key });
            sign_json(&self.store.account, &self.user_id, &self.device_id, &mut dict)?;
            signed.push((format!("signed_curve25519:{key_id}"), dict));
        }

        Ok(signed)
    }

    /// Top up the server side one-time key pool if it dropped below half of
    /// the account's capacity.
    pub async fn replenish_one_time_keys(
        &mut self,
        http: &HttpClient,
        server_count: u64,
    ) -> Result<(), Error> {
        let minimum = (self.store.account.max_one_time_keys() / 2) as u64;

        if server_count >= minimum {
            return Ok(());
        }

        let keys = self.generate_signed_one_time_keys((minimum - server_count) as usize)?;

        if keys.is_empty() {
            return Ok(());
        }

        debug!(count = keys.len(), "Uploading new one-time keys");

        let body: serde_json::Map<String, Value> = keys.into_iter().collect();
        http.keys_upload(&json!({ "one_time_keys": body })).await?;

        self.store.account.mark_keys_as_published();
        self.store.save()?;
        Ok(())
    }

    // One-time key claiming.

    /// POST `/keys/claim` for the given devices and validate every returned
    /// key's signature. Keys with a missing `key` field or a bad signature
    /// are skipped with a warning.
    pub(crate) async fn claim_one_time_keys(
        &self,
        http: &HttpClient,
        devices: &[Device],
    ) -> Result<HashMap<(OwnedUserId, OwnedDeviceId), String>, Error> {
        if devices.is_empty() {
            return Ok(HashMap::new());
        }

        let mut wanted: BTreeMap<&UserId, BTreeMap<&ruma::DeviceId, &str>> = BTreeMap::new();
        for device in devices {
            wanted
                .entry(&device.user_id)
                .or_default()
                .insert(&device.device_id, "signed_curve25519");
        }

        info!(?wanted, "Claiming one-time keys");

        let body = json!({
            "timeout": crate::http_client::KEY_REQUEST_TIMEOUT.as_millis() as u64,
            "one_time_keys": wanted,
        });
        let reply = http.keys_claim(&body).await?;

        if let Some(failures) = reply
            .get("failures")
            .filter(|f| f.as_object().is_some_and(|o| !o.is_empty()))
        {
            warn!(?failures, "Failed claiming keys from some servers");
        }

        let mut validated = HashMap::new();

        let empty = serde_json::Map::new();
        let one_time_keys = reply
            .get("one_time_keys")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        for (user_id, user_devices) in one_time_keys {
            let Ok(user_id) = UserId::parse(user_id.as_str()) else {
                continue;
            };
            let Some(user_devices) = user_devices.as_object() else {
                continue;
            };

            for (device_id, key_map) in user_devices {
                let device_id: OwnedDeviceId = device_id.as_str().into();

                let Some(device) = self.registry.get(&user_id, &device_id) else {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        "Claimed a one-time key for an unknown device"
                    );
                    continue;
                };

                let Some(key_map) = key_map.as_object() else {
                    continue;
                };

                for key_dict in key_map.values() {
                    let Some(key) = key_dict.get("key").and_then(Value::as_str) else {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "The claimed key has no key field"
                        );
                        continue;
                    };

                    match verify_signed_json(key_dict, &user_id, &device_id, &device.ed25519) {
                        Ok(()) => {
                            validated
                                .insert((user_id.clone(), device_id.clone()), key.to_owned());
                        }
                        Err(e) => warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            error = %e,
                            "Rejected a claimed one-time key"
                        ),
                    }
                }
            }
        }

        Ok(validated)
    }

    // Olm encryption.

    /// Olm encrypt a payload for every target device that has (or can get)
    /// a session with us.
    ///
    /// Returns the encrypted contents grouped per user and device, along
    /// with the devices that couldn't be reached because they had no
    /// one-time key left. Those keep being retried on later sends.
    pub(crate) async fn olm_encrypt_to_devices(
        &mut self,
        http: &HttpClient,
        event_type: &str,
        content: &Value,
        targets: Vec<Device>,
    ) -> Result<
        (
            BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
            Vec<Device>,
        ),
        Error,
    > {
        let targets: Vec<Device> = targets
            .into_iter()
            .filter(|d| !(d.user_id == self.user_id && d.device_id == self.device_id))
            .collect();

        let missing: Vec<Device> = targets
            .iter()
            .filter(|d| !self.store.has_outbound_session(&d.curve25519))
            .cloned()
            .collect();

        let claimed = self.claim_one_time_keys(http, &missing).await?;

        let mut no_otks = Vec::new();

        for device in missing {
            match claimed.get(&(device.user_id.clone(), device.device_id.clone())) {
                Some(one_time_key) => {
                    let session = self
                        .store
                        .account
                        .create_outbound_session(&device.curve25519, one_time_key)
                        .map_err(OlmError::Key)?;

                    info!(
                        user_id = device.user_id.as_str(),
                        device_id = device.device_id.as_str(),
                        "Created a new outbound Olm session"
                    );
                    self.store.add_outbound_session(&device.curve25519, session)?;
                }
                None => no_otks.push(device),
            }
        }

        let own_ed25519 = self.store.account.ed25519();
        let own_curve25519 = self.store.account.curve25519();

        let mut messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>> = BTreeMap::new();

        for device in &targets {
            if no_otks
                .iter()
                .any(|d| d.user_id == device.user_id && d.device_id == device.device_id)
            {
                continue;
            }

            let payload = json!({
                "type": event_type,
                "content": content,
                "sender": self.user_id,
                "keys": { "ed25519": own_ed25519 },
                "recipient": device.user_id,
                "recipient_keys": { "ed25519": device.ed25519 },
            });
            let plaintext = canonical_json(&payload)?;

            let Some(session) = self.store.outbound_session_mut(&device.curve25519) else {
                continue;
            };
            let cipher = session.encrypt(&plaintext);

            let olm_content = OlmContent {
                algorithm: OLM_V1_ALGORITHM.to_owned(),
                sender_curve25519: own_curve25519.clone(),
                ciphertext: BTreeMap::from([(device.curve25519.clone(), cipher)]),
            };

            messages
                .entry(device.user_id.clone())
                .or_default()
                .insert(device.device_id.clone(), serde_json::to_value(olm_content)?);
        }

        // Every encryption advanced a ratchet.
        self.store.save()?;

        Ok((messages, no_otks))
    }

    /// PUT the given per-device contents as one to-device request. When all
    /// of a user's devices get an identical payload, the device map
    /// collapses to `"*"`.
    pub(crate) async fn send_to_devices(
        &self,
        http: &HttpClient,
        event_type: &str,
        messages: &BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
    ) -> Result<(), Error> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut wire = serde_json::Map::new();

        for (user_id, devices) in messages {
            let covers_all = self
                .registry
                .devices_of(user_id)
                .all(|d| devices.contains_key(&d.device_id));

            let contents: Vec<&Value> = devices.values().collect();
            let identical = contents.windows(2).all(|pair| pair[0] == pair[1]);

            if covers_all && identical && !contents.is_empty() {
                wire.insert(user_id.to_string(), json!({ "*": contents[0] }));
            } else {
                let map: serde_json::Map<String, Value> = devices
                    .iter()
                    .map(|(device_id, content)| (device_id.to_string(), content.clone()))
                    .collect();
                wire.insert(user_id.to_string(), Value::Object(map));
            }
        }

        let txn_id = Uuid::new_v4().to_string();
        http.send_to_device(event_type, &txn_id, &Value::Object(wire))
            .await?;

        Ok(())
    }

    // Olm decryption.

    /// Decrypt an Olm encrypted to-device event and verify the payload's
    /// sender and recipient bindings.
    pub fn decrypt_to_device_event(
        &mut self,
        sender: &UserId,
        content: &OlmContent,
    ) -> Result<OlmDecryptionResult, OlmError> {
        let our_curve25519 = self.store.account.curve25519();

        let cipher: &OlmCiphertext = content
            .ciphertext
            .get(&our_curve25519)
            .ok_or(OlmError::MissingCiphertext)?;

        let message = message_from_parts(cipher)?;
        let sender_curve25519 = content.sender_curve25519.as_str();

        let mut plaintext = None;

        if let Some(sessions) = self.store.inbound_sessions_mut(sender_curve25519) {
            for session in sessions.iter_mut() {
                let prekey_match = match &message {
                    OlmMessage::PreKey(m) => {
                        if !session.matches(m) {
                            continue;
                        }
                        true
                    }
                    OlmMessage::Normal(_) => false,
                };

                match session.decrypt(&message) {
                    Ok(p) => {
                        plaintext = Some(p);
                        break;
                    }
                    // A prekey message that matches this session but fails
                    // to decrypt can't be recovered by any other session.
                    Err(e) if prekey_match => return Err(e),
                    Err(_) => continue,
                }
            }
        }

        let plaintext = match plaintext {
            Some(p) => {
                // The winning session's ratchet advanced.
                self.store.save()?;
                p
            }
            None => {
                let OlmMessage::PreKey(m) = &message else {
                    return Err(OlmError::Decryption);
                };

                let (session, raw) = self
                    .store
                    .account
                    .create_inbound_session(sender_curve25519, m)?;

                info!(
                    sender = sender.as_str(),
                    sender_key = sender_curve25519,
                    "Created a new inbound Olm session"
                );

                // Persists both the new session and the account, whose used
                // one-time key was just removed.
                self.store.add_inbound_session(sender_curve25519, session)?;

                String::from_utf8_lossy(&raw).into_owned()
            }
        };

        let payload: Value = serde_json::from_str(&plaintext)?;

        if !payload.is_object() {
            return Err(OlmError::NotAnObject);
        }

        let verification_errors = self.verify_olm_payload(sender, sender_curve25519, &payload);

        let claimed_ed25519 = payload["keys"]["ed25519"]
            .as_str()
            .unwrap_or_default()
            .to_owned();

        Ok(OlmDecryptionResult {
            payload,
            verification_errors,
            sender_curve25519: sender_curve25519.to_owned(),
            claimed_ed25519,
        })
    }

    /// Check the sender and recipient bindings of a decrypted Olm payload.
    fn verify_olm_payload(
        &self,
        sender: &UserId,
        sender_curve25519: &str,
        payload: &Value,
    ) -> Vec<VerificationError> {
        let payload_sender = payload["sender"].as_str().unwrap_or_default();
        let payload_recipient = payload["recipient"].as_str().unwrap_or_default();
        let claimed_ed25519 = payload["keys"]["ed25519"].as_str().unwrap_or_default();
        let recipient_ed25519 = payload["recipient_keys"]["ed25519"]
            .as_str()
            .unwrap_or_default();

        if payload_sender != sender.as_str() {
            return vec![VerificationError::OlmSenderMismatch {
                event: sender.to_owned(),
                payload: payload_sender.to_owned(),
            }];
        }

        if payload_recipient != self.user_id.as_str() {
            return vec![VerificationError::OlmWrongRecipient {
                intended: payload_recipient.to_owned(),
                us: self.user_id.clone(),
            }];
        }

        let own_device = self.registry.current();

        if recipient_ed25519 != own_device.ed25519 {
            return vec![VerificationError::OlmWrongRecipientEd25519 {
                intended: recipient_ed25519.to_owned(),
                ours: own_device.ed25519.clone(),
            }];
        }

        // A payload we sent to ourselves checks out against our own keys
        // even when the sending device isn't in the registry.
        if payload_sender == self.user_id.as_str()
            && claimed_ed25519 == own_device.ed25519
            && sender_curve25519 == own_device.curve25519
        {
            return Vec::new();
        }

        for device in self.registry.devices_of(sender) {
            if device.curve25519 == sender_curve25519 && device.ed25519 == claimed_ed25519 {
                if device.is_blocked() {
                    return vec![VerificationError::OlmPayloadFromBlockedDevice {
                        user_id: device.user_id.clone(),
                        device_id: device.device_id.clone(),
                    }];
                }

                return Vec::new();
            }
        }

        vec![VerificationError::OlmFromUnknownDevice {
            claimed_ed25519: claimed_ed25519.to_owned(),
            sender_curve25519: sender_curve25519.to_owned(),
        }]
    }

    // Megolm encryption.

    /// Encrypt a room event for the given users.
    ///
    /// Selects or rotates the room's outbound group session, distributes
    /// the session key to every target device that doesn't have it yet and
    /// returns the encrypted content to send.
    pub async fn encrypt_room_event(
        &mut self,
        http: &HttpClient,
        room_id: &RoomId,
        target_users: &[OwnedUserId],
        settings: &EncryptionSettings,
        event_type: &str,
        content: &Value,
    ) -> Result<MegolmContent, Error> {
        let rotate = self
            .store
            .outbound_group_session(room_id)
            .map_or(true, |session| session.expired(settings));

        if rotate {
            let session = OutboundGroupSession::new(room_id.to_owned());

            info!(
                room_id = room_id.as_str(),
                session_id = session.session_id(),
                "Creating a new outbound group session"
            );

            // The mirror inbound record lets us decrypt our own messages.
            let mirror = InboundGroupSession::new(
                &self.store.account.curve25519(),
                &self.store.account.ed25519(),
                room_id,
                &session.session_key(),
            )
            .map_err(Error::Megolm)?;

            self.store.add_inbound_group_session(mirror)?;
            self.store.put_outbound_group_session(session)?;
        }

        self.registry
            .ensure_tracked(http, target_users.iter().cloned())
            .await?;

        let (session_id, session_key) = {
            let session = self
                .store
                .outbound_group_session(room_id)
                .expect("the outbound session was installed above");
            (session.session_id().to_owned(), session.session_key())
        };

        let targets: Vec<Device> = {
            let session = self
                .store
                .outbound_group_session(room_id)
                .expect("the outbound session was installed above");

            target_users
                .iter()
                .flat_map(|user| self.registry.devices_of(user))
                .filter(|device| !device.is_blocked())
                .filter(|device| !session.is_shared_with(&device.user_id, &device.device_id))
                .cloned()
                .collect()
        };

        let delivered = self
            .share_group_session(http, room_id, &session_id, &session_key, targets)
            .await?;

        {
            let session = self
                .store
                .outbound_group_session_mut(room_id)
                .expect("the outbound session was installed above");

            for (user_id, device_id) in &delivered {
                session.mark_shared_with(user_id, device_id);
            }
        }

        let payload = json!({
            "type": event_type,
            "content": content,
            "room_id": room_id,
        });
        let plaintext = canonical_json(&payload)?;

        let ciphertext = self
            .store
            .outbound_group_session_mut(room_id)
            .expect("the outbound session was installed above")
            .encrypt(&plaintext);

        self.store.save()?;

        Ok(MegolmContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            sender_curve25519: self.store.account.curve25519(),
            ciphertext,
            device_id: self.device_id.clone(),
            session_id,
        })
    }

    // Megolm decryption.

    /// Decrypt a Megolm encrypted room event.
    ///
    /// Applies the replay check before anything is returned and verifies
    /// the session's starter bindings and forward chain against the device
    /// registry.
    pub fn decrypt_room_event(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
        origin_server_ts: MilliSecondsSinceUnixEpoch,
        sender: &UserId,
        content: &MegolmContent,
    ) -> Result<MegolmDecryptionResult, MegolmError> {
        let key: InboundGroupKey = (
            room_id.to_owned(),
            content.sender_curve25519.clone(),
            content.session_id.clone(),
        );

        let (plaintext, message_index, signing_key, forward_chain) = {
            let Some(session) = self.store.inbound_group_session_mut(&key) else {
                return Err(MegolmError::MissingSession {
                    room_id: room_id.to_owned(),
                    sender_key: content.sender_curve25519.clone(),
                    session_id: content.session_id.clone(),
                });
            };

            let (plaintext, message_index) = session.decrypt(&content.ciphertext)?;

            (
                plaintext,
                message_index,
                session.signing_key.clone(),
                session.forwarding_chains.clone(),
            )
        };

        let newly_recorded = self
            .store
            .inbound_group_session_mut(&key)
            .expect("the session was just used")
            .check_replay(message_index, event_id, origin_server_ts)?;

        if newly_recorded {
            // Losing this record would flag the legitimate event as a
            // replay later, so it must hit the disk before the plaintext
            // leaves the crypto layer.
            self.store.save()?;
        }

        let payload: Value = serde_json::from_str(&plaintext)?;

        if !payload.is_object() {
            return Err(MegolmError::NotAnObject);
        }

        let mut verification_errors = Vec::new();

        let starter = self.registry.devices_of(sender).find(|device| {
            device.curve25519 == content.sender_curve25519 && device.ed25519 == signing_key
        });

        match starter {
            None => verification_errors.push(VerificationError::MegolmWrongSender {
                starter_ed25519: signing_key,
                sender_curve25519: content.sender_curve25519.clone(),
            }),
            Some(device) if device.is_blocked() => {
                verification_errors.push(VerificationError::MegolmFromBlockedDevice {
                    user_id: device.user_id.clone(),
                    device_id: device.device_id.clone(),
                })
            }
            Some(device) if !device.is_trusted() => {
                verification_errors.push(VerificationError::MegolmFromUntrustedDevice {
                    user_id: device.user_id.clone(),
                    device_id: device.device_id.clone(),
                })
            }
            Some(_) => {}
        }

        for curve25519 in &forward_chain {
            match self.registry.any_device_by_curve(curve25519) {
                Some(device) if device.is_blocked() => verification_errors.push(
                    VerificationError::MegolmBlockedDeviceInForwardChain {
                        curve25519: curve25519.clone(),
                    },
                ),
                Some(device) if device.is_trusted() => {}
                // An unknown or undecided link taints the chain: nothing
                // vouches for it.
                _ => verification_errors.push(
                    VerificationError::MegolmUntrustedDeviceInForwardChain {
                        curve25519: curve25519.clone(),
                    },
                ),
            }
        }

        Ok(MegolmDecryptionResult {
            payload,
            verification_errors,
            forward_chain,
        })
    }
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, event_id, room_id, uint, user_id};
    use url::Url;

    use super::*;
    use crate::events::ToDeviceContent;

    /// An HTTP client pointing nowhere, for paths that never hit the wire.
    pub(crate) fn offline_http() -> HttpClient {
        HttpClient::new(Url::parse("http://127.0.0.1:9").unwrap()).unwrap()
    }

    pub(crate) fn machine(
        dir: &Path,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> OlmMachine {
        OlmMachine::open(
            &dir.join(device_id.as_str()),
            user_id.to_owned(),
            device_id.to_owned(),
        )
        .unwrap()
    }

    /// Teach `machine` about the other machine's device, as if a key query
    /// had returned it.
    pub(crate) fn introduce(machine: &mut OlmMachine, other: &OlmMachine) {
        let entry = other.signed_device_keys().unwrap();

        machine
            .registry
            .accept_queried_device(other.user_id(), other.device_id(), &entry)
            .unwrap();
    }

    /// Establish an outbound Olm session from `from` to `to` without a
    /// server, using a locally generated one-time key.
    pub(crate) fn connect(from: &mut OlmMachine, to: &mut OlmMachine) {
        let (_, one_time_key) = to
            .generate_signed_one_time_keys(1)
            .unwrap()
            .pop()
            .map(|(id, dict)| (id, dict["key"].as_str().unwrap().to_owned()))
            .unwrap();
        to.store.account.mark_keys_as_published();

        let session = from
            .store
            .account
            .create_outbound_session(&to.own_curve25519(), &one_time_key)
            .unwrap();
        from.store
            .add_outbound_session(&to.own_curve25519(), session)
            .unwrap();
    }

    /// Olm encrypt a payload from one machine to another, returning the
    /// wire content. The sender must already have a session.
    pub(crate) async fn olm_send(
        from: &mut OlmMachine,
        to: &OlmMachine,
        event_type: &str,
        content: &Value,
    ) -> OlmContent {
        let target = to.registry.current().clone();

        let (messages, no_otks) = from
            .olm_encrypt_to_devices(&offline_http(), event_type, content, vec![target])
            .await
            .unwrap();

        assert!(no_otks.is_empty());

        let value = messages[to.user_id()][&to.device_id().to_owned()].clone();
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn olm_round_trip_verifies_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");

        let mut alice_machine = machine(dir.path(), alice, device_id!("ALICEDEV"));
        let mut bob_machine = machine(dir.path(), bob, device_id!("BOBDEV"));

        introduce(&mut alice_machine, &bob_machine);
        introduce(&mut bob_machine, &alice_machine);
        connect(&mut alice_machine, &mut bob_machine);

        let content = serde_json::json!({ "body": "ping" });
        let olm = olm_send(&mut alice_machine, &bob_machine, "net.example.ping", &content).await;

        let result = bob_machine.decrypt_to_device_event(alice, &olm).unwrap();

        assert!(result.verification_errors.is_empty());
        assert_eq!(result.payload["type"], "net.example.ping");
        assert_eq!(result.payload["content"], content);
        assert_eq!(result.claimed_ed25519, alice_machine.own_ed25519());

        // Bob answers over a session of his own, claiming one of Alice's
        // one-time keys the way the server-side flow would.
        connect(&mut bob_machine, &mut alice_machine);
        let reply = serde_json::json!({ "body": "pong" });
        let olm = olm_send(&mut bob_machine, &alice_machine, "net.example.pong", &reply).await;

        let result = alice_machine.decrypt_to_device_event(bob, &olm).unwrap();
        assert!(result.verification_errors.is_empty());
        assert_eq!(result.payload["content"], reply);
    }

    #[tokio::test]
    async fn olm_payload_from_unknown_device_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");

        let mut alice_machine = machine(dir.path(), alice, device_id!("ALICEDEV"));
        let mut bob_machine = machine(dir.path(), bob, device_id!("BOBDEV"));

        // Alice knows Bob, but Bob never learned about Alice's device.
        introduce(&mut alice_machine, &bob_machine);
        connect(&mut alice_machine, &mut bob_machine);

        let olm = olm_send(
            &mut alice_machine,
            &bob_machine,
            "m.dummy",
            &serde_json::json!({}),
        )
        .await;

        let result = bob_machine.decrypt_to_device_event(alice, &olm).unwrap();

        assert_matches!(
            result.verification_errors.as_slice(),
            [VerificationError::OlmFromUnknownDevice { .. }]
        );
    }

    #[tokio::test]
    async fn olm_payload_from_blocked_device_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");

        let mut alice_machine = machine(dir.path(), alice, device_id!("ALICEDEV"));
        let mut bob_machine = machine(dir.path(), bob, device_id!("BOBDEV"));

        introduce(&mut alice_machine, &bob_machine);
        introduce(&mut bob_machine, &alice_machine);
        connect(&mut alice_machine, &mut bob_machine);

        bob_machine
            .registry
            .block(alice, device_id!("ALICEDEV"))
            .unwrap();

        let olm = olm_send(
            &mut alice_machine,
            &bob_machine,
            "m.dummy",
            &serde_json::json!({}),
        )
        .await;

        let result = bob_machine.decrypt_to_device_event(alice, &olm).unwrap();

        // Decryption still succeeds, the policy decision is the caller's.
        assert_eq!(result.payload["type"], "m.dummy");
        assert_matches!(
            result.verification_errors.as_slice(),
            [VerificationError::OlmPayloadFromBlockedDevice { .. }]
        );
    }

    #[tokio::test]
    async fn megolm_room_key_flow_and_replay_protection() {
        let dir = tempfile::tempdir().unwrap();
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");
        let room = room_id!("!room:example.org");

        let mut alice_machine = machine(dir.path(), alice, device_id!("ALICEDEV"));
        let mut bob_machine = machine(dir.path(), bob, device_id!("BOBDEV"));

        introduce(&mut alice_machine, &bob_machine);
        introduce(&mut bob_machine, &alice_machine);
        connect(&mut alice_machine, &mut bob_machine);

        // Alice starts a group session and shares it over Olm.
        let outbound = OutboundGroupSession::new(room.to_owned());
        let room_key = serde_json::json!({
            "algorithm": MEGOLM_V1_ALGORITHM,
            "room_id": room,
            "session_id": outbound.session_id(),
            "session_key": outbound.session_key(),
        });
        alice_machine
            .store
            .put_outbound_group_session(outbound)
            .unwrap();

        let olm = olm_send(&mut alice_machine, &bob_machine, "m.room_key", &room_key).await;

        // Bob decrypts the envelope and ingests the room key.
        let decrypted = bob_machine.decrypt_to_device_event(alice, &olm).unwrap();
        assert!(decrypted.verification_errors.is_empty());

        let inner = ToDeviceContent::from_parts(
            decrypted.payload["type"].as_str().unwrap(),
            &decrypted.payload["content"],
        )
        .unwrap();
        let key_content = assert_matches!(inner, ToDeviceContent::RoomKey(c) => c);

        let installed = bob_machine
            .receive_room_key(
                &decrypted.sender_curve25519,
                &decrypted.claimed_ed25519,
                &key_content,
            )
            .unwrap();
        assert!(installed.is_some());

        // Alice encrypts a room event with the shared session.
        let payload = canonical_json(&serde_json::json!({
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hi" },
            "room_id": room,
        }))
        .unwrap();

        let sender_curve25519 = alice_machine.own_curve25519();
        let megolm = {
            let session = alice_machine
                .store
                .outbound_group_session_mut(room)
                .unwrap();
            MegolmContent {
                algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
                sender_curve25519,
                ciphertext: session.encrypt(&payload),
                device_id: device_id!("ALICEDEV").to_owned(),
                session_id: session.session_id().to_owned(),
            }
        };

        bob_machine
            .registry
            .trust(alice, device_id!("ALICEDEV"))
            .unwrap();

        let result = bob_machine
            .decrypt_room_event(
                room,
                event_id!("$one:example.org"),
                MilliSecondsSinceUnixEpoch(uint!(1000)),
                alice,
                &megolm,
            )
            .unwrap();

        assert!(result.verification_errors.is_empty());
        assert_eq!(result.payload["content"]["body"], "hi");

        // The same ciphertext under a different event id is a replay.
        let error = bob_machine
            .decrypt_room_event(
                room,
                event_id!("$two:example.org"),
                MilliSecondsSinceUnixEpoch(uint!(2000)),
                alice,
                &megolm,
            )
            .unwrap_err();

        assert_matches!(error, MegolmError::PossibleReplayAttack { index: 0 });
    }

    #[tokio::test]
    async fn megolm_verification_states() {
        let dir = tempfile::tempdir().unwrap();
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");
        let room = room_id!("!room:example.org");

        let mut alice_machine = machine(dir.path(), alice, device_id!("ALICEDEV"));
        let mut bob_machine = machine(dir.path(), bob, device_id!("BOBDEV"));

        introduce(&mut bob_machine, &alice_machine);

        // Bob gets the session key out of band.
        let outbound = OutboundGroupSession::new(room.to_owned());
        let inbound = InboundGroupSession::new(
            &alice_machine.own_curve25519(),
            &alice_machine.own_ed25519(),
            room,
            &outbound.session_key(),
        )
        .unwrap();
        bob_machine
            .store
            .add_inbound_group_session(inbound)
            .unwrap();
        alice_machine
            .store
            .put_outbound_group_session(outbound)
            .unwrap();

        let encrypt = |machine: &mut OlmMachine, body: &str| {
            let payload = canonical_json(&serde_json::json!({
                "type": "m.room.message",
                "content": { "msgtype": "m.text", "body": body },
                "room_id": room,
            }))
            .unwrap();

            let sender_curve25519 = machine.own_curve25519();
            let session = machine.store.outbound_group_session_mut(room).unwrap();
            MegolmContent {
                algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
                sender_curve25519,
                ciphertext: session.encrypt(&payload),
                device_id: device_id!("ALICEDEV").to_owned(),
                session_id: session.session_id().to_owned(),
            }
        };

        // Untrusted sender device.
        let megolm = encrypt(&mut alice_machine, "one");
        let result = bob_machine
            .decrypt_room_event(
                room,
                event_id!("$one:example.org"),
                MilliSecondsSinceUnixEpoch(uint!(1)),
                alice,
                &megolm,
            )
            .unwrap();
        assert_matches!(
            result.verification_errors.as_slice(),
            [VerificationError::MegolmFromUntrustedDevice { .. }]
        );

        // Blocked sender device.
        bob_machine
            .registry
            .block(alice, device_id!("ALICEDEV"))
            .unwrap();

        let megolm = encrypt(&mut alice_machine, "two");
        let result = bob_machine
            .decrypt_room_event(
                room,
                event_id!("$two:example.org"),
                MilliSecondsSinceUnixEpoch(uint!(2)),
                alice,
                &megolm,
            )
            .unwrap();
        assert_matches!(
            result.verification_errors.as_slice(),
            [VerificationError::MegolmFromBlockedDevice { .. }]
        );
        assert_eq!(result.payload["content"]["body"], "two");

        // A session claiming keys no device of the sender owns.
        let mut foreign = machine(dir.path(), bob, device_id!("OTHERDEV"));
        let outbound = OutboundGroupSession::new(room.to_owned());
        let inbound = InboundGroupSession::new(
            &foreign.own_curve25519(),
            &foreign.own_ed25519(),
            room,
            &outbound.session_key(),
        )
        .unwrap();
        bob_machine
            .store
            .add_inbound_group_session(inbound)
            .unwrap();
        foreign.store.put_outbound_group_session(outbound).unwrap();

        let megolm = {
            let payload = canonical_json(&serde_json::json!({
                "type": "m.room.message",
                "content": { "msgtype": "m.text", "body": "forged" },
                "room_id": room,
            }))
            .unwrap();
            let sender_curve25519 = foreign.own_curve25519();
            let session = foreign.store.outbound_group_session_mut(room).unwrap();
            MegolmContent {
                algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
                sender_curve25519,
                ciphertext: session.encrypt(&payload),
                device_id: device_id!("ALICEDEV").to_owned(),
                session_id: session.session_id().to_owned(),
            }
        };

        let result = bob_machine
            .decrypt_room_event(
                room,
                event_id!("$three:example.org"),
                MilliSecondsSinceUnixEpoch(uint!(3)),
                alice,
                &megolm,
            )
            .unwrap();
        assert_matches!(
            result.verification_errors.as_slice(),
            [VerificationError::MegolmWrongSender { .. }]
        );
    }
}

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

//! Room key distribution.
//!
//! Sharing fresh Megolm sessions over Olm, ingesting `m.room_key` and
//! `m.forwarded_room_key` events, and the session request machinery:
//! requests go out to all of our tracked devices when we can't decrypt,
//! incoming requests are answered immediately for trusted devices and
//! parked on untrusted ones, and the first forward we receive cancels the
//! request everywhere else. Forwards only ever happen between our own
//! devices.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId, RoomId, UserId};
use tracing::{debug, info, warn};

use super::{
    device::Device,
    machine::OlmMachine,
    olm::InboundGroupSession,
    store::InboundGroupKey,
    MEGOLM_V1_ALGORITHM,
};
use crate::{
    error::Error,
    events::{
        CancelGroupSessionRequest, ForwardedRoomKeyContent, GroupSessionRequest, RoomKeyContent,
        ToDeviceContent,
    },
    http_client::HttpClient,
};

impl OlmMachine {
    /// Share a group session key with the given devices over Olm.
    ///
    /// Our own device is never a target. Devices without a one-time key are
    /// logged and left out of the returned delivery list, so the next send
    /// retries them.
    pub(crate) async fn share_group_session(
        &mut self,
        http: &HttpClient,
        room_id: &RoomId,
        session_id: &str,
        session_key: &str,
        targets: Vec<Device>,
    ) -> Result<Vec<(OwnedUserId, OwnedDeviceId)>, Error> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let content = serde_json::to_value(RoomKeyContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            room_id: room_id.to_owned(),
            session_id: session_id.to_owned(),
            session_key: session_key.to_owned(),
        })?;

        let (messages, no_otks) = self
            .olm_encrypt_to_devices(http, "m.room_key", &content, targets)
            .await?;

        if !no_otks.is_empty() {
            let missing: Vec<(&UserId, &ruma::DeviceId)> = no_otks
                .iter()
                .map(|d| (&*d.user_id, &*d.device_id))
                .collect();

            warn!(
                ?missing,
                room_id = room_id.as_str(),
                session_id,
                "Got no one-time keys for some devices, they won't be able \
                 to decrypt until the session is shared again"
            );
        }

        let delivered = messages
            .iter()
            .flat_map(|(user_id, devices)| {
                devices
                    .keys()
                    .map(move |device_id| (user_id.clone(), device_id.clone()))
            })
            .collect();

        self.send_to_devices(http, "m.room.encrypted", &messages)
            .await?;

        Ok(delivered)
    }

    /// Ingest an `m.room_key` carried by a verified Olm payload.
    ///
    /// The enveloping Olm event anchors the starter's keys, so the caller
    /// must only pass contents whose envelope verified cleanly. An existing
    /// session for the same key is kept as is.
    ///
    /// Returns the key of the newly installed session, if one was.
    pub fn receive_room_key(
        &mut self,
        sender_curve25519: &str,
        claimed_ed25519: &str,
        content: &RoomKeyContent,
    ) -> Result<Option<InboundGroupKey>, crate::crypto::MegolmError> {
        if content.algorithm != MEGOLM_V1_ALGORITHM {
            warn!(
                algorithm = content.algorithm.as_str(),
                "Received a room key with an unsupported algorithm"
            );
            return Ok(None);
        }

        let session = InboundGroupSession::new(
            sender_curve25519,
            claimed_ed25519,
            &content.room_id,
            &content.session_key,
        )?;

        let key: InboundGroupKey = (
            content.room_id.clone(),
            sender_curve25519.to_owned(),
            session.session_id().to_owned(),
        );

        if self.store.add_inbound_group_session(session)? {
            info!(
                room_id = content.room_id.as_str(),
                session_id = key.2.as_str(),
                "Installed a new inbound group session"
            );
            Ok(Some(key))
        } else {
            debug!(
                room_id = content.room_id.as_str(),
                session_id = key.2.as_str(),
                "Ignoring a room key for a session we already have"
            );
            Ok(None)
        }
    }

    /// Ingest an `m.forwarded_room_key`.
    ///
    /// Installs the session unless a (possibly directly received) one
    /// already exists for the key, and cancels our matching open request on
    /// every other device that was asked.
    pub async fn receive_forwarded_room_key(
        &mut self,
        http: &HttpClient,
        forwarder_curve25519: &str,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Option<InboundGroupKey>, Error> {
        if content.algorithm != MEGOLM_V1_ALGORITHM {
            warn!(
                algorithm = content.algorithm.as_str(),
                "Received a forwarded room key with an unsupported algorithm"
            );
            return Ok(None);
        }

        let session = InboundGroupSession::from_forwarded(content).map_err(Error::Megolm)?;

        let key: InboundGroupKey = (
            content.room_id.clone(),
            content.session_creator_curve25519.clone(),
            session.session_id().to_owned(),
        );

        let installed = self
            .store
            .add_inbound_group_session(session)
            .map_err(crate::crypto::MegolmError::Store)
            .map_err(Error::Megolm)?;

        if installed {
            info!(
                room_id = content.room_id.as_str(),
                session_id = content.session_id.as_str(),
                forward_chain = ?content.curve25519_forward_chain,
                "Installed a forwarded inbound group session"
            );
        }

        // Whoever answered first wins; everyone else can stop digging.
        let open_request = self.store.take_sent_session_request((
            &content.room_id,
            &content.session_creator_curve25519,
            &content.session_id,
        ))?;

        if let Some(request) = open_request {
            self.broadcast_cancellation(http, &request, forwarder_curve25519)
                .await?;
        }

        Ok(installed.then_some(key))
    }

    /// Ask every device of every tracked user, our own included, for a
    /// session we can't decrypt with. Repeated failures for the same
    /// session reuse the already open request.
    pub async fn request_group_session(
        &mut self,
        http: &HttpClient,
        room_id: &RoomId,
        sender_curve25519: &str,
        session_id: &str,
    ) -> Result<(), Error> {
        if self
            .store
            .has_sent_session_request((room_id, sender_curve25519, session_id))
        {
            return Ok(());
        }

        let request = GroupSessionRequest::new(
            self.device_id().to_owned(),
            room_id.to_owned(),
            sender_curve25519.to_owned(),
            session_id.to_owned(),
        );

        info!(
            room_id = room_id.as_str(),
            session_id,
            request_id = request.request_id.as_str(),
            "Requesting a group session from other devices"
        );

        let (event_type, content) = ToDeviceContent::KeyRequest(request.clone()).to_parts();
        let messages = self.all_tracked_devices_content(&content, None);

        self.send_to_devices(http, &event_type, &messages).await?;
        self.store.record_sent_session_request(request)?;

        Ok(())
    }

    /// Handle an incoming `m.room_key_request`.
    ///
    /// Requests from other users are out of scope and dropped. Requests
    /// from our own trusted devices are answered right away, others are
    /// parked on the requesting device until it gets trusted.
    pub async fn receive_group_session_request(
        &mut self,
        http: &HttpClient,
        sender: &UserId,
        request: GroupSessionRequest,
    ) -> Result<(), Error> {
        if sender != self.user_id() {
            debug!(
                sender = sender.as_str(),
                "Ignoring a session request from another user"
            );
            return Ok(());
        }

        if request.requesting_device_id == self.device_id() {
            return Ok(());
        }

        let key: InboundGroupKey = (
            request.room_id.clone(),
            request.session_creator_curve25519.clone(),
            request.session_id.clone(),
        );

        if self.store.inbound_group_session(&key).is_none() {
            debug!(
                room_id = request.room_id.as_str(),
                session_id = request.session_id.as_str(),
                "Can't serve a session request, we don't hold the session"
            );
            return Ok(());
        }

        let requesting_device_id = request.requesting_device_id.clone();

        let trusted = match self.registry.get(sender, &requesting_device_id) {
            Some(device) => device.is_trusted(),
            None => {
                warn!(
                    device_id = requesting_device_id.as_str(),
                    "Ignoring a session request from an unknown own device"
                );
                return Ok(());
            }
        };

        if trusted {
            self.forward_group_session(http, &request).await
        } else {
            info!(
                device_id = requesting_device_id.as_str(),
                request_id = request.request_id.as_str(),
                "Parking a session request until the device is trusted"
            );
            self.registry
                .park_session_request(sender, &requesting_device_id, request)
                .map_err(Error::Store)
        }
    }

    /// Handle an incoming request cancellation.
    pub fn receive_request_cancellation(
        &mut self,
        sender: &UserId,
        cancel: &CancelGroupSessionRequest,
    ) -> Result<(), Error> {
        if sender != self.user_id() {
            return Ok(());
        }

        self.registry
            .cancel_session_request(sender, &cancel.requesting_device_id, &cancel.request_id)
            .map_err(Error::Store)
    }

    /// Answer a session request: export the session and send it to the
    /// requesting device as an `m.forwarded_room_key`, with ourselves
    /// appended to the forward chain.
    pub(crate) async fn forward_group_session(
        &mut self,
        http: &HttpClient,
        request: &GroupSessionRequest,
    ) -> Result<(), Error> {
        let key: InboundGroupKey = (
            request.room_id.clone(),
            request.session_creator_curve25519.clone(),
            request.session_id.clone(),
        );

        let (session_key, mut forward_chain, signing_key) = {
            let Some(session) = self.store.inbound_group_session(&key) else {
                warn!(
                    room_id = request.room_id.as_str(),
                    session_id = request.session_id.as_str(),
                    "Can't forward a session we no longer hold"
                );
                return Ok(());
            };

            (
                session.export(),
                session.forwarding_chains.clone(),
                session.signing_key.clone(),
            )
        };

        forward_chain.push(self.own_curve25519());

        let content = serde_json::to_value(ForwardedRoomKeyContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            room_id: request.room_id.clone(),
            session_creator_curve25519: request.session_creator_curve25519.clone(),
            creator_supposed_ed25519: signing_key,
            session_id: request.session_id.clone(),
            session_key,
            curve25519_forward_chain: forward_chain,
        })?;

        let own_user = self.user_id().to_owned();
        let Some(device) = self.registry.get(&own_user, &request.requesting_device_id).cloned()
        else {
            warn!(
                device_id = request.requesting_device_id.as_str(),
                "Can't forward a session to an unknown device"
            );
            return Ok(());
        };

        info!(
            device_id = device.device_id.as_str(),
            room_id = request.room_id.as_str(),
            session_id = request.session_id.as_str(),
            "Forwarding a group session"
        );

        let (messages, no_otks) = self
            .olm_encrypt_to_devices(http, "m.forwarded_room_key", &content, vec![device])
            .await?;

        if !no_otks.is_empty() {
            warn!("The requesting device has no one-time keys, the forward is lost");
        }

        self.send_to_devices(http, "m.room.encrypted", &messages)
            .await
    }

    /// Tell every other asked device that the request was already served.
    async fn broadcast_cancellation(
        &mut self,
        http: &HttpClient,
        request: &GroupSessionRequest,
        responder_curve25519: &str,
    ) -> Result<(), Error> {
        let (event_type, content) =
            ToDeviceContent::KeyRequestCancellation(request.cancellation()).to_parts();

        let messages = self.all_tracked_devices_content(&content, Some(responder_curve25519));

        debug!(
            request_id = request.request_id.as_str(),
            "Cancelling a served session request on the remaining devices"
        );

        self.send_to_devices(http, &event_type, &messages).await
    }

    /// The given content addressed to every tracked device except our own
    /// current one and, optionally, one excluded device.
    fn all_tracked_devices_content(
        &self,
        content: &serde_json::Value,
        exclude_curve25519: Option<&str>,
    ) -> BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, serde_json::Value>> {
        let mut messages = BTreeMap::new();

        for user_id in self.registry.tracked_users() {
            let devices: BTreeMap<OwnedDeviceId, serde_json::Value> = self
                .registry
                .devices_of(user_id)
                .filter(|d| !(d.user_id == self.user_id() && d.device_id == self.device_id()))
                .filter(|d| exclude_curve25519 != Some(d.curve25519.as_str()))
                .map(|d| (d.device_id.clone(), content.clone()))
                .collect();

            if !devices.is_empty() {
                messages.insert(user_id.clone(), devices);
            }
        }

        messages
    }

    // Trust decisions and their crypto side effects.

    /// Trust a device and replay every session request it had parked.
    pub async fn trust_device(
        &mut self,
        http: &HttpClient,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> Result<(), Error> {
        let pending = self
            .registry
            .trust(user_id, device_id)
            .map_err(Error::Store)?;

        for request in pending {
            self.forward_group_session(http, &request).await?;
        }

        Ok(())
    }

    /// Block a device and drop every outbound group session it received,
    /// forcing a rotation on the next encryption in those rooms.
    pub fn block_device(
        &mut self,
        user_id: &UserId,
        device_id: &ruma::DeviceId,
    ) -> Result<(), Error> {
        self.registry
            .block(user_id, device_id)
            .map_err(Error::Store)?;

        for room_id in self.store.rooms_shared_with_device(user_id, device_id) {
            info!(
                room_id = room_id.as_str(),
                user_id = user_id.as_str(),
                device_id = device_id.as_str(),
                "Rotating the room's group session away from a blocked device"
            );
            self.store
                .drop_outbound_group_session(&room_id)
                .map_err(crate::crypto::MegolmError::Store)
                .map_err(Error::Megolm)?;
        }

        Ok(())
    }
}

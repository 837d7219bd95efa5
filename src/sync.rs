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

//! The sync dispatcher.
//!
//! `sync_once` drives one long-poll round trip and feeds everything it
//! brought back into the right subsystem: to-device events into the Olm
//! machine, room keys into the group session store, timeline events through
//! Megolm decryption into the per-room logs, device list hints into the
//! registry, and the one-time-key count into replenishment. `sync_forever`
//! loops it.

use std::{collections::BTreeMap, collections::BTreeSet, time::Duration};

use ruma::{OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    client::Client,
    crypto::{InboundGroupKey, MegolmError, OlmMachine},
    error::{Error, Result},
    events::{
        DecryptionInfo, RoomContent, StateEvent, TimelineEvent, ToDeviceContent, ToDeviceEvent,
    },
    http_client::HttpClient,
    rooms::{Gap, Room},
};

/// Settings for a sync request.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// How long the server may hold the request open, in milliseconds on
    /// the wire.
    pub timeout: Duration,
    /// A filter id or inline filter definition.
    pub filter: Option<String>,
    /// An explicit since token; the stored one is used otherwise.
    pub since: Option<String>,
    /// Ask for the full room state instead of the delta.
    pub full_state: Option<bool>,
    /// The presence state to set while syncing.
    pub set_presence: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            filter: None,
            since: None,
            full_state: None,
            set_presence: None,
        }
    }
}

impl SyncSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn full_state(mut self, full_state: bool) -> Self {
        self.full_state = Some(full_state);
        self
    }
}

// The wire model of a sync response. Events stay raw until the dispatcher
// hands them to the typed parsers, so a malformed event never poisons the
// whole response.

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: RoomsResponse,
    #[serde(default)]
    pub to_device: EventList,
    #[serde(default)]
    pub device_lists: DeviceLists,
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RoomsResponse {
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventList {
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InvitedRoom {
    #[serde(default)]
    pub invite_state: EventList,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct JoinedRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineChunk,
    #[serde(default)]
    pub summary: RoomSummary,
    #[serde(default)]
    pub unread_notifications: UnreadCounts,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LeftRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineChunk,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TimelineChunk {
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub limited: bool,
    pub prev_batch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RoomSummary {
    #[serde(rename = "m.heroes", default)]
    pub heroes: Vec<OwnedUserId>,
    #[serde(rename = "m.joined_member_count")]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count")]
    pub invited_member_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UnreadCounts {
    pub notification_count: Option<u64>,
    pub highlight_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

fn event_matches_olm(event: &Value) -> bool {
    event["type"] == "m.room.encrypted"
        && event["content"]["algorithm"] == crate::crypto::OLM_V1_ALGORITHM
}

fn event_matches_megolm(event: &Value) -> bool {
    event["type"] == "m.room.encrypted"
        && event["content"]["algorithm"] == crate::crypto::MEGOLM_V1_ALGORITHM
}

fn event_sender(event: &Value) -> Option<OwnedUserId> {
    serde_json::from_value(event.get("sender")?.clone()).ok()
}

impl Client {
    /// Run one sync round trip and dispatch everything it returned.
    ///
    /// Returns the new `next_batch` token, or `None` when the response
    /// carried the token we already processed (in which case nothing else
    /// is touched).
    pub async fn sync_once(&self, settings: &SyncSettings) -> Result<Option<String>> {
        let stored_token = self.sync_token();
        let since = settings.since.clone().or_else(|| stored_token.clone());

        let mut query: Vec<(&str, String)> =
            vec![("timeout", settings.timeout.as_millis().to_string())];

        if let Some(filter) = &settings.filter {
            query.push(("filter", filter.clone()));
        }
        if let Some(since) = &since {
            query.push(("since", since.clone()));
        }
        if let Some(full_state) = settings.full_state {
            query.push(("full_state", full_state.to_string()));
        }
        if let Some(set_presence) = &settings.set_presence {
            query.push(("set_presence", set_presence.clone()));
        }

        let reply = self.inner.http.sync(&query, settings.timeout).await?;
        let response: SyncResponse = serde_json::from_value(reply)?;

        if stored_token.as_deref() == Some(response.next_batch.as_str()) {
            debug!("The sync token didn't advance, nothing to do");
            return Ok(None);
        }

        // Collect the senders of encrypted events so their devices are
        // known before anything is decrypted.
        let mut e2e_senders: BTreeSet<OwnedUserId> = BTreeSet::new();

        for event in &response.to_device.events {
            if event_matches_olm(event) {
                e2e_senders.extend(event_sender(event));
            }
        }

        for room in response.rooms.join.values() {
            for event in &room.timeline.events {
                if event_matches_megolm(event) {
                    e2e_senders.extend(event_sender(event));
                }
            }
        }

        e2e_senders.extend(response.device_lists.changed.iter().cloned());

        {
            let mut olm = self.inner.olm.lock().await;

            if let Some(machine) = olm.as_mut() {
                machine
                    .registry
                    .ensure_tracked(&self.inner.http, e2e_senders)
                    .await?;

                machine
                    .registry
                    .update(
                        &self.inner.http,
                        response.device_lists.changed.iter().cloned(),
                        stored_token.as_deref(),
                    )
                    .await?;
            }
        }

        // The pause gate: local processing waits here until any pause guard
        // is released. The HTTP exchange above is never interrupted.
        let mut pause = self.inner.pause_rx.clone();
        let _ = pause.wait_for(|paused| !*paused).await;

        let mut olm = self.inner.olm.lock().await;

        // To-device events, and the group sessions they installed.
        let mut fresh_sessions: Vec<InboundGroupKey> = Vec::new();

        if let Some(machine) = olm.as_mut() {
            for raw in &response.to_device.events {
                let event = match ToDeviceEvent::from_value(raw) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Skipping an invalid to-device event");
                        continue;
                    }
                };

                fresh_sessions.extend(self.process_to_device_event(machine, event).await?);
            }
        }

        // Rooms.
        let mut rooms = self.inner.rooms.lock().await;

        for (room_id, invited) in &response.rooms.invite {
            let room = rooms
                .entry(room_id.clone())
                .or_insert_with(|| Room::new(&self.inner.base_dir, room_id.clone()));
            room.invited = true;
            room.left = false;

            for raw in &invited.invite_state.events {
                register_state_value(room, raw)?;
            }

            room.save_state(&self.inner.base_dir)?;
        }

        for (room_id, joined) in &response.rooms.join {
            let room = rooms
                .entry(room_id.clone())
                .or_insert_with(|| Room::new(&self.inner.base_dir, room_id.clone()));
            room.invited = false;
            room.left = false;

            if !joined.summary.heroes.is_empty() {
                room.summary_heroes = joined.summary.heroes.clone();
            }
            if let Some(count) = joined.summary.joined_member_count {
                room.summary_joined = count;
            }
            if let Some(count) = joined.summary.invited_member_count {
                room.summary_invited = count;
            }
            if let Some(count) = joined.unread_notifications.notification_count {
                room.unread_notifications = count;
            }
            if let Some(count) = joined.unread_notifications.highlight_count {
                room.unread_highlights = count;
            }

            // A truncated timeline leaves a gap between what we had and the
            // first event of this batch.
            if joined.timeline.limited {
                if let (Some(prev_batch), Some(first)) = (
                    &joined.timeline.prev_batch,
                    joined
                        .timeline
                        .events
                        .iter()
                        .find_map(|raw| TimelineEvent::from_value(raw).ok()),
                ) {
                    let gap = Gap {
                        fill_token: prev_batch.clone(),
                        event_before: room.timeline.last_event_id().cloned(),
                        event_after: first.event_id.clone(),
                        event_after_ts: first.origin_server_ts,
                    };

                    info!(
                        room_id = room_id.as_str(),
                        fill_token = gap.fill_token.as_str(),
                        "The server truncated the timeline, recording a gap"
                    );
                    room.timeline.register_gap(gap)?;
                }
            }

            for raw in &joined.state.events {
                register_state_value(room, raw)?;
            }

            for raw in &joined.timeline.events {
                if let Some(machine) = olm.as_mut() {
                    process_timeline_value(&self.inner.http, machine, room, raw).await?;
                } else {
                    register_plain_timeline_value(room, raw)?;
                }
            }

            room.save_state(&self.inner.base_dir)?;
        }

        for (room_id, left) in &response.rooms.leave {
            let room = rooms
                .entry(room_id.clone())
                .or_insert_with(|| Room::new(&self.inner.base_dir, room_id.clone()));
            room.left = true;

            for raw in &left.state.events {
                register_state_value(room, raw)?;
            }

            for raw in &left.timeline.events {
                if let Some(machine) = olm.as_mut() {
                    process_timeline_value(&self.inner.http, machine, room, raw).await?;
                } else {
                    register_plain_timeline_value(room, raw)?;
                }
            }

            room.save_state(&self.inner.base_dir)?;
        }

        // Late keys may unlock events queued in any room.
        if let Some(machine) = olm.as_mut() {
            for key in &fresh_sessions {
                if let Some(room) = rooms.get_mut(&key.0) {
                    retry_room_decryption(machine, room, key)?;
                }
            }
        }

        drop(rooms);

        if let Some(machine) = olm.as_mut() {
            machine
                .registry
                .drop_users(response.device_lists.left.iter().cloned())
                .map_err(Error::Store)?;

            if let Some(count) = response
                .device_one_time_keys_count
                .get("signed_curve25519")
            {
                machine
                    .replenish_one_time_keys(&self.inner.http, *count)
                    .await?;
            }
        }

        drop(olm);

        *self.inner.sync_token.lock().unwrap() = Some(response.next_batch.clone());
        self.save_config()?;

        Ok(Some(response.next_batch))
    }

    /// Loop [`sync_once`](Self::sync_once) forever.
    ///
    /// `first_filter` replaces the settings' filter on the first successful
    /// iteration only. Errors go to `on_error` (if any) and never end the
    /// loop; cancellation happens by dropping the future between
    /// iterations.
    pub async fn sync_forever<F>(
        &self,
        settings: SyncSettings,
        first_filter: Option<String>,
        sleep_between_syncs: Duration,
        mut on_error: Option<F>,
    ) where
        F: FnMut(&Error),
    {
        let mut first_run = true;

        loop {
            let mut current = settings.clone();

            if first_run {
                current.filter = first_filter.clone().or(current.filter);
            }

            match self.sync_once(&current).await {
                Ok(_) => first_run = false,
                Err(e) => {
                    error!(error = %e, "Error in the sync loop");

                    if let Some(handler) = on_error.as_mut() {
                        handler(&e);
                    }
                }
            }

            tokio::time::sleep(sleep_between_syncs).await;
        }
    }

    /// Pause local sync processing.
    ///
    /// The returned guard keeps `sync_once` blocked right before its
    /// processing phase; dropping the guard resumes it. In-flight HTTP
    /// requests are never cancelled.
    pub fn pause_sync(&self) -> SyncPauseGuard<'_> {
        let _ = self.inner.pause.send(true);
        SyncPauseGuard { client: self }
    }

    /// Route one decrypted (or plain) to-device event, returning the group
    /// session keys it installed.
    async fn process_to_device_event(
        &self,
        machine: &mut OlmMachine,
        event: ToDeviceEvent,
    ) -> Result<Vec<InboundGroupKey>> {
        match &event.content {
            ToDeviceContent::OlmEncrypted(content) => {
                let result = match machine.decrypt_to_device_event(&event.sender, content) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(
                            sender = event.sender.as_str(),
                            error = %e,
                            "Failed to decrypt a to-device event"
                        );
                        return Ok(Vec::new());
                    }
                };

                let inner_type = result.payload["type"].as_str().unwrap_or_default();
                let inner_content = result.payload.get("content").cloned().unwrap_or(Value::Null);

                let inner = match ToDeviceContent::from_parts(inner_type, &inner_content) {
                    Ok(inner) => inner,
                    Err(e) => {
                        warn!(error = %e, "The decrypted to-device payload is malformed");
                        return Ok(Vec::new());
                    }
                };

                match inner {
                    ToDeviceContent::RoomKey(key_content) => {
                        // Without a verified envelope nothing anchors the
                        // claimed starter keys.
                        if !result.verification_errors.is_empty() {
                            warn!(
                                sender = event.sender.as_str(),
                                errors = ?result.verification_errors,
                                "Ignoring a room key from an unverified Olm payload"
                            );
                            return Ok(Vec::new());
                        }

                        let installed = machine.receive_room_key(
                            &result.sender_curve25519,
                            &result.claimed_ed25519,
                            &key_content,
                        )?;

                        Ok(installed.into_iter().collect())
                    }
                    ToDeviceContent::ForwardedRoomKey(forwarded) => {
                        let installed = machine
                            .receive_forwarded_room_key(
                                &self.inner.http,
                                &result.sender_curve25519,
                                &forwarded,
                            )
                            .await?;

                        Ok(installed.into_iter().collect())
                    }
                    other => {
                        debug!(
                            event_type = other.event_type(),
                            sender = event.sender.as_str(),
                            "Ignoring an encrypted to-device event we don't handle"
                        );
                        Ok(Vec::new())
                    }
                }
            }
            ToDeviceContent::KeyRequest(request) => {
                machine
                    .receive_group_session_request(
                        &self.inner.http,
                        &event.sender,
                        request.clone(),
                    )
                    .await?;
                Ok(Vec::new())
            }
            ToDeviceContent::KeyRequestCancellation(cancel) => {
                machine.receive_request_cancellation(&event.sender, cancel)?;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// A guard holding the sync dispatcher's processing phase paused.
pub struct SyncPauseGuard<'a> {
    client: &'a Client,
}

impl std::fmt::Debug for SyncPauseGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPauseGuard").finish_non_exhaustive()
    }
}

impl Drop for SyncPauseGuard<'_> {
    fn drop(&mut self) {
        let _ = self.client.inner.pause.send(false);
    }
}

/// Register a raw state event on the room, recording it as invalid when it
/// doesn't parse.
fn register_state_value(room: &mut Room, raw: &Value) -> Result<()> {
    match StateEvent::from_value(raw) {
        Ok(event) => room.state.register(&event),
        Err(e) => room.timeline.record_invalid(&e)?,
    }

    Ok(())
}

/// Register a raw timeline event without any crypto, for clients that
/// aren't logged in.
fn register_plain_timeline_value(room: &mut Room, raw: &Value) -> Result<()> {
    if raw.get("state_key").is_some() {
        register_state_value(room, raw)?;
    }

    match TimelineEvent::from_value(raw) {
        Ok(event) => room.timeline.register(event)?,
        Err(e) => room.timeline.record_invalid(&e)?,
    }

    Ok(())
}

/// Parse a raw timeline event, run it through Megolm decryption when it is
/// encrypted, and register it on the room's timeline.
///
/// A missing session queues the event for a retry and asks the other
/// devices for the key; other decryption failures keep the ciphertext event
/// as is.
pub(crate) async fn process_timeline_value(
    http: &HttpClient,
    machine: &mut OlmMachine,
    room: &mut Room,
    raw: &Value,
) -> Result<()> {
    if raw.get("state_key").is_some() {
        register_state_value(room, raw)?;
    }

    let mut event = match TimelineEvent::from_value(raw) {
        Ok(event) => event,
        Err(e) => {
            room.timeline.record_invalid(&e)?;
            return Ok(());
        }
    };

    let encrypted = match &event.content {
        RoomContent::Encrypted(content) => Some(content.clone()),
        _ => None,
    };

    if let Some(content) = encrypted {
        match machine.decrypt_room_event(
            &room.id,
            &event.event_id,
            event.origin_server_ts,
            &event.sender,
            &content,
        ) {
            Ok(result) => {
                event = apply_decryption(raw, &event, result);
            }
            Err(MegolmError::MissingSession { .. }) => {
                debug!(
                    room_id = room.id.as_str(),
                    event_id = event.event_id.as_str(),
                    session_id = content.session_id.as_str(),
                    "No session to decrypt the event yet, queueing it"
                );

                if let Err(e) = machine
                    .request_group_session(
                        http,
                        &room.id,
                        &content.sender_curve25519,
                        &content.session_id,
                    )
                    .await
                {
                    warn!(error = %e, "Failed to request the missing group session");
                }
            }
            Err(e) => {
                warn!(
                    room_id = room.id.as_str(),
                    event_id = event.event_id.as_str(),
                    error = %e,
                    "Failed to decrypt a room event"
                );
            }
        }
    }

    room.timeline.register(event)?;
    Ok(())
}

/// Build the decrypted version of an encrypted timeline event.
fn apply_decryption(
    raw: &Value,
    event: &TimelineEvent,
    result: crate::crypto::MegolmDecryptionResult,
) -> TimelineEvent {
    let inner_type = result.payload["type"].as_str().unwrap_or_default().to_owned();
    let inner_content = result
        .payload
        .get("content")
        .cloned()
        .unwrap_or(Value::Null);

    let content = RoomContent::from_parts(&inner_type, &inner_content).unwrap_or_else(|_| {
        RoomContent::Unknown {
            event_type: inner_type,
            content: inner_content,
        }
    });

    TimelineEvent {
        event_id: event.event_id.clone(),
        sender: event.sender.clone(),
        origin_server_ts: event.origin_server_ts,
        content,
        unsigned: event.unsigned.clone(),
        decryption: Some(Box::new(DecryptionInfo {
            original: raw.clone(),
            payload: result.payload,
            verification_errors: result.verification_errors,
            forward_chain: result.forward_chain,
        })),
    }
}

/// Retry the events queued on a freshly arrived session.
fn retry_room_decryption(
    machine: &mut OlmMachine,
    room: &mut Room,
    key: &InboundGroupKey,
) -> Result<()> {
    let queue_key = (key.1.clone(), key.2.clone());
    let queued = room.timeline.take_undecrypted(&queue_key);

    for event_id in queued {
        let Some(event) = room.timeline.get(&event_id).cloned() else {
            continue;
        };

        let RoomContent::Encrypted(content) = &event.content else {
            continue;
        };

        match machine.decrypt_room_event(
            &room.id,
            &event.event_id,
            event.origin_server_ts,
            &event.sender,
            content,
        ) {
            Ok(result) => {
                info!(
                    room_id = room.id.as_str(),
                    event_id = event.event_id.as_str(),
                    "Decrypted a queued event after its key arrived"
                );

                let original = event.to_value();
                let decrypted = apply_decryption(&original, &event, result);
                room.timeline.register(decrypted)?;
            }
            Err(e) => {
                warn!(
                    event_id = event.event_id.as_str(),
                    error = %e,
                    "A queued event still doesn't decrypt"
                );
                // Leave it queued for the next key arrival.
                room.timeline.requeue_undecrypted(&queue_key, event.event_id.clone());
            }
        }
    }

    Ok(())
}

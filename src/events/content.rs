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

//! Typed event contents.
//!
//! Contents are dispatched on the event `type`, plus the `algorithm` field
//! for `m.room.encrypted` and the `action` field for `m.room_key_request`.
//! Types we don't know collapse into an `Unknown` variant that keeps the
//! source JSON, so unknown events round-trip losslessly.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::crypto::{MEGOLM_V1_ALGORITHM, OLM_V1_ALGORITHM};

/// One Olm ciphertext blob, keyed by the recipient's curve25519 key in the
/// enclosing [`OlmContent`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// 0 for a prekey message, 1 for a normal message.
    #[serde(rename = "type")]
    pub message_type: u8,
    /// The base64 encoded ciphertext.
    pub body: String,
}

/// The content of an Olm encrypted `m.room.encrypted` to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmContent {
    pub algorithm: String,
    /// The curve25519 key of the sending device.
    #[serde(rename = "sender_key")]
    pub sender_curve25519: String,
    /// Ciphertexts per recipient curve25519 key.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// The content of a Megolm encrypted `m.room.encrypted` room event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmContent {
    pub algorithm: String,
    /// The curve25519 key of the device that started the group session.
    #[serde(rename = "sender_key")]
    pub sender_curve25519: String,
    /// The base64 encoded Megolm ciphertext.
    pub ciphertext: String,
    /// The id of the device that encrypted the event.
    pub device_id: OwnedDeviceId,
    /// The id of the group session that encrypted the event.
    pub session_id: String,
}

/// An `m.room_key` to-device content, carrying a Megolm session key.
///
/// Only ever accepted from a verified Olm payload, since the enclosing Olm
/// envelope is what anchors the session starter's ed25519 key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    pub algorithm: String,
    pub room_id: OwnedRoomId,
    pub session_id: String,
    /// The exported Megolm session key.
    pub session_key: String,
}

/// An `m.forwarded_room_key` to-device content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    pub algorithm: String,
    pub room_id: OwnedRoomId,
    /// The curve25519 key of the device that originally created the session.
    #[serde(rename = "sender_key")]
    pub session_creator_curve25519: String,
    /// The ed25519 key the forwarder claims the session creator has. Unlike a
    /// direct room key this is not anchored by any Olm envelope.
    #[serde(rename = "sender_claimed_ed25519_key")]
    pub creator_supposed_ed25519: String,
    pub session_id: String,
    /// The exported Megolm session key.
    pub session_key: String,
    /// The curve25519 keys of the devices the session passed through.
    #[serde(rename = "forwarding_curve25519_key_chain", default)]
    pub curve25519_forward_chain: Vec<String>,
}

/// A request for a Megolm session we are missing, sent to other devices as
/// an `m.room_key_request` with `action: request`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSessionRequest {
    pub request_id: String,
    pub requesting_device_id: OwnedDeviceId,
    pub algorithm: String,
    pub room_id: OwnedRoomId,
    pub session_creator_curve25519: String,
    pub session_id: String,
}

impl GroupSessionRequest {
    /// Create a request for the given session, with a fresh request id.
    pub fn new(
        requesting_device_id: OwnedDeviceId,
        room_id: OwnedRoomId,
        session_creator_curve25519: String,
        session_id: String,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            requesting_device_id,
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            room_id,
            session_creator_curve25519,
            session_id,
        }
    }

    /// The key identifying the session this request is about. Two requests
    /// for the same session compare equal on this key even when their
    /// request ids differ.
    pub fn compare_key(&self) -> (&RoomId, &str, &str) {
        (
            &self.room_id,
            &self.session_creator_curve25519,
            &self.session_id,
        )
    }

    /// The matching cancellation message.
    pub fn cancellation(&self) -> CancelGroupSessionRequest {
        CancelGroupSessionRequest {
            request_id: self.request_id.clone(),
            requesting_device_id: self.requesting_device_id.clone(),
        }
    }
}

/// An `m.room_key_request` with `action: request_cancellation`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelGroupSessionRequest {
    pub request_id: String,
    pub requesting_device_id: OwnedDeviceId,
}

/// The wire form of `m.room_key_request` contents, for both actions.
#[derive(Serialize, Deserialize)]
struct RoomKeyRequestWire {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<RoomKeyRequestBody>,
    request_id: String,
    requesting_device_id: OwnedDeviceId,
}

#[derive(Serialize, Deserialize)]
struct RoomKeyRequestBody {
    algorithm: String,
    room_id: OwnedRoomId,
    #[serde(rename = "sender_key")]
    session_creator_curve25519: String,
    session_id: String,
}

/// An `m.room.message` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageContent {
    pub msgtype: String,
    pub body: String,
    /// Any fields we don't model, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageContent {
    /// A plain `m.text` message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.text".to_owned(),
            body: body.into(),
            extra: Map::new(),
        }
    }
}

/// An `m.room.member` state content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberContent {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A room membership state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Knock,
    Leave,
    Ban,
}

/// An `m.room.encryption` state content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionContent {
    pub algorithm: String,
    /// How long a group session may be used, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    /// How many messages a group session may encrypt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An `m.room.create` state content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<ruma::OwnedUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An `m.room.name` state content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NameContent {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The content of a to-device event.
#[derive(Clone, Debug)]
pub enum ToDeviceContent {
    /// An Olm encrypted envelope.
    OlmEncrypted(OlmContent),
    /// A Megolm session key, arriving inside an Olm envelope.
    RoomKey(RoomKeyContent),
    /// A forwarded Megolm session key.
    ForwardedRoomKey(ForwardedRoomKeyContent),
    /// A request for a session another device is missing.
    KeyRequest(GroupSessionRequest),
    /// A cancellation of an earlier request.
    KeyRequestCancellation(CancelGroupSessionRequest),
    /// An `m.dummy` event.
    Dummy,
    /// Anything else, kept verbatim.
    Unknown { event_type: String, content: Value },
}

impl ToDeviceContent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::OlmEncrypted(_) => "m.room.encrypted",
            Self::RoomKey(_) => "m.room_key",
            Self::ForwardedRoomKey(_) => "m.forwarded_room_key",
            Self::KeyRequest(_) | Self::KeyRequestCancellation(_) => "m.room_key_request",
            Self::Dummy => "m.dummy",
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    /// Dispatch a raw `(type, content)` pair into a typed content.
    pub fn from_parts(event_type: &str, content: &Value) -> Result<Self, serde_json::Error> {
        match event_type {
            "m.room.encrypted"
                if content.get("algorithm").and_then(Value::as_str) == Some(OLM_V1_ALGORITHM) =>
            {
                Ok(Self::OlmEncrypted(serde_json::from_value(content.clone())?))
            }
            "m.room_key" => Ok(Self::RoomKey(serde_json::from_value(content.clone())?)),
            "m.forwarded_room_key" => {
                Ok(Self::ForwardedRoomKey(serde_json::from_value(content.clone())?))
            }
            "m.room_key_request" => {
                let wire: RoomKeyRequestWire = serde_json::from_value(content.clone())?;

                match (wire.action.as_str(), wire.body) {
                    ("request", Some(body)) => Ok(Self::KeyRequest(GroupSessionRequest {
                        request_id: wire.request_id,
                        requesting_device_id: wire.requesting_device_id,
                        algorithm: body.algorithm,
                        room_id: body.room_id,
                        session_creator_curve25519: body.session_creator_curve25519,
                        session_id: body.session_id,
                    })),
                    ("request_cancellation", _) => {
                        Ok(Self::KeyRequestCancellation(CancelGroupSessionRequest {
                            request_id: wire.request_id,
                            requesting_device_id: wire.requesting_device_id,
                        }))
                    }
                    _ => Ok(Self::Unknown {
                        event_type: event_type.to_owned(),
                        content: content.clone(),
                    }),
                }
            }
            "m.dummy" => Ok(Self::Dummy),
            _ => Ok(Self::Unknown {
                event_type: event_type.to_owned(),
                content: content.clone(),
            }),
        }
    }

    /// The raw `(type, content)` pair of this content.
    pub fn to_parts(&self) -> (String, Value) {
        let event_type = self.event_type().to_owned();

        let content = match self {
            Self::OlmEncrypted(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::RoomKey(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::ForwardedRoomKey(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::KeyRequest(request) => serde_json::to_value(RoomKeyRequestWire {
                action: "request".to_owned(),
                body: Some(RoomKeyRequestBody {
                    algorithm: request.algorithm.clone(),
                    room_id: request.room_id.clone(),
                    session_creator_curve25519: request.session_creator_curve25519.clone(),
                    session_id: request.session_id.clone(),
                }),
                request_id: request.request_id.clone(),
                requesting_device_id: request.requesting_device_id.clone(),
            })
            .expect("contents serialize"),
            Self::KeyRequestCancellation(cancel) => serde_json::to_value(RoomKeyRequestWire {
                action: "request_cancellation".to_owned(),
                body: None,
                request_id: cancel.request_id.clone(),
                requesting_device_id: cancel.requesting_device_id.clone(),
            })
            .expect("contents serialize"),
            Self::Dummy => Value::Object(Map::new()),
            Self::Unknown { content, .. } => content.clone(),
        };

        (event_type, content)
    }
}

/// The content of a room timeline event.
#[derive(Clone, Debug)]
pub enum RoomContent {
    /// An `m.room.message`.
    Message(MessageContent),
    /// A Megolm encrypted event, not yet (or not) decryptable.
    Encrypted(MegolmContent),
    /// Anything else, kept verbatim.
    Unknown { event_type: String, content: Value },
}

impl RoomContent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Message(_) => "m.room.message",
            Self::Encrypted(_) => "m.room.encrypted",
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    pub fn from_parts(event_type: &str, content: &Value) -> Result<Self, serde_json::Error> {
        match event_type {
            "m.room.message" => Ok(Self::Message(serde_json::from_value(content.clone())?)),
            "m.room.encrypted"
                if content.get("algorithm").and_then(Value::as_str)
                    == Some(MEGOLM_V1_ALGORITHM) =>
            {
                Ok(Self::Encrypted(serde_json::from_value(content.clone())?))
            }
            _ => Ok(Self::Unknown {
                event_type: event_type.to_owned(),
                content: content.clone(),
            }),
        }
    }

    pub fn to_parts(&self) -> (String, Value) {
        let content = match self {
            Self::Message(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::Encrypted(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::Unknown { content, .. } => content.clone(),
        };

        (self.event_type().to_owned(), content)
    }
}

/// The content of a room state event.
#[derive(Clone, Debug)]
pub enum StateContent {
    Member(MemberContent),
    Encryption(EncryptionContent),
    Create(CreateContent),
    Name(NameContent),
    /// Anything else, kept verbatim.
    Unknown { event_type: String, content: Value },
}

impl StateContent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Member(_) => "m.room.member",
            Self::Encryption(_) => "m.room.encryption",
            Self::Create(_) => "m.room.create",
            Self::Name(_) => "m.room.name",
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    pub fn from_parts(event_type: &str, content: &Value) -> Result<Self, serde_json::Error> {
        match event_type {
            "m.room.member" => Ok(Self::Member(serde_json::from_value(content.clone())?)),
            "m.room.encryption" => Ok(Self::Encryption(serde_json::from_value(content.clone())?)),
            "m.room.create" => Ok(Self::Create(serde_json::from_value(content.clone())?)),
            "m.room.name" => Ok(Self::Name(serde_json::from_value(content.clone())?)),
            _ => Ok(Self::Unknown {
                event_type: event_type.to_owned(),
                content: content.clone(),
            }),
        }
    }

    pub fn to_parts(&self) -> (String, Value) {
        let content = match self {
            Self::Member(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::Encryption(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::Create(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::Name(c) => serde_json::to_value(c).expect("contents serialize"),
            Self::Unknown { content, .. } => content.clone(),
        };

        (self.event_type().to_owned(), content)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn olm_content_is_dispatched_on_algorithm() {
        let content = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "sender_key": "sender_curve",
            "ciphertext": { "our_curve": { "type": 0, "body": "AwG..." } },
        });

        let parsed = ToDeviceContent::from_parts("m.room.encrypted", &content).unwrap();
        let olm = assert_matches!(parsed, ToDeviceContent::OlmEncrypted(c) => c);
        assert_eq!(olm.sender_curve25519, "sender_curve");
        assert_eq!(olm.ciphertext["our_curve"].message_type, 0);
    }

    #[test]
    fn unknown_contents_round_trip_losslessly() {
        let content = json!({ "net.example.custom": { "deep": [1, 2, 3] } });

        let parsed = ToDeviceContent::from_parts("net.example.event", &content).unwrap();
        let (event_type, emitted) = parsed.to_parts();

        assert_eq!(event_type, "net.example.event");
        assert_eq!(emitted, content);
    }

    #[test]
    fn key_request_wire_round_trip() {
        let request = GroupSessionRequest::new(
            ruma::device_id!("DEV").to_owned(),
            ruma::room_id!("!room:example.org").to_owned(),
            "creator_curve".to_owned(),
            "session_id".to_owned(),
        );

        let (event_type, wire) = ToDeviceContent::KeyRequest(request.clone()).to_parts();
        assert_eq!(event_type, "m.room_key_request");
        assert_eq!(wire["action"], "request");
        assert_eq!(wire["body"]["sender_key"], "creator_curve");

        let parsed = ToDeviceContent::from_parts(&event_type, &wire).unwrap();
        let round_tripped = assert_matches!(parsed, ToDeviceContent::KeyRequest(r) => r);
        assert_eq!(round_tripped, request);

        let (_, cancel_wire) =
            ToDeviceContent::KeyRequestCancellation(request.cancellation()).to_parts();
        assert_eq!(cancel_wire["action"], "request_cancellation");
        assert_eq!(cancel_wire["request_id"], request.request_id);
        assert!(cancel_wire.get("body").is_none());
    }

    #[test]
    fn message_content_keeps_extra_fields() {
        let content = json!({
            "msgtype": "m.text",
            "body": "hi",
            "format": "org.matrix.custom.html",
            "formatted_body": "<b>hi</b>",
        });

        let parsed = RoomContent::from_parts("m.room.message", &content).unwrap();
        let (_, emitted) = parsed.to_parts();
        assert_eq!(emitted, content);
    }
}

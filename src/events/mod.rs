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

//! Event envelopes.
//!
//! Two kinds of events reach the crypto layer: to-device events and room
//! timeline events. Both keep the raw JSON of anything we don't model and
//! carry an optional [`DecryptionInfo`] once the crypto layer has processed
//! them.

mod content;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedUserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

pub use self::content::{
    CancelGroupSessionRequest, CreateContent, EncryptionContent, ForwardedRoomKeyContent,
    GroupSessionRequest, MemberContent, Membership, MessageContent, MegolmContent, NameContent,
    OlmCiphertext, OlmContent, RoomContent, RoomKeyContent, StateContent, ToDeviceContent,
};
use crate::crypto::VerificationError;

/// An event that couldn't be parsed.
///
/// Invalid events are recorded in an `invalid` bucket next to the store they
/// would have landed in, and skipped.
#[derive(Clone, Debug)]
pub struct InvalidEvent {
    /// Why the event was rejected.
    pub reason: String,
    /// The raw event source.
    pub source: Value,
}

impl std::fmt::Display for InvalidEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid event: {}", self.reason)
    }
}

impl std::error::Error for InvalidEvent {}

impl InvalidEvent {
    pub(crate) fn new(reason: impl Into<String>, source: &Value) -> Self {
        Self {
            reason: reason.into(),
            source: source.clone(),
        }
    }
}

fn field<T: DeserializeOwned>(value: &Value, name: &str) -> Result<T, InvalidEvent> {
    serde_json::from_value(value.get(name).cloned().unwrap_or(Value::Null))
        .map_err(|e| InvalidEvent::new(format!("field {name}: {e}"), value))
}

/// What the crypto layer learned while decrypting an event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptionInfo {
    /// The original encrypted event, as received.
    pub original: Value,
    /// The decrypted cleartext payload.
    pub payload: Value,
    /// Binding and trust violations found while verifying the payload.
    /// Decryption and verification are orthogonal: a non-empty list still
    /// comes with a decrypted payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_errors: Vec<VerificationError>,
    /// The curve25519 keys of the devices that relayed the Megolm session to
    /// us, empty for directly received sessions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forward_chain: Vec<String>,
}

/// A to-device event.
#[derive(Clone, Debug)]
pub struct ToDeviceEvent {
    pub sender: OwnedUserId,
    pub content: ToDeviceContent,
    /// Present once the event went through Olm decryption.
    pub decryption: Option<Box<DecryptionInfo>>,
}

impl ToDeviceEvent {
    pub fn from_value(value: &Value) -> Result<Self, InvalidEvent> {
        let sender: OwnedUserId = field(value, "sender")?;
        let event_type: String = field(value, "type")?;
        let content = value.get("content").cloned().unwrap_or_else(|| Value::Object(Map::new()));

        let content = ToDeviceContent::from_parts(&event_type, &content)
            .map_err(|e| InvalidEvent::new(format!("content: {e}"), value))?;

        Ok(Self {
            sender,
            content,
            decryption: None,
        })
    }

    pub fn to_value(&self) -> Value {
        let (event_type, content) = self.content.to_parts();

        let mut object = Map::new();
        object.insert("sender".to_owned(), Value::String(self.sender.to_string()));
        object.insert("type".to_owned(), Value::String(event_type));
        object.insert("content".to_owned(), content);

        if let Some(decryption) = &self.decryption {
            object.insert(
                "decryption".to_owned(),
                serde_json::to_value(decryption).expect("decryption info serializes"),
            );
        }

        Value::Object(object)
    }
}

/// A room timeline event.
#[derive(Clone, Debug)]
pub struct TimelineEvent {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    pub content: RoomContent,
    /// The raw `unsigned` object, kept verbatim.
    pub unsigned: Option<Value>,
    /// Present once the event went through Megolm decryption.
    pub decryption: Option<Box<DecryptionInfo>>,
}

impl TimelineEvent {
    pub fn from_value(value: &Value) -> Result<Self, InvalidEvent> {
        let event_id: OwnedEventId = field(value, "event_id")?;
        let sender: OwnedUserId = field(value, "sender")?;
        let origin_server_ts: MilliSecondsSinceUnixEpoch = field(value, "origin_server_ts")?;
        let event_type: String = field(value, "type")?;
        let content = value.get("content").cloned().unwrap_or_else(|| Value::Object(Map::new()));

        let content = RoomContent::from_parts(&event_type, &content)
            .map_err(|e| InvalidEvent::new(format!("content: {e}"), value))?;

        let decryption = match value.get("decryption") {
            Some(info) => Some(Box::new(
                serde_json::from_value(info.clone())
                    .map_err(|e| InvalidEvent::new(format!("decryption: {e}"), value))?,
            )),
            None => None,
        };

        Ok(Self {
            event_id,
            sender,
            origin_server_ts,
            content,
            unsigned: value.get("unsigned").cloned(),
            decryption,
        })
    }

    pub fn to_value(&self) -> Value {
        let (event_type, content) = self.content.to_parts();

        let mut object = Map::new();
        object.insert("event_id".to_owned(), Value::String(self.event_id.to_string()));
        object.insert("sender".to_owned(), Value::String(self.sender.to_string()));
        object.insert(
            "origin_server_ts".to_owned(),
            serde_json::to_value(self.origin_server_ts).expect("timestamps serialize"),
        );
        object.insert("type".to_owned(), Value::String(event_type));
        object.insert("content".to_owned(), content);

        if let Some(unsigned) = &self.unsigned {
            object.insert("unsigned".to_owned(), unsigned.clone());
        }

        if let Some(decryption) = &self.decryption {
            object.insert(
                "decryption".to_owned(),
                serde_json::to_value(decryption).expect("decryption info serializes"),
            );
        }

        Value::Object(object)
    }
}

/// A room state event.
///
/// Events from an invited room's `invite_state` are stripped: they carry
/// neither an event id nor a timestamp.
#[derive(Clone, Debug)]
pub struct StateEvent {
    pub event_id: Option<OwnedEventId>,
    pub sender: OwnedUserId,
    pub state_key: String,
    pub origin_server_ts: Option<MilliSecondsSinceUnixEpoch>,
    pub content: StateContent,
}

impl StateEvent {
    pub fn from_value(value: &Value) -> Result<Self, InvalidEvent> {
        let sender: OwnedUserId = field(value, "sender")?;
        let state_key: String = field(value, "state_key")?;
        let event_type: String = field(value, "type")?;
        let content = value.get("content").cloned().unwrap_or_else(|| Value::Object(Map::new()));

        let content = StateContent::from_parts(&event_type, &content)
            .map_err(|e| InvalidEvent::new(format!("content: {e}"), value))?;

        let event_id = match value.get("event_id") {
            Some(Value::String(_)) => Some(field(value, "event_id")?),
            _ => None,
        };

        let origin_server_ts = match value.get("origin_server_ts") {
            Some(Value::Number(_)) => Some(field(value, "origin_server_ts")?),
            _ => None,
        };

        Ok(Self {
            event_id,
            sender,
            state_key,
            origin_server_ts,
            content,
        })
    }

    pub fn to_value(&self) -> Value {
        let (event_type, content) = self.content.to_parts();

        let mut object = Map::new();
        object.insert("sender".to_owned(), Value::String(self.sender.to_string()));
        object.insert("state_key".to_owned(), Value::String(self.state_key.clone()));
        object.insert("type".to_owned(), Value::String(event_type));
        object.insert("content".to_owned(), content);

        if let Some(event_id) = &self.event_id {
            object.insert("event_id".to_owned(), Value::String(event_id.to_string()));
        }

        if let Some(ts) = self.origin_server_ts {
            object.insert(
                "origin_server_ts".to_owned(),
                serde_json::to_value(ts).expect("timestamps serialize"),
            );
        }

        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn timeline_event_round_trip() {
        let source = json!({
            "event_id": "$event:example.org",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_432_735_824_653u64,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hello" },
            "unsigned": { "age": 1234, "custom": true },
        });

        let event = TimelineEvent::from_value(&source).unwrap();
        assert_matches!(&event.content, RoomContent::Message(m) if m.body == "hello");
        assert_eq!(event.to_value(), source);
    }

    #[test]
    fn missing_fields_are_invalid() {
        let source = json!({ "type": "m.room.message", "content": {} });
        let error = TimelineEvent::from_value(&source).unwrap_err();
        assert!(error.reason.contains("event_id"));
    }

    #[test]
    fn stripped_state_events_parse() {
        let source = json!({
            "sender": "@alice:example.org",
            "state_key": "",
            "type": "m.room.encryption",
            "content": { "algorithm": "m.megolm.v1.aes-sha2" },
        });

        let event = StateEvent::from_value(&source).unwrap();
        assert!(event.event_id.is_none());
        assert_matches!(event.content, StateContent::Encryption(_));
    }
}

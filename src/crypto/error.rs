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

//! Errors of the encryption subsystem.

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

/// Result of an Olm to-device operation.
pub type OlmResult<T> = Result<T, OlmError>;

/// Result of a Megolm room event operation.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error while encrypting or decrypting an Olm to-device message.
#[derive(Debug, Error)]
pub enum OlmError {
    /// The encrypted event used an algorithm we don't support.
    #[error("the encrypted event used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The event carries no ciphertext for our curve25519 key.
    #[error("the encrypted event doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The ciphertext couldn't be base64 decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// A curve25519 or ed25519 key couldn't be decoded.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// An existing session failed to decrypt the message.
    #[error("the Olm session failed to decrypt the message: {0}")]
    Session(#[from] vodozemac::olm::DecryptionError),

    /// No stored session could decrypt the message and it wasn't a prekey
    /// message, so no new session could be established either.
    #[error("no Olm session could decrypt the message")]
    Decryption,

    /// A new inbound session couldn't be created from a prekey message.
    #[error("couldn't create a new inbound Olm session: {0}")]
    SessionCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The encrypting device has no one-time keys left for us to claim.
    #[error("the device {user_id} {device_id} has no one-time keys available")]
    MissingOneTimeKey {
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    },

    /// The device we should encrypt for doesn't have an Olm session with us.
    #[error("the device doesn't have an Olm session with us")]
    MissingSession,

    /// The decrypted payload wasn't valid JSON.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// The decrypted payload wasn't a JSON object.
    #[error("the decrypted payload isn't a JSON object")]
    NotAnObject,

    /// The crypto store couldn't be written.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error while encrypting or decrypting a Megolm room event.
#[derive(Debug, Error)]
pub enum MegolmError {
    /// No inbound group session is known for the event. The caller may queue
    /// the event and retry once the key arrives.
    #[error(
        "no inbound group session to decrypt room {room_id}, \
         sender key {sender_key}, session {session_id}"
    )]
    MissingSession {
        room_id: OwnedRoomId,
        sender_key: String,
        session_id: String,
    },

    /// The ciphertext couldn't be base64 decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The group session failed to decrypt the ciphertext.
    #[error("the group session failed to decrypt the message: {0}")]
    Session(#[from] vodozemac::megolm::DecryptionError),

    /// A message index was seen twice with different event ids or
    /// timestamps, which indicates a replayed ciphertext.
    #[error("message index {index} was already used by a different event, possible replay attack")]
    PossibleReplayAttack { index: u32 },

    /// The encrypted event used an algorithm we don't support.
    #[error("the encrypted event used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The session key of a room key couldn't be decoded.
    #[error("the session key is malformed: {0}")]
    InvalidSessionKey(String),

    /// The decrypted payload wasn't valid JSON.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// The decrypted payload wasn't a JSON object.
    #[error("the decrypted payload isn't a JSON object")]
    NotAnObject,

    /// The crypto store couldn't be written.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error while creating or checking a signed JSON object.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The value to sign or verify wasn't a JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The value couldn't be converted to canonical JSON.
    #[error("the object can't be canonicalized: {0}")]
    Canonical(#[from] ruma::CanonicalJsonError),

    /// The `signatures` object is missing the expected key.
    #[error("the signatures object is missing the key {0}")]
    MissingSignature(String),

    /// The signature wasn't valid base64.
    #[error("the signature isn't valid base64")]
    InvalidSignature,

    /// The provided public key couldn't be decoded.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// The signature didn't match the signed object.
    #[error("the signature didn't match the provided key")]
    Verification,

    /// The object couldn't be serialized.
    #[error(transparent)]
    Json(#[from] JsonError),
}

/// Error while loading or saving the crypto store.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The store file couldn't be read or written.
    #[error("failed to read or write the crypto store: {0}")]
    Store(#[from] crate::store::StoreError),

    /// The store contents couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] JsonError),
}

/// Why a device entry returned by `/keys/query` was rejected.
///
/// These are recovered locally: the entry is logged and skipped without
/// aborting the query.
#[derive(Debug, Error)]
pub enum QueriedDeviceError {
    /// The entry's `user_id` disagrees with the map key it was found under.
    #[error("the entry user id {entry} doesn't match the queried user {queried}")]
    UserIdMismatch {
        queried: OwnedUserId,
        entry: String,
    },

    /// The entry's `device_id` disagrees with the map key it was found under.
    #[error("the entry device id {entry} doesn't match the queried device {queried}")]
    DeviceIdMismatch {
        queried: OwnedDeviceId,
        entry: String,
    },

    /// The entry is missing one of its identity keys.
    #[error("the entry is missing its {0} key")]
    MissingKey(String),

    /// The device was seen before with a different ed25519 key.
    #[error("the stored ed25519 key {stored} differs from the queried one {queried}")]
    Ed25519Changed { stored: String, queried: String },

    /// The entry's self-signature didn't check out.
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// A binding or trust violation found while verifying a decrypted payload.
///
/// Verification failures never destroy the payload: the decrypted event is
/// returned together with the list of errors so callers can apply their own
/// policy.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum VerificationError {
    /// The Olm payload's `sender` doesn't match the event sender.
    #[error("the Olm payload sender {payload} doesn't match the event sender {event}")]
    OlmSenderMismatch { event: OwnedUserId, payload: String },

    /// The Olm payload was meant for a different user.
    #[error("the Olm payload was intended for {intended}, but we are {us}")]
    OlmWrongRecipient { intended: String, us: OwnedUserId },

    /// The Olm payload was meant for a device with a different ed25519 key.
    #[error("the Olm payload was intended for the ed25519 key {intended}, ours is {ours}")]
    OlmWrongRecipientEd25519 { intended: String, ours: String },

    /// No known device of the sender matches the event's sender key and the
    /// payload's claimed ed25519 key.
    #[error(
        "no known device of the sender matches the sender key {sender_curve25519} \
         and claimed ed25519 key {claimed_ed25519}"
    )]
    OlmFromUnknownDevice {
        claimed_ed25519: String,
        sender_curve25519: String,
    },

    /// The Olm payload comes from a device the user has blocked.
    #[error("the Olm payload comes from the blocked device {user_id} {device_id}")]
    OlmPayloadFromBlockedDevice {
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    },

    /// No known device of the sender owns both the session's sender key and
    /// the ed25519 key that started the group session.
    #[error(
        "no known device of the sender matches the session starter keys \
         {sender_curve25519} / {starter_ed25519}"
    )]
    MegolmWrongSender {
        starter_ed25519: String,
        sender_curve25519: String,
    },

    /// The group session was started by a device the user hasn't decided to
    /// trust yet.
    #[error("the group session was started by the untrusted device {user_id} {device_id}")]
    MegolmFromUntrustedDevice {
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    },

    /// The group session was started by a device the user has blocked.
    #[error("the group session was started by the blocked device {user_id} {device_id}")]
    MegolmFromBlockedDevice {
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    },

    /// The session was relayed by a device that isn't trusted.
    #[error("the session was forwarded by the untrusted device with curve25519 key {curve25519}")]
    MegolmUntrustedDeviceInForwardChain { curve25519: String },

    /// The session was relayed by a blocked device.
    #[error("the session was forwarded by the blocked device with curve25519 key {curve25519}")]
    MegolmBlockedDeviceInForwardChain { curve25519: String },
}

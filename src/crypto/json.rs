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

//! Canonical JSON and the signed object protocol.
//!
//! Signing strips the `signatures` and `unsigned` keys, canonicalizes the
//! remainder (sorted keys, no whitespace, UTF-8 output) and writes the
//! signature back under `signatures.<user_id>.ed25519:<device_id>`, as laid
//! out in the Matrix spec appendices.

use ruma::{CanonicalJsonValue, DeviceId, UserId};
use serde_json::{Map, Value};
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use super::{error::SignatureError, olm::Account};

/// Encode a JSON value in its canonical form.
pub fn canonical_json(value: &Value) -> Result<String, SignatureError> {
    let canonical = CanonicalJsonValue::try_from(value.clone())?;
    Ok(serde_json::to_string(&canonical)?)
}

fn strip_for_signing(object: &Map<String, Value>) -> Result<String, SignatureError> {
    let stripped: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| key.as_str() != "signatures" && key.as_str() != "unsigned")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    canonical_json(&Value::Object(stripped))
}

/// Sign a JSON object with the account's ed25519 key.
///
/// The signature lands under `signatures[user_id]["ed25519:" + device_id]`,
/// existing signatures from other keys are preserved and `unsigned` is left
/// untouched.
pub fn sign_json(
    account: &Account,
    user_id: &UserId,
    device_id: &DeviceId,
    value: &mut Value,
) -> Result<(), SignatureError> {
    let object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    let signature = account.sign(&strip_for_signing(object)?);

    let signatures = object
        .entry("signatures".to_owned())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or(SignatureError::NotAnObject)?;

    let user_signatures = signatures
        .entry(user_id.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or(SignatureError::NotAnObject)?;

    user_signatures.insert(format!("ed25519:{device_id}"), Value::String(signature));

    Ok(())
}

/// Verify the signed object protocol on a JSON object.
///
/// `ed25519_b64` is the key the signer claims; the caller decides whether
/// that claim is anchored (from our device store, or an enclosing Olm
/// envelope).
pub fn verify_signed_json(
    value: &Value,
    user_id: &UserId,
    device_id: &DeviceId,
    ed25519_b64: &str,
) -> Result<(), SignatureError> {
    let object = value.as_object().ok_or(SignatureError::NotAnObject)?;
    let canonical = strip_for_signing(object)?;

    let key_id = format!("ed25519:{device_id}");

    let signature_b64 = object
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(&key_id))
        .and_then(Value::as_str)
        .ok_or_else(|| SignatureError::MissingSignature(format!("{user_id}/{key_id}")))?;

    let key = Ed25519PublicKey::from_base64(ed25519_b64)?;
    let signature = Ed25519Signature::from_base64(signature_b64)
        .map_err(|_| SignatureError::InvalidSignature)?;

    key.verify(canonical.as_bytes(), &signature)
        .map_err(|_| SignatureError::Verification)
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::*;
    use crate::crypto::olm::Account;

    #[test]
    fn canonical_json_sorts_keys_and_drops_whitespace() {
        let value = json!({
            "b": 2,
            "a": { "y": "ŝ", "x": [true, null] },
        });

        let canonical = canonical_json(&value).unwrap();
        assert_eq!(canonical, r#"{"a":{"x":[true,null],"y":"ŝ"},"b":2}"#);
    }

    #[test]
    fn canonical_json_round_trips() {
        let value = json!({
            "one": 1,
            "nested": { "list": [1, 2, {"deep": "value"}] },
            "unicode": "日本語",
        });

        let canonical = canonical_json(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(reparsed, value);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let account = Account::new();
        let user_id = user_id!("@alice:example.org");
        let device_id = device_id!("ALICEDEVICE");

        let mut value = json!({
            "key": "value",
            "unsigned": { "ignored": true },
        });

        sign_json(&account, user_id, device_id, &mut value).unwrap();

        assert!(value["signatures"][user_id.as_str()]["ed25519:ALICEDEVICE"].is_string());
        assert_eq!(value["unsigned"]["ignored"], true);

        verify_signed_json(&value, user_id, device_id, &account.ed25519()).unwrap();
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let account = Account::new();
        let user_id = user_id!("@alice:example.org");
        let device_id = device_id!("ALICEDEVICE");

        let mut value = json!({ "key": "value" });
        sign_json(&account, user_id, device_id, &mut value).unwrap();

        value["key"] = "changed".into();

        let error =
            verify_signed_json(&value, user_id, device_id, &account.ed25519()).unwrap_err();
        assert!(matches!(error, SignatureError::Verification));
    }

    #[test]
    fn missing_signature_is_reported() {
        let account = Account::new();
        let value = json!({ "key": "value" });

        let error = verify_signed_json(
            &value,
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            &account.ed25519(),
        )
        .unwrap_err();

        assert!(matches!(error, SignatureError::MissingSignature(_)));
    }
}

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

//! The identity account.

use vodozemac::{
    olm::{AccountPickle, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, KeyError,
};

use super::session::Session;
use crate::crypto::error::OlmError;

/// Our own Olm account.
///
/// One per client, created on first login and never replaced afterwards.
/// Holds the ed25519 signing key, the curve25519 identity key and the pool
/// of not yet published one-time keys.
pub struct Account {
    inner: vodozemac::olm::Account,
}

impl Account {
    /// Create a fresh account with new identity keys.
    pub fn new() -> Self {
        Self {
            inner: vodozemac::olm::Account::new(),
        }
    }

    /// Restore an account from its pickled form.
    pub fn from_pickle(pickle: AccountPickle) -> Self {
        Self {
            inner: vodozemac::olm::Account::from_pickle(pickle),
        }
    }

    /// Pickle the account for storage.
    pub fn pickle(&self) -> AccountPickle {
        self.inner.pickle()
    }

    /// The base64 encoded public ed25519 signing key.
    pub fn ed25519(&self) -> String {
        self.inner.ed25519_key().to_base64()
    }

    /// The base64 encoded public curve25519 identity key.
    pub fn curve25519(&self) -> String {
        self.inner.curve25519_key().to_base64()
    }

    /// Sign the given message, returning the base64 encoded signature.
    pub fn sign(&self, message: &str) -> String {
        self.inner.sign(message).to_base64()
    }

    /// The maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate `count` new one-time keys.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        let _ = self.inner.generate_one_time_keys(count);
    }

    /// The not yet published one-time keys, as `(key id, base64 key)` pairs.
    pub fn one_time_keys(&self) -> Vec<(String, String)> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| (key_id.to_base64(), key.to_base64()))
            .collect()
    }

    /// Mark the current one-time key pool as published to the server.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Create an outbound session to a device, using a one-time key we
    /// claimed for it.
    pub fn create_outbound_session(
        &self,
        their_curve25519: &str,
        one_time_key: &str,
    ) -> Result<Session, KeyError> {
        let identity_key = Curve25519PublicKey::from_base64(their_curve25519)?;
        let one_time_key = Curve25519PublicKey::from_base64(one_time_key)?;

        let session =
            self.inner
                .create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key);

        Ok(Session::new(session, their_curve25519.to_owned()))
    }

    /// Create an inbound session from a prekey message.
    ///
    /// The used one-time key is removed from the pool, and the prekey
    /// message's plaintext is returned along with the new session.
    pub fn create_inbound_session(
        &mut self,
        their_curve25519: &str,
        message: &PreKeyMessage,
    ) -> Result<(Session, Vec<u8>), OlmError> {
        let identity_key = Curve25519PublicKey::from_base64(their_curve25519)?;

        let result = self.inner.create_inbound_session(identity_key, message)?;

        Ok((
            Session::new(result.session, their_curve25519.to_owned()),
            result.plaintext,
        ))
    }
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("ed25519", &self.ed25519())
            .field("curve25519", &self.curve25519())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_time_key_pool() {
        let mut account = Account::new();
        assert!(account.one_time_keys().is_empty());

        account.generate_one_time_keys(4);
        assert_eq!(account.one_time_keys().len(), 4);

        account.mark_keys_as_published();
        assert!(account.one_time_keys().is_empty());
    }

    #[test]
    fn pickle_round_trip_preserves_identity() {
        let account = Account::new();
        let restored = Account::from_pickle(account.pickle());

        assert_eq!(account.ed25519(), restored.ed25519());
        assert_eq!(account.curve25519(), restored.curve25519());
    }

    #[test]
    fn sign_verify_round_trip() {
        let account = Account::new();
        let signature = account.sign("message");

        let key = vodozemac::Ed25519PublicKey::from_base64(&account.ed25519()).unwrap();
        let signature = vodozemac::Ed25519Signature::from_base64(&signature).unwrap();
        key.verify(b"message", &signature).unwrap();
    }
}

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

//! End-to-end encryption.
//!
//! Olm for to-device messages, Megolm for room messages, with device
//! tracking, trust enforcement and room key distribution on top. The
//! [`OlmMachine`] ties everything together; the sync dispatcher feeds it
//! and the client sends what it produces.

mod device;
mod error;
pub(crate) mod json;
mod key_sharing;
mod machine;
pub mod olm;
mod registry;
mod store;

/// The algorithm identifying Olm encrypted to-device events.
pub const OLM_V1_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// The algorithm identifying Megolm encrypted room events.
pub const MEGOLM_V1_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

pub use device::{Device, TrustState};
pub use error::{
    CryptoStoreError, MegolmError, MegolmResult, OlmError, OlmResult, QueriedDeviceError,
    SignatureError, VerificationError,
};
pub use machine::{MegolmDecryptionResult, OlmDecryptionResult, OlmMachine};
pub use olm::EncryptionSettings;
pub use registry::DeviceRegistry;
pub use store::{InboundGroupKey, SessionStore};

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

//! Known devices.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};

use crate::events::GroupSessionRequest;

/// The local trust decision about a device.
///
/// Fresh devices start out `Unset`; only the user moves them to `Trusted`
/// or `Blocked`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    #[default]
    Unset,
    Trusted,
    Blocked,
}

/// A device of some user, as accepted from a `/keys/query` response.
///
/// The `(user_id, device_id)` pair is unique, and `ed25519` never changes
/// once the device was seen: a later query claiming a different signing key
/// is rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    /// The base64 ed25519 signing key, locked on first use.
    pub ed25519: String,
    /// The base64 curve25519 identity key.
    pub curve25519: String,
    /// The E2EE algorithms the device announced.
    pub algorithms: Vec<String>,
    /// The display name from the entry's `unsigned` section, if any.
    pub display_name: Option<String>,
    /// The local trust decision.
    #[serde(default)]
    pub trust: TrustState,
    /// Group session requests from this device, parked until it is trusted.
    #[serde(default)]
    pub pending_session_requests: BTreeMap<String, GroupSessionRequest>,
}

impl Device {
    /// Does the device support Olm encrypted to-device messages?
    pub fn supports_olm(&self) -> bool {
        self.algorithms
            .iter()
            .any(|a| a == crate::crypto::OLM_V1_ALGORITHM)
    }

    pub fn is_blocked(&self) -> bool {
        self.trust == TrustState::Blocked
    }

    pub fn is_trusted(&self) -> bool {
        self.trust == TrustState::Trusted
    }
}

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

//! On-disk state layout.
//!
//! Everything the client persists is JSON written atomically (temp file +
//! rename) so that a crash never leaves a half-written file behind. The
//! layout under the base directory is:
//!
//! ```text
//! client.json               client config incl. the sync token
//! e2e.json                  crypto account and sessions
//! devices.json              device registry
//! rooms/<room>/state.json   per-room state snapshot
//! rooms/<room>/timeline.json  timeline index and gaps
//! rooms/<room>/<date>.json  daily timeline event shards
//! ```

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use url::Url;

/// Error while reading or writing a store file.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The file couldn't be read, created or renamed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The file contents couldn't be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result of a store operation.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Write `value` as JSON to `path`, atomically.
///
/// The value is first written to a temporary file in the same directory and
/// then renamed over the target, so readers never observe partial contents.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().expect("store paths always have a parent");
    fs::create_dir_all(parent)?;

    let json = serde_json::to_vec_pretty(value)?;

    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(&json)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Read a JSON file into `T`, returning `None` if the file doesn't exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Encode an identifier so it is safe to use as a file or directory name.
///
/// Alphanumerics, `-`, `.` and `_` pass through, everything else becomes
/// `%XX`, so distinct ids always map to distinct names.
pub(crate) fn encode_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());

    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02x}")),
        }
    }

    out
}

/// The persisted client configuration, stored as `client.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// The homeserver URL, possibly rewritten by `.well-known` discovery.
    pub homeserver: Url,
    /// Our own user id, set after login.
    pub user_id: Option<ruma::OwnedUserId>,
    /// The id of the device this client drives.
    pub device_id: Option<ruma::OwnedDeviceId>,
    /// The access token of the current login session.
    pub access_token: Option<String>,
    /// The `next_batch` cursor of the last handled sync response.
    pub next_batch: Option<String>,
}

impl ClientConfig {
    /// The path of the config file under the given base directory.
    pub fn path(base_dir: &Path) -> PathBuf {
        base_dir.join("client.json")
    }

    /// Load the config from the base directory, if one was saved before.
    pub fn load(base_dir: &Path) -> Result<Option<Self>> {
        read_json(&Self::path(base_dir))
    }

    /// Persist the config under the base directory.
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        write_json_atomic(&Self::path(base_dir), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");

        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let value: Option<serde_json::Value> = read_json(&path).unwrap();

        assert_eq!(value, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<serde_json::Value> =
            read_json(&dir.path().join("nothing.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn file_names_are_reversible_and_safe() {
        let encoded = encode_file_name("!room:example.org");
        assert_eq!(encoded, "%21room%3aexample.org");
        assert!(!encoded.contains(['/', ':', '!']));

        assert_ne!(encode_file_name("!a:x"), encode_file_name("!a%3ax"));
    }

    #[test]
    fn client_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let config = ClientConfig {
            homeserver: Url::parse("https://example.org").unwrap(),
            user_id: Some(ruma::user_id!("@alice:example.org").to_owned()),
            device_id: Some(ruma::device_id!("DEVICEID").to_owned()),
            access_token: Some("syt_secret".to_owned()),
            next_batch: Some("s123".to_owned()),
        };

        config.save(dir.path()).unwrap();
        let loaded = ClientConfig::load(dir.path()).unwrap().unwrap();

        assert_eq!(loaded.user_id, config.user_id);
        assert_eq!(loaded.next_batch, config.next_batch);
    }
}

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

//! The room timeline log.
//!
//! Events are kept in memory in arrival order and persisted into daily
//! shard files next to a `timeline.json` index holding the gaps and the
//! invalid-event bucket. Encrypted events we couldn't decrypt stay queued
//! by their session key so they can be retried once the key arrives.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    events::{InvalidEvent, RoomContent, TimelineEvent},
    store::{read_json, write_json_atomic, Result as StoreResult},
};

/// The key identifying the Megolm session an undecrypted event needs:
/// `(sender_curve25519, session_id)`.
pub type UndecryptedKey = (String, String);

/// A marker that the server truncated the room's timeline.
///
/// Carries the token needed to fetch the missing events backwards from
/// `event_after`, until `event_before` (or the room creation) is reached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Gap {
    /// The `prev_batch` token to fill the gap from.
    pub fill_token: String,
    /// The last event known before the gap, if any.
    pub event_before: Option<OwnedEventId>,
    /// The first event after the gap.
    pub event_after: OwnedEventId,
    /// When `event_after` was sent, used to order gaps.
    pub event_after_ts: MilliSecondsSinceUnixEpoch,
}

/// An event that failed to parse, kept for inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidEventRecord {
    pub reason: String,
    pub source: Value,
}

#[derive(Serialize, Deserialize, Default)]
struct TimelineIndex {
    gaps: Vec<Gap>,
    #[serde(default)]
    invalid: Vec<InvalidEventRecord>,
}

/// The persistent event log of one room.
#[derive(Clone, Debug)]
pub struct Timeline {
    dir: PathBuf,
    events: Vec<TimelineEvent>,
    positions: HashMap<OwnedEventId, usize>,
    /// Open gaps, oldest first.
    pub gaps: Vec<Gap>,
    /// Events waiting for a Megolm session, by session key.
    undecrypted: HashMap<UndecryptedKey, Vec<OwnedEventId>>,
    /// Events that failed to parse.
    pub invalid: Vec<InvalidEventRecord>,
}

impl Timeline {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            events: Vec::new(),
            positions: HashMap::new(),
            gaps: Vec::new(),
            undecrypted: HashMap::new(),
            invalid: Vec::new(),
        }
    }

    /// Load the timeline from its index and shard files.
    pub(crate) fn load(dir: PathBuf) -> StoreResult<Self> {
        let mut timeline = Self::new(dir);

        if let Some(index) = read_json::<TimelineIndex>(&timeline.index_path())? {
            timeline.gaps = index.gaps;
            timeline.invalid = index.invalid;
        }

        let mut shards: Vec<PathBuf> = match std::fs::read_dir(&timeline.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| is_shard_file(p))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        shards.sort();

        for shard in shards {
            let Some(values) = read_json::<Vec<Value>>(&shard)? else {
                continue;
            };

            for value in values {
                match TimelineEvent::from_value(&value) {
                    Ok(event) => timeline.insert(event),
                    Err(e) => warn!(
                        shard = %shard.display(),
                        error = %e,
                        "Skipping an unreadable stored event"
                    ),
                }
            }
        }

        Ok(timeline)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("timeline.json")
    }

    fn shard_path(&self, ts: MilliSecondsSinceUnixEpoch) -> PathBuf {
        let millis = i64::try_from(u64::from(ts.get())).unwrap_or(0);
        let date = DateTime::<Utc>::from_timestamp_millis(millis)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "1970-01-01".to_owned());

        self.dir.join(format!("{date}.json"))
    }

    fn save_index(&self) -> StoreResult<()> {
        write_json_atomic(
            &self.index_path(),
            &TimelineIndex {
                gaps: self.gaps.clone(),
                invalid: self.invalid.clone(),
            },
        )
    }

    /// Put an event into the in-memory log, replacing any previous version
    /// with the same id.
    fn insert(&mut self, event: TimelineEvent) {
        if let RoomContent::Encrypted(content) = &event.content {
            let key = (
                content.sender_curve25519.clone(),
                content.session_id.clone(),
            );
            let queue = self.undecrypted.entry(key).or_default();
            if !queue.contains(&event.event_id) {
                queue.push(event.event_id.clone());
            }
        }

        match self.positions.get(&event.event_id) {
            Some(&position) => self.events[position] = event,
            None => {
                self.positions.insert(event.event_id.clone(), self.events.len());
                self.events.push(event);
            }
        }
    }

    /// Register an event: record it in memory and append it to its daily
    /// shard. A decrypted version of a known event replaces the stored one.
    pub(crate) fn register(&mut self, event: TimelineEvent) -> StoreResult<()> {
        let shard = self.shard_path(event.origin_server_ts);
        let value = event.to_value();

        self.insert(event);

        let mut values: Vec<Value> = read_json(&shard)?.unwrap_or_default();
        values.push(value);
        write_json_atomic(&shard, &values)
    }

    /// Record an event that failed to parse.
    pub(crate) fn record_invalid(&mut self, source: &InvalidEvent) -> StoreResult<()> {
        debug!(reason = source.reason.as_str(), "Recording an invalid event");

        self.invalid.push(InvalidEventRecord {
            reason: source.reason.clone(),
            source: source.source.clone(),
        });
        self.save_index()
    }

    /// Record that the server truncated the timeline before `event_after`.
    pub(crate) fn register_gap(&mut self, gap: Gap) -> StoreResult<()> {
        self.gaps.push(gap);
        self.gaps.sort_by_key(|g| g.event_after_ts);
        self.save_index()
    }

    /// Drop a gap once it was filled.
    pub(crate) fn resolve_gap(&mut self, event_after: &ruma::EventId) -> StoreResult<()> {
        let before = self.gaps.len();
        self.gaps.retain(|gap| gap.event_after != event_after);

        if self.gaps.len() != before {
            self.save_index()?;
        }

        Ok(())
    }

    /// Take the events queued on the given session key for a decryption
    /// retry. The ids leave the queue; events that still fail to decrypt
    /// get re-queued by their re-registration.
    pub(crate) fn take_undecrypted(&mut self, key: &UndecryptedKey) -> Vec<OwnedEventId> {
        self.undecrypted.remove(key).unwrap_or_default()
    }

    /// Put an event id back on the queue after a failed retry.
    pub(crate) fn requeue_undecrypted(&mut self, key: &UndecryptedKey, event_id: OwnedEventId) {
        let queue = self.undecrypted.entry(key.clone()).or_default();
        if !queue.contains(&event_id) {
            queue.push(event_id);
        }
    }

    /// Does the log have events waiting on the given session?
    pub fn has_undecrypted(&self, key: &UndecryptedKey) -> bool {
        self.undecrypted.contains_key(key)
    }

    pub fn get(&self, event_id: &ruma::EventId) -> Option<&TimelineEvent> {
        self.positions
            .get(event_id)
            .map(|&position| &self.events[position])
    }

    /// The events in arrival order.
    pub fn events(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The id of the most recently registered event.
    pub fn last_event_id(&self) -> Option<&OwnedEventId> {
        self.events.last().map(|event| &event.event_id)
    }
}

fn is_shard_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    // YYYY-MM-DD.json
    name.len() == 15
        && name.ends_with(".json")
        && name[..10]
            .chars()
            .enumerate()
            .all(|(i, c)| if i == 4 || i == 7 { c == '-' } else { c.is_ascii_digit() })
}

#[cfg(test)]
mod tests {
    use ruma::{event_id, uint, user_id};
    use serde_json::json;

    use super::*;

    fn event(id: &str, ts: u64, body: &str) -> TimelineEvent {
        TimelineEvent::from_value(&json!({
            "event_id": id,
            "sender": user_id!("@alice:example.org"),
            "origin_server_ts": ts,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": body },
        }))
        .unwrap()
    }

    #[test]
    fn events_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut timeline = Timeline::new(dir.path().to_path_buf());

        timeline.register(event("$a:x.org", 1_600_000_000_000, "one")).unwrap();
        timeline.register(event("$b:x.org", 1_600_000_100_000, "two")).unwrap();
        // A different day lands in a different shard.
        timeline.register(event("$c:x.org", 1_600_100_000_000, "three")).unwrap();

        let reloaded = Timeline::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.get(event_id!("$c:x.org")).is_some());
    }

    #[test]
    fn re_registration_replaces_the_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut timeline = Timeline::new(dir.path().to_path_buf());

        timeline.register(event("$a:x.org", 1_600_000_000_000, "before")).unwrap();
        timeline.register(event("$a:x.org", 1_600_000_000_000, "after")).unwrap();

        assert_eq!(timeline.len(), 1);

        let reloaded = Timeline::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.len(), 1);

        let stored = reloaded.get(event_id!("$a:x.org")).unwrap();
        match &stored.content {
            RoomContent::Message(m) => assert_eq!(m.body, "after"),
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn undecrypted_events_are_queued_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut timeline = Timeline::new(dir.path().to_path_buf());

        let encrypted = TimelineEvent::from_value(&json!({
            "event_id": "$enc:x.org",
            "sender": user_id!("@alice:example.org"),
            "origin_server_ts": 1_600_000_000_000u64,
            "type": "m.room.encrypted",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": "curve",
                "ciphertext": "AwgA...",
                "device_id": "DEV",
                "session_id": "session",
            },
        }))
        .unwrap();

        timeline.register(encrypted).unwrap();

        let key = ("curve".to_owned(), "session".to_owned());
        assert!(timeline.has_undecrypted(&key));

        let queued = timeline.take_undecrypted(&key);
        assert_eq!(queued, vec![event_id!("$enc:x.org").to_owned()]);
        assert!(!timeline.has_undecrypted(&key));
    }

    #[test]
    fn gaps_are_persisted_and_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let mut timeline = Timeline::new(dir.path().to_path_buf());

        timeline
            .register_gap(Gap {
                fill_token: "t123".to_owned(),
                event_before: None,
                event_after: event_id!("$after:x.org").to_owned(),
                event_after_ts: MilliSecondsSinceUnixEpoch(uint!(1000)),
            })
            .unwrap();

        let reloaded = Timeline::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.gaps.len(), 1);
        assert_eq!(reloaded.gaps[0].fill_token, "t123");

        let mut reloaded = reloaded;
        reloaded.resolve_gap(event_id!("$after:x.org")).unwrap();
        assert!(reloaded.gaps.is_empty());

        let reloaded = Timeline::load(dir.path().to_path_buf()).unwrap();
        assert!(reloaded.gaps.is_empty());
    }
}

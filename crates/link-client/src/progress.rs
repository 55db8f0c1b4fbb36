//! This browser's view of the linking flow, persisted in local storage.
//!
//! Reads never fail: a missing, corrupt or inaccessible record reads as the
//! default record. Writes merge a [`ProgressPatch`] over the previous record,
//! stamp `updatedAt`, append one history entry and persist. If persistence
//! fails the merged record is still returned so the caller sees the intended
//! effect for the rest of the tick.

use crate::clock::{SharedClock, iso_from_ms};
use crate::storage::SharedStorage;
use link_protocol::{Capabilities, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

pub const PROGRESS_KEY: &str = "link.progress.v1";
pub const PROGRESS_VERSION: u32 = 1;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastTab {
    Intro,
    Setup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub stage: Stage,
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tab: Option<LastTab>,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
    /// Capability tokens handed out by the endpoint for self-service writes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities: Capabilities,
}

fn default_version() -> u32 {
    PROGRESS_VERSION
}

impl ProgressRecord {
    pub fn new(updated_at: String) -> Self {
        Self {
            version: PROGRESS_VERSION,
            stage: Stage::NOT_STARTED,
            updated_at,
            code: None,
            expires_at_ms: None,
            last_tab: None,
            history: VecDeque::new(),
            capabilities: Capabilities::new(),
        }
    }

    /// True when in the waiting window and `now_ms` is past its end. A
    /// waiting stage without a window counts as lapsed.
    pub fn window_lapsed(&self, now_ms: i64) -> bool {
        if !self.stage.is_waiting() {
            return false;
        }
        match self.expires_at_ms {
            Some(expires_at) => now_ms > expires_at,
            None => true,
        }
    }

    pub fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        self.expires_at_ms.map(|expires_at| (expires_at - now_ms).max(0))
    }
}

/// Partial update. `None` leaves a field alone; for nullable fields
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressPatch {
    pub stage: Option<Stage>,
    pub code: Option<Option<String>>,
    pub expires_at_ms: Option<Option<i64>>,
    pub last_tab: Option<LastTab>,
}

impl ProgressPatch {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_window(mut self, expires_at_ms: Option<i64>) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    pub fn with_last_tab(mut self, tab: LastTab) -> Self {
        self.last_tab = Some(tab);
        self
    }

    fn apply(self, record: &mut ProgressRecord) {
        if let Some(stage) = self.stage {
            record.stage = stage;
        }
        if let Some(code) = self.code {
            record.code = code;
        }
        if let Some(expires_at_ms) = self.expires_at_ms {
            record.expires_at_ms = expires_at_ms;
        }
        if let Some(tab) = self.last_tab {
            record.last_tab = Some(tab);
        }
    }
}

pub struct ProgressStore {
    storage: SharedStorage,
    clock: SharedClock,
    history_limit: usize,
}

impl ProgressStore {
    pub fn new(storage: SharedStorage, clock: SharedClock) -> Self {
        Self::with_history_limit(storage, clock, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(
        storage: SharedStorage,
        clock: SharedClock,
        history_limit: usize,
    ) -> Self {
        Self {
            storage,
            clock,
            history_limit: history_limit.max(1),
        }
    }

    pub fn read(&self) -> ProgressRecord {
        let fallback = || ProgressRecord::new(iso_from_ms(self.clock.now_ms()));
        let raw = match self.storage.get_item(PROGRESS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return fallback(),
            Err(err) => {
                warn!(error = %err, "progress storage unreadable, using defaults");
                return fallback();
            }
        };
        match serde_json::from_str::<ProgressRecord>(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "progress record corrupt, using defaults");
                fallback()
            }
        }
    }

    pub fn write(&self, patch: ProgressPatch) -> ProgressRecord {
        let mut record = self.read();
        patch.apply(&mut record);
        record.version = PROGRESS_VERSION;
        record.updated_at = iso_from_ms(self.clock.now_ms());
        record.history.push_back(HistoryEntry {
            stage: record.stage,
            at: record.updated_at.clone(),
        });
        while record.history.len() > self.history_limit {
            record.history.pop_front();
        }
        self.persist(&record);
        record
    }

    /// Merges capability tokens into the record without touching stage or
    /// history.
    pub fn grant_capabilities(&self, granted: &Capabilities) -> ProgressRecord {
        let mut record = self.read();
        if granted.is_empty() {
            return record;
        }
        for (action, token) in granted {
            record.capabilities.insert(*action, token.clone());
        }
        self.persist(&record);
        record
    }

    fn persist(&self, record: &ProgressRecord) {
        let encoded = match serde_json::to_string(record) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed to encode progress record");
                return;
            }
        };
        if let Err(err) = self.storage.set_item(PROGRESS_KEY, &encoded) {
            warn!(error = %err, stage = %record.stage, "failed to persist progress record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{LocalStorage, MemoryStorage};
    use link_protocol::CapabilityAction;
    use std::sync::Arc;

    fn store(storage: &MemoryStorage, limit: usize) -> ProgressStore {
        ProgressStore::with_history_limit(
            Arc::new(storage.clone()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            limit,
        )
    }

    #[test]
    fn empty_storage_reads_as_default() {
        let storage = MemoryStorage::new();
        let record = store(&storage, 10).read();
        assert_eq!(record.version, 1);
        assert_eq!(record.stage, Stage::NOT_STARTED);
        assert_eq!(record.code, None);
        assert!(record.history.is_empty());
        assert_eq!(record.updated_at, "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn corrupt_or_unreadable_storage_reads_as_default() {
        let storage = MemoryStorage::new();
        storage.set_item(PROGRESS_KEY, "[1,2,3]").expect("seed");
        assert_eq!(store(&storage, 10).read().stage, Stage::NOT_STARTED);

        storage.set_failing(true);
        assert_eq!(store(&storage, 10).read().stage, Stage::NOT_STARTED);
    }

    #[test]
    fn stored_zero_stage_is_clamped() {
        let storage = MemoryStorage::new();
        storage
            .set_item(PROGRESS_KEY, r#"{"version":1,"stage":0,"updatedAt":"x"}"#)
            .expect("seed");
        assert_eq!(store(&storage, 10).read().stage, Stage::NOT_STARTED);
    }

    #[test]
    fn write_merges_stamps_and_appends_history() {
        let storage = MemoryStorage::new();
        let store = store(&storage, 10);
        let first = store.write(ProgressPatch::stage(Stage::TWO_FACTOR_ENABLED));
        let second = store.write(
            ProgressPatch::stage(Stage::CODE_ISSUED).with_code(Some("AB12".to_string())),
        );

        assert_eq!(first.history.len(), 1);
        assert_eq!(second.history.len(), first.history.len() + 1);
        let last = second.history.back().expect("history entry");
        assert_eq!(last.stage, Stage::CODE_ISSUED);
        assert_eq!(last.at, second.updated_at);
        assert_eq!(store.read(), second);
    }

    #[test]
    fn history_is_bounded() {
        let storage = MemoryStorage::new();
        let store = store(&storage, 3);
        for stage in 1..=5 {
            store.write(ProgressPatch::stage(Stage::clamped(stage)));
        }
        let stages: Vec<u8> = store.read().history.iter().map(|e| e.stage.get()).collect();
        assert_eq!(stages, vec![3, 4, 5]);
    }

    #[test]
    fn failed_persist_still_returns_merged_record() {
        let storage = MemoryStorage::new();
        let store = store(&storage, 10);
        storage.set_failing(true);
        let record = store.write(ProgressPatch::stage(Stage::LINKED));
        assert_eq!(record.stage, Stage::LINKED);
        storage.set_failing(false);
        assert_eq!(store.read().stage, Stage::NOT_STARTED);
    }

    #[test]
    fn granting_capabilities_leaves_history_alone() {
        let storage = MemoryStorage::new();
        let store = store(&storage, 10);
        store.write(ProgressPatch::stage(Stage::LINK_GENERATED));
        let mut granted = Capabilities::new();
        granted.insert(CapabilityAction::Finalize, "v1.tok".to_string());
        let record = store.grant_capabilities(&granted);
        assert_eq!(record.history.len(), 1);
        assert_eq!(
            store.read().capabilities.get(&CapabilityAction::Finalize),
            Some(&"v1.tok".to_string())
        );
    }

    #[test]
    fn window_lapse_rules() {
        let mut record = ProgressRecord::new(String::new());
        record.stage = Stage::LINK_GENERATED;
        assert!(record.window_lapsed(0), "waiting stage without a window");
        record.expires_at_ms = Some(1_000);
        assert!(!record.window_lapsed(1_000));
        assert!(record.window_lapsed(1_001));
        record.stage = Stage::LINKED;
        assert!(!record.window_lapsed(5_000));
    }
}

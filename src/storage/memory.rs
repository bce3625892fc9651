//! In-memory storage drive.
//!
//! The default drive for tests and storage-less assemblies. Range storages
//! keep messages ordered in a `BTreeMap`; snapshots are plain keyed maps.

use super::{
    snapshot_record_key, MessageStorage, SnapshotStorage, StorageDrive,
};
use crate::error::Result;
use crate::message::Message;
use crate::types::{CandleKind, DataKind, SecurityId, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// In-memory [`StorageDrive`].
#[derive(Default)]
pub struct MemoryDrive {
    storages: Mutex<HashMap<(Option<SecurityId>, DataKind), Arc<MemoryStorage>>>,
    snapshots: Mutex<HashMap<DataKind, Arc<MemorySnapshots>>>,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageDrive for MemoryDrive {
    fn storage(&self, security: Option<&SecurityId>, kind: &DataKind) -> Arc<dyn MessageStorage> {
        let key = (security.cloned(), *kind);
        self.storages
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(MemoryStorage::default()))
            .clone()
    }

    fn snapshot(&self, kind: &DataKind) -> Arc<dyn SnapshotStorage> {
        self.snapshots
            .lock()
            .entry(*kind)
            .or_insert_with(|| Arc::new(MemorySnapshots::default()))
            .clone()
    }

    fn candle_kinds(&self, security: &SecurityId) -> Vec<CandleKind> {
        self.storages
            .lock()
            .iter()
            .filter_map(|((sec, kind), storage)| match kind {
                DataKind::Candles(candle_kind)
                    if sec.as_ref() == Some(security) && !storage.is_empty() =>
                {
                    Some(*candle_kind)
                }
                _ => None,
            })
            .collect()
    }
}

/// Ordered in-memory range storage.
#[derive(Default)]
struct MemoryStorage {
    /// Keyed by (server time, insertion counter) so equal timestamps keep
    /// arrival order.
    records: RwLock<BTreeMap<(Timestamp, u64), Message>>,
    next_seq: Mutex<u64>,
}

impl MemoryStorage {
    fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl MessageStorage for MemoryStorage {
    fn save(&self, messages: &[Message]) -> Result<()> {
        let mut records = self.records.write();
        let mut seq = self.next_seq.lock();
        for message in messages {
            let time = message.server_time().unwrap_or_default();
            records.insert((time, *seq), message.clone());
            *seq += 1;
        }
        Ok(())
    }

    fn load(&self, from: Timestamp, to: Timestamp) -> Result<Vec<Message>> {
        if from > to {
            return Ok(Vec::new());
        }
        let records = self.records.read();
        Ok(records
            .range((from, 0)..(to, 0))
            .map(|(_, message)| message.clone())
            .collect())
    }

    fn dates(&self) -> Result<Option<(Timestamp, Timestamp)>> {
        let records = self.records.read();
        let first = records.keys().next().map(|(time, _)| *time);
        let last = records.keys().next_back().map(|(time, _)| *time);
        Ok(first.zip(last))
    }
}

/// Keyed in-memory snapshots.
#[derive(Default)]
struct MemorySnapshots {
    records: RwLock<HashMap<String, Message>>,
}

impl SnapshotStorage for MemorySnapshots {
    fn get(&self, security: &SecurityId) -> Result<Option<Message>> {
        Ok(self.records.read().get(security.as_str()).cloned())
    }

    fn update(&self, message: &Message) -> Result<()> {
        if let Some(key) = snapshot_record_key(message) {
            self.records.write().insert(key, message.clone());
        }
        Ok(())
    }

    fn all(&self, from: Timestamp, to: Timestamp) -> Result<Vec<Message>> {
        let mut records: Vec<Message> = self
            .records
            .read()
            .values()
            .filter(|message| {
                message
                    .server_time()
                    .map(|time| from <= time && time < to)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        records.sort_by_key(|message| message.server_time().unwrap_or_default());
        Ok(records)
    }
}

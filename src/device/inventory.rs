use std::sync::{Arc, Mutex, PoisonError, RwLock};
use indexmap::IndexMap;
use log::debug;
use tokio::sync::watch;

use crate::device::types::{PeripheralId, PeripheralRecord};

type Entry = Arc<Mutex<PeripheralRecord>>;

/// The table of every peripheral seen since the last scan started.
///
/// Each record sits behind its own lock. The table lock is only held long enough to find or
/// insert an entry, so updates to different peripherals never wait on each other, while updates
/// to the same peripheral are applied one at a time.
pub struct Inventory {
    records: RwLock<IndexMap<PeripheralId, Entry>>,
    snapshots: watch::Sender<Vec<PeripheralRecord>>,
}

impl Default for Inventory {
    fn default() -> Self {
        Inventory::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Inventory {
            records: RwLock::new(IndexMap::new()),
            snapshots,
        }
    }

    pub fn clear(&self) {
        let mut removed = 0;
        // the table is cleared inside send_modify so that no publish can interleave
        self.snapshots.send_modify(|current| {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            removed = records.len();
            records.clear();
            current.clear();
        });
        debug!("Inventory cleared ({} records dropped)", removed);
    }

    /// Applies `mutator` to the record for `id`, creating a disconnected record first if there is
    /// none. Returns whatever the mutator returns.
    pub fn upsert<F, R>(&self, id: &PeripheralId, mutator: F) -> R
    where
        F: FnOnce(&mut PeripheralRecord) -> R,
    {
        let entry = self.entry_or_insert(id);
        let mut record = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let result = mutator(&mut record);
        self.publish(&entry, &record);
        result
    }

    /// Like [`upsert`](Self::upsert), but leaves the inventory alone when `id` is unknown.
    /// Returns `None` in that case.
    pub fn update<F, R>(&self, id: &PeripheralId, mutator: F) -> Option<R>
    where
        F: FnOnce(&mut PeripheralRecord) -> R,
    {
        let entry = self.find(id)?;
        let mut record = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let result = mutator(&mut record);
        self.publish(&entry, &record);
        Some(result)
    }

    pub fn get(&self, id: &PeripheralId) -> Option<PeripheralRecord> {
        self.find(id).map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.records.read().unwrap_or_else(PoisonError::into_inner).contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of all records. Callers must not rely on the order.
    pub fn snapshot(&self) -> Vec<PeripheralRecord> {
        let entries: Vec<Entry> = self.records.read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        entries.iter()
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    /// A receiver that always holds the snapshot taken after the latest change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PeripheralRecord>> {
        self.snapshots.subscribe()
    }

    fn find(&self, id: &PeripheralId) -> Option<Entry> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    fn entry_or_insert(&self, id: &PeripheralId) -> Entry {
        if let Some(entry) = self.find(id) {
            return entry;
        }

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PeripheralRecord::new(id.clone()))))
            .clone()
    }

    // Called with the entry lock held, so changes to one record reach subscribers in the order
    // they were made. Only the changed record is copied; no other entry lock is taken.
    fn publish(&self, entry: &Entry, record: &PeripheralRecord) {
        self.snapshots.send_if_modified(|current| {
            let position = current.iter().position(|published| published.id == record.id);

            // a record dropped by clear() must not come back through a late update
            let live = self.find(&record.id).map_or(false, |found| Arc::ptr_eq(&found, entry));
            match (live, position) {
                (true, Some(i)) => current[i] = record.clone(),
                (true, None) => current.push(record.clone()),
                (false, _) => return false,
            }
            true
        });
    }
}

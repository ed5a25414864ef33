//! Transaction journal and transactional cells.
//!
//! Every [`TCell`] carries a version that is bumped by each commit that
//! writes it. A transaction records, per touched cell, the version it first
//! observed and any pending write. Commit locks the touched cells in id
//! order, checks that no observed version moved, and publishes the writes;
//! otherwise the attempt is thrown away and re-run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::continuation::Callback;
use crate::value::AnyValue;

/// Wakes a fiber suspended on `retry`.
pub(crate) type Waiter = Callback<()>;

struct CellState {
    version: u64,
    value: AnyValue,
    waiters: BTreeMap<u64, Waiter>,
}

/// A versioned, type-erased transactional cell.
pub(crate) struct TCell {
    id: u64,
    state: Mutex<CellState>,
}

impl TCell {
    pub(crate) fn new(value: AnyValue) -> Arc<TCell> {
        static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(0);
        Arc::new(TCell {
            id: NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(CellState {
                version: 0,
                value,
                waiters: BTreeMap::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn load(&self) -> (u64, AnyValue) {
        let state = self.state.lock();
        (state.version, state.value.clone())
    }

    fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Register `waiter` under `key` unless the cell moved past `version`.
    /// False if it did.
    pub(crate) fn watch(&self, version: u64, key: u64, waiter: Waiter) -> bool {
        let mut state = self.state.lock();
        if state.version != version {
            return false;
        }
        state.waiters.insert(key, waiter);
        true
    }

    pub(crate) fn unwatch(&self, key: u64) {
        self.state.lock().waiters.remove(&key);
    }
}

impl fmt::Debug for TCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TCell")
            .field("id", &self.id)
            .field("version", &state.version)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

struct Entry {
    cell: Arc<TCell>,
    /// Version seen on first access.
    version: u64,
    /// Value at that version.
    observed: AnyValue,
    pending: Option<AnyValue>,
}

impl Entry {
    fn current(&self) -> &AnyValue {
        self.pending.as_ref().unwrap_or(&self.observed)
    }
}

/// Pending writes at some point of a transaction.
pub(crate) struct Checkpoint(BTreeMap<u64, Option<AnyValue>>);

/// The commit found a cell written by someone else since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Conflict;

/// Reads and pending writes of one transaction attempt.
#[derive(Default)]
pub(crate) struct Journal {
    entries: BTreeMap<u64, Entry>,
}

impl Journal {
    fn entry(&mut self, cell: &Arc<TCell>) -> &mut Entry {
        self.entries.entry(cell.id).or_insert_with(|| {
            let (version, observed) = cell.load();
            Entry {
                cell: cell.clone(),
                version,
                observed,
                pending: None,
            }
        })
    }

    /// The cell's value as this transaction sees it.
    pub(crate) fn read(&mut self, cell: &Arc<TCell>) -> AnyValue {
        self.entry(cell).current().clone()
    }

    pub(crate) fn write(&mut self, cell: &Arc<TCell>, value: AnyValue) {
        self.entry(cell).pending = Some(value);
    }

    /// Number of cells touched.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint(
            self.entries
                .iter()
                .map(|(id, entry)| (*id, entry.pending.clone()))
                .collect(),
        )
    }

    /// Undo the writes made since `checkpoint`. Reads are kept: the rest of
    /// the transaction still depends on them.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        let mut saved = checkpoint.0;
        for (id, entry) in self.entries.iter_mut() {
            entry.pending = saved.remove(id).flatten();
        }
    }

    /// Whether every observed version is still current.
    pub(crate) fn is_valid(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.cell.version() == entry.version)
    }

    /// Publish the pending writes atomically and hand back the fibers
    /// waiting on the written cells.
    pub(crate) fn commit(&self) -> Result<Vec<Waiter>, Conflict> {
        let mut locked = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            let state = entry.cell.state.lock();
            if state.version != entry.version {
                return Err(Conflict);
            }
            locked.push((entry, state));
        }
        let mut wake = Vec::new();
        for (entry, state) in locked.iter_mut() {
            if let Some(value) = &entry.pending {
                state.value = value.clone();
                state.version += 1;
                wake.extend(std::mem::take(&mut state.waiters).into_values());
            }
        }
        Ok(wake)
    }

    /// Cells read by this attempt with the versions observed.
    pub(crate) fn read_set(&self) -> Vec<(Arc<TCell>, u64)> {
        self.entries
            .values()
            .map(|entry| (entry.cell.clone(), entry.version))
            .collect()
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let written = self.entries.values().filter(|e| e.pending.is_some()).count();
        f.debug_struct("Journal")
            .field("touched", &self.entries.len())
            .field("written", &written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(cell: &Arc<TCell>, journal: &mut Journal) -> i32 {
        journal.read(cell).downcast::<i32>()
    }

    #[test]
    fn test_read_your_writes() {
        let cell = TCell::new(AnyValue::new(1i32));
        let mut journal = Journal::default();
        assert_eq!(int(&cell, &mut journal), 1);
        journal.write(&cell, AnyValue::new(2i32));
        assert_eq!(int(&cell, &mut journal), 2);
        assert_eq!(cell.load().1.downcast::<i32>(), 1);
    }

    #[test]
    fn test_commit_bumps_version() {
        let cell = TCell::new(AnyValue::new(1i32));
        let mut journal = Journal::default();
        journal.write(&cell, AnyValue::new(5i32));
        assert!(journal.commit().is_ok());
        let (version, value) = cell.load();
        assert_eq!(version, 1);
        assert_eq!(value.downcast::<i32>(), 5);
    }

    #[test]
    fn test_read_only_commit_keeps_version() {
        let cell = TCell::new(AnyValue::new(1i32));
        let mut journal = Journal::default();
        int(&cell, &mut journal);
        assert!(journal.commit().is_ok());
        assert_eq!(cell.version(), 0);
    }

    #[test]
    fn test_conflict_detected() {
        let cell = TCell::new(AnyValue::new(0i32));
        let mut slow = Journal::default();
        let seen = int(&cell, &mut slow);
        slow.write(&cell, AnyValue::new(seen + 1));

        let mut fast = Journal::default();
        fast.write(&cell, AnyValue::new(10i32));
        assert!(fast.commit().is_ok());

        assert!(!slow.is_valid());
        assert_eq!(slow.commit().err(), Some(Conflict));
        assert_eq!(cell.load().1.downcast::<i32>(), 10);
    }

    #[test]
    fn test_rollback_keeps_reads() {
        let a = TCell::new(AnyValue::new(1i32));
        let b = TCell::new(AnyValue::new(2i32));
        let mut journal = Journal::default();
        journal.write(&a, AnyValue::new(10i32));
        let checkpoint = journal.checkpoint();
        journal.write(&a, AnyValue::new(20i32));
        journal.write(&b, AnyValue::new(30i32));
        journal.rollback(checkpoint);
        assert_eq!(int(&a, &mut journal), 10);
        assert_eq!(int(&b, &mut journal), 2);
        assert_eq!(journal.len(), 2);
    }
}

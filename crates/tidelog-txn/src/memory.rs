//! In-memory log manager and record store.
//!
//! Used by tests and by hosts that want a transaction core without a disk.
//! Both carry fault-injection switches so failure paths can be driven
//! deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tidelog_error::{Result, TideError};
use tidelog_types::{
    DatabaseId, LOG_VERSION_CURRENT, LnLogEntry, LogEntry, Lsn, TxnEnd, TxnEndKind,
};
use tracing::trace;

use crate::env::{
    DatabaseOp, DeletedSlot, LogManager, LogParams, ObsoleteCounting, RecordStore, UndoRecord,
};
use crate::lock_type::LockType;
use crate::locker::Locker;
use crate::txn::{Change, Txn};

// ---------------------------------------------------------------------------
// MemoryLogManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum StoredRecord {
    Ln(LnLogEntry),
    /// End records are kept in their encoded form so reads exercise the
    /// versioned decoder.
    TxnEnd { kind: TxnEndKind, bytes: Vec<u8> },
}

#[derive(Debug, Default)]
struct LogInner {
    records: Vec<StoredRecord>,
    durable: u64,
    obsolete: Vec<(Lsn, ObsoleteCounting)>,
}

/// Append-only log held in a vector; position `n` is the `n`-th record.
#[derive(Debug)]
pub struct MemoryLogManager {
    inner: Mutex<LogInner>,
    log_version: u32,
    fsyncs: AtomicU64,
    fail_data: AtomicBool,
    fail_commit: AtomicBool,
    fail_abort: AtomicBool,
    fail_flush: AtomicBool,
}

impl Default for MemoryLogManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_log_version(LOG_VERSION_CURRENT)
    }

    /// Write end records using an older layout.
    #[must_use]
    pub fn with_log_version(log_version: u32) -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
            log_version,
            fsyncs: AtomicU64::new(0),
            fail_data: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            fail_abort: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
        }
    }

    pub fn set_fail_data(&self, fail: bool) {
        self.fail_data.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_abort(&self, fail: bool) {
        self.fail_abort.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Physical fsyncs performed so far.
    #[must_use]
    pub fn fsync_count(&self) -> u64 {
        self.fsyncs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn durable_lsn(&self) -> Option<Lsn> {
        Lsn::new(self.inner.lock().durable)
    }

    /// Every obsolete-version notification, in call order.
    #[must_use]
    pub fn obsolete_counts(&self) -> Vec<(Lsn, ObsoleteCounting)> {
        self.inner.lock().obsolete.clone()
    }

    /// All end records, decoded.
    pub fn txn_ends(&self) -> Result<Vec<TxnEnd>> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .filter_map(|r| match r {
                StoredRecord::TxnEnd { kind, bytes } => {
                    Some(TxnEnd::decode(*kind, bytes, self.log_version))
                }
                StoredRecord::Ln(_) => None,
            })
            .collect()
    }

    /// All data records, in log order.
    #[must_use]
    pub fn data_entries(&self) -> Vec<LnLogEntry> {
        self.inner
            .lock()
            .records
            .iter()
            .filter_map(|r| match r {
                StoredRecord::Ln(ln) => Some(ln.clone()),
                StoredRecord::TxnEnd { .. } => None,
            })
            .collect()
    }

    fn check_injected(&self, entry: &LogEntry) -> Result<()> {
        let (switch, what) = match entry {
            LogEntry::Ln(_) => (&self.fail_data, "data"),
            LogEntry::TxnEnd(end) => match end.kind {
                TxnEndKind::Commit => (&self.fail_commit, "commit"),
                TxnEndKind::Abort => (&self.fail_abort, "abort"),
            },
        };
        if switch.load(Ordering::SeqCst) {
            return Err(TideError::log_write(format!("injected {what} record failure")));
        }
        Ok(())
    }
}

impl LogManager for MemoryLogManager {
    fn log(&self, entry: LogEntry, params: &LogParams) -> Result<Lsn> {
        self.check_injected(&entry)?;
        let mut inner = self.inner.lock();
        let stored = match entry {
            LogEntry::Ln(ln) => StoredRecord::Ln(ln),
            LogEntry::TxnEnd(end) => StoredRecord::TxnEnd {
                kind: end.kind,
                bytes: end.encode(self.log_version),
            },
        };
        inner.records.push(stored);
        let raw = inner.records.len() as u64;
        let lsn = Lsn::new(raw).ok_or_else(|| TideError::internal("log position overflow"))?;
        for obsolete in &params.obsolete {
            inner.obsolete.push((*obsolete, ObsoleteCounting::Exact));
        }
        if params.sync.requires_fsync() {
            inner.durable = raw;
            self.fsyncs.fetch_add(1, Ordering::SeqCst);
        }
        trace!(target: "tidelog_txn::memory", %lsn, sync = %params.sync, "appended");
        Ok(lsn)
    }

    fn read_entry(&self, lsn: Lsn) -> Result<LogEntry> {
        let inner = self.inner.lock();
        let idx = usize::try_from(lsn.get() - 1)
            .map_err(|_| TideError::malformed(format!("position {lsn} out of range")))?;
        match inner.records.get(idx) {
            Some(StoredRecord::Ln(ln)) => Ok(LogEntry::Ln(ln.clone())),
            Some(StoredRecord::TxnEnd { kind, bytes }) => {
                TxnEnd::decode(*kind, bytes, self.log_version).map(LogEntry::TxnEnd)
            }
            None => Err(TideError::malformed(format!("no record at {lsn}"))),
        }
    }

    fn flush_sync(&self) -> Result<Option<Lsn>> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(TideError::log_write("injected fsync failure"));
        }
        let mut inner = self.inner.lock();
        inner.durable = inner.records.len() as u64;
        self.fsyncs.fetch_add(1, Ordering::SeqCst);
        Ok(Lsn::new(inner.durable))
    }

    fn count_obsolete_node(&self, lsn: Lsn, counting: ObsoleteCounting) {
        self.inner.lock().obsolete.push((lsn, counting));
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

type SlotKey = (DatabaseId, Vec<u8>);

#[derive(Debug, Default)]
struct StoreInner {
    /// Slot -> position of its current version.
    slots: BTreeMap<SlotKey, Lsn>,
    /// Every installed version; `None` is a deletion marker.
    versions: HashMap<Lsn, Option<Vec<u8>>>,
    undone: Vec<UndoRecord>,
    finished: Vec<(DatabaseOp, bool)>,
    reclaim: Vec<DeletedSlot>,
}

impl StoreInner {
    /// Current version position and whether it is a deletion marker.
    fn current(&self, db: DatabaseId, key: &[u8]) -> Option<(Lsn, bool)> {
        let lsn = *self.slots.get(&(db, key.to_vec()))?;
        let deleted = self.versions.get(&lsn).is_none_or(Option::is_none);
        Some((lsn, deleted))
    }
}

/// Slot map keyed by `(database, key)`, versioned by log position.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<StoreInner>,
    fail_undo: AtomicBool,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_undo(&self, fail: bool) {
        self.fail_undo.store(fail, Ordering::SeqCst);
    }

    /// Committed-or-not current value, ignoring locks.
    #[must_use]
    pub fn get(&self, db: DatabaseId, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let lsn = inner.slots.get(&(db, key.to_vec()))?;
        inner.versions.get(lsn).cloned().flatten()
    }

    /// Position of the slot's current version, deletion markers included.
    #[must_use]
    pub fn slot_lsn(&self, db: DatabaseId, key: &[u8]) -> Option<Lsn> {
        self.inner.lock().slots.get(&(db, key.to_vec())).copied()
    }

    /// Install a version directly, bypassing transactions. For loading
    /// fixtures whose records already exist in the log.
    pub fn install(&self, db: DatabaseId, key: &[u8], lsn: Lsn, data: Option<Vec<u8>>) {
        let mut inner = self.inner.lock();
        inner.versions.insert(lsn, data);
        inner.slots.insert((db, key.to_vec()), lsn);
    }

    /// Write (or delete, with `data == None`) `key` inside `txn`.
    ///
    /// Write-locks the current version first and retries if the slot moved
    /// while the lock was being waited for.
    pub fn write(
        &self,
        txn: &Txn,
        db: DatabaseId,
        key: &[u8],
        data: Option<&[u8]>,
    ) -> Result<Lsn> {
        loop {
            let current = self.inner.lock().current(db, key);
            if let Some((lsn, _)) = current {
                txn.lock(lsn, LockType::Write, false, Some(db))?;
            }

            let mut inner = self.inner.lock();
            if inner.current(db, key) != current {
                continue;
            }
            let data = data.map(<[u8]>::to_vec);
            let new_lsn = txn.log_change(Change {
                db,
                key: key.to_vec(),
                data: data.clone(),
                prior: current.map(|(lsn, _)| lsn),
                prior_known_deleted: current.is_some_and(|(_, deleted)| deleted),
            })?;
            inner.versions.insert(new_lsn, data);
            inner.slots.insert((db, key.to_vec()), new_lsn);
            return Ok(new_lsn);
        }
    }

    /// Read-lock and read `key` inside `txn`.
    pub fn read(&self, txn: &Txn, db: DatabaseId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(lsn) = self.slot_lsn(db, key) else {
            return Ok(None);
        };
        txn.lock(lsn, LockType::Read, false, Some(db))?;
        Ok(self.get(db, key))
    }

    #[must_use]
    pub fn undone(&self) -> Vec<UndoRecord> {
        self.inner.lock().undone.clone()
    }

    #[must_use]
    pub fn finished_ops(&self) -> Vec<(DatabaseOp, bool)> {
        self.inner.lock().finished.clone()
    }

    #[must_use]
    pub fn reclaim_queue(&self) -> Vec<DeletedSlot> {
        self.inner.lock().reclaim.clone()
    }
}

impl RecordStore for MemoryRecordStore {
    fn undo(&self, record: &UndoRecord) -> Result<()> {
        if self.fail_undo.load(Ordering::SeqCst) {
            return Err(TideError::Io(std::io::Error::other("injected undo failure")));
        }
        let mut inner = self.inner.lock();
        let slot = (record.db, record.key.clone());
        match record.abort_lsn {
            Some(abort_lsn) if !record.abort_known_deleted => {
                if !inner.versions.contains_key(&abort_lsn) {
                    return Err(TideError::malformed(format!(
                        "undo of {} restores unknown version {abort_lsn}",
                        record.lsn
                    )));
                }
                inner.slots.insert(slot, abort_lsn);
            }
            Some(abort_lsn) => {
                inner.slots.insert(slot, abort_lsn);
            }
            None => {
                inner.slots.remove(&slot);
            }
        }
        inner.undone.push(record.clone());
        Ok(())
    }

    fn finish_database_ops(&self, ops: &[DatabaseOp], committed: bool) -> Result<()> {
        self.inner
            .lock()
            .finished
            .extend(ops.iter().cloned().map(|op| (op, committed)));
        Ok(())
    }

    fn queue_deleted_slots(&self, slots: Vec<DeletedSlot>) {
        self.inner.lock().reclaim.extend(slots);
    }
}

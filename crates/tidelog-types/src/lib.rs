pub mod durability;
pub mod log_entry;
pub mod varint;

pub use durability::{Durability, ReplicaAckPolicy, SyncPolicy};
pub use log_entry::{
    LOG_VERSION_BASE, LOG_VERSION_CURRENT, LOG_VERSION_DTVLSN, LOG_VERSION_MASTER_TERM,
    LnLogEntry, LogEntry, TxnEnd, TxnEndKind,
};

use std::fmt;
use std::num::{NonZeroI64, NonZeroU64};

/// A position in the write-ahead log.
///
/// Log positions are strictly positive; "no position" is expressed as
/// `Option<Lsn>`, which keeps the same size as a raw `u64`. An `Lsn` is also the
/// resource identifier a record lock is taken on: it names the record's current
/// location in the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Lsn(NonZeroU64);

impl Lsn {
    /// The first position a log manager hands out.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Create a log position from a raw value. Returns `None` for 0.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Raw value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Encode an optional position, mapping "none" to 0.
    #[inline]
    pub const fn raw_or_null(lsn: Option<Self>) -> u64 {
        match lsn {
            Some(l) => l.get(),
            None => 0,
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Transaction (and locker) identifier.
///
/// Locally originated lockers draw positive ids; transactions replayed from a
/// replication stream carry negative ids. The two spaces never overlap, so
/// both kinds share one registry and one lock table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(NonZeroI64);

impl TxnId {
    /// Create a transaction id. Returns `None` for 0.
    #[inline]
    pub const fn new(raw: i64) -> Option<Self> {
        match NonZeroI64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Raw value.
    #[inline]
    pub const fn get(self) -> i64 {
        self.0.get()
    }

    /// Whether this id came from the replicated (negative) sequence.
    #[inline]
    pub const fn is_replicated(self) -> bool {
        self.0.get() < 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock owners are identified by the same id space as transactions.
pub type LockerId = TxnId;

/// Replication stream sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Vlsn(i64);

impl Vlsn {
    /// No sequence number at all.
    pub const NULL: Self = Self(-1);
    /// Sequence not yet known (older records, non-replicated environments).
    pub const UNINITIALIZED: Self = Self(0);

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }
}

impl Default for Vlsn {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl fmt::Display for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Election term of the primary that wrote a record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct MasterTerm(i64);

impl MasterTerm {
    /// Term unknown or not recorded.
    pub const NULL: Self = Self(i64::MIN);

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == i64::MIN
    }
}

impl Default for MasterTerm {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for MasterTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifier of a database (a named record container) within an environment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct DatabaseId(pub u64);

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_rejects_zero() {
        assert!(Lsn::new(0).is_none());
        assert_eq!(Lsn::new(7).map(Lsn::get), Some(7));
        assert_eq!(Lsn::raw_or_null(None), 0);
        assert_eq!(Lsn::raw_or_null(Lsn::new(12)), 12);
        assert_eq!(std::mem::size_of::<Option<Lsn>>(), 8);
    }

    #[test]
    fn lsn_display_is_hex() {
        assert_eq!(Lsn::new(255).unwrap().to_string(), "0xff");
    }

    #[test]
    fn txn_id_sign_marks_replication() {
        let local = TxnId::new(5).unwrap();
        let replicated = TxnId::new(-5).unwrap();
        assert!(!local.is_replicated());
        assert!(replicated.is_replicated());
        assert_ne!(local, replicated);
        assert!(TxnId::new(0).is_none());
    }

    #[test]
    fn sentinels() {
        assert!(Vlsn::NULL.is_null());
        assert!(!Vlsn::UNINITIALIZED.is_null());
        assert_eq!(Vlsn::default(), Vlsn::UNINITIALIZED);
        assert!(MasterTerm::default().is_null());
        assert_eq!(MasterTerm::NULL.to_string(), "null");
        assert_eq!(MasterTerm::new(3).to_string(), "3");
    }
}

//! Log record shapes produced by the transaction core.
//!
//! Only the transaction-end record has a persisted layout owned by this crate;
//! data records are handed to the log manager as structured values.
//!
//! ## Transaction-end layout
//!
//! ```text
//! txn_id        signed varint
//! timestamp_ms  varint
//! last_lsn      varint (0 = none)
//! master_id     signed varint
//! dtvlsn        signed varint   (version >= LOG_VERSION_DTVLSN)
//! master_term   signed varint   (version >= LOG_VERSION_MASTER_TERM)
//! ```

use tidelog_error::{Result, TideError};

use crate::varint::{get_signed, get_varint, put_signed, put_varint};
use crate::{DatabaseId, Lsn, MasterTerm, TxnId, Vlsn};

/// First layout: id, timestamp, chain pointer, master id.
pub const LOG_VERSION_BASE: u32 = 1;
/// Adds the durable-VLSN watermark.
pub const LOG_VERSION_DTVLSN: u32 = 2;
/// Adds the master term.
pub const LOG_VERSION_MASTER_TERM: u32 = 3;
/// Layout written by this build.
pub const LOG_VERSION_CURRENT: u32 = LOG_VERSION_MASTER_TERM;

/// Which way a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxnEndKind {
    Commit,
    Abort,
}

impl TxnEndKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "TxnCommit",
            Self::Abort => "TxnAbort",
        }
    }
}

/// "This transaction ended here."
///
/// Built once per commit or abort of a transaction that logged entries and
/// never mutated after it is handed to the log manager.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxnEnd {
    pub kind: TxnEndKind,
    pub txn_id: TxnId,
    pub timestamp_ms: u64,
    /// Last entry of the transaction's backward chain.
    pub last_lsn: Option<Lsn>,
    /// Replication node that wrote the record, 0 when not replicated.
    pub master_id: i32,
    pub dtvlsn: Vlsn,
    pub master_term: MasterTerm,
}

impl TxnEnd {
    /// A record with replication metadata left at its "unknown" defaults.
    #[must_use]
    pub const fn new(
        kind: TxnEndKind,
        txn_id: TxnId,
        timestamp_ms: u64,
        last_lsn: Option<Lsn>,
    ) -> Self {
        Self {
            kind,
            txn_id,
            timestamp_ms,
            last_lsn,
            master_id: 0,
            dtvlsn: Vlsn::UNINITIALIZED,
            master_term: MasterTerm::NULL,
        }
    }

    /// Serialize using the layout of `version`.
    ///
    /// Fields newer than `version` are dropped.
    #[must_use]
    pub fn encode(&self, version: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        put_signed(&mut out, self.txn_id.get());
        put_varint(&mut out, self.timestamp_ms);
        put_varint(&mut out, Lsn::raw_or_null(self.last_lsn));
        put_signed(&mut out, i64::from(self.master_id));
        if version >= LOG_VERSION_DTVLSN {
            put_signed(&mut out, self.dtvlsn.get());
        }
        if version >= LOG_VERSION_MASTER_TERM {
            put_signed(&mut out, self.master_term.get());
        }
        out
    }

    /// Parse a record written with the layout of `version`.
    ///
    /// Fields absent from older layouts come back as `Vlsn::UNINITIALIZED`
    /// and `MasterTerm::NULL`.
    pub fn decode(kind: TxnEndKind, buf: &[u8], version: u32) -> Result<Self> {
        if !(LOG_VERSION_BASE..=LOG_VERSION_CURRENT).contains(&version) {
            return Err(TideError::malformed(format!(
                "{} log version {version} is not readable (supported {LOG_VERSION_BASE}..={LOG_VERSION_CURRENT})",
                kind.as_str()
            )));
        }
        let truncated =
            |field: &str| TideError::malformed(format!("{} truncated at {field}", kind.as_str()));

        let mut pos = 0;
        let raw_id = get_signed(buf, &mut pos).ok_or_else(|| truncated("txn_id"))?;
        let txn_id = TxnId::new(raw_id)
            .ok_or_else(|| TideError::malformed(format!("{} has txn_id 0", kind.as_str())))?;
        let timestamp_ms = get_varint(buf, &mut pos).ok_or_else(|| truncated("timestamp"))?;
        let last_lsn = Lsn::new(get_varint(buf, &mut pos).ok_or_else(|| truncated("last_lsn"))?);
        let raw_master = get_signed(buf, &mut pos).ok_or_else(|| truncated("master_id"))?;
        let master_id = i32::try_from(raw_master).map_err(|_| {
            TideError::malformed(format!("{} master_id {raw_master} out of range", kind.as_str()))
        })?;

        let dtvlsn = if version >= LOG_VERSION_DTVLSN {
            Vlsn::new(get_signed(buf, &mut pos).ok_or_else(|| truncated("dtvlsn"))?)
        } else {
            Vlsn::UNINITIALIZED
        };
        let master_term = if version >= LOG_VERSION_MASTER_TERM {
            MasterTerm::new(get_signed(buf, &mut pos).ok_or_else(|| truncated("master_term"))?)
        } else {
            MasterTerm::NULL
        };

        if pos != buf.len() {
            return Err(TideError::malformed(format!(
                "{} has {} trailing bytes",
                kind.as_str(),
                buf.len() - pos
            )));
        }

        Ok(Self {
            kind,
            txn_id,
            timestamp_ms,
            last_lsn,
            master_id,
            dtvlsn,
            master_term,
        })
    }
}

/// A transactional data record: one change to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LnLogEntry {
    pub txn_id: TxnId,
    /// Previous entry in this transaction's chain.
    pub prev_lsn: Option<Lsn>,
    pub db: DatabaseId,
    pub key: Vec<u8>,
    /// New value, `None` for a deletion.
    pub data: Option<Vec<u8>>,
    /// Version this change supersedes, restored on undo.
    pub abort_lsn: Option<Lsn>,
    /// The superseded version was itself a deletion.
    pub abort_known_deleted: bool,
}

impl LnLogEntry {
    #[must_use]
    pub const fn is_deletion(&self) -> bool {
        self.data.is_none()
    }
}

/// Anything the transaction core appends to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Ln(LnLogEntry),
    TxnEnd(TxnEnd),
}

impl LogEntry {
    #[must_use]
    pub const fn txn_id(&self) -> TxnId {
        match self {
            Self::Ln(ln) => ln.txn_id,
            Self::TxnEnd(end) => end.txn_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn full_record() -> TxnEnd {
        TxnEnd {
            kind: TxnEndKind::Commit,
            txn_id: TxnId::new(-77).unwrap(),
            timestamp_ms: 1_700_000_000_123,
            last_lsn: Lsn::new(0x1_0000_2000),
            master_id: 3,
            dtvlsn: Vlsn::new(981),
            master_term: MasterTerm::new(12),
        }
    }

    #[test]
    fn current_version_reads_back_every_field() {
        let rec = full_record();
        let bytes = rec.encode(LOG_VERSION_CURRENT);
        let back = TxnEnd::decode(TxnEndKind::Commit, &bytes, LOG_VERSION_CURRENT).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn base_version_defaults_replication_fields() {
        let rec = full_record();
        let bytes = rec.encode(LOG_VERSION_BASE);
        let back = TxnEnd::decode(TxnEndKind::Commit, &bytes, LOG_VERSION_BASE).unwrap();
        assert_eq!(back.txn_id, rec.txn_id);
        assert_eq!(back.last_lsn, rec.last_lsn);
        assert_eq!(back.master_id, 3);
        assert_eq!(back.dtvlsn, Vlsn::UNINITIALIZED);
        assert_eq!(back.master_term, MasterTerm::NULL);
    }

    #[test]
    fn dtvlsn_version_keeps_vlsn_but_not_term() {
        let rec = full_record();
        let bytes = rec.encode(LOG_VERSION_DTVLSN);
        let back = TxnEnd::decode(TxnEndKind::Abort, &bytes, LOG_VERSION_DTVLSN).unwrap();
        assert_eq!(back.kind, TxnEndKind::Abort);
        assert_eq!(back.dtvlsn, Vlsn::new(981));
        assert!(back.master_term.is_null());
    }

    #[test]
    fn null_chain_pointer_encodes_as_zero() {
        let rec = TxnEnd::new(TxnEndKind::Abort, TxnId::new(1).unwrap(), 0, None);
        let bytes = rec.encode(LOG_VERSION_BASE);
        assert_eq!(bytes, vec![2, 0, 0, 0]);
        let back = TxnEnd::decode(TxnEndKind::Abort, &bytes, LOG_VERSION_BASE).unwrap();
        assert_eq!(back.last_lsn, None);
    }

    #[test]
    fn truncated_record_is_malformed() {
        let bytes = full_record().encode(LOG_VERSION_CURRENT);
        let err = TxnEnd::decode(TxnEndKind::Commit, &bytes[..bytes.len() - 1], LOG_VERSION_CURRENT)
            .unwrap_err();
        assert!(matches!(err, TideError::MalformedRecord { .. }));
        assert!(err.to_string().contains("master_term"));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut bytes = full_record().encode(LOG_VERSION_BASE);
        bytes.push(0);
        let err = TxnEnd::decode(TxnEndKind::Commit, &bytes, LOG_VERSION_BASE).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes = full_record().encode(LOG_VERSION_CURRENT);
        assert!(TxnEnd::decode(TxnEndKind::Commit, &bytes, 0).is_err());
        assert!(TxnEnd::decode(TxnEndKind::Commit, &bytes, LOG_VERSION_CURRENT + 1).is_err());
    }

    #[test]
    fn json_shape_is_stable() {
        let rec = TxnEnd::new(TxnEndKind::Commit, TxnId::new(9).unwrap(), 5, Lsn::new(40));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["kind"], "Commit");
        assert_eq!(json["txn_id"], 9);
        assert_eq!(json["last_lsn"], 40);
        let back: TxnEnd = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }

    proptest! {
        #[test]
        fn decode_of_older_layout_matches_prefix(
            id in any::<i64>().prop_filter("nonzero", |v| *v != 0),
            ts in any::<u64>(),
            last in any::<u64>(),
            master in any::<i32>(),
            vlsn in any::<i64>(),
            term in any::<i64>(),
            version in LOG_VERSION_BASE..=LOG_VERSION_CURRENT,
        ) {
            let rec = TxnEnd {
                kind: TxnEndKind::Commit,
                txn_id: TxnId::new(id).unwrap(),
                timestamp_ms: ts,
                last_lsn: Lsn::new(last),
                master_id: master,
                dtvlsn: Vlsn::new(vlsn),
                master_term: MasterTerm::new(term),
            };
            let back = TxnEnd::decode(TxnEndKind::Commit, &rec.encode(version), version).unwrap();
            prop_assert_eq!(back.txn_id, rec.txn_id);
            prop_assert_eq!(back.timestamp_ms, ts);
            prop_assert_eq!(back.last_lsn, rec.last_lsn);
            prop_assert_eq!(back.master_id, master);
            if version >= LOG_VERSION_DTVLSN {
                prop_assert_eq!(back.dtvlsn, rec.dtvlsn);
            } else {
                prop_assert_eq!(back.dtvlsn, Vlsn::UNINITIALIZED);
            }
            if version >= LOG_VERSION_MASTER_TERM {
                prop_assert_eq!(back.master_term, rec.master_term);
            } else {
                prop_assert_eq!(back.master_term, MasterTerm::NULL);
            }
        }
    }
}

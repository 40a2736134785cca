//! Lock modes and their conflict / upgrade matrices.
//!
//! Both matrices are 2x2 over the indices READ=0 and WRITE=1. WRITE_RMW shares
//! WRITE's index; NONE is outside both matrices and never conflicts or
//! upgrades.

use std::fmt;

use tidelog_error::{Result, TideError};

/// Requested or held lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Read,
    Write,
    /// Write lock taken by a read-modify-write cursor. Behaves like WRITE for
    /// locking; differs only in obsolete-version accounting at commit.
    WriteRmw,
    /// Dirty read; nothing is locked.
    None,
}

/// Outcome of a conflict lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockConflict {
    Allow,
    Block,
}

/// Outcome of an upgrade lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockUpgrade {
    /// The held lock already covers the request.
    Existing,
    /// The held lock must be promoted to its write form.
    Promote,
    /// Not produced by the matrix; reaching it is a programming error.
    Illegal,
}

const READ: usize = 0;
const WRITE: usize = 1;

/// `CONFLICT[held][requested]`.
const CONFLICT: [[LockConflict; 2]; 2] = [
    [LockConflict::Allow, LockConflict::Block],
    [LockConflict::Block, LockConflict::Block],
];

/// `UPGRADE[held][requested]`.
const UPGRADE: [[LockUpgrade; 2]; 2] = [
    [LockUpgrade::Existing, LockUpgrade::Promote],
    [LockUpgrade::Existing, LockUpgrade::Existing],
];

impl LockType {
    pub const ALL: [Self; 4] = [Self::Read, Self::Write, Self::WriteRmw, Self::None];

    #[inline]
    pub const fn is_write_lock(self) -> bool {
        matches!(self, Self::Write | Self::WriteRmw)
    }

    #[inline]
    pub const fn is_rmw(self) -> bool {
        matches!(self, Self::WriteRmw)
    }

    /// Matrix index, `None` for NONE.
    #[inline]
    const fn index(self) -> Option<usize> {
        match self {
            Self::Read => Some(READ),
            Self::Write | Self::WriteRmw => Some(WRITE),
            Self::None => None,
        }
    }

    /// Whether a lock of this type, held by someone else, blocks `requested`.
    #[inline]
    pub const fn conflicts_with(self, requested: Self) -> LockConflict {
        conflict(self, requested)
    }

    /// Whether this held type satisfies a request for `requested` without any
    /// change.
    #[inline]
    pub const fn covers(self, requested: Self) -> bool {
        matches!(upgrade(self, requested), LockUpgrade::Existing)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::WriteRmw => "WRITE_RMW",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict lookup: does `held` (owned by another locker) block `requested`?
pub const fn conflict(held: LockType, requested: LockType) -> LockConflict {
    match (held.index(), requested.index()) {
        (Some(h), Some(r)) => CONFLICT[h][r],
        _ => LockConflict::Allow,
    }
}

/// Upgrade lookup for a locker that already holds `held` and asks for
/// `requested`.
pub const fn upgrade(held: LockType, requested: LockType) -> LockUpgrade {
    match (held.index(), requested.index()) {
        (Some(h), Some(r)) => UPGRADE[h][r],
        _ => LockUpgrade::Existing,
    }
}

/// [`upgrade`], with ILLEGAL surfaced as an internal error.
pub fn upgrade_for(held: LockType, requested: LockType) -> Result<LockUpgrade> {
    let up = upgrade(held, requested);
    if up == LockUpgrade::Illegal {
        return Err(TideError::internal(format!(
            "illegal lock upgrade {held} -> {requested}"
        )));
    }
    Ok(up)
}

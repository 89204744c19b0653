//! Identity types for Chrona
//!
//! All identifiers are 64-bit. Variable ids define the global lock order:
//! multi-variable commits always lock in ascending `VarId` order.

use std::fmt;

use serde::Serialize;

/// Variable identity - stable for the lifetime of a runtime
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct VarId(pub u64);

impl VarId {
    pub const ZERO: VarId = VarId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        VarId(id)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for VarId {
    #[inline]
    fn from(id: u64) -> Self {
        VarId(id)
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({})", self.0)
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Transaction identity - one per `begin`, retries get a fresh id
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxnId(pub u64);

impl TxnId {
    #[inline]
    pub fn new(id: u64) -> Self {
        TxnId(id)
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txn({})", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Commit identity - keys the idempotent ledger append of one commit
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitId(pub u64);

impl CommitId {
    #[inline]
    pub fn new(id: u64) -> Self {
        CommitId(id)
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commit({})", self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit-{}", self.0)
    }
}

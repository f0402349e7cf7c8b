//! Strongly-typed identifiers.
//!
//! A remote object is addressed by a plain 64-bit number, but passing raw
//! integers around invites mixing them up with sequence numbers or counts.
//! `RefId` keeps the identifier distinct at the type level.

use std::fmt;

/// Identifier of an object living on the remote side.
///
/// The value is allocated by whoever hands out references; a `RefId` only
/// carries it. Nothing here checks uniqueness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(pub u64);

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

impl From<u64> for RefId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<RefId> for serde_json::Value {
    fn from(id: RefId) -> Self {
        serde_json::Value::from(id.0)
    }
}

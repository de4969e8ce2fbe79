//! Queued mutation kinds and how they coalesce.
//!
//! The queue keeps at most one entry per record. When a record is mutated
//! again before its entry was pushed, the two mutations collapse into the
//! smallest single mutation with the same remote effect.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A mutation waiting to be pushed to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Outcome of coalescing a new mutation into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// Keep a single entry with this operation
    Keep(Operation),
    /// The mutations cancel out; remove the entry
    Drop,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Whether the operation carries a payload to push.
    pub fn has_payload(&self) -> bool {
        !matches!(self, Operation::Delete)
    }

    /// Collapse `self` (already queued) followed by `next`.
    pub fn coalesce(self, next: Operation) -> Coalesced {
        use Operation::*;
        match (self, next) {
            // Never reached the remote, still a create
            (Create, Create) | (Create, Update) => Coalesced::Keep(Create),
            (Create, Delete) => Coalesced::Drop,
            (Update, Create) | (Update, Update) => Coalesced::Keep(Update),
            (Update, Delete) => Coalesced::Keep(Delete),
            // The remote row still exists, so re-creating it is an update
            (Delete, Create) | (Delete, Update) => Coalesced::Keep(Update),
            (Delete, Delete) => Coalesced::Keep(Delete),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::InvalidPayload(format!("unknown operation: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_update_stays_create() {
        assert_eq!(
            Operation::Create.coalesce(Operation::Update),
            Coalesced::Keep(Operation::Create)
        );
    }

    #[test]
    fn update_then_delete_is_delete() {
        assert_eq!(
            Operation::Update.coalesce(Operation::Delete),
            Coalesced::Keep(Operation::Delete)
        );
    }

    #[test]
    fn delete_then_create_is_update() {
        assert_eq!(
            Operation::Delete.coalesce(Operation::Create),
            Coalesced::Keep(Operation::Update)
        );
    }

    #[test]
    fn create_then_delete_cancels() {
        assert_eq!(Operation::Create.coalesce(Operation::Delete), Coalesced::Drop);
    }

    #[test]
    fn coalescing_table() {
        use Operation::*;
        let table = [
            (Create, Create, Coalesced::Keep(Create)),
            (Create, Update, Coalesced::Keep(Create)),
            (Create, Delete, Coalesced::Drop),
            (Update, Create, Coalesced::Keep(Update)),
            (Update, Update, Coalesced::Keep(Update)),
            (Update, Delete, Coalesced::Keep(Delete)),
            (Delete, Create, Coalesced::Keep(Update)),
            (Delete, Update, Coalesced::Keep(Update)),
            (Delete, Delete, Coalesced::Keep(Delete)),
        ];
        for (queued, next, expected) in table {
            assert_eq!(queued.coalesce(next), expected, "{queued} then {next}");
        }
    }

    #[test]
    fn string_roundtrip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("upsert".parse::<Operation>().is_err());
    }
}

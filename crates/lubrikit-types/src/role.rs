//! Stage roles and edge overflow policies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability a stage declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// Produces records from an external source. No inbound edges.
    Collector,
    /// Consumes and emits records.
    Processor,
    /// Consumes records and performs a terminal effect. No outbound edges.
    Sink,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Collector => "collector",
            Self::Processor => "processor",
            Self::Sink => "sink",
        };
        f.write_str(s)
    }
}

/// What an edge does when its queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the producer until space frees up.
    #[default]
    Block,
    /// Evict the oldest queued record to make room.
    DropOldest,
    /// Discard the incoming record.
    DropNewest,
}

impl OverflowPolicy {
    #[must_use]
    pub fn is_lossy(self) -> bool {
        !matches!(self, Self::Block)
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Block => "block",
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_serde() {
        for (policy, expected) in [
            (OverflowPolicy::Block, "\"block\""),
            (OverflowPolicy::DropOldest, "\"drop_oldest\""),
            (OverflowPolicy::DropNewest, "\"drop_newest\""),
        ] {
            assert_eq!(serde_json::to_string(&policy).unwrap(), expected);
        }
        assert!(!OverflowPolicy::Block.is_lossy());
        assert!(OverflowPolicy::DropNewest.is_lossy());
    }
}

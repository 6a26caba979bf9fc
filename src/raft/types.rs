use serde::{Deserialize, Serialize};

/// A single entry in the replicated log. Its index is implied by its
/// position in the log (1-based).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// Opaque command payload
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, data: Vec<u8>) -> Self {
        Self { term, data }
    }
}

/// A committed entry handed to the application, in log order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    pub index: LogIndex,
    pub entry: LogEntry,
}

/// Type alias for term numbers
pub type Term = u64;

/// Type alias for log indices
pub type LogIndex = u64;

/// Numeric node identifier, as listed in the cluster configuration
pub type NodeId = u64;

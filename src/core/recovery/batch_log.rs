use crate::core::error::{Error, Result};
use crate::core::pmem::PmemOffset;
use serde::{Deserialize, Serialize};

/// One possibly half-committed sorted element of a crashed batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedLogEntry {
    pub offset: PmemOffset,
}

/// Staged log of a batch write, replayed backwards on restart to undo
/// partially committed element operations before index rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWriteLog {
    sorted_entries: Vec<SortedLogEntry>,
}

impl BatchWriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sorted(&mut self, offset: PmemOffset) {
        self.sorted_entries.push(SortedLogEntry { offset });
    }

    pub fn sorted_entries(&self) -> &[SortedLogEntry] {
        &self.sorted_entries
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Internal(format!("failed to encode batch log: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Decode(format!("bad batch log: {}", e)))
    }
}

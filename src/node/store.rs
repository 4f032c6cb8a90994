//! The in-memory block store: `filename -> stripe -> { role, bytes }`.
//! Nothing here touches a socket and nothing is ever persisted.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::raid::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub role: Role,
    pub bytes: Bytes,
}

#[derive(Debug, Default)]
pub struct BlockStore {
    files: HashMap<String, BTreeMap<u64, StoredBlock>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite one block.
    pub fn upsert(&mut self, file: &str, stripe: u64, role: Role, bytes: Bytes) {
        self.files
            .entry(file.to_string())
            .or_default()
            .insert(stripe, StoredBlock { role, bytes });
    }

    pub fn get(&self, file: &str, stripe: u64) -> Option<&StoredBlock> {
        self.files.get(file)?.get(&stripe)
    }

    /// Drop everything, returning how many files went with it.
    pub fn wipe(&mut self) -> usize {
        let files = self.files.len();
        self.files.clear();
        files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn block_count(&self) -> usize {
        self.files.values().map(BTreeMap::len).sum()
    }
}

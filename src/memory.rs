// Copyright (C) 2013-2020 Blockstack PBC, a public benefit corporation
// Copyright (C) 2020 Stacks Open Internet Foundation
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! In-memory backing store, for tests and ephemeral forests.

use std::collections::HashMap;

use crate::db::{TrieDb, TrieMeta};
use crate::{CheckpointId, Error, Result};

struct MemoryTrie {
    meta: TrieMeta,
    records: HashMap<u32, Vec<u8>>,
}

/// A `TrieDb` held entirely in RAM.  "Atomic" commit is trivial here:
/// the whole trie is inserted under one map entry.
pub struct MemoryTrieDb {
    order: Vec<CheckpointId>,
    tries: HashMap<CheckpointId, (u32, MemoryTrie)>,
}

impl MemoryTrieDb {
    pub fn new() -> MemoryTrieDb {
        MemoryTrieDb {
            order: vec![],
            tries: HashMap::new(),
        }
    }
}

impl Default for MemoryTrieDb {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieDb for MemoryTrieDb {
    fn read(&self, checkpoint: &CheckpointId, offset: u32) -> Result<Vec<u8>> {
        let (_, trie) = self.tries.get(checkpoint).ok_or(Error::NotFound)?;
        trie.records.get(&offset).cloned().ok_or(Error::NotFound)
    }

    fn batch_write(
        &mut self,
        checkpoint: &CheckpointId,
        meta: &TrieMeta,
        records: &[(u32, Vec<u8>)],
    ) -> Result<u32> {
        if self.tries.contains_key(checkpoint) {
            return Err(Error::CheckpointExists(*checkpoint));
        }
        let index = self.order.len() as u32;
        let mut trie = MemoryTrie {
            meta: *meta,
            records: HashMap::with_capacity(records.len()),
        };
        for (offset, bytes) in records.iter() {
            trie.records.insert(*offset, bytes.clone());
        }
        self.order.push(*checkpoint);
        self.tries.insert(*checkpoint, (index, trie));
        Ok(index)
    }

    fn index_of(&self, checkpoint: &CheckpointId) -> Result<Option<u32>> {
        Ok(self.tries.get(checkpoint).map(|(index, _)| *index))
    }

    fn checkpoint_at(&self, index: u32) -> Result<Option<CheckpointId>> {
        Ok(self.order.get(index as usize).copied())
    }

    fn trie_meta(&self, checkpoint: &CheckpointId) -> Result<Option<TrieMeta>> {
        Ok(self.tries.get(checkpoint).map(|(_, trie)| trie.meta))
    }

    fn count_checkpoints(&self) -> Result<u32> {
        Ok(self.order.len() as u32)
    }
}

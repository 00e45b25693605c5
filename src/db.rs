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

//! Backing-store contract.
//!
//! The forest persists each committed trie as a set of `(offset, bytes)`
//! node records plus one metadata row, written atomically.  The store
//! also owns the mapping between 32-byte checkpoint ids and the compact
//! u32 indices that back-pointers embed.

use crate::{CheckpointId, Result, TrieHash};

/// Per-checkpoint metadata recorded at commit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrieMeta {
    /// Parent checkpoint, or the sentinel for the forest's genesis.
    pub parent: CheckpointId,
    /// Hash of the trie's root node.
    pub root_node_hash: TrieHash,
    /// Sealed root published for this checkpoint (root node hash folded
    /// with the parent lineage).
    pub sealed_hash: TrieHash,
}

/// An atomic, transactional byte store for committed tries.
///
/// Implementations map checkpoint ids to physical storage however they
/// like; the forest only ever speaks this record-level contract.
/// Committed records are immutable.
pub trait TrieDb: Sized {
    /// Read one raw node record.  `Error::NotFound` if the checkpoint or
    /// offset is absent.
    fn read(&self, checkpoint: &CheckpointId, offset: u32) -> Result<Vec<u8>>;

    /// Atomically persist a whole trie: all node records plus metadata
    /// become visible together, or not at all.  Assigns and returns the
    /// checkpoint's immutable store index.  `Error::CheckpointExists` if
    /// the checkpoint was already committed.
    fn batch_write(
        &mut self,
        checkpoint: &CheckpointId,
        meta: &TrieMeta,
        records: &[(u32, Vec<u8>)],
    ) -> Result<u32>;

    /// Store index of a committed checkpoint.
    fn index_of(&self, checkpoint: &CheckpointId) -> Result<Option<u32>>;

    /// Checkpoint id at a store index.  `None` signals a dangling
    /// back-pointer to the caller.
    fn checkpoint_at(&self, index: u32) -> Result<Option<CheckpointId>>;

    /// Metadata recorded when the checkpoint was committed.
    fn trie_meta(&self, checkpoint: &CheckpointId) -> Result<Option<TrieMeta>>;

    fn count_checkpoints(&self) -> Result<u32>;

    fn checkpoint_exists(&self, checkpoint: &CheckpointId) -> Result<bool> {
        Ok(self.index_of(checkpoint)?.is_some())
    }
}

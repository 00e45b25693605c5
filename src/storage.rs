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

//! Node storage plumbing.
//!
//! The at-most-one uncommitted trie lives in a `TrieRAM` arena, addressed
//! by slot index; committed tries are read through the `TrieDb` record
//! store, fronted by the node cache.  `TrieStorage` routes reads and
//! writes to whichever trie is currently open.

use log::trace;

use crate::bits::{read_node_frame, write_node_frame};
use crate::cache::TrieCache;
use crate::db::{TrieDb, TrieMeta};
use crate::node::{is_backptr, TrieNodeID, TrieNodeType, TriePtr};
use crate::{CheckpointId, Error, Result, TrieHash};

/// In-RAM arena for the trie being built.  Slot 0 is always the root.
pub struct TrieRAM {
    data: Vec<(TrieNodeType, TrieHash)>,
}

impl TrieRAM {
    pub fn new() -> TrieRAM {
        TrieRAM { data: vec![] }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn read_nodetype(&self, slot: u32) -> Result<(TrieNodeType, TrieHash)> {
        self.data
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| Error::CorruptNode(format!("no in-RAM node at slot {}", slot)))
    }

    pub fn read_node_hash(&self, slot: u32) -> Result<TrieHash> {
        self.data
            .get(slot as usize)
            .map(|(_, hash)| *hash)
            .ok_or_else(|| Error::CorruptNode(format!("no in-RAM node at slot {}", slot)))
    }

    /// Overwrite an existing slot, or push to the next free one.
    pub fn write_nodetype(&mut self, slot: u32, node: &TrieNodeType, hash: TrieHash) -> Result<()> {
        let slot = slot as usize;
        if slot < self.data.len() {
            self.data[slot] = (node.clone(), hash);
            Ok(())
        } else if slot == self.data.len() {
            self.data.push((node.clone(), hash));
            Ok(())
        } else {
            Err(Error::CorruptNode(format!(
                "write to slot {} beyond arena end {}",
                slot,
                self.data.len()
            )))
        }
    }

    pub fn append_nodetype(&mut self, node: &TrieNodeType, hash: TrieHash) -> u32 {
        let slot = self.data.len() as u32;
        self.data.push((node.clone(), hash));
        slot
    }

    /// Serialize every slot into the records handed to the store.
    pub fn to_records(&self) -> Vec<(u32, Vec<u8>)> {
        self.data
            .iter()
            .enumerate()
            .map(|(i, (node, hash))| (i as u32, write_node_frame(node, hash)))
            .collect()
    }
}

/// The one trie that may be open for writing.
pub struct UncommittedTrie {
    pub checkpoint: CheckpointId,
    pub parent: CheckpointId,
    pub ram: TrieRAM,
    pub sealed: Option<TrieHash>,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum CurrentView {
    /// The uncommitted trie.
    Uncommitted,
    /// A committed trie, by checkpoint id and store index.
    Committed(CheckpointId, u32),
}

/// Forest-wide node access: one `TrieDb`, one optional uncommitted trie,
/// one "currently open" trie that reads and writes resolve against.
pub struct TrieStorage<T: TrieDb> {
    db: T,
    cache: TrieCache,
    uncommitted: Option<UncommittedTrie>,
    cur: Option<CurrentView>,
}

impl<T: TrieDb> TrieStorage<T> {
    pub fn new(db: T, cache: TrieCache) -> TrieStorage<T> {
        TrieStorage {
            db,
            cache,
            uncommitted: None,
            cur: None,
        }
    }

    pub fn db(&self) -> &T {
        &self.db
    }

    /// Give the store handle back, discarding any uncommitted trie.
    pub fn into_db(self) -> T {
        self.db
    }

    pub fn root_ptr(&self) -> u32 {
        0
    }

    pub fn root_trieptr(&self) -> TriePtr {
        TriePtr::new(TrieNodeID::Node256.to_u8(), 0, self.root_ptr())
    }

    /// The trie reads currently resolve against.
    pub fn cur_checkpoint(&self) -> CheckpointId {
        match self.cur {
            Some(CurrentView::Uncommitted) => {
                self.uncommitted
                    .as_ref()
                    .expect("BUG: current view names a missing uncommitted trie")
                    .checkpoint
            }
            Some(CurrentView::Committed(id, _)) => id,
            None => panic!("BUG: no trie is open"),
        }
    }

    pub fn uncommitted(&self) -> Option<&UncommittedTrie> {
        self.uncommitted.as_ref()
    }

    pub fn uncommitted_mut(&mut self) -> Option<&mut UncommittedTrie> {
        self.uncommitted.as_mut()
    }

    /// Begin a new uncommitted trie.  The caller guarantees no other is
    /// outstanding.
    pub fn extend_uncommitted(&mut self, checkpoint: CheckpointId, parent: CheckpointId) {
        assert!(self.uncommitted.is_none());
        self.uncommitted = Some(UncommittedTrie {
            checkpoint,
            parent,
            ram: TrieRAM::new(),
            sealed: None,
        });
        self.cur = Some(CurrentView::Uncommitted);
    }

    /// Discard the uncommitted trie, leaving no trace of it.
    pub fn drop_uncommitted(&mut self) {
        if let Some(trie) = self.uncommitted.take() {
            trace!("dropped uncommitted trie {}", trie.checkpoint);
        }
        self.cur = None;
    }

    /// Open a trie for subsequent reads (and writes, if it is the
    /// uncommitted one).
    pub fn open_checkpoint(&mut self, checkpoint: &CheckpointId) -> Result<()> {
        if let Some(ref trie) = self.uncommitted {
            if trie.checkpoint == *checkpoint {
                self.cur = Some(CurrentView::Uncommitted);
                return Ok(());
            }
        }
        let index = match self.cache.load_checkpoint_index(checkpoint) {
            Some(index) => index,
            None => {
                let index = self.db.index_of(checkpoint)?.ok_or(Error::NotFound)?;
                self.cache.store_checkpoint_id(index, *checkpoint);
                index
            }
        };
        self.cur = Some(CurrentView::Committed(*checkpoint, index));
        Ok(())
    }

    /// Open a committed trie by store index, as found in a back-pointer.
    /// A missing index is a dangling back-pointer.
    pub fn open_checkpoint_index(&mut self, index: u32) -> Result<CheckpointId> {
        let db = &self.db;
        let id = *self.cache.get_checkpoint_id_caching(index, |index| {
            db.checkpoint_at(index)?
                .ok_or(Error::DanglingBackpointer(index))
        })?;
        self.cur = Some(CurrentView::Committed(id, index));
        Ok(id)
    }

    /// Store index of the currently-open committed trie, or of the
    /// uncommitted trie's parent when the uncommitted trie is open.
    pub fn cur_index(&self) -> Option<u32> {
        match self.cur {
            Some(CurrentView::Committed(_, index)) => Some(index),
            _ => None,
        }
    }

    /// Read a (non-back-pointer) node and its hash from the open trie.
    pub fn read_nodetype(&mut self, ptr: &TriePtr) -> Result<(TrieNodeType, TrieHash)> {
        assert!(!is_backptr(ptr.id()), "BUG: unresolved back-pointer read");
        match self.cur {
            Some(CurrentView::Uncommitted) => self
                .uncommitted
                .as_ref()
                .expect("BUG: current view names a missing uncommitted trie")
                .ram
                .read_nodetype(ptr.ptr()),
            Some(CurrentView::Committed(id, index)) => {
                if let (Some(node), Some(hash)) = (
                    self.cache.load_node(index, ptr),
                    self.cache.load_node_hash(index, ptr),
                ) {
                    return Ok((node, hash));
                }
                let bytes = self.db.read(&id, ptr.ptr())?;
                let (node, hash) = read_node_frame(&bytes)?;
                self.cache
                    .store_node_and_hash(index, *ptr, node.clone(), hash);
                Ok((node, hash))
            }
            None => panic!("BUG: no trie is open"),
        }
    }

    /// Read just a node's hash from the open trie.
    pub fn read_node_hash(&mut self, ptr: &TriePtr) -> Result<TrieHash> {
        assert!(!is_backptr(ptr.id()), "BUG: unresolved back-pointer read");
        match self.cur {
            Some(CurrentView::Uncommitted) => self
                .uncommitted
                .as_ref()
                .expect("BUG: current view names a missing uncommitted trie")
                .ram
                .read_node_hash(ptr.ptr()),
            Some(CurrentView::Committed(id, index)) => {
                if let Some(hash) = self.cache.load_node_hash(index, ptr) {
                    return Ok(hash);
                }
                let bytes = self.db.read(&id, ptr.ptr())?;
                let (node, hash) = read_node_frame(&bytes)?;
                self.cache
                    .store_node_and_hash(index, *ptr, node, hash);
                Ok(hash)
            }
            None => panic!("BUG: no trie is open"),
        }
    }

    /// Resolve a back-pointer's target hash without disturbing the open
    /// trie.
    pub fn read_backptr_node_hash(&mut self, ptr: &TriePtr) -> Result<TrieHash> {
        assert!(is_backptr(ptr.id()));
        let saved = self.cur;
        self.open_checkpoint_index(ptr.back_block())?;
        let res = self.read_node_hash(&ptr.from_backptr());
        self.cur = saved;
        res
    }

    /// Read the open trie's root, verifying it is a Node256.
    pub fn read_root(&mut self) -> Result<(TrieNodeType, TrieHash)> {
        let (node, hash) = self.read_nodetype(&self.root_trieptr())?;
        if !node.is_node256() {
            return Err(Error::CorruptNode("trie root is not a Node256".to_string()));
        }
        Ok((node, hash))
    }

    /// Write a node into the uncommitted trie at the given slot.
    pub fn write_nodetype(&mut self, slot: u32, node: &TrieNodeType, hash: TrieHash) -> Result<()> {
        match self.cur {
            Some(CurrentView::Uncommitted) => self
                .uncommitted
                .as_mut()
                .expect("BUG: current view names a missing uncommitted trie")
                .ram
                .write_nodetype(slot, node, hash),
            _ => Err(Error::ReadOnly),
        }
    }

    /// Append a node to the uncommitted trie; returns its slot.
    pub fn append_nodetype(&mut self, node: &TrieNodeType, hash: TrieHash) -> Result<u32> {
        match self.cur {
            Some(CurrentView::Uncommitted) => Ok(self
                .uncommitted
                .as_mut()
                .expect("BUG: current view names a missing uncommitted trie")
                .ram
                .append_nodetype(node, hash)),
            _ => Err(Error::ReadOnly),
        }
    }

    /// Atomically persist the uncommitted trie and retire it.  Returns
    /// the store index the trie was assigned.
    pub fn commit_uncommitted(&mut self, meta: &TrieMeta) -> Result<u32> {
        let trie = self
            .uncommitted
            .take()
            .expect("BUG: no uncommitted trie to commit");
        let records = trie.ram.to_records();
        let index = self.db.batch_write(&trie.checkpoint, meta, &records)?;
        self.cache.store_checkpoint_id(index, trie.checkpoint);
        self.cur = None;
        trace!(
            "committed trie {} as index {} ({} nodes)",
            trie.checkpoint,
            index,
            records.len()
        );
        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bits::get_leaf_hash;
    use crate::memory::MemoryTrieDb;
    use crate::node::{TrieLeaf, TrieNode, TrieNode256};
    use crate::MarfValue;

    fn leaf(value: &[u8]) -> (TrieNodeType, TrieHash) {
        let leaf = TrieLeaf::new(&[1, 2], &MarfValue::from_value(value));
        let hash = get_leaf_hash(&leaf);
        (leaf.as_trie_node_type(), hash)
    }

    fn empty_root() -> (TrieNodeType, TrieHash) {
        let root = TrieNode256::new(&[]);
        let node = root.as_trie_node_type();
        (node, TrieHash::from_empty_data())
    }

    #[test]
    fn uncommitted_write_read_commit() {
        let mut storage = TrieStorage::new(MemoryTrieDb::new(), TrieCache::new("everything"));
        let cp = CheckpointId::from_data(b"cp");
        storage.extend_uncommitted(cp, CheckpointId::sentinel());
        assert_eq!(storage.cur_checkpoint(), cp);

        let (root, root_hash) = empty_root();
        storage.write_nodetype(0, &root, root_hash).unwrap();
        let (l, lh) = leaf(b"value");
        let slot = storage.append_nodetype(&l, lh).unwrap();
        assert_eq!(slot, 1);

        let ptr = TriePtr::new(TrieNodeID::Leaf.to_u8(), 0, slot);
        let (read, read_hash) = storage.read_nodetype(&ptr).unwrap();
        assert_eq!((read, read_hash), (l.clone(), lh));

        let meta = TrieMeta {
            parent: CheckpointId::sentinel(),
            root_node_hash: root_hash,
            sealed_hash: root_hash,
        };
        let index = storage.commit_uncommitted(&meta).unwrap();
        assert_eq!(index, 0);

        // committed now; reads go through the db + cache
        storage.open_checkpoint(&cp).unwrap();
        let (read, read_hash) = storage.read_nodetype(&ptr).unwrap();
        assert_eq!((read, read_hash), (l, lh));
        assert_eq!(storage.read_node_hash(&ptr).unwrap(), lh);

        // writes are rejected against committed tries
        assert!(matches!(
            storage.write_nodetype(0, &empty_root().0, root_hash),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn dropped_trie_leaves_no_trace() {
        let mut storage = TrieStorage::new(MemoryTrieDb::new(), TrieCache::default());
        let cp = CheckpointId::from_data(b"cp");
        storage.extend_uncommitted(cp, CheckpointId::sentinel());
        let (root, root_hash) = empty_root();
        storage.write_nodetype(0, &root, root_hash).unwrap();
        storage.drop_uncommitted();

        assert!(matches!(
            storage.open_checkpoint(&cp),
            Err(Error::NotFound)
        ));
        assert_eq!(storage.db().count_checkpoints().unwrap(), 0);
    }

    #[test]
    fn backptr_hash_read_restores_view() {
        let mut storage = TrieStorage::new(MemoryTrieDb::new(), TrieCache::default());
        let a = CheckpointId::from_data(b"a");
        storage.extend_uncommitted(a, CheckpointId::sentinel());
        let (root, root_hash) = empty_root();
        storage.write_nodetype(0, &root, root_hash).unwrap();
        let (l, lh) = leaf(b"v");
        storage.append_nodetype(&l, lh).unwrap();
        let meta = TrieMeta {
            parent: CheckpointId::sentinel(),
            root_node_hash: root_hash,
            sealed_hash: root_hash,
        };
        storage.commit_uncommitted(&meta).unwrap();

        let b = CheckpointId::from_data(b"b");
        storage.extend_uncommitted(b, a);
        storage.write_nodetype(0, &empty_root().0, root_hash).unwrap();

        let mut backptr = TriePtr::new(
            crate::node::set_backptr(TrieNodeID::Leaf.to_u8()),
            1,
            1,
        );
        backptr.back_block = 0;
        assert_eq!(storage.read_backptr_node_hash(&backptr).unwrap(), lh);
        // view must still be the uncommitted trie
        assert_eq!(storage.cur_checkpoint(), b);

        let mut dangling = backptr;
        dangling.back_block = 9;
        assert!(matches!(
            storage.read_backptr_node_hash(&dangling),
            Err(Error::DanglingBackpointer(9))
        ));
    }
}

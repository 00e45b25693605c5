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

//! The forest manager.
//!
//! A `Marf` owns the storage for one forest and hands out at most one
//! `WriteSession` at a time.  A session builds the trie for a new
//! checkpoint by copy-on-write against its parent: untouched subtrees
//! stay in ancestor tries behind back-pointers, and only the nodes on
//! written paths are copied forward.  Dropping a session without
//! committing discards the trie; committing persists it atomically and
//! publishes its sealed root.

use log::{debug, trace};

use crate::bits::{get_leaf_hash, get_node_hash, get_nodetype_hash, seal_root_hash};
use crate::cache::TrieCache;
use crate::cursor::{CursorError, TrieCursor};
use crate::db::{TrieDb, TrieMeta};
use crate::node::{
    clear_backptr, is_backptr, set_backptr, TrieNode, TrieNode256, TrieNodeType, TriePtr,
};
use crate::proofs::TrieMerkleProof;
use crate::storage::TrieStorage;
use crate::trie::Trie;
use crate::{CheckpointId, Error, MarfValue, Result, TrieHash, TriePath};

/// Hard bound on checkpoint crossings in a single walk.  A valid path
/// crosses at most once per path byte; exceeding this means a corrupt
/// back-pointer graph.
pub(crate) const MAX_BACKPTR_CROSSINGS: u32 = 64;

/// When node hashes are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieHashCalculationMode {
    /// Hash every written node at `put` time.
    Immediate,
    /// Write placeholder hashes and compute everything in one post-order
    /// pass at seal time.  Faster for write-heavy sessions.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct MarfOpenOpts {
    pub hash_calculation_mode: TrieHashCalculationMode,
    /// One of "noop", "everything", "node256".
    pub cache_strategy: String,
}

impl MarfOpenOpts {
    pub fn new(hash_calculation_mode: TrieHashCalculationMode, cache_strategy: &str) -> MarfOpenOpts {
        MarfOpenOpts {
            hash_calculation_mode,
            cache_strategy: cache_strategy.to_string(),
        }
    }
}

impl Default for MarfOpenOpts {
    fn default() -> MarfOpenOpts {
        MarfOpenOpts::new(TrieHashCalculationMode::Deferred, "noop")
    }
}

/// Walk the open trie to the leaf for `path`, resolving checkpoint
/// crossings as they are encountered.  `Error::NotFound` when the path
/// diverges or a branch is missing.
pub(crate) fn walk_path<T: TrieDb>(
    storage: &mut TrieStorage<T>,
    path: &TriePath,
) -> Result<(TrieCursor, crate::node::TrieLeaf)> {
    let mut c = TrieCursor::new(path, storage.root_ptr());
    let (mut node, _) = storage.read_root()?;
    let mut crossings = 0u32;

    // each iteration either consumes path bytes or resolves one crossing
    for _ in 0..(2 * (path.len() + 1)) {
        if c.tell() + node.path_bytes().len() > path.len() {
            return Err(Error::CorruptNode(
                "compressed path overruns the search path".to_string(),
            ));
        }
        let checkpoint = storage.cur_checkpoint();
        match c.walk(&node, &checkpoint) {
            Ok(Some(ptr)) => {
                node = storage.read_nodetype(&ptr)?.0;
            }
            Ok(None) => {
                return match node {
                    TrieNodeType::Leaf(leaf) => Ok((c, leaf)),
                    _ => Err(Error::CorruptNode(
                        "search path ended at an intermediate node".to_string(),
                    )),
                };
            }
            Err(CursorError::PathDiverged) | Err(CursorError::ChrNotFound) => {
                return Err(Error::NotFound);
            }
            Err(CursorError::BackptrEncountered(ptr)) => {
                crossings += 1;
                if crossings > MAX_BACKPTR_CROSSINGS {
                    return Err(Error::ChainTooDeep(MAX_BACKPTR_CROSSINGS));
                }
                let foreign = storage.open_checkpoint_index(ptr.back_block())?;
                let (next_node, _) = storage.read_nodetype(&ptr.from_backptr())?;
                c.walk_backptr_step_backptr(&next_node, &ptr, &foreign);
                c.walk_backptr_finish(&ptr.from_backptr(), &foreign);
                node = next_node;
            }
        }
    }
    Err(Error::CorruptNode("trie has a cycle".to_string()))
}

pub(crate) fn get_path<T: TrieDb>(
    storage: &mut TrieStorage<T>,
    checkpoint: &CheckpointId,
    path: &TriePath,
) -> Result<Option<MarfValue>> {
    storage.open_checkpoint(checkpoint)?;
    match walk_path(storage, path) {
        Ok((_, leaf)) => Ok(Some(leaf.data)),
        Err(Error::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Resolve a crossing during a write walk: copy the foreign node into
/// the uncommitted trie, demoting its children to back-pointers into the
/// trie that physically holds them.
fn node_child_copy<T: TrieDb>(
    storage: &mut TrieStorage<T>,
    ptr: &TriePtr,
    c: &mut TrieCursor,
    target: &CheckpointId,
) -> Result<TrieNodeType> {
    let foreign_index = ptr.back_block();
    let foreign = storage.open_checkpoint_index(foreign_index)?;
    let (mut child, _) = storage.read_nodetype(&ptr.from_backptr())?;
    trace!(
        "node_child_copy: bring {:?} forward from {} into {}",
        &child,
        &foreign,
        target
    );
    c.walk_backptr_step_backptr(&child, ptr, &foreign);

    for p in child.ptrs_mut() {
        if p.is_empty() || is_backptr(p.id()) {
            continue;
        }
        p.id = set_backptr(p.id());
        p.back_block = foreign_index;
    }

    // leaves keep a real hash; internal copies are re-hashed by the
    // spine sweep or the seal pass
    let hash = match child {
        TrieNodeType::Leaf(ref leaf) => get_leaf_hash(leaf),
        _ => TrieHash::from_empty_data(),
    };
    storage.open_checkpoint(target)?;
    let slot = storage.append_nodetype(&child, hash)?;
    let local_ptr = TriePtr::new(clear_backptr(ptr.id()), ptr.chr(), slot);
    c.walk_backptr_finish(&local_ptr, target);
    Ok(child)
}

/// Walk toward `path` in the uncommitted trie, copying foreign nodes
/// forward as crossings are hit.  The returned cursor stops at the
/// insertion point with every spine node local, ready for `add_value`.
fn walk_cow<T: TrieDb>(storage: &mut TrieStorage<T>, path: &TriePath) -> Result<TrieCursor> {
    let target = storage.cur_checkpoint();
    let mut c = TrieCursor::new(path, storage.root_ptr());
    let (mut node, _) = storage.read_root()?;
    let mut crossings = 0u32;

    for _ in 0..(2 * (path.len() + 1)) {
        if c.tell() + node.path_bytes().len() > path.len() {
            return Err(Error::CorruptNode(
                "compressed path overruns the search path".to_string(),
            ));
        }
        match c.walk(&node, &target) {
            Ok(Some(ptr)) => {
                node = storage.read_nodetype(&ptr)?.0;
            }
            Ok(None) => {
                // terminal node; add_value decides between replace,
                // attach, and promote
                return Ok(c);
            }
            Err(CursorError::PathDiverged) | Err(CursorError::ChrNotFound) => {
                return Ok(c);
            }
            Err(CursorError::BackptrEncountered(ptr)) => {
                crossings += 1;
                if crossings > MAX_BACKPTR_CROSSINGS {
                    return Err(Error::ChainTooDeep(MAX_BACKPTR_CROSSINGS));
                }
                node = node_child_copy(storage, &ptr, &mut c, &target)?;
            }
        }
    }
    Err(Error::CorruptNode("trie has a cycle".to_string()))
}

/// Copy the parent's root into the uncommitted trie, demoting its
/// children to back-pointers at the parent's store index.
fn root_copy<T: TrieDb>(
    storage: &mut TrieStorage<T>,
    parent: &CheckpointId,
    parent_index: u32,
    mode: TrieHashCalculationMode,
) -> Result<()> {
    let target = storage
        .uncommitted()
        .expect("BUG: root_copy without an uncommitted trie")
        .checkpoint;
    storage.open_checkpoint(parent)?;
    let (mut root, _) = storage.read_root()?;
    for p in root.ptrs_mut() {
        if p.is_empty() || is_backptr(p.id()) {
            continue;
        }
        p.id = set_backptr(p.id());
        p.back_block = parent_index;
    }

    storage.open_checkpoint(&target)?;
    let hash = match mode {
        TrieHashCalculationMode::Immediate => {
            let hashes = Trie::get_children_hashes(storage, &root)?;
            get_nodetype_hash(&root, &hashes)
        }
        TrieHashCalculationMode::Deferred => TrieHash::from_empty_data(),
    };
    storage.write_nodetype(0, &root, hash)
}

/// Post-order hash pass over the uncommitted trie, used at seal time in
/// deferred mode.  Returns the root node's hash.
fn seal_trie_hashes<T: TrieDb>(storage: &mut TrieStorage<T>, slot: u32, depth: u32) -> Result<TrieHash> {
    // deeper than any 32-byte path can reach
    if depth > 34 {
        return Err(Error::CorruptNode("trie has a cycle".to_string()));
    }
    let (node, _) = storage
        .uncommitted()
        .ok_or(Error::ReadOnly)?
        .ram
        .read_nodetype(slot)?;

    let hash = match node {
        TrieNodeType::Leaf(ref leaf) => get_leaf_hash(leaf),
        _ => {
            let mut hashes = Vec::with_capacity(node.ptrs().len());
            for ptr in node.ptrs().to_vec() {
                if ptr.is_empty() {
                    hashes.push(TrieHash::from_empty_data());
                } else if is_backptr(ptr.id()) {
                    hashes.push(storage.read_backptr_node_hash(&ptr)?);
                } else {
                    hashes.push(seal_trie_hashes(storage, ptr.ptr(), depth + 1)?);
                }
            }
            get_nodetype_hash(&node, &hashes)
        }
    };
    storage
        .uncommitted_mut()
        .ok_or(Error::ReadOnly)?
        .ram
        .write_nodetype(slot, &node, hash)?;
    Ok(hash)
}

/// One forest: a backing store plus the at-most-one write session.
pub struct Marf<T: TrieDb> {
    storage: TrieStorage<T>,
    opts: MarfOpenOpts,
    write_open: bool,
}

impl<T: TrieDb> Marf<T> {
    pub fn new(db: T, opts: MarfOpenOpts) -> Marf<T> {
        let cache = TrieCache::new(&opts.cache_strategy);
        Marf {
            storage: TrieStorage::new(db, cache),
            opts,
            write_open: false,
        }
    }

    /// Open with default options.
    pub fn from_db(db: T) -> Marf<T> {
        Marf::new(db, MarfOpenOpts::default())
    }

    pub fn db(&self) -> &T {
        self.storage.db()
    }

    pub fn checkpoint_exists(&self, checkpoint: &CheckpointId) -> Result<bool> {
        self.storage.db().checkpoint_exists(checkpoint)
    }

    /// Sealed root published when `checkpoint` was committed.
    pub fn sealed_root(&self, checkpoint: &CheckpointId) -> Result<TrieHash> {
        Ok(self
            .storage
            .db()
            .trie_meta(checkpoint)?
            .ok_or(Error::NotFound)?
            .sealed_hash)
    }

    /// Read `key` as of a committed checkpoint.  `Ok(None)` when the key
    /// is absent; `Error::NotFound` when the checkpoint itself is.
    pub fn get(&mut self, checkpoint: &CheckpointId, key: &[u8]) -> Result<Option<MarfValue>> {
        get_path(&mut self.storage, checkpoint, &TriePath::from_key(key))
    }

    /// Inclusion proof for `key` as of a committed checkpoint.
    pub fn prove(&mut self, checkpoint: &CheckpointId, key: &[u8]) -> Result<TrieMerkleProof> {
        TrieMerkleProof::from_storage(&mut self.storage, checkpoint, key)
    }

    /// Open a read-only view over its own store handle.  Readers never
    /// see uncommitted state, so any number may run alongside the one
    /// writer.
    pub fn open_for_read(db: T, opts: &MarfOpenOpts) -> ReadHandle<T> {
        ReadHandle::new(db, opts)
    }

    /// Begin the trie for `target` on top of `parent`.  `parent` must be
    /// committed (or the sentinel, for the forest's genesis); `target`
    /// must be new.  At most one session can exist at a time.
    pub fn open_for_write(
        &mut self,
        parent: &CheckpointId,
        target: CheckpointId,
    ) -> Result<WriteSession<'_, T>> {
        assert!(!target.is_sentinel(), "BUG: the sentinel cannot name a trie");
        if self.write_open {
            return Err(Error::WriteSessionConflict);
        }
        if self.storage.db().checkpoint_exists(&target)? {
            return Err(Error::CheckpointExists(target));
        }

        if parent.is_sentinel() {
            self.storage.extend_uncommitted(target, *parent);
            let root = TrieNode256::new(&[]);
            let hash = get_node_hash(&root, &[TrieHash::from_empty_data(); 256]);
            self.storage
                .write_nodetype(0, &root.as_trie_node_type(), hash)?;
        } else {
            let parent_index = self
                .storage
                .db()
                .index_of(parent)?
                .ok_or(Error::NotFound)?;
            self.storage.extend_uncommitted(target, *parent);
            root_copy(
                &mut self.storage,
                parent,
                parent_index,
                self.opts.hash_calculation_mode,
            )?;
        }
        debug!("open trie {} for writing on top of {}", target, parent);
        self.write_open = true;
        Ok(WriteSession { marf: self })
    }
}

/// An open, uncommitted trie.  Dropping the session rolls it back.
pub struct WriteSession<'a, T: TrieDb> {
    marf: &'a mut Marf<T>,
}

impl<'a, T: TrieDb> WriteSession<'a, T> {
    pub fn target(&self) -> CheckpointId {
        self.marf
            .storage
            .uncommitted()
            .expect("BUG: write session without an uncommitted trie")
            .checkpoint
    }

    /// Write a key-value pair into the uncommitted trie.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_value(key, &MarfValue::from_value(value))
    }

    /// Like `put`, for callers that already hold the value hash.
    pub fn put_value(&mut self, key: &[u8], value: &MarfValue) -> Result<()> {
        let mode = self.marf.opts.hash_calculation_mode;
        let storage = &mut self.marf.storage;
        let (target, sealed) = {
            let trie = storage
                .uncommitted()
                .expect("BUG: write session without an uncommitted trie");
            (trie.checkpoint, trie.sealed.is_some())
        };
        if sealed {
            return Err(Error::SessionSealed);
        }

        storage.open_checkpoint(&target)?;
        let path = TriePath::from_key(key);
        let mut c = walk_cow(storage, &path)?;
        Trie::add_value(storage, &mut c, value, mode)?;
        Trie::update_root_hash(storage, &c, mode)?;
        Ok(())
    }

    /// Read a key through the uncommitted trie, falling through to
    /// ancestors for untouched subtrees.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<MarfValue>> {
        let target = self.target();
        get_path(&mut self.marf.storage, &target, &TriePath::from_key(key))
    }

    /// Finalize the trie's hashes and derive the sealed root.  Further
    /// `put`s are rejected; seal is idempotent.
    pub fn seal(&mut self) -> Result<TrieHash> {
        let mode = self.marf.opts.hash_calculation_mode;
        let storage = &mut self.marf.storage;
        let (target, parent, already_sealed) = {
            let trie = storage
                .uncommitted()
                .expect("BUG: write session without an uncommitted trie");
            (trie.checkpoint, trie.parent, trie.sealed)
        };
        if let Some(sealed) = already_sealed {
            return Ok(sealed);
        }

        storage.open_checkpoint(&target)?;
        let root_node_hash = match mode {
            TrieHashCalculationMode::Deferred => seal_trie_hashes(storage, 0, 0)?,
            TrieHashCalculationMode::Immediate => {
                let root_ptr = storage.root_trieptr();
                storage.read_node_hash(&root_ptr)?
            }
        };

        let parent_sealed = if parent.is_sentinel() {
            TrieHash::from_empty_data()
        } else {
            storage
                .db()
                .trie_meta(&parent)?
                .ok_or(Error::NotFound)?
                .sealed_hash
        };
        let sealed = seal_root_hash(&root_node_hash, &parent, &parent_sealed);
        storage
            .uncommitted_mut()
            .expect("BUG: write session without an uncommitted trie")
            .sealed = Some(sealed);
        debug!("sealed trie {}: {}", target, sealed);
        Ok(sealed)
    }

    /// Seal (if not yet sealed) and atomically persist the trie.
    /// Returns the sealed root the checkpoint now publishes.
    pub fn commit(mut self) -> Result<TrieHash> {
        let sealed = self.seal()?;
        let storage = &mut self.marf.storage;
        let (parent, root_node_hash) = {
            let trie = storage
                .uncommitted()
                .expect("BUG: write session without an uncommitted trie");
            (trie.parent, trie.ram.read_node_hash(0)?)
        };
        let meta = TrieMeta {
            parent,
            root_node_hash,
            sealed_hash: sealed,
        };
        storage.commit_uncommitted(&meta)?;
        Ok(sealed)
    }
}

impl<'a, T: TrieDb> Drop for WriteSession<'a, T> {
    fn drop(&mut self) {
        // no-op after commit; rollback otherwise
        self.marf.storage.drop_uncommitted();
        self.marf.write_open = false;
    }
}

/// A read-only view of a forest, over its own store handle.  Never sees
/// uncommitted state, so any number may coexist with one writer.
pub struct ReadHandle<T: TrieDb> {
    storage: TrieStorage<T>,
}

impl<T: TrieDb> ReadHandle<T> {
    pub fn new(db: T, opts: &MarfOpenOpts) -> ReadHandle<T> {
        ReadHandle {
            storage: TrieStorage::new(db, TrieCache::new(&opts.cache_strategy)),
        }
    }

    pub fn get(&mut self, checkpoint: &CheckpointId, key: &[u8]) -> Result<Option<MarfValue>> {
        get_path(&mut self.storage, checkpoint, &TriePath::from_key(key))
    }

    pub fn sealed_root(&self, checkpoint: &CheckpointId) -> Result<TrieHash> {
        Ok(self
            .storage
            .db()
            .trie_meta(checkpoint)?
            .ok_or(Error::NotFound)?
            .sealed_hash)
    }

    pub fn checkpoint_exists(&self, checkpoint: &CheckpointId) -> Result<bool> {
        self.storage.db().checkpoint_exists(checkpoint)
    }

    pub fn prove(&mut self, checkpoint: &CheckpointId, key: &[u8]) -> Result<TrieMerkleProof> {
        TrieMerkleProof::from_storage(&mut self.storage, checkpoint, key)
    }
}

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

//! Single-trie write operations.
//!
//! These run against the uncommitted trie once the copy-on-write walk has
//! brought every node on the search path into RAM.  A write lands in one
//! of four ways: replace an existing leaf, attach a new leaf to a node
//! (promoting the node to the next fan-out if it is full), promote a leaf
//! to a Node4 holding both leaves, or splice a Node4 into a node's
//! compressed path at the divergence point.  After the write, the spine
//! recorded by the cursor is swept bottom-up to patch child pointers and
//! (in immediate mode) recompute hashes.

use log::trace;

use crate::bits::{get_leaf_hash, get_node_hash, get_nodetype_hash};
use crate::cursor::TrieCursor;
use crate::db::TrieDb;
use crate::marf::TrieHashCalculationMode;
use crate::node::{
    is_backptr, clear_backptr, TrieLeaf, TrieNode, TrieNode16, TrieNode256, TrieNode4, TrieNode48,
    TrieNodeID, TrieNodeType, TriePtr,
};
use crate::storage::TrieStorage;
use crate::{Error, MarfValue, Result, TrieHash};

pub struct Trie;

impl Trie {
    /// One 32-byte hash contribution per child slot: the empty-string
    /// hash for empty slots, the target node's hash otherwise.  A
    /// back-pointer contributes the foreign node's hash unchanged, so
    /// hashes chain across checkpoints transparently.
    pub fn get_children_hashes<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        node: &TrieNodeType,
    ) -> Result<Vec<TrieHash>> {
        let mut hashes = Vec::with_capacity(node.ptrs().len());
        for ptr in node.ptrs().iter() {
            if ptr.is_empty() {
                hashes.push(TrieHash::from_empty_data());
            } else if is_backptr(ptr.id()) {
                hashes.push(storage.read_backptr_node_hash(ptr)?);
            } else {
                hashes.push(storage.read_node_hash(ptr)?);
            }
        }
        Ok(hashes)
    }

    /// Hash a node in the open trie.  In deferred mode internal nodes get
    /// a placeholder; the seal pass computes the real hashes in one
    /// post-order sweep.
    fn node_hash_for_mode<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        node: &TrieNodeType,
        mode: TrieHashCalculationMode,
    ) -> Result<TrieHash> {
        match node {
            TrieNodeType::Leaf(ref leaf) => Ok(get_leaf_hash(leaf)),
            _ => match mode {
                TrieHashCalculationMode::Immediate => {
                    let hashes = Trie::get_children_hashes(storage, node)?;
                    Ok(get_nodetype_hash(node, &hashes))
                }
                TrieHashCalculationMode::Deferred => Ok(TrieHash::from_empty_data()),
            },
        }
    }

    /// Replace the value of the leaf the cursor stopped on.  The leaf
    /// keeps its compressed path; only the payload changes.
    fn replace_leaf<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &TrieCursor,
        value: &MarfValue,
    ) -> Result<TriePtr> {
        let (cur_node, _) = storage.read_nodetype(&c.ptr())?;
        let path = match cur_node {
            TrieNodeType::Leaf(ref data) => data.path.clone(),
            _ => {
                return Err(Error::CorruptNode(format!(
                    "not a leaf: {:?}",
                    &c.ptr()
                )));
            }
        };

        let leaf = TrieLeaf::new(&path, value);
        let leaf_hash = get_leaf_hash(&leaf);
        storage.write_nodetype(c.ptr().ptr(), &leaf.as_trie_node_type(), leaf_hash)?;
        trace!("replace_leaf: wrote {:?} at {:?}", &leaf, &c.ptr());
        Ok(c.ptr())
    }

    /// Append a leaf holding the rest of the cursor's path, lazily
    /// expanded: the trailing path lives in the leaf itself.
    fn append_leaf<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &TrieCursor,
        value: &MarfValue,
    ) -> Result<(TriePtr, TrieHash)> {
        let chr = c.chr().expect("BUG: appending a leaf before any walk step");
        let leaf = TrieLeaf::new(&c.path.as_bytes()[c.tell()..], value);
        let leaf_hash = get_leaf_hash(&leaf);
        let slot = storage.append_nodetype(&leaf.as_trie_node_type(), leaf_hash)?;
        let leaf_ptr = TriePtr::new(TrieNodeID::Leaf.to_u8(), chr, slot);
        trace!("append_leaf: {:?} at {:?}", &leaf, &leaf_ptr);
        Ok((leaf_ptr, leaf_hash))
    }

    /// Turn the leaf the cursor diverged inside into a Node4 carrying the
    /// shared prefix, with the old leaf and the new one as children.
    ///
    /// The old leaf keeps its slot (with a shortened path); the new leaf
    /// and the Node4 are appended, and the cursor is retargeted at the
    /// Node4 so the spine sweep patches the parent.
    fn promote_leaf_to_node4<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &mut TrieCursor,
        cur_leaf: &TrieLeaf,
        value: &MarfValue,
        mode: TrieHashCalculationMode,
    ) -> Result<TriePtr> {
        assert!(!c.eop());
        assert!(!cur_leaf.path.is_empty());

        let cur_leaf_ptr = c.ptr();
        let node4_path = cur_leaf.path[0..c.ntell()].to_vec();
        let node4_chr = cur_leaf_ptr.chr();

        // the two leaves keep their unique suffixes past the divergence
        let cur_leaf_chr = cur_leaf.path[c.ntell()];
        let shortened = TrieLeaf::new(&cur_leaf.path[c.ntell() + 1..], &cur_leaf.data);
        let cur_leaf_hash = get_leaf_hash(&shortened);
        storage.write_nodetype(
            cur_leaf_ptr.ptr(),
            &shortened.as_trie_node_type(),
            cur_leaf_hash,
        )?;
        let cur_leaf_new_ptr =
            TriePtr::new(TrieNodeID::Leaf.to_u8(), cur_leaf_chr, cur_leaf_ptr.ptr());

        let new_leaf_chr = c.path.as_bytes()[c.tell()];
        let new_leaf = TrieLeaf::new(&c.path.as_bytes()[c.tell() + 1..], value);
        let new_leaf_hash = get_leaf_hash(&new_leaf);
        let new_leaf_slot = storage.append_nodetype(&new_leaf.as_trie_node_type(), new_leaf_hash)?;
        let new_leaf_ptr = TriePtr::new(TrieNodeID::Leaf.to_u8(), new_leaf_chr, new_leaf_slot);

        let mut node4 = TrieNode4::new(&node4_path);
        assert!(node4.insert(&cur_leaf_new_ptr));
        assert!(node4.insert(&new_leaf_ptr));

        let node4_hash = match mode {
            TrieHashCalculationMode::Immediate => get_node_hash(
                &node4,
                &[
                    cur_leaf_hash,
                    new_leaf_hash,
                    TrieHash::from_empty_data(),
                    TrieHash::from_empty_data(),
                ],
            ),
            TrieHashCalculationMode::Deferred => TrieHash::from_empty_data(),
        };
        let node4_slot = storage.append_nodetype(&node4.as_trie_node_type(), node4_hash)?;

        let ret = TriePtr::new(TrieNodeID::Node4.to_u8(), node4_chr, node4_slot);
        let checkpoint = storage.cur_checkpoint();
        c.retarget(&node4.as_trie_node_type(), &ret, &checkpoint);
        trace!("promote_leaf_to_node4: {:?} at {:?}", &node4, &ret);
        Ok(ret)
    }

    fn node_has_space(chr: u8, children: &[TriePtr]) -> bool {
        children
            .iter()
            .any(|p| p.is_empty() || p.chr() == chr)
    }

    /// Attach a leaf as a child of the cursor's node if there is a free
    /// slot.  Returns `None` when the node is full.
    fn try_attach_leaf<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &TrieCursor,
        value: &MarfValue,
        node: &mut TrieNodeType,
        mode: TrieHashCalculationMode,
    ) -> Result<Option<TriePtr>> {
        assert!(c.eonp(node));
        let chr = c.chr().expect("BUG: attaching a leaf before any walk step");
        if !Trie::node_has_space(chr, node.ptrs()) {
            return Ok(None);
        }

        let (leaf_ptr, _) = Trie::append_leaf(storage, c, value)?;
        assert!(node.insert(&leaf_ptr));

        let node_hash = Trie::node_hash_for_mode(storage, node, mode)?;
        storage.write_nodetype(c.ptr().ptr(), node, node_hash)?;
        Ok(Some(c.ptr()))
    }

    /// Attach a leaf, promoting the node to the next fan-out when it is
    /// full.  The promoted node is appended and the old slot is leaked;
    /// the spine sweep patches the parent with the new pointer.
    fn insert_leaf<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &mut TrieCursor,
        value: &MarfValue,
        node: &mut TrieNodeType,
        mode: TrieHashCalculationMode,
    ) -> Result<TriePtr> {
        assert!(c.eonp(node));
        if let Some(ptr) = Trie::try_attach_leaf(storage, c, value, node, mode)? {
            return Ok(ptr);
        }

        let node_ptr = c.ptr();
        let mut promoted = match node {
            TrieNodeType::Node4(ref data) => {
                TrieNodeType::Node16(TrieNode16::from_node4(data))
            }
            TrieNodeType::Node16(ref data) => {
                TrieNodeType::Node48(TrieNode48::from_node16(data))
            }
            TrieNodeType::Node48(ref data) => {
                TrieNodeType::Node256(TrieNode256::from_node48(data))
            }
            // a Node256 always has a slot for every chr
            TrieNodeType::Node256(_) => return Err(Error::CapacityOverflow),
            TrieNodeType::Leaf(_) => {
                return Err(Error::CorruptNode(
                    "tried to insert a child into a leaf".to_string(),
                ));
            }
        };

        let (leaf_ptr, _) = Trie::append_leaf(storage, c, value)?;
        assert!(promoted.insert(&leaf_ptr));

        let promoted_hash = Trie::node_hash_for_mode(storage, &promoted, mode)?;
        let promoted_slot = storage.append_nodetype(&promoted, promoted_hash)?;
        let ret = TriePtr::new(promoted.id(), node_ptr.chr(), promoted_slot);

        let checkpoint = storage.cur_checkpoint();
        c.retarget(&promoted, &ret, &checkpoint);
        trace!("insert_leaf: promoted to {:?} at {:?}", &promoted, &ret);
        Ok(ret)
    }

    /// Break the node's compressed path at the divergence point: a new
    /// Node4 takes the shared prefix and the old slot, pointing at the
    /// new leaf and at the old node (moved to a fresh slot with the path
    /// segment past the break).
    fn splice_leaf<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &mut TrieCursor,
        value: &MarfValue,
        node: &mut TrieNodeType,
        mode: TrieHashCalculationMode,
    ) -> Result<TriePtr> {
        assert!(!c.eop());
        assert!(!c.eonp(node));
        if node.is_leaf() {
            return Err(Error::CorruptNode(
                "tried to splice into a leaf".to_string(),
            ));
        }

        let node_path = node.path_bytes().to_vec();
        let shared_path_prefix = node_path[0..c.ntell()].to_vec();
        let new_cur_node_path = node_path[c.ntell() + 1..].to_vec();
        let new_cur_node_chr = node_path[c.ntell()];

        let leaf_chr = c.path.as_bytes()[c.tell()];
        let leaf = TrieLeaf::new(&c.path.as_bytes()[c.tell() + 1..], value);
        let leaf_hash = get_leaf_hash(&leaf);
        let leaf_slot = storage.append_nodetype(&leaf.as_trie_node_type(), leaf_hash)?;
        let leaf_ptr = TriePtr::new(TrieNodeID::Leaf.to_u8(), leaf_chr, leaf_slot);

        // move the old node to a fresh slot with the trimmed path
        let cur_node_cur_ptr = c.ptr();
        let old_children_hashes = match mode {
            TrieHashCalculationMode::Immediate => Trie::get_children_hashes(storage, node)?,
            TrieHashCalculationMode::Deferred => vec![],
        };
        node.set_path(new_cur_node_path);
        let new_cur_node_hash = match mode {
            TrieHashCalculationMode::Immediate => {
                get_nodetype_hash(node, &old_children_hashes)
            }
            TrieHashCalculationMode::Deferred => TrieHash::from_empty_data(),
        };
        let new_cur_node_slot = storage.append_nodetype(node, new_cur_node_hash)?;
        let new_cur_node_ptr =
            TriePtr::new(cur_node_cur_ptr.id(), new_cur_node_chr, new_cur_node_slot);

        // node-X': shared prefix, two children.  Always born a Node4 --
        // its fan-out is the divergence, not the old node's occupancy,
        // so its shape (and hash) cannot depend on insertion order.
        let mut new_node = TrieNodeType::Node4(TrieNode4::new(&shared_path_prefix));
        assert!(new_node.insert(&leaf_ptr));
        assert!(new_node.insert(&new_cur_node_ptr));

        let new_node_hash = match mode {
            TrieHashCalculationMode::Immediate => {
                let hashes = Trie::get_children_hashes(storage, &new_node)?;
                get_nodetype_hash(&new_node, &hashes)
            }
            TrieHashCalculationMode::Deferred => TrieHash::from_empty_data(),
        };

        // node-X' takes node-X's old slot, so the parent's pointer keeps
        // its offset; only the id may change via the spine sweep
        storage.write_nodetype(cur_node_cur_ptr.ptr(), &new_node, new_node_hash)?;

        let ret = TriePtr::new(new_node.id(), cur_node_cur_ptr.chr(), cur_node_cur_ptr.ptr());
        let checkpoint = storage.cur_checkpoint();
        c.retarget(&new_node, &ret, &checkpoint);
        trace!("splice_leaf: node-X' at {:?}", &ret);
        Ok(ret)
    }

    /// Add a value at the cursor's stopping point.  The cursor must have
    /// been produced by the copy-on-write walk, so every node on the
    /// spine is local to the uncommitted trie.
    pub fn add_value<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &mut TrieCursor,
        value: &MarfValue,
        mode: TrieHashCalculationMode,
    ) -> Result<TriePtr> {
        let mut node = c.node().ok_or_else(|| {
            Error::CorruptNode("cursor stopped before visiting any node".to_string())
        })?;

        if c.eop() {
            match node {
                TrieNodeType::Leaf(_) => Trie::replace_leaf(storage, c, value),
                _ => Trie::insert_leaf(storage, c, value, &mut node, mode),
            }
        } else if c.eonp(&node) {
            Trie::insert_leaf(storage, c, value, &mut node, mode)
        } else {
            match node {
                TrieNodeType::Leaf(ref data) => {
                    Trie::promote_leaf_to_node4(storage, c, &data.clone(), value, mode)
                }
                _ => Trie::splice_leaf(storage, c, value, &mut node, mode),
            }
        }
    }

    /// Sweep the walked spine bottom-up: patch each parent's pointer to
    /// the (possibly moved or promoted) child below it, and in immediate
    /// mode recompute each node's hash.  Pointers recording a checkpoint
    /// crossing are skipped; the copied node below them carries the
    /// change.
    ///
    /// This must run after every `add_value` in both hash modes: the
    /// pointer patching is structural, only the hashing is mode-gated.
    pub fn update_root_hash<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        c: &TrieCursor,
        mode: TrieHashCalculationMode,
    ) -> Result<()> {
        assert!(!c.node_ptrs.is_empty());

        let mut ptrs = c.node_ptrs.clone();
        let mut child_ptr = ptrs.pop().expect("BUG: empty cursor spine");
        child_ptr.id = clear_backptr(child_ptr.id);

        while let Some(ptr) = ptrs.pop() {
            if is_backptr(ptr.id()) {
                // crossing marker; the node it names was re-recorded with
                // its local pointer just below
                continue;
            }

            let (mut node, _) = storage.read_nodetype(&ptr)?;
            if node.is_leaf() {
                return Err(Error::CorruptNode(
                    "leaf as intermediate node on walked spine".to_string(),
                ));
            }
            if !node.replace(&child_ptr) {
                return Err(Error::CorruptNode(format!(
                    "no child 0x{:02x} to patch in spine node",
                    child_ptr.chr()
                )));
            }

            let hash = Trie::node_hash_for_mode(storage, &node, mode)?;
            storage.write_nodetype(ptr.ptr(), &node, hash)?;

            child_ptr = TriePtr::new(node.id(), ptr.chr(), ptr.ptr());
        }

        // the sweep must end at the root
        debug_assert_eq!(child_ptr.ptr(), storage.root_ptr());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::TrieCache;
    use crate::memory::MemoryTrieDb;
    use crate::{CheckpointId, TriePath};

    fn ram_storage() -> TrieStorage<MemoryTrieDb> {
        let mut storage = TrieStorage::new(MemoryTrieDb::new(), TrieCache::default());
        let cp = CheckpointId::from_data(b"test");
        storage.extend_uncommitted(cp, CheckpointId::sentinel());
        let root = TrieNode256::new(&[]).as_trie_node_type();
        let hash = get_node_hash(
            &TrieNode256::new(&[]),
            &[TrieHash::from_empty_data(); 256],
        );
        storage.write_nodetype(0, &root, hash).unwrap();
        storage
    }

    fn insert(storage: &mut TrieStorage<MemoryTrieDb>, path: &TriePath, value: &MarfValue) {
        let cp = storage.cur_checkpoint();
        let mut c = TrieCursor::new(path, storage.root_ptr());
        let (mut node, _) = storage.read_root().unwrap();
        loop {
            match c.walk(&node, &cp) {
                Ok(Some(ptr)) => {
                    node = storage.read_nodetype(&ptr).unwrap().0;
                }
                Ok(None) | Err(_) => break,
            }
        }
        Trie::add_value(storage, &mut c, value, TrieHashCalculationMode::Immediate).unwrap();
        Trie::update_root_hash(storage, &c, TrieHashCalculationMode::Immediate).unwrap();
    }

    fn lookup(storage: &mut TrieStorage<MemoryTrieDb>, path: &TriePath) -> Option<MarfValue> {
        let cp = storage.cur_checkpoint();
        let mut c = TrieCursor::new(path, storage.root_ptr());
        let (mut node, _) = storage.read_root().unwrap();
        loop {
            match c.walk(&node, &cp) {
                Ok(Some(ptr)) => {
                    node = storage.read_nodetype(&ptr).unwrap().0;
                }
                Ok(None) => {
                    if let TrieNodeType::Leaf(leaf) = node {
                        return c.eop().then(|| leaf.data);
                    }
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    #[test]
    fn insert_promote_splice_lookup() {
        let mut storage = ram_storage();

        // paths engineered to collide on prefixes: same first byte, then
        // diverge at different depths
        let mut paths = vec![];
        for i in 0..40u8 {
            let mut p = [0u8; 32];
            p[0] = 0xaa;
            p[1] = i / 8;
            p[2] = i;
            paths.push(TriePath(p));
        }

        for (i, path) in paths.iter().enumerate() {
            insert(&mut storage, path, &MarfValue::from_value(&[i as u8]));
        }
        for (i, path) in paths.iter().enumerate() {
            assert_eq!(
                lookup(&mut storage, path),
                Some(MarfValue::from_value(&[i as u8]))
            );
        }

        // untouched path is absent
        let mut other = [0u8; 32];
        other[0] = 0xbb;
        assert_eq!(lookup(&mut storage, &TriePath(other)), None);
    }

    #[test]
    fn splice_order_does_not_change_root_hash() {
        // five paths share bytes 0-1 and fan out at byte 2, enough to
        // promote the shared node past Node4; a sixth diverges at byte 1,
        // splicing inside the shared node's compressed path.  Whether the
        // splice happens before or after the promotion must not show up
        // in the root hash.
        let mut colliders = vec![];
        for i in 0..5u8 {
            let mut p = [0u8; 32];
            p[0] = 0xaa;
            p[1] = 0x55;
            p[2] = 0x10 + i;
            colliders.push(TriePath(p));
        }
        let mut d = [0u8; 32];
        d[0] = 0xaa;
        d[1] = 0x77;
        let divergent = TriePath(d);

        // splice into the already-promoted Node16 / splice into a Node4 /
        // no splice at all (the divergence node is built by promotion)
        let mut splice_node16 = colliders.clone();
        splice_node16.push(divergent);
        let splice_node4 = vec![
            colliders[0], colliders[1], divergent, colliders[2], colliders[3], colliders[4],
        ];
        let no_splice: Vec<_> = splice_node16.iter().rev().cloned().collect();

        let mut roots = vec![];
        for order in [&splice_node16, &splice_node4, &no_splice] {
            let mut storage = ram_storage();
            for path in order.iter() {
                insert(&mut storage, path, &MarfValue::from_value(&[path.0[2]]));
            }
            for path in order.iter() {
                assert!(lookup(&mut storage, path).is_some());
            }
            roots.push(storage.read_root().unwrap().1);
        }
        assert_eq!(roots[0], roots[1]);
        assert_eq!(roots[0], roots[2]);
    }

    #[test]
    fn replace_keeps_shape_and_updates_value() {
        let mut storage = ram_storage();
        let path = TriePath([3u8; 32]);
        insert(&mut storage, &path, &MarfValue::from_value(b"one"));
        let size_before = storage.uncommitted().unwrap().ram.size();

        insert(&mut storage, &path, &MarfValue::from_value(b"two"));
        assert_eq!(
            lookup(&mut storage, &path),
            Some(MarfValue::from_value(b"two"))
        );
        // replacement rewrites the leaf in place
        assert_eq!(storage.uncommitted().unwrap().ram.size(), size_before);
    }

    #[test]
    fn root_hash_tracks_content() {
        let mut storage = ram_storage();
        let empty_hash = storage.read_root().unwrap().1;

        let path = TriePath([9u8; 32]);
        insert(&mut storage, &path, &MarfValue::from_value(b"v"));
        let h1 = storage.read_root().unwrap().1;
        assert_ne!(h1, empty_hash);

        insert(&mut storage, &path, &MarfValue::from_value(b"w"));
        let h2 = storage.read_root().unwrap().1;
        assert_ne!(h2, h1);

        // writing the same value back is idempotent on the root hash
        insert(&mut storage, &path, &MarfValue::from_value(b"w"));
        assert_eq!(storage.read_root().unwrap().1, h2);
    }
}

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

//! Hash and byte-frame helpers shared by the storage, trie, and proof
//! layers.
//!
//! A node's hash preimage is its id byte (so leaf and internal preimages
//! are tag-separated), its length-prefixed compressed path, and one
//! (id, chr, hash) contribution per child slot in canonical order:
//! occupied slots sorted by branch byte, then the free slots.  Sorting
//! makes the hash independent of slot assignment order, so the same
//! final key set always seals to the same root no matter the insertion
//! order.  Slot offsets and store-local checkpoint indices never enter a
//! preimage.  A sealed checkpoint root additionally folds in the
//! parent's id and sealed root, committing the whole ancestor lineage.

use sha2::{Digest, Sha512_256 as TrieHasher};

use crate::node::{TrieLeaf, TrieNode, TrieNodeType, TriePtr};
use crate::{CheckpointId, Error, Result, TrieHash, TRIEHASH_ENCODED_SIZE};

/// Leading tag byte of a sealed-root preimage.  Distinct from every node
/// id, so a sealed root can never collide with a node hash preimage.
pub const ROOT_SEAL_TAG: u8 = 0xff;

fn hash_node_with_children(
    id: u8,
    path: &[u8],
    ptrs: &[TriePtr],
    child_hashes: &[TrieHash],
) -> TrieHash {
    assert_eq!(ptrs.len(), child_hashes.len());

    let mut hasher = TrieHasher::new();
    hasher.update([id]);
    hasher.update([path.len() as u8]);
    hasher.update(path);

    let mut live: Vec<(&TriePtr, &TrieHash)> = ptrs
        .iter()
        .zip(child_hashes.iter())
        .filter(|(ptr, _)| !ptr.is_empty())
        .collect();
    live.sort_by_key(|(ptr, _)| ptr.chr());
    let mut free = vec![];
    for (ptr, hash) in ptrs.iter().zip(child_hashes.iter()) {
        if ptr.is_empty() {
            free.push((ptr, hash));
        }
    }
    for (ptr, hash) in live.into_iter().chain(free) {
        hasher.update([ptr.id(), ptr.chr()]);
        hasher.update(hash.as_bytes());
    }

    let mut out = [0u8; TRIEHASH_ENCODED_SIZE];
    out.copy_from_slice(hasher.finalize().as_slice());
    TrieHash(out)
}

/// Hash an internal node given its children's hash contributions, one
/// per slot.
pub fn get_node_hash<T: TrieNode>(node: &T, child_hashes: &[TrieHash]) -> TrieHash {
    hash_node_with_children(node.id(), node.path(), node.ptrs(), child_hashes)
}

/// `get_node_hash` over the tagged union.
pub fn get_nodetype_hash(node: &TrieNodeType, child_hashes: &[TrieHash]) -> TrieHash {
    match node {
        TrieNodeType::Leaf(leaf) => get_leaf_hash(leaf),
        _ => hash_node_with_children(node.id(), node.path_bytes(), node.ptrs(), child_hashes),
    }
}

/// Leaves have no children; their hash is just the tagged storage form.
pub fn get_leaf_hash(leaf: &TrieLeaf) -> TrieHash {
    let mut buf = vec![];
    leaf.to_bytes(&mut buf);
    let mut hasher = TrieHasher::new();
    hasher.update(&buf);
    let mut out = [0u8; TRIEHASH_ENCODED_SIZE];
    out.copy_from_slice(hasher.finalize().as_slice());
    TrieHash(out)
}

/// Fold a trie's root node hash with its parent linkage into the sealed
/// root published for the checkpoint.
pub fn seal_root_hash(
    root_node_hash: &TrieHash,
    parent: &CheckpointId,
    parent_sealed: &TrieHash,
) -> TrieHash {
    let mut hasher = TrieHasher::new();
    hasher.update([ROOT_SEAL_TAG]);
    hasher.update(root_node_hash.as_bytes());
    hasher.update(parent.as_bytes());
    hasher.update(parent_sealed.as_bytes());

    let mut out = [0u8; TRIEHASH_ENCODED_SIZE];
    out.copy_from_slice(hasher.finalize().as_slice());
    TrieHash(out)
}

/// Serialize a node record as it is handed to the backing store:
/// the node's hash followed by its storage bytes.
pub fn write_node_frame(node: &TrieNodeType, hash: &TrieHash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRIEHASH_ENCODED_SIZE + 64);
    buf.extend_from_slice(hash.as_bytes());
    node.to_bytes(&mut buf);
    buf
}

/// Parse a node record read back from the backing store.
pub fn read_node_frame(bytes: &[u8]) -> Result<(TrieNodeType, TrieHash)> {
    if bytes.len() < TRIEHASH_ENCODED_SIZE + 1 {
        return Err(Error::CorruptNode("truncated node record".to_string()));
    }
    let hash = TrieHash::from_bytes(&bytes[0..TRIEHASH_ENCODED_SIZE])
        .ok_or_else(|| Error::CorruptNode("bad node hash".to_string()))?;
    let mut cursor = &bytes[TRIEHASH_ENCODED_SIZE..];
    let node = TrieNodeType::from_bytes(&mut cursor)?;
    Ok((node, hash))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{TrieNode4, TrieNodeID, TriePtr};
    use crate::MarfValue;

    #[test]
    fn leaf_and_node_hashes_are_tag_separated() {
        // a leaf and a node with the same tail bytes must hash apart,
        // because the id byte leads the preimage
        let leaf = TrieLeaf::new(&[], &MarfValue::from_value(b"x"));
        let node = TrieNode4::new(&[]);
        assert_ne!(
            get_leaf_hash(&leaf),
            get_node_hash(&node, &[TrieHash::from_empty_data(); 4])
        );
    }

    #[test]
    fn node_hash_covers_children() {
        let mut node = TrieNode4::new(&[3]);
        node.insert(&TriePtr::new(TrieNodeID::Leaf.to_u8(), 1, 4));

        let empty = TrieHash::from_empty_data();
        let h1 = get_node_hash(&node, &[TrieHash::from_data(b"a"), empty, empty, empty]);
        let h2 = get_node_hash(&node, &[TrieHash::from_data(b"b"), empty, empty, empty]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn node_hash_ignores_slot_order() {
        // the same children land in different slots depending on insert
        // order; the hash must not see the difference
        let empty = TrieHash::from_empty_data();
        let (ha, hb) = (TrieHash::from_data(b"a"), TrieHash::from_data(b"b"));

        let mut x = TrieNode4::new(&[7]);
        x.insert(&TriePtr::new(TrieNodeID::Leaf.to_u8(), 1, 10));
        x.insert(&TriePtr::new(TrieNodeID::Leaf.to_u8(), 2, 11));
        let mut y = TrieNode4::new(&[7]);
        y.insert(&TriePtr::new(TrieNodeID::Leaf.to_u8(), 2, 99));
        y.insert(&TriePtr::new(TrieNodeID::Leaf.to_u8(), 1, 98));

        assert_eq!(
            get_node_hash(&x, &[ha, hb, empty, empty]),
            get_node_hash(&y, &[hb, ha, empty, empty])
        );
        assert_ne!(
            get_node_hash(&x, &[ha, hb, empty, empty]),
            get_node_hash(&x, &[hb, ha, empty, empty])
        );
    }

    #[test]
    fn seal_commits_lineage() {
        let root = TrieHash::from_data(b"root");
        let a = CheckpointId::from_data(b"a");
        let b = CheckpointId::from_data(b"b");
        let anchor = TrieHash::from_empty_data();
        assert_ne!(
            seal_root_hash(&root, &a, &anchor),
            seal_root_hash(&root, &b, &anchor)
        );
        assert_ne!(
            seal_root_hash(&root, &a, &anchor),
            seal_root_hash(&root, &a, &TrieHash::from_data(b"other"))
        );
    }

    #[test]
    fn node_frame_roundtrip() {
        let leaf = TrieLeaf::new(&[1, 2, 3], &MarfValue::from_value(b"v"));
        let hash = get_leaf_hash(&leaf);
        let node = leaf.as_trie_node_type();
        let frame = write_node_frame(&node, &hash);
        let (node2, hash2) = read_node_frame(&frame).unwrap();
        assert_eq!(node2, node);
        assert_eq!(hash2, hash);
    }
}

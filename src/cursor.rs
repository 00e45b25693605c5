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

//! Path-walking state machine.
//!
//! A `TrieCursor` consumes a 32-byte path one node at a time, recording
//! every node, pointer, and checkpoint it visits.  The record is what the
//! write path uses to splice new nodes and re-hash the walked spine, and
//! what the proof engine turns into sibling-hash sets.

use std::fmt;

use log::trace;

use crate::node::{is_backptr, set_backptr, TrieNodeID, TrieNodeType, TriePtr};
use crate::{CheckpointId, TriePath};

/// Why a walk step could not follow the path any further.  Only
/// `BackptrEncountered` is resumable (by crossing into the ancestor
/// trie); the other two mean the key is absent from this trie.
#[derive(Clone, PartialEq)]
pub enum CursorError {
    /// The node's compressed path prefix disagrees with the search path.
    PathDiverged,
    /// The node has no child for the next path byte.
    ChrNotFound,
    /// The child pointer crosses into an ancestor checkpoint.
    BackptrEncountered(TriePtr),
}

impl fmt::Debug for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CursorError::PathDiverged => write!(f, "PathDiverged"),
            CursorError::ChrNotFound => write!(f, "ChrNotFound"),
            CursorError::BackptrEncountered(ptr) => write!(f, "BackptrEncountered({:?})", ptr),
        }
    }
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CursorError::PathDiverged => write!(f, "path diverged"),
            CursorError::ChrNotFound => write!(f, "node has no matching child"),
            CursorError::BackptrEncountered(_) => write!(f, "back-pointer encountered"),
        }
    }
}

impl std::error::Error for CursorError {}

#[derive(Debug, Clone)]
pub struct TrieCursor {
    /// path being walked
    pub path: TriePath,
    /// offset into `path`
    pub index: usize,
    /// offset into the current node's compressed path prefix
    pub node_path_index: usize,
    /// nodes visited; `nodes[i]` is the node `node_ptrs[i]` points to
    pub nodes: Vec<TrieNodeType>,
    /// pointer branches taken.  A pointer with the back-pointer bit set
    /// records a crossing step and is skipped when re-hashing the spine.
    pub node_ptrs: Vec<TriePtr>,
    /// `checkpoints[i]` is the trie that holds `node_ptrs[i+1]`; the
    /// root pointer's trie is the walk's target checkpoint.
    pub checkpoints: Vec<CheckpointId>,
}

impl TrieCursor {
    pub fn new(path: &TriePath, root_ptr: u32) -> TrieCursor {
        TrieCursor {
            path: *path,
            index: 0,
            node_path_index: 0,
            nodes: vec![],
            node_ptrs: vec![TriePtr::new(TrieNodeID::Node256.to_u8(), 0, root_ptr)],
            checkpoints: vec![],
        }
    }

    /// The path byte consumed by the last child-pointer step.
    pub fn chr(&self) -> Option<u8> {
        if self.index > 0 && self.index <= self.path.len() {
            Some(self.path.as_bytes()[self.index - 1])
        } else {
            None
        }
    }

    /// Offset in the search path.
    pub fn tell(&self) -> usize {
        self.index
    }

    /// Offset in the current node's compressed path.
    pub fn ntell(&self) -> usize {
        self.node_path_index
    }

    /// End of the search path?
    pub fn eop(&self) -> bool {
        self.index == self.path.len()
    }

    /// End of the current node's compressed path?
    pub fn eonp(&self, node: &TrieNodeType) -> bool {
        self.node_path_index == node.path_bytes().len()
    }

    /// Last pointer pushed.  Always present by construction.
    pub fn ptr(&self) -> TriePtr {
        self.node_ptrs
            .last()
            .copied()
            .expect("cursor has no pointers")
    }

    /// Last node visited.
    pub fn node(&self) -> Option<TrieNodeType> {
        self.nodes.last().cloned()
    }

    /// Walk one node: consume its compressed prefix, then follow the
    /// child pointer for the next path byte.  `Ok(None)` means the path
    /// was fully consumed at this node.
    ///
    /// The caller must have verified that the node's prefix fits in the
    /// remaining path (the structural-corruption check).
    pub fn walk(
        &mut self,
        node: &TrieNodeType,
        checkpoint: &CheckpointId,
    ) -> Result<Option<TriePtr>, CursorError> {
        trace!("cursor: walk {:?} in {}", node, checkpoint);
        if self.index >= self.path.len() {
            return Ok(None);
        }

        let node_path = node.path_bytes().to_vec();
        let path_bytes = *self.path.as_bytes();
        debug_assert!(self.index + node_path.len() <= self.path.len());

        self.nodes.push(node.clone());
        self.node_path_index = 0;

        for nibble in node_path.iter() {
            if *nibble != path_bytes[self.index] {
                trace!(
                    "cursor: diverged at index {} node_path_index {}",
                    self.index,
                    self.node_path_index
                );
                return Err(CursorError::PathDiverged);
            }
            self.index += 1;
            self.node_path_index += 1;
        }

        if self.index >= self.path.len() {
            // prefix consumed the rest of the path; terminal node
            return Ok(None);
        }

        let chr = path_bytes[self.index];
        self.index += 1;
        match node.walk(chr) {
            None => Err(CursorError::ChrNotFound),
            Some(ptr) => {
                if is_backptr(ptr.id()) {
                    Err(CursorError::BackptrEncountered(ptr))
                } else {
                    self.walk_backptr_finish(&ptr, checkpoint);
                    Ok(Some(ptr))
                }
            }
        }
    }

    /// Record the crossing step itself: the foreign node at its location
    /// in the ancestor trie, marked with the back-pointer bit so the
    /// spine re-hash skips it.
    pub fn walk_backptr_step_backptr(
        &mut self,
        next_node: &TrieNodeType,
        ptr: &TriePtr,
        checkpoint: &CheckpointId,
    ) {
        let backptr = TriePtr {
            id: set_backptr(ptr.id()),
            ..*ptr
        };
        self.node_ptrs.push(backptr);
        self.checkpoints.push(*checkpoint);
        self.nodes.push(next_node.clone());
    }

    /// Record where the step actually landed: a resolvable (non-back)
    /// pointer and the trie that holds it.
    pub fn walk_backptr_finish(&mut self, ptr: &TriePtr, checkpoint: &CheckpointId) {
        assert!(!is_backptr(ptr.id()));
        self.node_ptrs.push(*ptr);
        self.checkpoints.push(*checkpoint);
    }

    /// Replace the last-visited node and pointer.  Used after a splice
    /// or promotion rewrites the node the cursor stopped on.
    pub fn retarget(&mut self, node: &TrieNodeType, ptr: &TriePtr, checkpoint: &CheckpointId) {
        self.nodes.pop();
        self.node_ptrs.pop();
        self.checkpoints.pop();

        self.nodes.push(node.clone());
        self.node_ptrs.push(*ptr);
        self.checkpoints.push(*checkpoint);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{TrieLeaf, TrieNode256, TrieNode4, TrieNode};
    use crate::MarfValue;

    fn cp(byte: u8) -> CheckpointId {
        CheckpointId([byte; 32])
    }

    #[test]
    fn walk_consumes_prefix_and_branch() {
        let path = TriePath([7u8; 32]);
        let mut root = TrieNode256::new(&[]);
        root.insert(&TriePtr::new(TrieNodeID::Node4.to_u8(), 7, 1));
        let mut c = TrieCursor::new(&path, 0);

        let ptr = c
            .walk(&TrieNodeType::Node256(root), &cp(1))
            .unwrap()
            .unwrap();
        assert_eq!(ptr.ptr(), 1);
        assert_eq!(c.tell(), 1);
        assert_eq!(c.chr(), Some(7));

        // node with a 3-byte prefix consumes 3 + 1 bytes
        let mut node = TrieNode4::new(&[7, 7, 7]);
        node.insert(&TriePtr::new(TrieNodeID::Leaf.to_u8(), 7, 2));
        let ptr = c.walk(&TrieNodeType::Node4(node), &cp(1)).unwrap().unwrap();
        assert_eq!(ptr.ptr(), 2);
        assert_eq!(c.tell(), 5);
    }

    #[test]
    fn walk_classifies_outcomes() {
        let path = TriePath([7u8; 32]);

        // divergent prefix
        let node = TrieNode4::new(&[7, 8]);
        let mut c = TrieCursor::new(&path, 0);
        assert_eq!(
            c.walk(&TrieNodeType::Node4(node), &cp(1)),
            Err(CursorError::PathDiverged)
        );
        assert_eq!(c.ntell(), 1);

        // no child for the next byte
        let node = TrieNode4::new(&[7]);
        let mut c = TrieCursor::new(&path, 0);
        assert_eq!(
            c.walk(&TrieNodeType::Node4(node), &cp(1)),
            Err(CursorError::ChrNotFound)
        );
        assert_eq!(c.chr(), Some(7));

        // back-pointer child
        let mut node = TrieNode4::new(&[7]);
        let mut backptr = TriePtr::new(set_backptr(TrieNodeID::Leaf.to_u8()), 7, 9);
        backptr.back_block = 4;
        node.ptrs[0] = backptr;
        let mut c = TrieCursor::new(&path, 0);
        assert_eq!(
            c.walk(&TrieNodeType::Node4(node), &cp(1)),
            Err(CursorError::BackptrEncountered(backptr))
        );
    }

    #[test]
    fn leaf_suffix_terminates_path() {
        let path = TriePath([7u8; 32]);
        let mut root = TrieNode256::new(&[]);
        root.insert(&TriePtr::new(TrieNodeID::Leaf.to_u8(), 7, 1));
        let leaf = TrieLeaf::new(&[7u8; 31], &MarfValue::from_value(b"v"));

        let mut c = TrieCursor::new(&path, 0);
        c.walk(&TrieNodeType::Node256(root), &cp(1))
            .unwrap()
            .unwrap();
        // leaf's 31-byte suffix consumes the rest of the path
        assert_eq!(c.walk(&TrieNodeType::Leaf(leaf.clone()), &cp(1)), Ok(None));
        assert!(c.eop());
        assert!(c.eonp(&TrieNodeType::Leaf(leaf)));
    }
}

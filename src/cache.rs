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

//! Node caching.
//!
//! Committed tries are immutable, so cache entries never need
//! invalidation: a `(checkpoint index, pointer)` address refers to the
//! same bytes forever.  The checkpoint id maps grow at the rate of new
//! checkpoints and are never evicted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::error;

use crate::node::{is_backptr, TrieNodeID, TrieNodeType, TriePtr};
use crate::{CheckpointId, TrieHash};

/// Fully-qualified address of a committed trie node: store index of the
/// checkpoint plus the pointer within its trie.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct TrieNodeAddr(u32, TriePtr);

/// Cache state shared by all strategies.
pub struct TrieCacheState {
    /// store index -> checkpoint id; grows with the forest, never evicted
    checkpoint_id_cache: HashMap<u32, CheckpointId>,
    /// checkpoint id -> store index
    checkpoint_index_cache: HashMap<CheckpointId, u32>,
    /// cached nodes
    node_cache: HashMap<TrieNodeAddr, TrieNodeType>,
    /// cached node hashes
    hash_cache: HashMap<TrieNodeAddr, TrieHash>,
}

impl TrieCacheState {
    pub fn new() -> TrieCacheState {
        TrieCacheState {
            checkpoint_id_cache: HashMap::new(),
            checkpoint_index_cache: HashMap::new(),
            node_cache: HashMap::new(),
            hash_cache: HashMap::new(),
        }
    }

    pub fn load_node(&self, index: u32, ptr: &TriePtr) -> Option<TrieNodeType> {
        self.node_cache.get(&TrieNodeAddr(index, *ptr)).cloned()
    }

    pub fn load_node_hash(&self, index: u32, ptr: &TriePtr) -> Option<TrieHash> {
        self.hash_cache.get(&TrieNodeAddr(index, *ptr)).cloned()
    }

    pub fn store_node(&mut self, index: u32, ptr: TriePtr, node: TrieNodeType) {
        self.node_cache.insert(TrieNodeAddr(index, ptr), node);
    }

    pub fn store_node_hash(&mut self, index: u32, ptr: TriePtr, hash: TrieHash) {
        self.hash_cache.insert(TrieNodeAddr(index, ptr), hash);
    }

    /// Cached id for a store index, or fetch-and-cache via `lookup`.
    pub fn get_checkpoint_id_caching<E, F: FnOnce(u32) -> Result<CheckpointId, E>>(
        &mut self,
        index: u32,
        lookup: F,
    ) -> Result<&CheckpointId, E> {
        match self.checkpoint_id_cache.entry(index) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),
            Entry::Vacant(vacant) => {
                let id = lookup(index)?;
                let id_ref = vacant.insert(id);
                self.checkpoint_index_cache.insert(id, index);
                Ok(id_ref)
            }
        }
    }

    pub fn store_checkpoint_id(&mut self, index: u32, id: CheckpointId) {
        self.checkpoint_index_cache.insert(id, index);
        self.checkpoint_id_cache.insert(index, id);
    }

    pub fn load_checkpoint_index(&self, id: &CheckpointId) -> Option<u32> {
        self.checkpoint_index_cache.get(id).copied()
    }
}

/// Node cache strategies.
pub enum TrieCache {
    /// Cache nothing (id maps only).
    Noop(TrieCacheState),
    /// Cache every node in RAM.
    Everything(TrieCacheState),
    /// Cache only Node256s, which sit near tries' roots and soak up most
    /// repeated reads.
    Node256(TrieCacheState),
}

impl TrieCache {
    /// Default strategy, overridable via `MARF_CACHE_STRATEGY`.
    pub fn default() -> TrieCache {
        if let Ok(strategy) = std::env::var("MARF_CACHE_STRATEGY") {
            TrieCache::new(&strategy)
        } else {
            TrieCache::Noop(TrieCacheState::new())
        }
    }

    /// `strategy` must be one of "noop", "everything", or "node256".
    pub fn new(strategy: &str) -> TrieCache {
        match strategy {
            "noop" => TrieCache::Noop(TrieCacheState::new()),
            "everything" => TrieCache::Everything(TrieCacheState::new()),
            "node256" => TrieCache::Node256(TrieCacheState::new()),
            _ => {
                error!(
                    "Unsupported node cache strategy '{}'; falling back to noop",
                    strategy
                );
                TrieCache::Noop(TrieCacheState::new())
            }
        }
    }

    fn state_ref(&self) -> &TrieCacheState {
        match self {
            TrieCache::Noop(state) | TrieCache::Everything(state) | TrieCache::Node256(state) => {
                state
            }
        }
    }

    fn state_mut(&mut self) -> &mut TrieCacheState {
        match self {
            TrieCache::Noop(state) | TrieCache::Everything(state) | TrieCache::Node256(state) => {
                state
            }
        }
    }

    pub fn load_node(&self, index: u32, ptr: &TriePtr) -> Option<TrieNodeType> {
        if let TrieCache::Noop(_) = self {
            None
        } else {
            self.state_ref().load_node(index, ptr)
        }
    }

    pub fn load_node_hash(&self, index: u32, ptr: &TriePtr) -> Option<TrieHash> {
        if let TrieCache::Noop(_) = self {
            None
        } else {
            self.state_ref().load_node_hash(index, ptr)
        }
    }

    /// `ptr` must not be a back-pointer: cache addresses are always the
    /// node's home trie.
    pub fn store_node_and_hash(&mut self, index: u32, ptr: TriePtr, node: TrieNodeType, hash: TrieHash) {
        assert!(!is_backptr(ptr.id()));
        match self {
            TrieCache::Noop(_) => {}
            TrieCache::Everything(state) => {
                state.store_node_hash(index, ptr, hash);
                state.store_node(index, ptr, node);
            }
            TrieCache::Node256(state) => {
                if ptr.id() == TrieNodeID::Node256.to_u8() {
                    state.store_node_hash(index, ptr, hash);
                    state.store_node(index, ptr, node);
                }
            }
        }
    }

    pub fn get_checkpoint_id_caching<E, F: FnOnce(u32) -> Result<CheckpointId, E>>(
        &mut self,
        index: u32,
        lookup: F,
    ) -> Result<&CheckpointId, E> {
        self.state_mut().get_checkpoint_id_caching(index, lookup)
    }

    pub fn store_checkpoint_id(&mut self, index: u32, id: CheckpointId) {
        self.state_mut().store_checkpoint_id(index, id)
    }

    pub fn load_checkpoint_index(&self, id: &CheckpointId) -> Option<u32> {
        self.state_ref().load_checkpoint_index(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{TrieLeaf, TrieNode};
    use crate::MarfValue;

    #[test]
    fn strategies_gate_node_storage() {
        let leaf = TrieLeaf::new(&[], &MarfValue::from_value(b"v")).as_trie_node_type();
        let leaf_ptr = TriePtr::new(TrieNodeID::Leaf.to_u8(), 0, 1);
        let hash = TrieHash::from_data(b"h");

        let mut noop = TrieCache::new("noop");
        noop.store_node_and_hash(0, leaf_ptr, leaf.clone(), hash);
        assert!(noop.load_node(0, &leaf_ptr).is_none());

        let mut everything = TrieCache::new("everything");
        everything.store_node_and_hash(0, leaf_ptr, leaf.clone(), hash);
        assert_eq!(everything.load_node(0, &leaf_ptr), Some(leaf.clone()));
        assert_eq!(everything.load_node_hash(0, &leaf_ptr), Some(hash));

        // node256 strategy ignores leaves
        let mut n256 = TrieCache::new("node256");
        n256.store_node_and_hash(0, leaf_ptr, leaf, hash);
        assert!(n256.load_node(0, &leaf_ptr).is_none());
    }

    #[test]
    fn checkpoint_id_map_caches_lookups() {
        let mut cache = TrieCache::new("noop");
        let id = CheckpointId::from_data(b"cp");
        let got = cache
            .get_checkpoint_id_caching::<(), _>(3, |_| Ok(id))
            .unwrap();
        assert_eq!(*got, id);
        // second lookup must not call the closure
        let got = cache
            .get_checkpoint_id_caching::<(), _>(3, |_| panic!("cache miss"))
            .unwrap();
        assert_eq!(*got, id);
        assert_eq!(cache.load_checkpoint_index(&id), Some(3));
    }
}

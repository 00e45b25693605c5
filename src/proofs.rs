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

//! Merkle inclusion proofs.
//!
//! A proof carries the walked spine deepest-first: the leaf, then each
//! internal node with the sibling hash contributions of every slot the
//! walk did not follow, with a shunt entry marking each checkpoint
//! crossing.  Crossings are hash-transparent, so folding the entries
//! bottom-up yields the target trie's root node hash directly; the
//! lineage section then folds that root through the parent chain into
//! the sealed root the verifier holds.  A verifier needs nothing but the
//! key, the value, and the sealed root.

use std::collections::HashSet;

use log::trace;
use sha2::{Digest, Sha512_256 as TrieHasher};

use crate::bits::{get_leaf_hash, seal_root_hash};
use crate::db::{TrieDb, TrieMeta};
use crate::marf::walk_path;
use crate::node::{
    clear_backptr, is_backptr, TrieLeaf, TrieNodeID, TrieNodeType, TriePtr,
};
use crate::storage::TrieStorage;
use crate::trie::Trie;
use crate::{CheckpointId, Error, MarfValue, Result, TrieHash, TriePath};

/// Proof view of a child pointer: just the (id, chr) pair that enters
/// the hash preimage.  The id keeps its back-pointer bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofTriePtr {
    pub id: u8,
    pub chr: u8,
}

impl ProofTriePtr {
    fn from_ptr(ptr: &TriePtr) -> ProofTriePtr {
        ProofTriePtr {
            id: ptr.id(),
            chr: ptr.chr(),
        }
    }

    fn is_empty(&self) -> bool {
        self.id == TrieNodeID::Empty.to_u8()
    }
}

/// Proof view of an internal node: everything that enters its hash
/// preimage except the per-slot hash contributions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofTrieNode {
    pub id: u8,
    pub path: Vec<u8>,
    pub ptrs: Vec<ProofTriePtr>,
}

impl ProofTrieNode {
    fn from_node(node: &TrieNodeType) -> ProofTrieNode {
        ProofTrieNode {
            id: node.id(),
            path: node.path_bytes().to_vec(),
            ptrs: node.ptrs().iter().map(ProofTriePtr::from_ptr).collect(),
        }
    }
}

/// One proof entry.  The leading `u8` of the node variants is the branch
/// byte that leads from the entry's parent into it (0 and unused for the
/// root).  Sibling arrays hold the hash contribution of every slot the
/// walk did not follow, in slot order, empty slots included.
#[derive(Debug, Clone, PartialEq)]
pub enum TrieMerkleProofType {
    Node4((u8, ProofTrieNode, [TrieHash; 3])),
    Node16((u8, ProofTrieNode, [TrieHash; 15])),
    Node48((u8, ProofTrieNode, [TrieHash; 47])),
    Node256((u8, ProofTrieNode, [TrieHash; 255])),
    Leaf((u8, TrieLeaf)),
    /// The walk crossed into this ancestor checkpoint between the
    /// adjacent entries.  Routing metadata; carries no hash material.
    Shunt(CheckpointId),
}

/// One step of the committed parent chain: a checkpoint and the root
/// node hash it sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuntLink {
    pub checkpoint: CheckpointId,
    pub trie_root_hash: TrieHash,
}

/// Inclusion proof for one `(key, value)` pair as of one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TrieMerkleProof {
    /// Walked spine, deepest-first; `entries[0]` is always the leaf and
    /// the last entry is always the trie root.
    pub entries: Vec<TrieMerkleProofType>,
    /// Parent chain of the target checkpoint, newest-first, down to the
    /// oldest checkpoint any shunt crosses into.  Empty iff the walk
    /// never left the target trie.
    pub lineage: Vec<ShuntLink>,
    /// Where the lineage fold starts: the parent of the oldest lineage
    /// link (or of the target itself when the lineage is empty) and its
    /// sealed root.  The genesis anchor is the sentinel with the
    /// empty-string hash.
    pub anchor: (CheckpointId, TrieHash),
}

fn siblings_without_followed(
    node: &TrieNodeType,
    all_hashes: &[TrieHash],
    followed_chr: u8,
) -> Result<Vec<TrieHash>> {
    let mut siblings = Vec::with_capacity(all_hashes.len().saturating_sub(1));
    let mut found = false;
    for (ptr, hash) in node.ptrs().iter().zip(all_hashes.iter()) {
        if !found && !ptr.is_empty() && ptr.chr() == followed_chr {
            found = true;
            continue;
        }
        siblings.push(*hash);
    }
    if !found {
        return Err(Error::CorruptNode(format!(
            "walked spine has no branch 0x{:02x}",
            followed_chr
        )));
    }
    Ok(siblings)
}

fn make_node_entry(
    chr: u8,
    node: &TrieNodeType,
    siblings: Vec<TrieHash>,
) -> Result<TrieMerkleProofType> {
    let pnode = ProofTrieNode::from_node(node);
    let wrong_count = |_| Error::CorruptNode("sibling count mismatch".to_string());
    match node {
        TrieNodeType::Node4(_) => Ok(TrieMerkleProofType::Node4((
            chr,
            pnode,
            siblings.try_into().map_err(wrong_count)?,
        ))),
        TrieNodeType::Node16(_) => Ok(TrieMerkleProofType::Node16((
            chr,
            pnode,
            siblings.try_into().map_err(wrong_count)?,
        ))),
        TrieNodeType::Node48(_) => Ok(TrieMerkleProofType::Node48((
            chr,
            pnode,
            siblings.try_into().map_err(wrong_count)?,
        ))),
        TrieNodeType::Node256(_) => Ok(TrieMerkleProofType::Node256((
            chr,
            pnode,
            siblings.try_into().map_err(wrong_count)?,
        ))),
        TrieNodeType::Leaf(_) => Err(Error::CorruptNode(
            "leaf as intermediate node on walked spine".to_string(),
        )),
    }
}

/// Hash an internal proof node: the same preimage the write path builds,
/// with the running hash substituted at the followed branch and the
/// carried siblings everywhere else.  `None` when the followed branch is
/// absent or the entry is malformed.
fn fold_node(
    pnode: &ProofTrieNode,
    siblings: &[TrieHash],
    running: &TrieHash,
    followed_chr: u8,
) -> Option<TrieHash> {
    if pnode.ptrs.len() != siblings.len() + 1 || pnode.path.len() > 32 {
        return None;
    }

    // rebuild the per-slot contributions, then feed them to the hasher in
    // canonical child order: occupied slots sorted by branch byte, then
    // the free slots
    let mut sib = siblings.iter();
    let mut contributions = Vec::with_capacity(pnode.ptrs.len());
    let mut found = false;
    for ptr in pnode.ptrs.iter() {
        if !found && !ptr.is_empty() && ptr.chr == followed_chr {
            found = true;
            contributions.push((ptr, running));
        } else {
            contributions.push((ptr, sib.next()?));
        }
    }
    if !found {
        return None;
    }

    let mut hasher = TrieHasher::new();
    hasher.update([pnode.id]);
    hasher.update([pnode.path.len() as u8]);
    hasher.update(&pnode.path);

    let mut live: Vec<(&ProofTriePtr, &TrieHash)> = contributions
        .iter()
        .filter(|(ptr, _)| !ptr.is_empty())
        .copied()
        .collect();
    live.sort_by_key(|(ptr, _)| ptr.chr);
    let free = contributions.iter().filter(|(ptr, _)| ptr.is_empty()).copied();
    for (ptr, hash) in live.into_iter().chain(free) {
        hasher.update([ptr.id, ptr.chr]);
        hasher.update(hash.as_bytes());
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_slice());
    Some(TrieHash(out))
}

impl TrieMerkleProof {
    /// Build the proof that `key` maps to its value as of `checkpoint`.
    /// `Error::NotFound` when the key or the checkpoint is absent.
    pub fn from_storage<T: TrieDb>(
        storage: &mut TrieStorage<T>,
        checkpoint: &CheckpointId,
        key: &[u8],
    ) -> Result<TrieMerkleProof> {
        let meta = storage
            .db()
            .trie_meta(checkpoint)?
            .ok_or(Error::NotFound)?;

        let path = TriePath::from_key(key);
        storage.open_checkpoint(checkpoint)?;
        let (c, leaf) = walk_path(storage, &path)?;

        let n = c.nodes.len();
        assert_eq!(n, c.node_ptrs.len(), "BUG: cursor spine misaligned");
        if n < 2 {
            return Err(Error::CorruptNode(
                "proof walk recorded no trie spine".to_string(),
            ));
        }

        let mut entries = vec![TrieMerkleProofType::Leaf((c.node_ptrs[n - 1].chr(), leaf))];
        let mut shunts = vec![];
        for i in (0..n - 1).rev() {
            let ptr = c.node_ptrs[i];
            if is_backptr(ptr.id()) {
                // crossing marker; the node it names was re-recorded with
                // its local pointer just below, so only the shunt remains
                let crossed = c.checkpoints[i];
                trace!("proof: shunt into {} at spine index {}", &crossed, i);
                entries.push(TrieMerkleProofType::Shunt(crossed));
                shunts.push(crossed);
                continue;
            }

            // reopen the trie that physically holds this node, so its
            // children's hashes resolve
            let holder = if i == 0 {
                *checkpoint
            } else {
                c.checkpoints[i - 1]
            };
            storage.open_checkpoint(&holder)?;
            let node = c.nodes[i].clone();
            let all_hashes = Trie::get_children_hashes(storage, &node)?;
            let followed_chr = c.node_ptrs[i + 1].chr();
            let siblings = siblings_without_followed(&node, &all_hashes, followed_chr)?;
            entries.push(make_node_entry(ptr.chr(), &node, siblings)?);
        }

        let (lineage, anchor) = Self::assemble_lineage(storage.db(), &meta, &shunts)?;
        Ok(TrieMerkleProof {
            entries,
            lineage,
            anchor,
        })
    }

    /// Walk the committed parent chain from the target's parent down to
    /// the oldest checkpoint any shunt names.
    fn assemble_lineage<T: TrieDb>(
        db: &T,
        meta: &TrieMeta,
        shunts: &[CheckpointId],
    ) -> Result<(Vec<ShuntLink>, (CheckpointId, TrieHash))> {
        let anchor_of = |id: &CheckpointId| -> Result<(CheckpointId, TrieHash)> {
            if id.is_sentinel() {
                Ok((*id, TrieHash::from_empty_data()))
            } else {
                Ok((*id, db.trie_meta(id)?.ok_or(Error::NotFound)?.sealed_hash))
            }
        };

        if shunts.is_empty() {
            return Ok((vec![], anchor_of(&meta.parent)?));
        }

        let mut pending: HashSet<CheckpointId> = shunts.iter().copied().collect();
        let mut lineage = vec![];
        let mut cur = meta.parent;
        let bound = db.count_checkpoints()?;
        for _ in 0..=bound {
            if cur.is_sentinel() {
                return Err(Error::CorruptNode(
                    "crossing into a checkpoint outside the ancestor chain".to_string(),
                ));
            }
            let cur_meta = db.trie_meta(&cur)?.ok_or(Error::NotFound)?;
            lineage.push(ShuntLink {
                checkpoint: cur,
                trie_root_hash: cur_meta.root_node_hash,
            });
            pending.remove(&cur);
            if pending.is_empty() {
                return Ok((lineage, anchor_of(&cur_meta.parent)?));
            }
            cur = cur_meta.parent;
        }
        // more hops than committed checkpoints: the parent chain loops
        Err(Error::ChainTooDeep(bound))
    }

    /// Check that this proof shows `key` mapping to `value` under the
    /// given sealed root.  Holding the sealed root is the verifier's
    /// only trust assumption.
    pub fn verify(&self, key: &[u8], value: &[u8], sealed_root: &TrieHash) -> bool {
        // the deepest entry must be the leaf for this value
        let (mut running, mut tail, mut pending_chr) = match self.entries.first() {
            Some(TrieMerkleProofType::Leaf((chr, ref leaf))) => {
                if leaf.data != MarfValue::from_value(value) {
                    trace!("proof: leaf payload does not match the value");
                    return false;
                }
                (get_leaf_hash(leaf), leaf.path.clone(), *chr)
            }
            _ => {
                trace!("proof: first entry is not a leaf");
                return false;
            }
        };

        let mut shunt_ids = vec![];
        let mut last_id = TrieNodeID::Leaf.to_u8();
        for entry in self.entries[1..].iter() {
            let (chr, pnode, siblings): (u8, &ProofTrieNode, &[TrieHash]) = match entry {
                TrieMerkleProofType::Shunt(id) => {
                    shunt_ids.push(*id);
                    continue;
                }
                TrieMerkleProofType::Node4((chr, ref pnode, ref siblings)) => {
                    (*chr, pnode, siblings)
                }
                TrieMerkleProofType::Node16((chr, ref pnode, ref siblings)) => {
                    (*chr, pnode, siblings)
                }
                TrieMerkleProofType::Node48((chr, ref pnode, ref siblings)) => {
                    (*chr, pnode, siblings)
                }
                TrieMerkleProofType::Node256((chr, ref pnode, ref siblings)) => {
                    (*chr, pnode, siblings)
                }
                TrieMerkleProofType::Leaf(_) => {
                    trace!("proof: leaf as intermediate entry");
                    return false;
                }
            };

            running = match fold_node(pnode, siblings, &running, pending_chr) {
                Some(hash) => hash,
                None => {
                    trace!("proof: malformed node entry");
                    return false;
                }
            };
            let mut new_tail = pnode.path.clone();
            new_tail.push(pending_chr);
            new_tail.extend_from_slice(&tail);
            tail = new_tail;
            pending_chr = chr;
            last_id = clear_backptr(pnode.id);
        }

        // the fold must end at a trie root
        if last_id != TrieNodeID::Node256.to_u8() {
            trace!("proof: entries do not end at a Node256 root");
            return false;
        }

        // the reassembled path must be the key's full trie path
        if tail != TriePath::from_key(key).as_bytes() {
            trace!("proof: reassembled path does not match the key");
            return false;
        }

        // every shunt must name a committed ancestor, and crossings must
        // go from older to newer as the fold ascends
        if shunt_ids.is_empty() != self.lineage.is_empty() {
            trace!("proof: lineage does not match the shunts");
            return false;
        }
        let mut min_position = self.lineage.len();
        for id in shunt_ids.iter() {
            let position = match self.lineage.iter().position(|link| link.checkpoint == *id) {
                Some(position) => position,
                None => {
                    trace!("proof: shunt {} is not in the lineage", id);
                    return false;
                }
            };
            if position > min_position {
                trace!("proof: shunts out of crossing order");
                return false;
            }
            min_position = position;
        }
        if let Some(last) = self.lineage.last() {
            // the lineage must stop at the oldest crossing
            if !shunt_ids.contains(&last.checkpoint) {
                trace!("proof: lineage extends past the oldest crossing");
                return false;
            }
        }

        // fold the parent chain from the anchor up to the target, then
        // seal the recomputed root node hash into it
        let (mut prev_id, mut prev_sealed) = self.anchor;
        for link in self.lineage.iter().rev() {
            prev_sealed = seal_root_hash(&link.trie_root_hash, &prev_id, &prev_sealed);
            prev_id = link.checkpoint;
        }
        let computed = seal_root_hash(&running, &prev_id, &prev_sealed);
        if computed != *sealed_root {
            trace!("proof: sealed root mismatch: {} != {}", computed, sealed_root);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::marf::{Marf, MarfOpenOpts};
    use crate::memory::MemoryTrieDb;

    fn cp(name: &str) -> CheckpointId {
        CheckpointId::from_data(name.as_bytes())
    }

    /// Two-checkpoint forest: genesis with 50 keys, a child overriding
    /// one and adding one.
    fn forest() -> Marf<MemoryTrieDb> {
        let mut m = Marf::new(MemoryTrieDb::new(), MarfOpenOpts::default());
        let mut session = m
            .open_for_write(&CheckpointId::sentinel(), cp("genesis"))
            .unwrap();
        for i in 0..50 {
            session
                .put(
                    format!("key-{}", i).as_bytes(),
                    format!("value-{}", i).as_bytes(),
                )
                .unwrap();
        }
        session.commit().unwrap();

        let mut session = m.open_for_write(&cp("genesis"), cp("child")).unwrap();
        session.put(b"key-3", b"overridden").unwrap();
        session.put(b"child-only", b"fresh").unwrap();
        session.commit().unwrap();
        m
    }

    #[test]
    fn proof_verifies_within_one_trie() {
        let mut m = forest();
        let root = m.sealed_root(&cp("genesis")).unwrap();
        for i in [0, 7, 49] {
            let key = format!("key-{}", i).into_bytes();
            let value = format!("value-{}", i).into_bytes();
            let proof = m.prove(&cp("genesis"), &key).unwrap();
            assert!(proof.verify(&key, &value, &root));
            // genesis walk never leaves its own trie
            assert!(proof.lineage.is_empty());
        }
    }

    #[test]
    fn proof_crosses_checkpoints() {
        let mut m = forest();
        let root = m.sealed_root(&cp("child")).unwrap();

        // inherited key: the walk crosses into genesis
        let proof = m.prove(&cp("child"), b"key-10").unwrap();
        assert!(proof
            .entries
            .iter()
            .any(|e| matches!(e, TrieMerkleProofType::Shunt(_))));
        assert!(!proof.lineage.is_empty());
        assert!(proof.verify(b"key-10", b"value-10", &root));

        // overridden and new keys verify against the same root
        let proof = m.prove(&cp("child"), b"key-3").unwrap();
        assert!(proof.verify(b"key-3", b"overridden", &root));
        let proof = m.prove(&cp("child"), b"child-only").unwrap();
        assert!(proof.verify(b"child-only", b"fresh", &root));
    }

    #[test]
    fn proof_crosses_deep_chains() {
        let mut m = Marf::new(MemoryTrieDb::new(), MarfOpenOpts::default());
        let mut parent = CheckpointId::sentinel();
        for i in 0..6 {
            let target = cp(&format!("chain-{}", i));
            let mut session = m.open_for_write(&parent, target).unwrap();
            session
                .put(format!("key-{}", i).as_bytes(), b"v")
                .unwrap();
            session.commit().unwrap();
            parent = target;
        }

        let root = m.sealed_root(&parent).unwrap();
        // the oldest key is only reachable through the whole chain
        let proof = m.prove(&parent, b"key-0").unwrap();
        assert!(proof.verify(b"key-0", b"v", &root));
        // and it does not verify against an ancestor's root
        let old_root = m.sealed_root(&cp("chain-3")).unwrap();
        assert!(!proof.verify(b"key-0", b"v", &old_root));
    }

    /// A store whose recorded parent chain loops: every checkpoint
    /// claims to be its own parent.
    struct LoopedParentDb(MemoryTrieDb);

    impl TrieDb for LoopedParentDb {
        fn read(&self, checkpoint: &CheckpointId, offset: u32) -> Result<Vec<u8>> {
            self.0.read(checkpoint, offset)
        }

        fn batch_write(
            &mut self,
            checkpoint: &CheckpointId,
            meta: &TrieMeta,
            records: &[(u32, Vec<u8>)],
        ) -> Result<u32> {
            self.0.batch_write(checkpoint, meta, records)
        }

        fn index_of(&self, checkpoint: &CheckpointId) -> Result<Option<u32>> {
            self.0.index_of(checkpoint)
        }

        fn checkpoint_at(&self, index: u32) -> Result<Option<CheckpointId>> {
            self.0.checkpoint_at(index)
        }

        fn trie_meta(&self, checkpoint: &CheckpointId) -> Result<Option<TrieMeta>> {
            Ok(self.0.trie_meta(checkpoint)?.map(|mut meta| {
                meta.parent = *checkpoint;
                meta
            }))
        }

        fn count_checkpoints(&self) -> Result<u32> {
            self.0.count_checkpoints()
        }
    }

    #[test]
    fn looped_parent_chain_fails_instead_of_spinning() {
        // same forest as above, but the store's parent chain never
        // reaches the crossed ancestor; the lineage walk must give up
        // after as many hops as there are committed checkpoints
        let mut m = Marf::new(LoopedParentDb(MemoryTrieDb::new()), MarfOpenOpts::default());
        let mut session = m
            .open_for_write(&CheckpointId::sentinel(), cp("genesis"))
            .unwrap();
        for i in 0..8 {
            session
                .put(format!("key-{}", i).as_bytes(), b"v")
                .unwrap();
        }
        session.commit().unwrap();
        let mut session = m.open_for_write(&cp("genesis"), cp("child")).unwrap();
        session.put(b"child-only", b"fresh").unwrap();
        session.commit().unwrap();

        // inherited key, so the proof needs the lineage down to genesis
        assert!(matches!(
            m.prove(&cp("child"), b"key-3"),
            Err(Error::ChainTooDeep(2))
        ));
    }

    #[test]
    fn proof_rejects_wrong_claims() {
        let mut m = forest();
        let root = m.sealed_root(&cp("genesis")).unwrap();
        let proof = m.prove(&cp("genesis"), b"key-5").unwrap();

        assert!(proof.verify(b"key-5", b"value-5", &root));
        // wrong value, wrong key, wrong root
        assert!(!proof.verify(b"key-5", b"value-6", &root));
        assert!(!proof.verify(b"key-6", b"value-5", &root));
        assert!(!proof.verify(b"key-5", b"value-5", &TrieHash::from_data(b"bogus")));

        // absent key has no proof
        assert!(matches!(
            m.prove(&cp("genesis"), b"no-such-key"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn proof_rejects_tampering() {
        let mut m = forest();
        let root = m.sealed_root(&cp("child")).unwrap();
        let proof = m.prove(&cp("child"), b"key-10").unwrap();
        assert!(proof.verify(b"key-10", b"value-10", &root));

        // flip one bit of one sibling hash
        let mut tampered = proof.clone();
        for entry in tampered.entries.iter_mut() {
            if let TrieMerkleProofType::Node256((_, _, ref mut siblings)) = entry {
                siblings[0].0[0] ^= 0x01;
                break;
            }
        }
        assert!(!tampered.verify(b"key-10", b"value-10", &root));

        // swap the leaf away from the front
        let mut tampered = proof.clone();
        tampered.entries.swap(0, 1);
        assert!(!tampered.verify(b"key-10", b"value-10", &root));

        // drop the root entry
        let mut tampered = proof.clone();
        tampered.entries.pop();
        assert!(!tampered.verify(b"key-10", b"value-10", &root));

        // point a shunt at a checkpoint outside the lineage
        let mut tampered = proof.clone();
        for entry in tampered.entries.iter_mut() {
            if let TrieMerkleProofType::Shunt(ref mut id) = entry {
                *id = cp("not-an-ancestor");
                break;
            }
        }
        assert!(!tampered.verify(b"key-10", b"value-10", &root));

        // rewrite a lineage link's root hash
        let mut tampered = proof.clone();
        tampered.lineage[0].trie_root_hash = TrieHash::from_data(b"bogus");
        assert!(!tampered.verify(b"key-10", b"value-10", &root));

        // rewrite the anchor
        let mut tampered = proof;
        tampered.anchor.1 = TrieHash::from_data(b"bogus");
        assert!(!tampered.verify(b"key-10", b"value-10", &root));
    }
}

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

//! Trie node shapes and the child-pointer codec.
//!
//! A trie is made of four adaptive fan-out shapes (Node4, Node16, Node48,
//! Node256) plus leaves.  Child pointers carry a one-byte type tag whose
//! high bit marks a back-pointer into an ancestor checkpoint's trie.

use std::fmt;
use std::io::Read;

use crate::{Error, MarfValue, Result, MARF_VALUE_ENCODED_SIZE};

/// Node type identifiers.  The id byte leads both the storage encoding
/// and the hash preimage of a node, so it doubles as the
/// domain-separation tag that keeps leaf and internal hashes distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrieNodeID {
    Empty = 0,
    Leaf = 1,
    Node4 = 2,
    Node16 = 3,
    Node48 = 4,
    Node256 = 5,
}

impl TrieNodeID {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(id: u8) -> Option<TrieNodeID> {
        match id {
            0 => Some(TrieNodeID::Empty),
            1 => Some(TrieNodeID::Leaf),
            2 => Some(TrieNodeID::Node4),
            3 => Some(TrieNodeID::Node16),
            4 => Some(TrieNodeID::Node48),
            5 => Some(TrieNodeID::Node256),
            _ => None,
        }
    }
}

/// High bit of a pointer's id byte marks it as a back-pointer.
pub fn is_backptr(id: u8) -> bool {
    id & 0x80 != 0
}

pub fn set_backptr(id: u8) -> u8 {
    id | 0x80
}

pub fn clear_backptr(id: u8) -> u8 {
    id & 0x7f
}

/// Encoded size of a child pointer: id, chr, slot offset, back-block index.
pub const TRIEPTR_SIZE: usize = 10;

/// Pointer to a trie node.
///
/// `ptr` is the node's slot offset within its trie's record store.  When
/// the back-pointer bit of `id` is set, `back_block` is the store-local
/// index of the foreign checkpoint that physically holds the node;
/// otherwise it is 0 and the pointer is local.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TriePtr {
    pub id: u8,
    pub chr: u8,
    pub ptr: u32,
    pub back_block: u32,
}

impl fmt::Debug for TriePtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TriePtr(id={},chr=0x{:02x},ptr={},back={})",
            self.id, self.chr, self.ptr, self.back_block
        )
    }
}

impl TriePtr {
    pub fn new(id: u8, chr: u8, ptr: u32) -> TriePtr {
        TriePtr {
            id,
            chr,
            ptr,
            back_block: 0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn chr(&self) -> u8 {
        self.chr
    }

    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    pub fn back_block(&self) -> u32 {
        self.back_block
    }

    /// This pointer, with the back-pointer bit cleared.  Used to read the
    /// node once the foreign trie has been opened.
    pub fn from_backptr(&self) -> TriePtr {
        assert!(is_backptr(self.id));
        TriePtr {
            id: clear_backptr(self.id),
            chr: self.chr,
            ptr: self.ptr,
            back_block: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id == TrieNodeID::Empty.to_u8()
    }

    pub fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.id);
        buf.push(self.chr);
        buf.extend_from_slice(&self.ptr.to_be_bytes());
        buf.extend_from_slice(&self.back_block.to_be_bytes());
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TriePtr> {
        if bytes.len() < TRIEPTR_SIZE {
            return Err(Error::CorruptNode("truncated trie pointer".to_string()));
        }
        let mut ptr_bytes = [0u8; 4];
        let mut back_bytes = [0u8; 4];
        ptr_bytes.copy_from_slice(&bytes[2..6]);
        back_bytes.copy_from_slice(&bytes[6..10]);
        Ok(TriePtr {
            id: bytes[0],
            chr: bytes[1],
            ptr: u32::from_be_bytes(ptr_bytes),
            back_block: u32::from_be_bytes(back_bytes),
        })
    }
}

fn path_to_bytes(path: &[u8], buf: &mut Vec<u8>) {
    assert!(path.len() < 256);
    buf.push(path.len() as u8);
    buf.extend_from_slice(path);
}

fn path_from_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut lenbuf = [0u8; 1];
    r.read_exact(&mut lenbuf)?;
    if lenbuf[0] as usize > 32 {
        return Err(Error::CorruptNode(format!(
            "node path is {} bytes; maximum is 32",
            lenbuf[0]
        )));
    }
    let mut path = vec![0u8; lenbuf[0] as usize];
    r.read_exact(&mut path)?;
    Ok(path)
}

fn ptrs_to_bytes(ptrs: &[TriePtr], buf: &mut Vec<u8>) {
    for ptr in ptrs.iter() {
        ptr.to_bytes(buf);
    }
}

fn ptrs_from_bytes<R: Read>(r: &mut R, ptrs: &mut [TriePtr]) -> Result<()> {
    let mut bytes = vec![0u8; ptrs.len() * TRIEPTR_SIZE];
    r.read_exact(&mut bytes)?;
    for (i, slot) in ptrs.iter_mut().enumerate() {
        *slot = TriePtr::from_bytes(&bytes[i * TRIEPTR_SIZE..(i + 1) * TRIEPTR_SIZE])?;
    }
    Ok(())
}

/// Uniform interface over the four fan-out shapes.  Leaves implement the
/// codec half but have no children to walk.
pub trait TrieNode {
    fn id(&self) -> u8;
    /// Child pointer for this byte, if present.
    fn walk(&self, chr: u8) -> Option<TriePtr>;
    /// Add a child.  Fails (returns false) when the node is full.
    fn insert(&mut self, ptr: &TriePtr) -> bool;
    /// Overwrite the child with the same chr.  Fails if absent.
    fn replace(&mut self, ptr: &TriePtr) -> bool;
    fn ptrs(&self) -> &[TriePtr];
    fn path(&self) -> &[u8];
    /// Storage encoding: id, ptrs, (indexes,) path.  Hash preimages are
    /// built separately, in canonical child order, by the bits layer.
    fn to_bytes(&self, buf: &mut Vec<u8>);
    fn as_trie_node_type(&self) -> TrieNodeType;
}

#[derive(Clone, PartialEq)]
pub struct TrieNode4 {
    pub path: Vec<u8>,
    pub ptrs: [TriePtr; 4],
}

#[derive(Clone, PartialEq)]
pub struct TrieNode16 {
    pub path: Vec<u8>,
    pub ptrs: [TriePtr; 16],
}

#[derive(Clone, PartialEq)]
pub struct TrieNode48 {
    pub path: Vec<u8>,
    pub indexes: [i8; 256],
    pub ptrs: [TriePtr; 48],
}

#[derive(Clone, PartialEq)]
pub struct TrieNode256 {
    pub path: Vec<u8>,
    pub ptrs: [TriePtr; 256],
}

#[derive(Clone, PartialEq)]
pub struct TrieLeaf {
    pub path: Vec<u8>,
    pub data: MarfValue,
}

impl fmt::Debug for TrieNode4 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TrieNode4(path={})", hex::encode(&self.path))
    }
}

impl fmt::Debug for TrieNode16 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TrieNode16(path={})", hex::encode(&self.path))
    }
}

impl fmt::Debug for TrieNode48 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TrieNode48(path={})", hex::encode(&self.path))
    }
}

impl fmt::Debug for TrieNode256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TrieNode256(path={})", hex::encode(&self.path))
    }
}

impl fmt::Debug for TrieLeaf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TrieLeaf(path={}, data={})",
            hex::encode(&self.path),
            &self.data
        )
    }
}

impl TrieNode4 {
    pub fn new(path: &[u8]) -> TrieNode4 {
        TrieNode4 {
            path: path.to_vec(),
            ptrs: [TriePtr::default(); 4],
        }
    }
}

impl TrieNode16 {
    pub fn new(path: &[u8]) -> TrieNode16 {
        TrieNode16 {
            path: path.to_vec(),
            ptrs: [TriePtr::default(); 16],
        }
    }

    /// Promote a full Node4.
    pub fn from_node4(node4: &TrieNode4) -> TrieNode16 {
        let mut ptrs = [TriePtr::default(); 16];
        ptrs[0..4].copy_from_slice(&node4.ptrs);
        TrieNode16 {
            path: node4.path.clone(),
            ptrs,
        }
    }
}

impl TrieNode48 {
    pub fn new(path: &[u8]) -> TrieNode48 {
        TrieNode48 {
            path: path.to_vec(),
            indexes: [-1; 256],
            ptrs: [TriePtr::default(); 48],
        }
    }

    /// Promote a full Node16.
    pub fn from_node16(node16: &TrieNode16) -> TrieNode48 {
        let mut node48 = TrieNode48::new(&node16.path);
        for (i, ptr) in node16.ptrs.iter().enumerate() {
            node48.ptrs[i] = *ptr;
            if !ptr.is_empty() {
                node48.indexes[ptr.chr() as usize] = i as i8;
            }
        }
        node48
    }
}

impl TrieNode256 {
    pub fn new(path: &[u8]) -> TrieNode256 {
        TrieNode256 {
            path: path.to_vec(),
            ptrs: [TriePtr::default(); 256],
        }
    }

    /// Promote a full Node48.
    pub fn from_node48(node48: &TrieNode48) -> TrieNode256 {
        let mut node256 = TrieNode256::new(&node48.path);
        for ptr in node48.ptrs.iter() {
            if !ptr.is_empty() {
                node256.ptrs[ptr.chr() as usize] = *ptr;
            }
        }
        node256
    }
}

impl TrieLeaf {
    pub fn new(path: &[u8], data: &MarfValue) -> TrieLeaf {
        TrieLeaf {
            path: path.to_vec(),
            data: *data,
        }
    }

    pub fn from_value(path: &[u8], value: &[u8]) -> TrieLeaf {
        TrieLeaf::new(path, &MarfValue::from_value(value))
    }
}

impl TrieNode for TrieNode4 {
    fn id(&self) -> u8 {
        TrieNodeID::Node4.to_u8()
    }

    fn walk(&self, chr: u8) -> Option<TriePtr> {
        self.ptrs
            .iter()
            .find(|p| !p.is_empty() && p.chr() == chr)
            .copied()
    }

    fn insert(&mut self, ptr: &TriePtr) -> bool {
        if self.replace(ptr) {
            return true;
        }
        for slot in self.ptrs.iter_mut() {
            if slot.is_empty() {
                *slot = *ptr;
                return true;
            }
        }
        false
    }

    fn replace(&mut self, ptr: &TriePtr) -> bool {
        for slot in self.ptrs.iter_mut() {
            if !slot.is_empty() && slot.chr() == ptr.chr() {
                *slot = *ptr;
                return true;
            }
        }
        false
    }

    fn ptrs(&self) -> &[TriePtr] {
        &self.ptrs
    }

    fn path(&self) -> &[u8] {
        &self.path
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.id());
        ptrs_to_bytes(&self.ptrs, buf);
        path_to_bytes(&self.path, buf);
    }

    fn as_trie_node_type(&self) -> TrieNodeType {
        TrieNodeType::Node4(self.clone())
    }
}

impl TrieNode for TrieNode16 {
    fn id(&self) -> u8 {
        TrieNodeID::Node16.to_u8()
    }

    fn walk(&self, chr: u8) -> Option<TriePtr> {
        self.ptrs
            .iter()
            .find(|p| !p.is_empty() && p.chr() == chr)
            .copied()
    }

    fn insert(&mut self, ptr: &TriePtr) -> bool {
        if self.replace(ptr) {
            return true;
        }
        for slot in self.ptrs.iter_mut() {
            if slot.is_empty() {
                *slot = *ptr;
                return true;
            }
        }
        false
    }

    fn replace(&mut self, ptr: &TriePtr) -> bool {
        for slot in self.ptrs.iter_mut() {
            if !slot.is_empty() && slot.chr() == ptr.chr() {
                *slot = *ptr;
                return true;
            }
        }
        false
    }

    fn ptrs(&self) -> &[TriePtr] {
        &self.ptrs
    }

    fn path(&self) -> &[u8] {
        &self.path
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.id());
        ptrs_to_bytes(&self.ptrs, buf);
        path_to_bytes(&self.path, buf);
    }

    fn as_trie_node_type(&self) -> TrieNodeType {
        TrieNodeType::Node16(self.clone())
    }
}

impl TrieNode for TrieNode48 {
    fn id(&self) -> u8 {
        TrieNodeID::Node48.to_u8()
    }

    fn walk(&self, chr: u8) -> Option<TriePtr> {
        let idx = self.indexes[chr as usize];
        if idx >= 0 && (idx as usize) < 48 {
            let ptr = self.ptrs[idx as usize];
            if !ptr.is_empty() && ptr.chr() == chr {
                return Some(ptr);
            }
        }
        None
    }

    fn insert(&mut self, ptr: &TriePtr) -> bool {
        if self.replace(ptr) {
            return true;
        }
        for (i, slot) in self.ptrs.iter_mut().enumerate() {
            if slot.is_empty() {
                *slot = *ptr;
                self.indexes[ptr.chr() as usize] = i as i8;
                return true;
            }
        }
        false
    }

    fn replace(&mut self, ptr: &TriePtr) -> bool {
        let idx = self.indexes[ptr.chr() as usize];
        if idx >= 0 && (idx as usize) < 48 && !self.ptrs[idx as usize].is_empty() {
            self.ptrs[idx as usize] = *ptr;
            return true;
        }
        false
    }

    fn ptrs(&self) -> &[TriePtr] {
        &self.ptrs
    }

    fn path(&self) -> &[u8] {
        &self.path
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.id());
        ptrs_to_bytes(&self.ptrs, buf);
        for idx in self.indexes.iter() {
            buf.push(*idx as u8);
        }
        path_to_bytes(&self.path, buf);
    }

    fn as_trie_node_type(&self) -> TrieNodeType {
        TrieNodeType::Node48(self.clone())
    }
}

impl TrieNode for TrieNode256 {
    fn id(&self) -> u8 {
        TrieNodeID::Node256.to_u8()
    }

    fn walk(&self, chr: u8) -> Option<TriePtr> {
        let ptr = self.ptrs[chr as usize];
        if !ptr.is_empty() {
            return Some(ptr);
        }
        None
    }

    fn insert(&mut self, ptr: &TriePtr) -> bool {
        self.ptrs[ptr.chr() as usize] = *ptr;
        true
    }

    fn replace(&mut self, ptr: &TriePtr) -> bool {
        if !self.ptrs[ptr.chr() as usize].is_empty() {
            self.ptrs[ptr.chr() as usize] = *ptr;
            return true;
        }
        false
    }

    fn ptrs(&self) -> &[TriePtr] {
        &self.ptrs
    }

    fn path(&self) -> &[u8] {
        &self.path
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.id());
        ptrs_to_bytes(&self.ptrs, buf);
        path_to_bytes(&self.path, buf);
    }

    fn as_trie_node_type(&self) -> TrieNodeType {
        TrieNodeType::Node256(self.clone())
    }
}

impl TrieNode for TrieLeaf {
    fn id(&self) -> u8 {
        TrieNodeID::Leaf.to_u8()
    }

    fn walk(&self, _chr: u8) -> Option<TriePtr> {
        None
    }

    fn insert(&mut self, _ptr: &TriePtr) -> bool {
        panic!("can't insert into a leaf");
    }

    fn replace(&mut self, _ptr: &TriePtr) -> bool {
        panic!("can't replace in a leaf");
    }

    fn ptrs(&self) -> &[TriePtr] {
        &[]
    }

    fn path(&self) -> &[u8] {
        &self.path
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.id());
        path_to_bytes(&self.path, buf);
        buf.extend_from_slice(self.data.as_bytes());
    }

    fn as_trie_node_type(&self) -> TrieNodeType {
        TrieNodeType::Leaf(self.clone())
    }
}

impl TrieNode4 {
    fn from_body<R: Read>(r: &mut R) -> Result<TrieNode4> {
        let mut node = TrieNode4::new(&[]);
        ptrs_from_bytes(r, &mut node.ptrs)?;
        node.path = path_from_bytes(r)?;
        Ok(node)
    }
}

impl TrieNode16 {
    fn from_body<R: Read>(r: &mut R) -> Result<TrieNode16> {
        let mut node = TrieNode16::new(&[]);
        ptrs_from_bytes(r, &mut node.ptrs)?;
        node.path = path_from_bytes(r)?;
        Ok(node)
    }
}

impl TrieNode48 {
    fn from_body<R: Read>(r: &mut R) -> Result<TrieNode48> {
        let mut node = TrieNode48::new(&[]);
        ptrs_from_bytes(r, &mut node.ptrs)?;
        let mut indexes = [0u8; 256];
        r.read_exact(&mut indexes)?;
        for (i, idx) in indexes.iter().enumerate() {
            node.indexes[i] = *idx as i8;
        }
        node.path = path_from_bytes(r)?;
        Ok(node)
    }
}

impl TrieNode256 {
    fn from_body<R: Read>(r: &mut R) -> Result<TrieNode256> {
        let mut node = TrieNode256::new(&[]);
        ptrs_from_bytes(r, &mut node.ptrs)?;
        node.path = path_from_bytes(r)?;
        Ok(node)
    }
}

impl TrieLeaf {
    fn from_body<R: Read>(r: &mut R) -> Result<TrieLeaf> {
        let path = path_from_bytes(r)?;
        let mut data = [0u8; MARF_VALUE_ENCODED_SIZE];
        r.read_exact(&mut data)?;
        Ok(TrieLeaf {
            path,
            data: MarfValue(data),
        })
    }
}

/// Tagged union over the node shapes, so walk/insert code stays
/// variant-agnostic without dynamic dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum TrieNodeType {
    Node4(TrieNode4),
    Node16(TrieNode16),
    Node48(TrieNode48),
    Node256(TrieNode256),
    Leaf(TrieLeaf),
}

macro_rules! with_node {
    ($self:expr, $pat:pat, $s:expr) => {
        match $self {
            TrieNodeType::Node4($pat) => $s,
            TrieNodeType::Node16($pat) => $s,
            TrieNodeType::Node48($pat) => $s,
            TrieNodeType::Node256($pat) => $s,
            TrieNodeType::Leaf($pat) => $s,
        }
    };
}

impl TrieNodeType {
    pub fn id(&self) -> u8 {
        with_node!(self, ref data, data.id())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, TrieNodeType::Leaf(_))
    }

    pub fn is_node256(&self) -> bool {
        matches!(self, TrieNodeType::Node256(_))
    }

    pub fn walk(&self, chr: u8) -> Option<TriePtr> {
        with_node!(self, ref data, data.walk(chr))
    }

    pub fn insert(&mut self, ptr: &TriePtr) -> bool {
        with_node!(self, ref mut data, data.insert(ptr))
    }

    pub fn replace(&mut self, ptr: &TriePtr) -> bool {
        with_node!(self, ref mut data, data.replace(ptr))
    }

    pub fn ptrs(&self) -> &[TriePtr] {
        with_node!(self, ref data, data.ptrs())
    }

    pub fn ptrs_mut(&mut self) -> &mut [TriePtr] {
        match self {
            TrieNodeType::Node4(ref mut data) => &mut data.ptrs,
            TrieNodeType::Node16(ref mut data) => &mut data.ptrs,
            TrieNodeType::Node48(ref mut data) => &mut data.ptrs,
            TrieNodeType::Node256(ref mut data) => &mut data.ptrs,
            TrieNodeType::Leaf(_) => &mut [],
        }
    }

    pub fn path_bytes(&self) -> &[u8] {
        with_node!(self, ref data, data.path())
    }

    pub fn set_path(&mut self, path: Vec<u8>) {
        match self {
            TrieNodeType::Node4(ref mut data) => data.path = path,
            TrieNodeType::Node16(ref mut data) => data.path = path,
            TrieNodeType::Node48(ref mut data) => data.path = path,
            TrieNodeType::Node256(ref mut data) => data.path = path,
            TrieNodeType::Leaf(ref mut data) => data.path = path,
        }
    }

    pub fn to_bytes(&self, buf: &mut Vec<u8>) {
        with_node!(self, ref data, data.to_bytes(buf))
    }

    pub fn from_bytes<R: Read>(r: &mut R) -> Result<TrieNodeType> {
        let mut idbuf = [0u8; 1];
        r.read_exact(&mut idbuf)?;
        match TrieNodeID::from_u8(idbuf[0]) {
            Some(TrieNodeID::Node4) => Ok(TrieNodeType::Node4(TrieNode4::from_body(r)?)),
            Some(TrieNodeID::Node16) => Ok(TrieNodeType::Node16(TrieNode16::from_body(r)?)),
            Some(TrieNodeID::Node48) => Ok(TrieNodeType::Node48(TrieNode48::from_body(r)?)),
            Some(TrieNodeID::Node256) => Ok(TrieNodeType::Node256(TrieNode256::from_body(r)?)),
            Some(TrieNodeID::Leaf) => Ok(TrieNodeType::Leaf(TrieLeaf::from_body(r)?)),
            _ => Err(Error::CorruptNode(format!(
                "unknown node type {}",
                idbuf[0]
            ))),
        }
    }
}

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

//! # Merklized Adaptive Radix Forest
//!
//! A MARF is a collection of adaptive radix tries, one per _checkpoint_,
//! chained together by back-pointers so that each checkpoint exposes a
//! complete key-value mapping while physically storing only the nodes its
//! own write session touched.  Every committed checkpoint has a sealed
//! Merkle root, and any `(key, value, root)` triple can be proven with a
//! compact inclusion proof that a verifier can check while holding nothing
//! but the root hash.
//!
//! The forest is single-writer, multi-reader: at most one checkpoint is
//! ever open for writing, and committed tries are immutable, so readers
//! never observe partial state.

use std::{fmt, io};

use sha2::{Digest, Sha512_256 as TrieHasher};

pub mod bits;
pub mod cache;
pub mod cursor;
pub mod db;
pub mod marf;
pub mod memory;
pub mod node;
pub mod proofs;
pub mod sqlite;
pub mod storage;
pub mod trie;

pub use crate::cursor::{CursorError, TrieCursor};
pub use crate::db::{TrieDb, TrieMeta};
pub use crate::marf::{Marf, MarfOpenOpts, ReadHandle, TrieHashCalculationMode, WriteSession};
pub use crate::memory::MemoryTrieDb;
pub use crate::proofs::TrieMerkleProof;
pub use crate::sqlite::SqliteTrieDb;

pub type Result<T> = std::result::Result<T, Error>;

/// Number of bytes in a trie hash and in a checkpoint id
pub const TRIEHASH_ENCODED_SIZE: usize = 32;

/// Number of bytes in a MARF leaf payload: a 32-byte value hash plus 8
/// reserved bytes.
pub const MARF_VALUE_ENCODED_SIZE: usize = 40;

/// The reserved "no parent" checkpoint id.  All 0xff can never be produced
/// by SHA-512/256, so back-pointer chains terminate unambiguously.
pub const SENTINEL_ARRAY: [u8; 32] = [255u8; 32];

/// SHA-512/256 of the empty string.  Used as the hash contribution of an
/// empty child slot.
const EMPTY_DATA_HASH: [u8; 32] = [
    0xc6, 0x72, 0xb8, 0xd1, 0xef, 0x56, 0xed, 0x28, 0xab, 0x87, 0xc3, 0x62, 0x2c, 0x51, 0x14, 0x06,
    0x9b, 0xdd, 0x3a, 0xd7, 0xb8, 0xf9, 0x73, 0x74, 0x98, 0xd0, 0xc0, 0x1e, 0xce, 0xf0, 0x96, 0x7a,
];

macro_rules! impl_byte_array {
    ($thing:ident, $len:expr) => {
        impl $thing {
            pub fn from_bytes(bytes: &[u8]) -> Option<$thing> {
                if bytes.len() != $len {
                    return None;
                }
                let mut buf = [0u8; $len];
                buf.copy_from_slice(bytes);
                Some($thing(buf))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $thing {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $thing {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($thing), &self.to_hex())
            }
        }

        impl AsRef<[u8]> for $thing {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

/// Hash of a trie node, or a sealed checkpoint root.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrieHash(pub [u8; TRIEHASH_ENCODED_SIZE]);
impl_byte_array!(TrieHash, TRIEHASH_ENCODED_SIZE);

impl TrieHash {
    pub fn from_data(data: &[u8]) -> TrieHash {
        if data.is_empty() {
            return TrieHash::from_empty_data();
        }
        let mut hasher = TrieHasher::new();
        hasher.update(data);
        let mut buf = [0u8; TRIEHASH_ENCODED_SIZE];
        buf.copy_from_slice(hasher.finalize().as_slice());
        TrieHash(buf)
    }

    /// Hash of the empty string.  Precomputed since it labels every empty
    /// child slot of every node.
    pub fn from_empty_data() -> TrieHash {
        TrieHash(EMPTY_DATA_HASH)
    }
}

/// Opaque 32-byte name of one trie in the forest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId(pub [u8; 32]);
impl_byte_array!(CheckpointId, 32);

impl CheckpointId {
    /// The reserved genesis parent.  Never a real checkpoint.
    pub fn sentinel() -> CheckpointId {
        CheckpointId(SENTINEL_ARRAY)
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL_ARRAY
    }

    /// Derive a checkpoint id from arbitrary bytes.  Handy for callers
    /// that name checkpoints after external identifiers.
    pub fn from_data(data: &[u8]) -> CheckpointId {
        CheckpointId(TrieHash::from_data(data).0)
    }
}

/// The fixed-length trie path of a key.  Keys are hashed before they are
/// walked, so every path is exactly 32 bytes and keys of any length fan
/// out uniformly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriePath(pub [u8; 32]);
impl_byte_array!(TriePath, 32);

impl TriePath {
    pub fn from_key(key: &[u8]) -> TriePath {
        TriePath(TrieHash::from_data(key).0)
    }

    pub fn len(&self) -> usize {
        32
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A leaf payload: the hash of the stored value plus 8 reserved bytes.
/// The MARF never stores raw values; a side-store keyed by the value hash
/// holds the actual bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarfValue(pub [u8; MARF_VALUE_ENCODED_SIZE]);
impl_byte_array!(MarfValue, MARF_VALUE_ENCODED_SIZE);

impl MarfValue {
    /// Hash a raw value into its leaf payload.
    pub fn from_value(value: &[u8]) -> MarfValue {
        MarfValue::from_value_hash(&TrieHash::from_data(value))
    }

    pub fn from_value_hash(hash: &TrieHash) -> MarfValue {
        let mut buf = [0u8; MARF_VALUE_ENCODED_SIZE];
        buf[0..32].copy_from_slice(hash.as_bytes());
        MarfValue(buf)
    }

    /// The 32-byte value hash portion.
    pub fn to_value_hash(&self) -> TrieHash {
        let mut buf = [0u8; TRIEHASH_ENCODED_SIZE];
        buf.copy_from_slice(&self.0[0..32]);
        TrieHash(buf)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key absent at the requested checkpoint.  Expected outcome of a
    /// lookup, not a failure.
    #[error("key not found")]
    NotFound,
    /// A node's stored structural invariant is violated.  Fatal for the
    /// affected trie; never repaired.
    #[error("corrupt node: {0}")]
    CorruptNode(String),
    /// A back-pointer references a checkpoint the store does not have.
    #[error("dangling back-pointer to checkpoint index {0}")]
    DanglingBackpointer(u32),
    /// A write session is already open.
    #[error("a write session is already open")]
    WriteSessionConflict,
    /// Promotion past Node256.  Unreachable by construction.
    #[error("node capacity overflow during promotion")]
    CapacityOverflow,
    /// The walk crossed more checkpoints than any valid ancestor chain
    /// allows.  Signals a corrupt parent link.
    #[error("back-pointer chain exceeded {0} crossings; possible cycle")]
    ChainTooDeep(u32),
    /// Commit target already present in the store.
    #[error("checkpoint {0} already exists")]
    CheckpointExists(CheckpointId),
    /// `put` after `seal`.
    #[error("write session is already sealed")]
    SessionSealed,
    /// Attempted write through a read-only view.
    #[error("checkpoint is not open for writing")]
    ReadOnly,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::QueryReturnedNoRows = err {
            Error::NotFound
        } else {
            Error::Db(err)
        }
    }
}

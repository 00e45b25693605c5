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

//! SQLite-backed store.
//!
//! One metadata row per committed trie, one record row per node, written
//! in a single transaction so a commit is all-or-nothing.  Store indices
//! are assigned in commit order and never reused.

use std::path::Path;

use log::debug;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};

use crate::db::{TrieDb, TrieMeta};
use crate::{CheckpointId, Error, Result, TrieHash};

const SQL_MARF_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS marf_tries (
   trie_index INTEGER PRIMARY KEY,
   checkpoint TEXT UNIQUE NOT NULL,
   parent TEXT NOT NULL,
   root_hash TEXT NOT NULL,
   sealed_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS marf_nodes (
   trie_index INTEGER NOT NULL,
   offset INTEGER NOT NULL,
   data BLOB NOT NULL,
   PRIMARY KEY(trie_index, offset)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS checkpoint_marf_tries ON marf_tries(checkpoint);
";

/// A `TrieDb` over a SQLite database.
pub struct SqliteTrieDb {
    conn: Connection,
}

fn hash_from_hex<T, F: Fn([u8; 32]) -> T>(text: &str, make: F) -> Result<T> {
    let bytes = hex::decode(text)
        .map_err(|_| Error::CorruptNode(format!("bad hex in store: {}", text)))?;
    if bytes.len() != 32 {
        return Err(Error::CorruptNode(format!("bad hash length: {}", text)));
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&bytes);
    Ok(make(buf))
}

impl SqliteTrieDb {
    /// Open (and create if absent) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SqliteTrieDb> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::create_tables_if_needed(&conn)?;
        Ok(SqliteTrieDb { conn })
    }

    /// Open a throwaway store in RAM.
    pub fn open_in_memory() -> Result<SqliteTrieDb> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables_if_needed(&conn)?;
        Ok(SqliteTrieDb { conn })
    }

    fn create_tables_if_needed(conn: &Connection) -> Result<()> {
        conn.execute_batch(SQL_MARF_SCHEMA)?;
        Ok(())
    }

    fn query_index(&self, checkpoint: &CheckpointId) -> Result<Option<u32>> {
        let index: Option<i64> = self
            .conn
            .query_row(
                "SELECT trie_index FROM marf_tries WHERE checkpoint = ?1",
                params![checkpoint.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(index.map(|i| i as u32))
    }
}

impl TrieDb for SqliteTrieDb {
    fn read(&self, checkpoint: &CheckpointId, offset: u32) -> Result<Vec<u8>> {
        let data: Vec<u8> = self.conn.query_row(
            "SELECT data FROM marf_nodes WHERE trie_index = (SELECT trie_index FROM marf_tries WHERE checkpoint = ?1) AND offset = ?2",
            params![checkpoint.to_hex(), offset],
            |row| row.get(0),
        )?;
        Ok(data)
    }

    fn batch_write(
        &mut self,
        checkpoint: &CheckpointId,
        meta: &TrieMeta,
        records: &[(u32, Vec<u8>)],
    ) -> Result<u32> {
        if self.query_index(checkpoint)?.is_some() {
            return Err(Error::CheckpointExists(*checkpoint));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let index: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(trie_index) + 1, 0) FROM marf_tries",
                [],
                |row| row.get(0),
            )?;
        tx.execute(
            "INSERT INTO marf_tries (trie_index, checkpoint, parent, root_hash, sealed_hash) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                index,
                checkpoint.to_hex(),
                meta.parent.to_hex(),
                meta.root_node_hash.to_hex(),
                meta.sealed_hash.to_hex()
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO marf_nodes (trie_index, offset, data) VALUES (?1, ?2, ?3)",
            )?;
            for (offset, bytes) in records.iter() {
                stmt.execute(params![index, offset, bytes])?;
            }
        }
        tx.commit()?;
        debug!(
            "Committed trie {} as index {} ({} records)",
            checkpoint,
            index,
            records.len()
        );
        Ok(index as u32)
    }

    fn index_of(&self, checkpoint: &CheckpointId) -> Result<Option<u32>> {
        self.query_index(checkpoint)
    }

    fn checkpoint_at(&self, index: u32) -> Result<Option<CheckpointId>> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT checkpoint FROM marf_tries WHERE trie_index = ?1",
                params![index],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            Some(text) => Ok(Some(hash_from_hex(&text, CheckpointId)?)),
            None => Ok(None),
        }
    }

    fn trie_meta(&self, checkpoint: &CheckpointId) -> Result<Option<TrieMeta>> {
        let row: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT parent, root_hash, sealed_hash FROM marf_tries WHERE checkpoint = ?1",
                params![checkpoint.to_hex()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((parent, root_hash, sealed_hash)) => Ok(Some(TrieMeta {
                parent: hash_from_hex(&parent, CheckpointId)?,
                root_node_hash: hash_from_hex(&root_hash, TrieHash)?,
                sealed_hash: hash_from_hex(&sealed_hash, TrieHash)?,
            })),
            None => Ok(None),
        }
    }

    fn count_checkpoints(&self) -> Result<u32> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM marf_tries", [], |row| row.get(0))?;
        Ok(count as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn meta(parent: CheckpointId) -> TrieMeta {
        TrieMeta {
            parent,
            root_node_hash: TrieHash::from_data(b"root"),
            sealed_hash: TrieHash::from_data(b"sealed"),
        }
    }

    #[test]
    fn sqlite_store_roundtrip() {
        let mut db = SqliteTrieDb::open_in_memory().unwrap();
        let a = CheckpointId::from_data(b"a");
        let b = CheckpointId::from_data(b"b");

        let idx_a = db
            .batch_write(&a, &meta(CheckpointId::sentinel()), &[(0, vec![0xab; 50])])
            .unwrap();
        let idx_b = db
            .batch_write(&b, &meta(a), &[(0, vec![1]), (1, vec![2, 3])])
            .unwrap();
        assert_eq!((idx_a, idx_b), (0, 1));

        assert_eq!(db.read(&a, 0).unwrap(), vec![0xab; 50]);
        assert_eq!(db.read(&b, 1).unwrap(), vec![2, 3]);
        assert!(matches!(db.read(&b, 7), Err(Error::NotFound)));

        assert_eq!(db.checkpoint_at(0).unwrap(), Some(a));
        assert_eq!(db.index_of(&b).unwrap(), Some(1));
        assert_eq!(db.trie_meta(&b).unwrap().unwrap().parent, a);
        assert_eq!(db.count_checkpoints().unwrap(), 2);

        assert!(matches!(
            db.batch_write(&a, &meta(CheckpointId::sentinel()), &[]),
            Err(Error::CheckpointExists(_))
        ));
    }
}

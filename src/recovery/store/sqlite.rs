//! SQLite implementation of a checkpoint store.
//!
//! One database file holds the snapshots of every partition in the
//! `snaps` table and the completed checkpoints in `commits`. A
//! checkpoint only counts once its `commits` row exists.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use rusqlite_migration::{Migrations, M};

use crate::errors::StoreError;
use crate::inputs::Offset;
use crate::partition::{PartitionCount, PartitionIndex};
use crate::recovery::{CheckpointId, CheckpointMeta};

use super::CheckpointStore;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE snaps ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             checkpoint_id INTEGER NOT NULL CHECK (checkpoint_id > 0), \
             part_index INTEGER NOT NULL CHECK (part_index >= 0), \
             ser_state BLOB NOT NULL, \
             PRIMARY KEY (checkpoint_id, part_index) \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE commits ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             checkpoint_id INTEGER NOT NULL PRIMARY KEY, \
             part_count INTEGER NOT NULL CHECK (part_count > 0), \
             input_offset INTEGER NOT NULL CHECK (input_offset >= 0) \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    migrations().to_latest(conn)?;
    Ok(())
}

pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open the database at `file`, creating it if needed.
    pub fn open(file: &Path) -> Result<Self, StoreError> {
        tracing::info!("Opening checkpoint store at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn put(
        &self,
        partition: PartitionIndex,
        checkpoint: CheckpointId,
        blob: &[u8],
    ) -> Result<(), StoreError> {
        tracing::trace!("Writing snapshot {checkpoint:?} for {partition:?}");
        self.conn()?.execute(
            "INSERT INTO snaps (checkpoint_id, part_index, ser_state) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (checkpoint_id, part_index) DO UPDATE \
             SET ser_state = EXCLUDED.ser_state",
            (checkpoint.0, partition.0, blob),
        )?;
        Ok(())
    }

    fn mark_complete(&self, meta: &CheckpointMeta) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let txn = conn.transaction()?;
        let found: usize = txn.query_row(
            "SELECT COUNT(*) FROM snaps \
             WHERE checkpoint_id = ?1 AND part_index < ?2",
            (meta.checkpoint_id.0, meta.partition_count.0),
            |row| row.get(0),
        )?;
        if found != meta.partition_count.0 {
            return Err(StoreError::Incomplete {
                checkpoint: meta.checkpoint_id,
                found,
                expected: meta.partition_count.0,
            });
        }
        txn.execute(
            "INSERT INTO commits (checkpoint_id, part_count, input_offset) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (checkpoint_id) DO UPDATE \
             SET part_count = EXCLUDED.part_count, input_offset = EXCLUDED.input_offset",
            (
                meta.checkpoint_id.0,
                meta.partition_count.0,
                meta.input_offset.0,
            ),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn latest_complete_meta(&self) -> Result<Option<CheckpointMeta>, StoreError> {
        let meta = self
            .conn()?
            .query_row(
                "SELECT checkpoint_id, part_count, input_offset \
                 FROM commits \
                 ORDER BY checkpoint_id DESC \
                 LIMIT 1",
                (),
                |row| {
                    Ok(CheckpointMeta {
                        checkpoint_id: CheckpointId(row.get(0)?),
                        partition_count: PartitionCount(row.get(1)?),
                        input_offset: Offset(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    fn latest_complete(
        &self,
        partition: PartitionIndex,
    ) -> Result<Option<(CheckpointId, Vec<u8>)>, StoreError> {
        let found = self
            .conn()?
            .query_row(
                "SELECT snaps.checkpoint_id, snaps.ser_state \
                 FROM snaps \
                 JOIN commits USING (checkpoint_id) \
                 WHERE snaps.part_index = ?1 \
                 ORDER BY snaps.checkpoint_id DESC \
                 LIMIT 1",
                (partition.0,),
                |row| Ok((CheckpointId(row.get(0)?), row.get(1)?)),
            )
            .optional()?;
        Ok(found)
    }

    fn garbage_collect(&self, older_than: CheckpointId) -> Result<usize, StoreError> {
        tracing::trace!("GCing checkpoints before {older_than:?}");
        let mut conn = self.conn()?;
        let txn = conn.transaction()?;
        let removed = txn.execute(
            "DELETE FROM snaps WHERE checkpoint_id < ?1",
            (older_than.0,),
        )?;
        txn.execute(
            "DELETE FROM commits WHERE checkpoint_id < ?1",
            (older_than.0,),
        )?;
        txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
fn meta(id: u64, count: usize, offset: u64) -> CheckpointMeta {
    CheckpointMeta {
        checkpoint_id: CheckpointId(id),
        partition_count: PartitionCount(count),
        input_offset: Offset(offset),
    }
}

#[test]
fn empty_store_has_nothing() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    assert_eq!(store.latest_complete_meta().unwrap(), None);
    assert_eq!(store.latest_complete(PartitionIndex(0)).unwrap(), None);
}

#[test]
fn complete_checkpoint_round_trips() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    store.put(PartitionIndex(0), CheckpointId(1), b"p0").unwrap();
    store.put(PartitionIndex(1), CheckpointId(1), b"p1").unwrap();
    // Second write of the same key replaces the first.
    store
        .put(PartitionIndex(1), CheckpointId(1), b"p1-again")
        .unwrap();
    store.mark_complete(&meta(1, 2, 42)).unwrap();

    assert_eq!(store.latest_complete_meta().unwrap(), Some(meta(1, 2, 42)));
    assert_eq!(
        store.latest_complete(PartitionIndex(1)).unwrap(),
        Some((CheckpointId(1), b"p1-again".to_vec()))
    );
}

#[test]
fn incomplete_checkpoint_rejected() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    store.put(PartitionIndex(0), CheckpointId(1), b"p0").unwrap();
    store.put(PartitionIndex(0), CheckpointId(2), b"p0").unwrap();
    store.put(PartitionIndex(1), CheckpointId(2), b"p1").unwrap();

    assert!(matches!(
        store.mark_complete(&meta(1, 2, 10)),
        Err(StoreError::Incomplete { found: 1, .. })
    ));
    store.mark_complete(&meta(2, 2, 20)).unwrap();
    assert_eq!(
        store.latest_complete_meta().unwrap().map(|m| m.checkpoint_id),
        Some(CheckpointId(2))
    );
}

#[test]
fn gc_keeps_newer_checkpoints() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    for id in 1..=3 {
        store
            .put(PartitionIndex(0), CheckpointId(id), format!("s{id}").as_bytes())
            .unwrap();
        store.mark_complete(&meta(id, 1, id * 5)).unwrap();
    }
    // An uncommitted attempt from before the cut goes too.
    let removed = store.garbage_collect(CheckpointId(3)).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(
        store.latest_complete(PartitionIndex(0)).unwrap(),
        Some((CheckpointId(3), b"s3".to_vec()))
    );
}

#[test]
fn persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("checkpoints.sqlite3");
    {
        let store = SqliteCheckpointStore::open(&file).unwrap();
        store.put(PartitionIndex(0), CheckpointId(7), b"state").unwrap();
        store.mark_complete(&meta(7, 1, 99)).unwrap();
    }

    let store = SqliteCheckpointStore::open(&file).unwrap();
    assert_eq!(store.latest_complete_meta().unwrap(), Some(meta(7, 1, 99)));
    assert_eq!(
        store.latest_complete(PartitionIndex(0)).unwrap(),
        Some((CheckpointId(7), b"state".to_vec()))
    );
}

//! The durable store backing the sync core.
//!
//! Three concerns behind one surface: the database/grant directory, the
//! per-database transaction log, and bundle snapshots. Directory and log
//! rows live in redb with JSON values; snapshot blobs live as plain files
//! under the bundle directory, keyed like the log.
//!
//! All writes are conditional inside a single write transaction, so two
//! racing writers can never both claim the same database id, grant, or
//! sequence slot.

use std::{io, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, backends::InMemoryBackend};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{error, info};

use crate::protos::client::Command;

mod tables;

pub use self::tables::{DatabaseRow, GrantRow, TransactionRow};
use self::tables::{DATABASES_TABLE, GRANTS_BY_DATABASE_TABLE, GRANTS_TABLE, TRANSACTIONS_TABLE};

/// Failures of the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No database row for the given id.
    #[error("database not found")]
    DatabaseNotFound,
    /// A database row already claims the given id.
    #[error("database already exists")]
    DatabaseAlreadyExists,
    /// No grant row for the given key.
    #[error("grant not found")]
    GrantNotFound,
    /// A grant row already exists for the given key.
    #[error("grant already exists")]
    GrantAlreadyExists,
    /// The caller has no writable grant matching the database.
    #[error("write permission denied")]
    PermissionDenied,
    /// The sequence slot is already occupied.
    #[error("sequence slot {0} already occupied")]
    SlotOccupied(u64),
    /// The bundle does not advance past the current one.
    #[error("bundle sequence number {attempted} does not exceed the current {current}")]
    StaleBundle {
        /// The rejected sequence number.
        attempted: u64,
        /// The bundle the database already has.
        current: u64,
    },
    /// No snapshot blob for the given key.
    #[error("bundle not found")]
    BundleNotFound,
    /// A grant index row pointing at a grant for a different database.
    #[error("grant index for database {0} is corrupt")]
    CorruptIndex(String),
    /// Row encoding or decoding failed.
    #[error("row encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    /// Blob I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    /// Storage layer failure.
    #[error(transparent)]
    Table(#[from] redb::TableError),
    /// Storage layer failure.
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    /// Storage layer failure.
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
}

/// The durable store: directory, transaction logs, and bundle blobs.
#[derive(Debug)]
pub struct Store {
    db: Database,
    bundle_dir: PathBuf,
}

impl Store {
    /// Open or create a store at the given paths.
    pub fn persistent(db_path: impl AsRef<Path>, bundle_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("loading store from {}", db_path.to_string_lossy());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create store directory at {}",
                    db_path.to_string_lossy()
                )
            })?;
        }
        let db = Database::builder()
            .create(db_path)
            .context("failed to open store database")?;
        Self::open(db, bundle_dir.as_ref().to_path_buf())
    }

    /// Open a fresh in-memory store with a throwaway bundle directory.
    pub fn in_memory() -> Result<Self> {
        info!("using in-memory store");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        let bundle_dir =
            std::env::temp_dir().join(format!("lockstep-bundles-{:08x}", rand::random::<u32>()));
        Self::open(db, bundle_dir)
    }

    fn open(db: Database, bundle_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&bundle_dir).with_context(|| {
            format!(
                "failed to create bundle directory at {}",
                bundle_dir.to_string_lossy()
            )
        })?;
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(DATABASES_TABLE)?;
            let _table = write_tx.open_table(GRANTS_TABLE)?;
            let _table = write_tx.open_table(GRANTS_BY_DATABASE_TABLE)?;
            let _table = write_tx.open_table(TRANSACTIONS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db, bundle_dir })
    }

    /// Create a database together with its owner's grant.
    ///
    /// Fails without writing anything if the database id or the grant key
    /// is already taken.
    pub fn create_database(
        &self,
        database: &DatabaseRow,
        grant: &GrantRow,
    ) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut databases = tx.open_table(DATABASES_TABLE)?;
            if databases.get(database.database_id.as_str())?.is_some() {
                return Err(StoreError::DatabaseAlreadyExists);
            }
            let mut grants = tx.open_table(GRANTS_TABLE)?;
            let grant_key = (grant.user_id.as_str(), grant.database_name_hash.as_str());
            if grants.get(grant_key)?.is_some() {
                return Err(StoreError::GrantAlreadyExists);
            }
            databases.insert(database.database_id.as_str(), encode(database)?.as_slice())?;
            grants.insert(grant_key, encode(grant)?.as_slice())?;
            let mut index = tx.open_table(GRANTS_BY_DATABASE_TABLE)?;
            index.insert(
                (database.database_id.as_str(), grant.user_id.as_str()),
                grant_key,
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Look up a database by id.
    pub fn get_database(&self, database_id: &str) -> Result<Option<DatabaseRow>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(DATABASES_TABLE)?;
        read_database(&table, database_id)
    }

    /// Look up a grant by its primary key.
    pub fn get_grant(
        &self,
        user_id: &str,
        database_name_hash: &str,
    ) -> Result<Option<GrantRow>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(GRANTS_TABLE)?;
        read_grant(&table, user_id, database_name_hash)
    }

    /// Look up a grant through the (database id, user id) index.
    pub fn get_grant_by_database(
        &self,
        database_id: &str,
        user_id: &str,
    ) -> Result<Option<GrantRow>, StoreError> {
        let tx = self.db.begin_read()?;
        let index = tx.open_table(GRANTS_BY_DATABASE_TABLE)?;
        let Some(key) = index.get((database_id, user_id))? else {
            return Ok(None);
        };
        let (grant_user, name_hash) = key.value();
        let (grant_user, name_hash) = (grant_user.to_owned(), name_hash.to_owned());
        drop(key);
        let grants = tx.open_table(GRANTS_TABLE)?;
        let Some(grant) = read_grant(&grants, &grant_user, &name_hash)? else {
            return Ok(None);
        };
        if grant.database_id != database_id {
            error!(
                database_id,
                user_id,
                grant_database_id = grant.database_id,
                "grant index points at a grant for another database"
            );
            return Err(StoreError::CorruptIndex(database_id.to_owned()));
        }
        Ok(Some(grant))
    }

    /// Resolve a user's (grant, database) pair by name hash.
    pub fn open_by_name_hash(
        &self,
        user_id: &str,
        database_name_hash: &str,
    ) -> Result<Option<(GrantRow, DatabaseRow)>, StoreError> {
        let tx = self.db.begin_read()?;
        let grants = tx.open_table(GRANTS_TABLE)?;
        let Some(grant) = read_grant(&grants, user_id, database_name_hash)? else {
            return Ok(None);
        };
        let databases = tx.open_table(DATABASES_TABLE)?;
        let Some(database) = read_database(&databases, &grant.database_id)? else {
            return Ok(None);
        };
        Ok(Some((grant, database)))
    }

    /// Create a grant for a user the database was shared with.
    pub fn put_grant(&self, grant: &GrantRow) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut grants = tx.open_table(GRANTS_TABLE)?;
            let grant_key = (grant.user_id.as_str(), grant.database_name_hash.as_str());
            if grants.get(grant_key)?.is_some() {
                return Err(StoreError::GrantAlreadyExists);
            }
            let mut index = tx.open_table(GRANTS_BY_DATABASE_TABLE)?;
            let index_key = (grant.database_id.as_str(), grant.user_id.as_str());
            if index.get(index_key)?.is_some() {
                return Err(StoreError::GrantAlreadyExists);
            }
            grants.insert(grant_key, encode(grant)?.as_slice())?;
            index.insert(index_key, grant_key)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Change the permission flags of an existing grant.
    pub fn modify_grant(
        &self,
        database_id: &str,
        user_id: &str,
        read_only: Option<bool>,
        resharing_allowed: Option<bool>,
    ) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let index = tx.open_table(GRANTS_BY_DATABASE_TABLE)?;
            let Some(key) = index.get((database_id, user_id))? else {
                return Err(StoreError::GrantNotFound);
            };
            let (grant_user, name_hash) = key.value();
            let (grant_user, name_hash) = (grant_user.to_owned(), name_hash.to_owned());
            drop(key);
            let mut grants = tx.open_table(GRANTS_TABLE)?;
            let mut grant =
                read_grant(&grants, &grant_user, &name_hash)?.ok_or(StoreError::GrantNotFound)?;
            if let Some(read_only) = read_only {
                grant.read_only = read_only;
            }
            if let Some(resharing_allowed) = resharing_allowed {
                grant.resharing_allowed = resharing_allowed;
            }
            grants.insert(
                (grant_user.as_str(), name_hash.as_str()),
                encode(&grant)?.as_slice(),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a grant, removing the user's access.
    pub fn revoke_grant(&self, database_id: &str, user_id: &str) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut index = tx.open_table(GRANTS_BY_DATABASE_TABLE)?;
            let Some(key) = index.remove((database_id, user_id))? else {
                return Err(StoreError::GrantNotFound);
            };
            let (grant_user, name_hash) = key.value();
            let (grant_user, name_hash) = (grant_user.to_owned(), name_hash.to_owned());
            drop(key);
            let mut grants = tx.open_table(GRANTS_TABLE)?;
            grants.remove((grant_user.as_str(), name_hash.as_str()))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically increment and fetch a database's sequence counter.
    ///
    /// The first allocation for a database yields 1. Once a number is
    /// handed out, a row must eventually exist at its slot, either the
    /// intended transaction or a rollback marker.
    pub fn allocate_seq_no(&self, database_id: &str) -> Result<u64, StoreError> {
        let tx = self.db.begin_write()?;
        let seq_no = {
            let mut databases = tx.open_table(DATABASES_TABLE)?;
            let mut row =
                read_database(&databases, database_id)?.ok_or(StoreError::DatabaseNotFound)?;
            row.next_seq_number += 1;
            databases.insert(database_id, encode(&row)?.as_slice())?;
            row.next_seq_number
        };
        tx.commit()?;
        Ok(seq_no)
    }

    /// Append a transaction at its allocated slot.
    ///
    /// The caller's grant is re-checked as a condition of the same write:
    /// it must exist, match the database id, and not be read-only.
    pub fn append_transaction(
        &self,
        user_id: &str,
        database_name_hash: &str,
        database_id: &str,
        row: &TransactionRow,
    ) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let grants = tx.open_table(GRANTS_TABLE)?;
            let grant = read_grant(&grants, user_id, database_name_hash)?
                .ok_or(StoreError::PermissionDenied)?;
            if grant.database_id != database_id || grant.read_only {
                return Err(StoreError::PermissionDenied);
            }
            let mut transactions = tx.open_table(TRANSACTIONS_TABLE)?;
            let key = (database_id, row.sequence_no);
            if transactions.get(key)?.is_some() {
                return Err(StoreError::SlotOccupied(row.sequence_no));
            }
            transactions.insert(key, encode(row)?.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Fill an allocated slot with a rollback marker, unless a row got
    /// there first. Returns whether the marker was written.
    pub fn plug_rollback(
        &self,
        database_id: &str,
        seq_no: u64,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let tx = self.db.begin_write()?;
        let plugged = {
            let mut transactions = tx.open_table(TRANSACTIONS_TABLE)?;
            let key = (database_id, seq_no);
            if transactions.get(key)?.is_some() {
                false
            } else {
                let row = TransactionRow {
                    sequence_no: seq_no,
                    creation_date: now_ms,
                    user_id: None,
                    command: Command::Rollback,
                };
                transactions.insert(key, encode(&row)?.as_slice())?;
                true
            }
        };
        tx.commit()?;
        Ok(plugged)
    }

    /// All log rows with a sequence number strictly greater than `after`,
    /// in order.
    pub fn transactions_after(
        &self,
        database_id: &str,
        after: u64,
    ) -> Result<Vec<TransactionRow>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TRANSACTIONS_TABLE)?;
        let start = after.saturating_add(1);
        let mut rows = Vec::new();
        for item in table.range((database_id, start)..=(database_id, u64::MAX))? {
            let (_key, value) = item?;
            rows.push(decode(value.value())?);
        }
        Ok(rows)
    }

    /// Advance a database's bundle sequence number.
    ///
    /// Only called after the snapshot blob is durable; rejects anything
    /// that does not move the number forward.
    pub fn record_bundle(&self, database_id: &str, bundle_seq_no: u64) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut databases = tx.open_table(DATABASES_TABLE)?;
            let mut row =
                read_database(&databases, database_id)?.ok_or(StoreError::DatabaseNotFound)?;
            if let Some(current) = row.bundle_seq_no {
                if current >= bundle_seq_no {
                    return Err(StoreError::StaleBundle {
                        attempted: bundle_seq_no,
                        current,
                    });
                }
            }
            row.bundle_seq_no = Some(bundle_seq_no);
            databases.insert(database_id, encode(&row)?.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Write a snapshot blob.
    pub async fn put_bundle(
        &self,
        database_id: &str,
        bundle_seq_no: u64,
        bundle: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.bundle_path(database_id, bundle_seq_no);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bundle).await?;
        Ok(())
    }

    /// Read a snapshot blob.
    pub async fn get_bundle(
        &self,
        database_id: &str,
        bundle_seq_no: u64,
    ) -> Result<String, StoreError> {
        match tokio::fs::read_to_string(self.bundle_path(database_id, bundle_seq_no)).await {
            Ok(bundle) => Ok(bundle),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::BundleNotFound),
            Err(e) => Err(e.into()),
        }
    }

    // database ids are client-chosen, keep them out of raw filesystem paths
    fn bundle_path(&self, database_id: &str, bundle_seq_no: u64) -> PathBuf {
        self.bundle_dir
            .join(base64_url::encode(database_id))
            .join(bundle_seq_no.to_string())
    }
}

fn encode<T: Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(row)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn read_database(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    database_id: &str,
) -> Result<Option<DatabaseRow>, StoreError> {
    let Some(row) = table.get(database_id)? else {
        return Ok(None);
    };
    Ok(Some(decode(row.value())?))
}

fn read_grant(
    table: &impl ReadableTable<(&'static str, &'static str), &'static [u8]>,
    user_id: &str,
    database_name_hash: &str,
) -> Result<Option<GrantRow>, StoreError> {
    let Some(row) = table.get((user_id, database_name_hash))? else {
        return Ok(None);
    };
    Ok(Some(decode(row.value())?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::util::now_millis;

    fn database(id: &str, owner: &str) -> DatabaseRow {
        DatabaseRow {
            database_id: id.into(),
            owner_id: owner.into(),
            database_name: format!("enc-name-{id}"),
            next_seq_number: 0,
            bundle_seq_no: None,
        }
    }

    fn grant(user: &str, hash: &str, db: &str) -> GrantRow {
        GrantRow {
            user_id: user.into(),
            database_name_hash: hash.into(),
            database_id: db.into(),
            encrypted_db_key: "enc-key".into(),
            read_only: false,
            resharing_allowed: false,
            sender_id: None,
        }
    }

    fn insert_row(store: &Store, db: &str, seq: u64) {
        let row = TransactionRow {
            sequence_no: seq,
            creation_date: now_millis(),
            user_id: Some("alice".into()),
            command: Command::Insert {
                key: format!("item-{seq}"),
                record: json!("payload"),
            },
        };
        store
            .append_transaction("alice", "hash-a", db, &row)
            .unwrap();
    }

    fn setup() -> Store {
        let store = Store::in_memory().unwrap();
        store
            .create_database(&database("db-a", "alice"), &grant("alice", "hash-a", "db-a"))
            .unwrap();
        store
    }

    #[test]
    fn create_and_resolve_database() {
        let store = setup();
        let (grant, db) = store.open_by_name_hash("alice", "hash-a").unwrap().unwrap();
        assert_eq!(grant.database_id, "db-a");
        assert_eq!(db.owner_id, "alice");
        assert_eq!(db.next_seq_number, 0);
        assert!(store.open_by_name_hash("alice", "other").unwrap().is_none());
        assert!(store.open_by_name_hash("bob", "hash-a").unwrap().is_none());
    }

    #[test]
    fn duplicate_database_creation_conflicts() {
        let store = setup();
        let err = store
            .create_database(&database("db-a", "bob"), &grant("bob", "hash-b", "db-a"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DatabaseAlreadyExists));

        // same name hash for the same user is a grant conflict
        let err = store
            .create_database(&database("db-b", "alice"), &grant("alice", "hash-a", "db-b"))
            .unwrap_err();
        assert!(matches!(err, StoreError::GrantAlreadyExists));
        assert!(store.get_database("db-b").unwrap().is_none());
    }

    #[test]
    fn allocation_is_dense_and_starts_at_one() {
        let store = setup();
        assert_eq!(store.allocate_seq_no("db-a").unwrap(), 1);
        assert_eq!(store.allocate_seq_no("db-a").unwrap(), 2);
        assert_eq!(store.allocate_seq_no("db-a").unwrap(), 3);
        assert_eq!(
            store.get_database("db-a").unwrap().unwrap().next_seq_number,
            3
        );

        let err = store.allocate_seq_no("nope").unwrap_err();
        assert!(matches!(err, StoreError::DatabaseNotFound));
    }

    #[test]
    fn append_requires_a_writable_matching_grant() {
        let store = setup();
        let row = TransactionRow {
            sequence_no: 1,
            creation_date: now_millis(),
            user_id: Some("bob".into()),
            command: Command::Insert {
                key: "k".into(),
                record: json!("r"),
            },
        };

        // no grant at all
        let err = store
            .append_transaction("bob", "hash-b", "db-a", &row)
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));

        // read-only grant
        let mut shared = grant("bob", "db-a", "db-a");
        shared.read_only = true;
        shared.sender_id = Some("alice".into());
        store.put_grant(&shared).unwrap();
        let err = store
            .append_transaction("bob", "db-a", "db-a", &row)
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));

        // grant pointing at a different database than claimed
        let err = store
            .append_transaction("alice", "hash-a", "db-other", &row)
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));

        assert!(store.transactions_after("db-a", 0).unwrap().is_empty());
    }

    #[test]
    fn sequence_slots_are_claimed_once() {
        let store = setup();
        insert_row(&store, "db-a", 1);
        let row = TransactionRow {
            sequence_no: 1,
            creation_date: now_millis(),
            user_id: Some("alice".into()),
            command: Command::Delete {
                key: "other".into(),
                record: json!("t"),
            },
        };
        let err = store
            .append_transaction("alice", "hash-a", "db-a", &row)
            .unwrap_err();
        assert!(matches!(err, StoreError::SlotOccupied(1)));

        // the original row survived the losing write
        let rows = store.transactions_after("db-a", 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0].command, Command::Insert { .. }));
    }

    #[test]
    fn rollback_only_fills_empty_slots() {
        let store = setup();
        insert_row(&store, "db-a", 1);

        assert!(store.plug_rollback("db-a", 2, now_millis()).unwrap());
        assert!(!store.plug_rollback("db-a", 1, now_millis()).unwrap());

        let rows = store.transactions_after("db-a", 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(rows[0].command, Command::Insert { .. }));
        assert!(rows[1].command.is_rollback());
        assert_eq!(rows[1].user_id, None);
    }

    #[test]
    fn log_scans_stay_inside_one_database() {
        let store = setup();
        store
            .create_database(&database("db-b", "alice"), &grant("alice", "hash-b", "db-b"))
            .unwrap();
        for seq in 1..=5 {
            insert_row(&store, "db-a", seq);
        }
        let row = TransactionRow {
            sequence_no: 1,
            creation_date: now_millis(),
            user_id: Some("alice".into()),
            command: Command::Insert {
                key: "b-item".into(),
                record: json!("b"),
            },
        };
        store
            .append_transaction("alice", "hash-b", "db-b", &row)
            .unwrap();

        let rows = store.transactions_after("db-a", 2).unwrap();
        let seqs: Vec<u64> = rows.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let rows = store.transactions_after("db-b", 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sequence_no, 1);
    }

    #[test]
    fn bundles_only_advance() {
        let store = setup();
        store.record_bundle("db-a", 5).unwrap();
        assert!(matches!(
            store.record_bundle("db-a", 5),
            Err(StoreError::StaleBundle {
                attempted: 5,
                current: 5
            })
        ));
        assert!(matches!(
            store.record_bundle("db-a", 4),
            Err(StoreError::StaleBundle { .. })
        ));
        store.record_bundle("db-a", 6).unwrap();
        assert_eq!(
            store.get_database("db-a").unwrap().unwrap().bundle_seq_no,
            Some(6)
        );
    }

    #[tokio::test]
    async fn bundle_blobs_round_trip() {
        let store = setup();
        store
            .put_bundle("db-a", 3, b"snapshot state")
            .await
            .unwrap();
        assert_eq!(store.get_bundle("db-a", 3).await.unwrap(), "snapshot state");
        assert!(matches!(
            store.get_bundle("db-a", 4).await,
            Err(StoreError::BundleNotFound)
        ));
        // ids with path characters stay contained
        store.put_bundle("../../db", 1, b"x").await.unwrap();
        assert_eq!(store.get_bundle("../../db", 1).await.unwrap(), "x");
    }

    #[test]
    fn persistent_stores_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("log.db");
        let bundle_dir = dir.path().join("bundles");
        {
            let store = Store::persistent(&db_path, &bundle_dir).unwrap();
            store
                .create_database(&database("db-a", "alice"), &grant("alice", "hash-a", "db-a"))
                .unwrap();
            assert_eq!(store.allocate_seq_no("db-a").unwrap(), 1);
            insert_row(&store, "db-a", 1);
        }

        let store = Store::persistent(&db_path, &bundle_dir).unwrap();
        let (_, db) = store.open_by_name_hash("alice", "hash-a").unwrap().unwrap();
        assert_eq!(db.next_seq_number, 1);
        let rows = store.transactions_after("db-a", 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sequence_no, 1);
        // the counter picks up where it left off
        assert_eq!(store.allocate_seq_no("db-a").unwrap(), 2);
    }

    #[test]
    fn grants_share_modify_revoke() {
        let store = setup();
        let mut shared = grant("bob", "db-a", "db-a");
        shared.read_only = true;
        shared.sender_id = Some("alice".into());
        store.put_grant(&shared).unwrap();

        assert!(matches!(
            store.put_grant(&shared),
            Err(StoreError::GrantAlreadyExists)
        ));

        let found = store.get_grant_by_database("db-a", "bob").unwrap().unwrap();
        assert!(found.read_only);
        assert_eq!(found.sender_id.as_deref(), Some("alice"));

        store
            .modify_grant("db-a", "bob", Some(false), Some(true))
            .unwrap();
        let found = store.get_grant_by_database("db-a", "bob").unwrap().unwrap();
        assert!(!found.read_only);
        assert!(found.resharing_allowed);

        store.revoke_grant("db-a", "bob").unwrap();
        assert!(store.get_grant_by_database("db-a", "bob").unwrap().is_none());
        assert!(matches!(
            store.revoke_grant("db-a", "bob"),
            Err(StoreError::GrantNotFound)
        ));
    }
}

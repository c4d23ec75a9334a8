//! Table definitions and row types of the durable store.

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::protos::{
    client::{Command, LogEntry},
    peer::CommittedTransaction,
};

/// Database directory, keyed by database id.
pub(super) const DATABASES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("databases-1");

/// Grants, keyed by (user id, database name hash).
pub(super) const GRANTS_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("user-databases-1");

/// Reverse grant lookup, (database id, user id) to a [`GRANTS_TABLE`] key.
pub(super) const GRANTS_BY_DATABASE_TABLE: TableDefinition<(&str, &str), (&str, &str)> =
    TableDefinition::new("user-databases-by-database-1");

/// Transaction log, keyed by (database id, sequence number).
pub(super) const TRANSACTIONS_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("transactions-1");

/// One logical database.
///
/// `next_seq_number` only ever grows, by the allocator. `bundle_seq_no` only
/// ever advances, and only after the snapshot blob it names is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRow {
    /// Identifier, also the table key.
    pub database_id: String,
    /// The owning user.
    pub owner_id: String,
    /// Encrypted database name.
    pub database_name: String,
    /// Highest sequence number ever allocated.
    #[serde(default)]
    pub next_seq_number: u64,
    /// Sequence number of the most recent snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_seq_no: Option<u64>,
}

/// One user's access to one database.
///
/// The owner's row is created together with the database and is never
/// read-only. Exactly one row exists per (user, database) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRow {
    /// The user holding the grant.
    pub user_id: String,
    /// The user's name hash for the database, part of the table key.
    pub database_name_hash: String,
    /// The database granted.
    pub database_id: String,
    /// Database key wrapped for this user.
    pub encrypted_db_key: String,
    /// Whether writes are denied.
    #[serde(default)]
    pub read_only: bool,
    /// Whether the user may share the database onward.
    #[serde(default)]
    pub resharing_allowed: bool,
    /// Who shared the database with this user, absent on the owner's row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

/// One transaction log row. The database id lives in the table key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRow {
    /// Position in the log, also part of the table key.
    pub sequence_no: u64,
    /// Commit time, milliseconds since the unix epoch.
    pub creation_date: u64,
    /// The committing user, when attributed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// What the transaction does.
    #[serde(flatten)]
    pub command: Command,
}

impl TransactionRow {
    /// The client-visible view of this row.
    pub fn log_entry(&self, database_id: &str) -> LogEntry {
        LogEntry {
            seq_no: self.sequence_no,
            db_id: database_id.to_owned(),
            command: self.command.clone(),
        }
    }

    /// The fan-out view of this row.
    pub fn committed(&self, database_id: &str) -> CommittedTransaction {
        CommittedTransaction {
            database_id: database_id.to_owned(),
            sequence_no: self.sequence_no,
            creation_date: self.creation_date,
            user_id: self.user_id.clone(),
            command: self.command.clone(),
        }
    }
}

//! The internal protocol between server instances.
//!
//! A commit on one instance nudges every other instance to catch its own
//! connections up. Notifications are best-effort fire-and-forget POSTs;
//! delivery is not relied on, since every connection's catch-up pass is
//! idempotent and the periodic pings trigger a coarse resync regardless.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::{Command, LogEntry};

/// Path of the transaction notification endpoint.
pub const NOTIFY_TRANSACTION_PATH: &str = "/internal/notify-transaction";

/// Path of the user update notification endpoint.
pub const NOTIFY_UPDATED_USER_PATH: &str = "/internal/notify-updated-user";

/// A transaction as fanned out to live connections and to peer instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedTransaction {
    /// The database the transaction was appended to.
    pub database_id: String,
    /// Position in that database's log.
    pub sequence_no: u64,
    /// Commit time, milliseconds since the unix epoch.
    pub creation_date: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The committing user, when attributed.
    pub user_id: Option<String>,
    /// What the transaction does.
    #[serde(flatten)]
    pub command: Command,
}

impl CommittedTransaction {
    /// The client-visible view of this transaction.
    pub fn log_entry(&self) -> LogEntry {
        LogEntry {
            seq_no: self.sequence_no,
            db_id: self.database_id.clone(),
            command: self.command.clone(),
        }
    }
}

/// Body of a `POST /internal/notify-transaction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyTransaction {
    /// The committed transaction.
    pub transaction: CommittedTransaction,
    /// The user whose connections should be caught up.
    pub user_id: String,
}

/// Body of a `POST /internal/notify-updated-user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyUpdatedUser {
    /// The user whose connections should be told.
    pub user_id: String,
    /// The changed profile, opaque to the sync core.
    pub updated_user: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn notification_round_trips() {
        let notification = NotifyTransaction {
            transaction: CommittedTransaction {
                database_id: "db".into(),
                sequence_no: 7,
                creation_date: 1_700_000_000_000,
                user_id: Some("user".into()),
                command: Command::Delete {
                    key: "k".into(),
                    record: json!("tombstone"),
                },
            },
            user_id: "user".into(),
        };
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["transaction"]["sequenceNo"], 7);
        assert_eq!(value["transaction"]["command"], "Delete");
        let back: NotifyTransaction = serde_json::from_value(value).unwrap();
        assert_eq!(back.transaction, notification.transaction);
    }

    #[test]
    fn log_entry_drops_attribution() {
        let tx = CommittedTransaction {
            database_id: "db".into(),
            sequence_no: 1,
            creation_date: 0,
            user_id: Some("user".into()),
            command: Command::Rollback,
        };
        let entry = tx.log_entry();
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("userId").is_none());
        assert!(value.get("creationDate").is_none());
    }
}

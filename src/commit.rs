//! The commit pipeline.
//!
//! A commit allocates the next sequence number for the database, then
//! appends the transaction at that slot with the caller's write grant
//! re-checked as a condition of the same store write. When the append
//! fails the allocated slot is plugged with a rollback marker so the log
//! stays dense; the plug itself is best effort, a catch-up pass repairs
//! any slot it misses once the gap grace period runs out.

use std::sync::Arc;

use tracing::debug;

use crate::{
    protos::{
        client::{Command, MAX_OPERATIONS_IN_BATCH},
        peer::NotifyTransaction,
    },
    state::AppState,
    store::{StoreError, TransactionRow},
    util::now_millis,
};

/// Why a commit was refused.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The request shape is invalid. Nothing was allocated.
    #[error("{0}")]
    Validation(String),
    /// The caller may not write to this database.
    #[error("Make sure user has write permission to this db and the db id and hash are correct")]
    PermissionDenied,
    /// The store refused the append. The allocated slot was plugged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Commit one transaction and fan it out.
///
/// On success returns the assigned sequence number, after handing the
/// transaction to same-instance connections watching the database and to
/// the peer broadcast.
pub async fn commit(
    state: &AppState,
    user_id: &str,
    database_name_hash: &str,
    database_id: &str,
    command: Command,
) -> Result<u64, CommitError> {
    if let Command::BatchTransaction { operations } = &command {
        if operations.len() > MAX_OPERATIONS_IN_BATCH {
            return Err(CommitError::Validation(
                "Too many operations in batch".into(),
            ));
        }
    }

    let sequence_no = state.store.allocate_seq_no(database_id)?;
    let row = TransactionRow {
        sequence_no,
        creation_date: now_millis(),
        user_id: Some(user_id.to_owned()),
        command,
    };

    if let Err(e) =
        state
            .store
            .append_transaction(user_id, database_name_hash, database_id, &row)
    {
        state.metrics.commit_failures.inc();
        if let Err(plug_err) =
            state
                .store
                .plug_rollback(database_id, sequence_no, row.creation_date)
        {
            debug!("failed to plug rollback at {database_id}/{sequence_no} with {plug_err}");
        }
        return Err(match e {
            StoreError::PermissionDenied => CommitError::PermissionDenied,
            e => CommitError::Store(e),
        });
    }

    state.metrics.commits.inc();
    let notification = Arc::new(NotifyTransaction {
        transaction: row.committed(database_id),
        user_id: user_id.to_owned(),
    });
    state.connections.push_transaction(notification.clone());
    state.peers.broadcast_transaction(&notification);
    Ok(sequence_no)
}

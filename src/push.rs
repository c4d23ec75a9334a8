//! Catch-up passes over database logs.
//!
//! Every (connection, database) pair owns a [`Cursor`]. A catch-up pass
//! scans the log above the cursor, walks entries in sequence order and
//! turns them into one [`TransactionPayload`]. Gaps in the log are slots
//! that were allocated but never written. A young gap may still be filled
//! by its straggling commit, so the pass backs off. A gap older than the
//! grace period is plugged with rollback markers and walked over.
//!
//! The cursor is only advanced by the caller once the payload is flushed
//! to the socket, so a failed send re-delivers instead of skipping.

use std::time::Duration;

use tracing::debug;

use crate::{
    metrics::Metrics,
    protos::{client::TransactionPayload, peer::CommittedTransaction},
    store::{DatabaseRow, GrantRow, Store, StoreError},
};

/// Delivery state of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing flushed yet. The next payload carries the database
    /// metadata the client needs to finish opening.
    Opening,
    /// At least one payload flushed.
    Streaming,
}

/// A connection's position in one database's log.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// The database this cursor follows.
    pub database_id: String,
    /// The caller's name hash for the database.
    pub database_name_hash: String,
    /// The caller's wrapped database key.
    pub encrypted_db_key: String,
    /// Whether the caller owns the database.
    pub is_owner: bool,
    /// Whether the caller's grant is read-only.
    pub read_only: bool,
    /// Snapshot to start from when delivery starts at the log head.
    pub bundle_seq_no: Option<u64>,
    /// Highest sequence number walked and flushed.
    pub last_seq_no: u64,
    /// Log bytes delivered since the last bundle hint.
    pub log_bytes: u64,
    /// Delivery state.
    pub state: CursorState,
}

impl Cursor {
    /// A fresh cursor for a grant, optionally resuming mid-log.
    pub fn open(grant: &GrantRow, database: &DatabaseRow, reopen_at_seq_no: Option<u64>) -> Self {
        Self {
            database_id: database.database_id.clone(),
            database_name_hash: grant.database_name_hash.clone(),
            encrypted_db_key: grant.encrypted_db_key.clone(),
            is_owner: grant.user_id == database.owner_id,
            read_only: grant.read_only,
            bundle_seq_no: database.bundle_seq_no,
            last_seq_no: reopen_at_seq_no.unwrap_or(0),
            log_bytes: 0,
            state: CursorState::Opening,
        }
    }

    /// Fold a batch into the bundle accounting. True asks the receiving
    /// client to upload a compacted snapshot; the accounting restarts.
    pub fn note_batch_size(&mut self, size: u64, trigger_bytes: u64) -> bool {
        if self.log_bytes + size >= trigger_bytes {
            self.log_bytes = 0;
            true
        } else {
            self.log_bytes += size;
            false
        }
    }

    /// Move past a flushed payload.
    pub fn advance(&mut self, last_seq_no: u64) {
        self.last_seq_no = last_seq_no;
        self.state = CursorState::Streaming;
    }
}

/// The outcome of a catch-up pass.
#[derive(Debug)]
pub struct Batch {
    /// The payload to flush, minus the bundle hint.
    pub payload: TransactionPayload,
    /// Where [`Cursor::advance`] lands once the payload is flushed.
    pub new_last_seq_no: u64,
    /// Serialized size of the walked rows.
    pub size: u64,
    /// False when the walk only crossed rollback plugs and the client
    /// needs no payload, just the cursor move.
    pub deliver: bool,
}

/// One catch-up pass over a database log.
///
/// Returns `None` when the cursor is already at the head, when a young
/// gap blocks the walk, or when a plug race is lost. The losing plug is
/// harmless either way: the racing commit triggers a fresh pass.
pub async fn catch_up(
    store: &Store,
    metrics: &Metrics,
    cursor: &Cursor,
    now_ms: u64,
    gap_grace: Duration,
) -> Result<Option<Batch>, StoreError> {
    metrics.catchup_passes.inc();

    let mut bundle = None;
    let floor = match cursor.bundle_seq_no {
        Some(bundle_seq_no) if cursor.last_seq_no == 0 => {
            bundle = Some(store.get_bundle(&cursor.database_id, bundle_seq_no).await?);
            bundle_seq_no
        }
        _ => cursor.last_seq_no,
    };

    let rows = store.transactions_after(&cursor.database_id, floor)?;
    let grace_ms = gap_grace.as_millis() as u64;
    let mut entries = Vec::new();
    let mut size = 0u64;
    let mut expected = floor.saturating_add(1);
    for row in &rows {
        if row.sequence_no > expected {
            if now_ms.saturating_sub(row.creation_date) <= grace_ms {
                // a commit below this row may still land in the hole
                debug!(
                    database_id = cursor.database_id,
                    expected,
                    found = row.sequence_no,
                    "waiting out a young log gap"
                );
                metrics.catchup_gap_waits.inc();
                return Ok(None);
            }
            for seq_no in expected..row.sequence_no {
                if !store.plug_rollback(&cursor.database_id, seq_no, now_ms)? {
                    // lost the slot to a racing commit, which re-runs us
                    return Ok(None);
                }
                metrics.rollbacks_plugged.inc();
            }
        }
        size += serde_json::to_vec(row)?.len() as u64;
        if !row.command.is_rollback() {
            entries.push(row.log_entry(&cursor.database_id));
        }
        expected = row.sequence_no + 1;
    }

    let new_last_seq_no = rows.last().map_or(floor, |row| row.sequence_no);
    let opening = cursor.state == CursorState::Opening;
    if !opening && entries.is_empty() && new_last_seq_no == cursor.last_seq_no {
        return Ok(None);
    }

    let deliver = opening || !entries.is_empty();
    let mut payload = TransactionPayload {
        db_id: cursor.database_id.clone(),
        transaction_log: entries,
        ..Default::default()
    };
    if opening {
        payload.db_name_hash = Some(cursor.database_name_hash.clone());
        payload.db_key = Some(cursor.encrypted_db_key.clone());
        payload.is_owner = Some(cursor.is_owner);
        payload.read_only = Some(cursor.read_only);
    }
    if let Some(bundle) = bundle {
        payload.bundle_seq_no = cursor.bundle_seq_no;
        payload.bundle = Some(bundle);
    }
    Ok(Some(Batch {
        payload,
        new_last_seq_no,
        size,
        deliver,
    }))
}

/// Hand a freshly committed transaction straight to a cursor, skipping
/// the log scan. Only applies when the transaction lands exactly at the
/// head of a streaming cursor; every other shape takes the full pass.
pub fn fast_forward(cursor: &Cursor, transaction: &CommittedTransaction) -> Option<Batch> {
    if cursor.state != CursorState::Streaming
        || transaction.database_id != cursor.database_id
        || transaction.command.is_rollback()
        || transaction.sequence_no != cursor.last_seq_no.saturating_add(1)
    {
        return None;
    }
    let size = serde_json::to_vec(transaction).map_or(0, |row| row.len() as u64);
    let payload = TransactionPayload {
        db_id: cursor.database_id.clone(),
        transaction_log: vec![transaction.log_entry()],
        ..Default::default()
    };
    Some(Batch {
        payload,
        new_last_seq_no: transaction.sequence_no,
        size,
        deliver: true,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        protos::client::Command,
        store::TransactionRow,
    };

    const GRACE: Duration = Duration::from_secs(10);

    fn setup() -> (Store, Cursor) {
        let store = Store::in_memory().unwrap();
        let database = DatabaseRow {
            database_id: "db-a".into(),
            owner_id: "alice".into(),
            database_name: "enc-name".into(),
            next_seq_number: 0,
            bundle_seq_no: None,
        };
        let grant = GrantRow {
            user_id: "alice".into(),
            database_name_hash: "hash-a".into(),
            database_id: "db-a".into(),
            encrypted_db_key: "enc-key".into(),
            read_only: false,
            resharing_allowed: false,
            sender_id: None,
        };
        store.create_database(&database, &grant).unwrap();
        let cursor = Cursor::open(&grant, &database, None);
        (store, cursor)
    }

    fn append(store: &Store, seq: u64, created_at: u64) {
        let row = TransactionRow {
            sequence_no: seq,
            creation_date: created_at,
            user_id: Some("alice".into()),
            command: Command::Insert {
                key: format!("k{seq}"),
                record: json!("r"),
            },
        };
        store
            .append_transaction("alice", "hash-a", "db-a", &row)
            .unwrap();
    }

    #[tokio::test]
    async fn young_gap_blocks_the_whole_pass() {
        let (store, cursor) = setup();
        for seq in [1, 2, 4, 5] {
            append(&store, seq, 1_000);
        }
        let metrics = Metrics::default();
        // right at the edge of the grace period, still too young
        let now = 1_000 + GRACE.as_millis() as u64;
        let batch = catch_up(&store, &metrics, &cursor, now, GRACE).await.unwrap();
        assert!(batch.is_none());
        assert_eq!(metrics.catchup_gap_waits.get(), 1);

        // slot 3 stays open for the straggler
        let rows = store.transactions_after("db-a", 2).unwrap();
        assert_eq!(rows[0].sequence_no, 4);
    }

    #[tokio::test]
    async fn expired_gap_is_plugged_and_walked_over() {
        let (store, mut cursor) = setup();
        for seq in [1, 2, 4, 5] {
            append(&store, seq, 1_000);
        }
        let metrics = Metrics::default();
        let now = 1_000 + GRACE.as_millis() as u64 + 1;
        let batch = catch_up(&store, &metrics, &cursor, now, GRACE)
            .await
            .unwrap()
            .unwrap();
        let seqs: Vec<u64> = batch
            .payload
            .transaction_log
            .iter()
            .map(|e| e.seq_no)
            .collect();
        assert_eq!(seqs, vec![1, 2, 4, 5]);
        assert_eq!(batch.new_last_seq_no, 5);
        assert!(batch.deliver);
        assert_eq!(metrics.rollbacks_plugged.get(), 1);

        // the hole is a rollback marker now
        let rows = store.transactions_after("db-a", 0).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows[2].command.is_rollback());

        // and the next pass finds nothing new
        cursor.advance(batch.new_last_seq_no);
        assert_eq!(cursor.state, CursorState::Streaming);
        let batch = catch_up(&store, &metrics, &cursor, now, GRACE).await.unwrap();
        assert!(batch.is_none());
    }

    #[tokio::test]
    async fn opening_payload_carries_database_metadata() {
        let (store, cursor) = setup();
        let metrics = Metrics::default();
        let batch = catch_up(&store, &metrics, &cursor, 1_000, GRACE)
            .await
            .unwrap()
            .unwrap();
        assert!(batch.deliver);
        assert!(batch.payload.transaction_log.is_empty());
        assert_eq!(batch.payload.db_name_hash.as_deref(), Some("hash-a"));
        assert_eq!(batch.payload.db_key.as_deref(), Some("enc-key"));
        assert_eq!(batch.payload.is_owner, Some(true));
        assert_eq!(batch.payload.read_only, Some(false));
        assert_eq!(batch.new_last_seq_no, 0);
    }

    #[tokio::test]
    async fn opening_from_a_bundle_skips_compacted_rows() {
        let (store, _) = setup();
        for seq in 1..=4 {
            append(&store, seq, 1_000);
        }
        store.put_bundle("db-a", 2, b"compacted").await.unwrap();
        store.record_bundle("db-a", 2).unwrap();

        let database = store.get_database("db-a").unwrap().unwrap();
        let grant = store.get_grant("alice", "hash-a").unwrap().unwrap();
        let cursor = Cursor::open(&grant, &database, None);
        let metrics = Metrics::default();
        let batch = catch_up(&store, &metrics, &cursor, 2_000, GRACE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.payload.bundle_seq_no, Some(2));
        assert_eq!(batch.payload.bundle.as_deref(), Some("compacted"));
        let seqs: Vec<u64> = batch
            .payload
            .transaction_log
            .iter()
            .map(|e| e.seq_no)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(batch.new_last_seq_no, 4);

        // a reopen mid-log ignores the snapshot
        let cursor = Cursor::open(&grant, &database, Some(3));
        let batch = catch_up(&store, &metrics, &cursor, 2_000, GRACE)
            .await
            .unwrap()
            .unwrap();
        assert!(batch.payload.bundle.is_none());
        assert_eq!(batch.payload.transaction_log.len(), 1);
        assert_eq!(batch.payload.transaction_log[0].seq_no, 4);
    }

    #[tokio::test]
    async fn rollback_only_spans_move_the_cursor_silently() {
        let (store, mut cursor) = setup();
        append(&store, 1, 1_000);
        let metrics = Metrics::default();
        let batch = catch_up(&store, &metrics, &cursor, 1_500, GRACE)
            .await
            .unwrap()
            .unwrap();
        cursor.advance(batch.new_last_seq_no);

        store.plug_rollback("db-a", 2, 1_500).unwrap();
        let batch = catch_up(&store, &metrics, &cursor, 1_600, GRACE)
            .await
            .unwrap()
            .unwrap();
        assert!(!batch.deliver);
        assert!(batch.payload.transaction_log.is_empty());
        assert_eq!(batch.new_last_seq_no, 2);

        cursor.advance(batch.new_last_seq_no);
        let batch = catch_up(&store, &metrics, &cursor, 1_600, GRACE).await.unwrap();
        assert!(batch.is_none());
    }

    #[test]
    fn fast_forward_applies_only_at_the_head() {
        let (_store, mut cursor) = setup();
        cursor.advance(3);

        let tx = |seq: u64| CommittedTransaction {
            database_id: "db-a".into(),
            sequence_no: seq,
            creation_date: 0,
            user_id: Some("alice".into()),
            command: Command::Insert {
                key: "k".into(),
                record: json!("r"),
            },
        };

        let batch = fast_forward(&cursor, &tx(4)).unwrap();
        assert!(batch.deliver);
        assert_eq!(batch.new_last_seq_no, 4);
        assert_eq!(batch.payload.transaction_log[0].seq_no, 4);
        assert!(batch.size > 0);

        // behind, ahead, wrong database, rollback
        assert!(fast_forward(&cursor, &tx(3)).is_none());
        assert!(fast_forward(&cursor, &tx(6)).is_none());
        let mut other = tx(4);
        other.database_id = "db-b".into();
        assert!(fast_forward(&cursor, &other).is_none());
        let mut rollback = tx(4);
        rollback.command = Command::Rollback;
        assert!(fast_forward(&cursor, &rollback).is_none());

        // opening cursors always take the full pass
        let mut opening = cursor.clone();
        opening.state = CursorState::Opening;
        assert!(fast_forward(&opening, &tx(4)).is_none());
    }

    #[test]
    fn bundle_hint_fires_at_the_size_trigger() {
        let (_store, mut cursor) = setup();
        assert!(!cursor.note_batch_size(400, 1_000));
        assert!(!cursor.note_batch_size(400, 1_000));
        // 800 accumulated, 400 more crosses the trigger
        assert!(cursor.note_batch_size(400, 1_000));
        // accounting restarted
        assert!(!cursor.note_batch_size(400, 1_000));
    }
}

//! The client protocol, JSON over websockets.
//!
//! Protocol flow:
//!
//! Connect:
//!  * server sends `Connection` with a fresh validation message
//!  * client proves possession of its key with `ValidateKey`
//!  * every other action before that is answered 401
//!
//! Steady state:
//!  * client sends requests `{requestId, action, params}`
//!  * server answers `{requestId, route, response}` where `route` echoes
//!    the action, so clients correlate replies by their own request id
//!  * server pushes `route`-tagged messages with no request id, most
//!    importantly `ApplyTransactions` carrying ordered log entries
//!  * server sends `Ping` periodically, client answers with a `Pong` action

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The largest inbound frame the server accepts.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 400;

/// Operations allowed in a single `BatchTransaction`.
pub const MAX_OPERATIONS_IN_BATCH: usize = 10;

/// Websocket close code sent when a client id is already connected.
pub const CLIENT_ALREADY_CONNECTED: u16 = 3001;

/// A client request. `params` stays raw until the action is dispatched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Client-chosen correlation id, echoed in the response.
    pub request_id: String,
    /// Action name, e.g. `OpenDatabase`.
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: Value,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// The request id this reply answers.
    pub request_id: String,
    /// Echo of the request's action.
    pub route: String,
    /// Outcome of the request.
    pub response: Status,
}

/// Outcome carried inside a [`Response`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// HTTP-style status code.
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Result payload, present on success.
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Human-readable failure reason.
    pub message: Option<String>,
}

impl Status {
    /// A 200 with a result payload.
    pub fn success(data: Value) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            data: Some(data),
            message: None,
        }
    }

    /// A failure with a status code and reason.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            data: None,
            message: Some(message.into()),
        }
    }

    /// A 429 telling the client when to retry.
    pub fn too_many_requests(retry_after_ms: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            data: Some(serde_json::json!({ "retryDelay": retry_after_ms })),
            message: Some("Too many requests".into()),
        }
    }
}

/// A mutation of a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemCommand {
    /// Create an item.
    Insert,
    /// Replace an item.
    Update,
    /// Tombstone an item.
    Delete,
}

/// One operation inside a batch commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// What to do with the item.
    pub command: ItemCommand,
    /// Item identifier.
    pub key: String,
    /// Encrypted item state.
    pub record: Value,
}

/// What a transaction log entry does.
///
/// `Rollback` occupies a sequence slot whose intended write failed. It keeps
/// the log gapless but is never delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    /// Create an item.
    Insert {
        /// Item identifier.
        key: String,
        /// Encrypted item state.
        record: Value,
    },
    /// Replace an item.
    Update {
        /// Item identifier.
        key: String,
        /// Encrypted item state.
        record: Value,
    },
    /// Tombstone an item.
    Delete {
        /// Item identifier.
        key: String,
        /// Encrypted tombstone.
        record: Value,
    },
    /// Apply several operations atomically under one sequence number.
    BatchTransaction {
        /// The operations, in order.
        operations: Vec<Operation>,
    },
    /// Plug for a failed write, invisible to clients.
    Rollback,
}

impl Command {
    /// Whether this entry is a rollback plug.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Command::Rollback)
    }
}

/// A log entry as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Position in the database's log.
    pub seq_no: u64,
    /// The database the entry belongs to.
    pub db_id: String,
    /// The entry itself.
    #[serde(flatten)]
    pub command: Command,
}

/// An ordered run of log entries applied to one database.
///
/// The optional fields are only set on the first payload after an open;
/// `build_bundle` asks the client to upload a compacted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    /// The database the entries belong to.
    pub db_id: String,
    /// Entries in strictly increasing sequence order.
    pub transaction_log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The caller's name hash for the database.
    pub db_name_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The caller's wrapped database key.
    pub db_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Whether the caller owns the database.
    pub is_owner: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Whether the caller's grant is read-only.
    pub read_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Snapshot the entries start from, if any.
    pub bundle_seq_no: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The snapshot contents.
    pub bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Ask the client to upload a fresh snapshot.
    pub build_bundle: Option<bool>,
}

/// Messages pushed to clients outside the request/response cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "route")]
pub enum Push {
    /// Welcome message, sent once per connection.
    #[serde(rename_all = "camelCase")]
    Connection {
        /// Server-assigned connection id.
        connection_id: u64,
        /// Nonce the client echoes back in `ValidateKey`.
        validation_message: String,
    },
    /// Liveness probe, answered with a `Pong` action.
    Ping,
    /// Ordered log entries for one database.
    ApplyTransactions(TransactionPayload),
    /// Fan-out of a user profile change.
    #[serde(rename_all = "camelCase")]
    UpdatedUser {
        /// The changed profile, opaque to the sync core.
        updated_user: Value,
    },
}

/// Parameters of `OpenDatabase`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct OpenDatabaseParams {
    pub db_name_hash: Option<String>,
    pub new_database_params: Option<NewDatabaseParams>,
    pub reopen_at_seq_no: Option<u64>,
}

/// Creation parameters carried by a first `OpenDatabase`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct NewDatabaseParams {
    pub db_id: Option<String>,
    pub encrypted_db_name: Option<String>,
    pub encrypted_db_key: Option<String>,
}

/// Parameters of `OpenDatabaseByDatabaseId`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct OpenByDatabaseIdParams {
    pub database_id: Option<String>,
    pub reopen_at_seq_no: Option<u64>,
}

/// Parameters of `Insert`, `Update` and `Delete`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct CommandParams {
    pub db_name_hash: Option<String>,
    pub db_id: Option<String>,
    pub item_key: Option<String>,
    pub encrypted_item: Option<Value>,
}

/// Parameters of `BatchTransaction`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct BatchParams {
    pub db_name_hash: Option<String>,
    pub db_id: Option<String>,
    pub operations: Option<Vec<BatchOperation>>,
}

/// One inbound batch operation. Stored and pushed as [`Operation`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct BatchOperation {
    pub command: Option<String>,
    pub item_key: Option<String>,
    pub encrypted_item: Option<Value>,
}

/// Parameters of `InitBundleUpload`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct InitBundleUploadParams {
    pub db_id: Option<String>,
    pub seq_no: Option<u64>,
}

/// Parameters of `UploadBundleChunk`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct UploadBundleChunkParams {
    pub upload_id: Option<String>,
    pub chunk_no: Option<u64>,
    pub chunk: Option<String>,
}

/// Parameters of `CompleteBundleUpload`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct CompleteBundleUploadParams {
    pub upload_id: Option<String>,
}

/// Parameters of `ShareDatabase`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct ShareDatabaseParams {
    pub db_id: Option<String>,
    pub user_id: Option<String>,
    pub encrypted_db_key: Option<String>,
    pub read_only: Option<bool>,
    pub resharing_allowed: Option<bool>,
}

/// Parameters of `ModifyDatabasePermissions`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct ModifyPermissionsParams {
    pub db_id: Option<String>,
    pub user_id: Option<String>,
    pub read_only: Option<bool>,
    pub resharing_allowed: Option<bool>,
    pub revoke: Option<bool>,
}

/// Parameters of `ValidateKey`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct ValidateKeyParams {
    pub validation_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_envelope_parses() {
        let text = r#"{
            "requestId": "req-1",
            "action": "Insert",
            "params": {"dbNameHash": "h", "dbId": "d", "itemKey": "k", "encryptedItem": "blob"}
        }"#;
        let request: Request = serde_json::from_str(text).unwrap();
        assert_eq!(request.request_id, "req-1");
        assert_eq!(request.action, "Insert");
        let params: CommandParams = serde_json::from_value(request.params).unwrap();
        assert_eq!(params.item_key.as_deref(), Some("k"));
        assert_eq!(params.encrypted_item, Some(json!("blob")));
    }

    #[test]
    fn request_without_params_parses() {
        let request: Request =
            serde_json::from_str(r#"{"requestId": "r", "action": "Pong"}"#).unwrap();
        assert_eq!(request.action, "Pong");
        assert!(request.params.is_null());
    }

    #[test]
    fn log_entry_flattens_command() {
        let entry = LogEntry {
            seq_no: 4,
            db_id: "db".into(),
            command: Command::Insert {
                key: "k".into(),
                record: json!({"c": 1}),
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            json!({"seqNo": 4, "dbId": "db", "command": "Insert", "key": "k", "record": {"c": 1}})
        );
    }

    #[test]
    fn rollback_has_no_payload_fields() {
        let value = serde_json::to_value(Command::Rollback).unwrap();
        assert_eq!(value, json!({"command": "Rollback"}));
        let back: Command = serde_json::from_value(value).unwrap();
        assert!(back.is_rollback());
    }

    #[test]
    fn push_messages_are_route_tagged() {
        let value = serde_json::to_value(Push::Ping).unwrap();
        assert_eq!(value, json!({"route": "Ping"}));

        let payload = TransactionPayload {
            db_id: "db".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(Push::ApplyTransactions(payload)).unwrap();
        assert_eq!(value["route"], "ApplyTransactions");
        assert_eq!(value["dbId"], "db");
        assert_eq!(value["transactionLog"], json!([]));
        // open-only fields stay absent until set
        assert!(value.get("bundleSeqNo").is_none());
        assert!(value.get("buildBundle").is_none());
    }

    #[test]
    fn batch_operations_keep_wire_names() {
        let ops: Vec<BatchOperation> = serde_json::from_value(json!([
            {"command": "Insert", "itemKey": "a", "encryptedItem": "x"},
            {"command": "Delete", "itemKey": "b"}
        ]))
        .unwrap();
        assert_eq!(ops[0].item_key.as_deref(), Some("a"));
        assert_eq!(ops[1].encrypted_item, None);
    }

    #[test]
    fn status_shapes() {
        let ok = serde_json::to_value(Status::success(json!({"sequenceNo": 9}))).unwrap();
        assert_eq!(ok, json!({"status": 200, "data": {"sequenceNo": 9}}));

        let err = serde_json::to_value(Status::error(
            StatusCode::BAD_REQUEST,
            "Missing database name hash",
        ))
        .unwrap();
        assert_eq!(
            err,
            json!({"status": 400, "message": "Missing database name hash"})
        );

        let throttled = serde_json::to_value(Status::too_many_requests(800)).unwrap();
        assert_eq!(throttled["status"], 429);
        assert_eq!(throttled["data"]["retryDelay"], 800);
    }
}

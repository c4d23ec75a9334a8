//! The client-facing websocket surface.
//!
//! Every socket gets one task that owns the socket end to end. The task
//! multiplexes shutdown, the liveness ping, inbound frames and registry
//! events, and holds the connection's cursors, rate limit buckets and
//! pending bundle uploads. Nothing here is shared; cross-connection
//! traffic arrives through the registry's event channel.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use axum::extract::{
    Query, State, WebSocketUpgrade,
    ws::{CloseFrame, Message, WebSocket},
};
use axum::response::IntoResponse;
use bytes::Bytes;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use ttl_cache::TtlCache;

use crate::{
    commit::{self, CommitError},
    http::AppResult,
    protos::client::{
        BatchParams, CLIENT_ALREADY_CONNECTED, Command, CommandParams, CompleteBundleUploadParams,
        InitBundleUploadParams, ItemCommand, MAX_MESSAGE_SIZE, ModifyPermissionsParams,
        NewDatabaseParams, OpenByDatabaseIdParams, OpenDatabaseParams, Operation, Push, Request,
        Response, ShareDatabaseParams, Status, UploadBundleChunkParams, ValidateKeyParams,
    },
    push::{self, Batch, Cursor},
    ratelimit::ConnectionLimits,
    registry::{ClientIdentity, ConnEvent, ConnectionId},
    state::AppState,
    store::{DatabaseRow, GrantRow, StoreError},
    util::now_millis,
};

/// Registry events buffered per connection before fan-out drops them.
/// A dropped event is healed by the resync on the next ping tick.
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Bundle uploads a single connection may have in flight.
const MAX_PENDING_UPLOADS: usize = 32;

/// How long an unfinished bundle upload is kept around.
const UPLOAD_TTL: std::time::Duration = std::time::Duration::from_secs(600);

/// Handler for the websocket route.
///
/// The client identifies itself through query parameters. Upgrades
/// without a complete identity are rejected before the handshake.
pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<impl IntoResponse> {
    let identity = identity_from_params(&params)?;
    Ok(ws.on_upgrade(move |socket| {
        let span = info_span!("conn", user = %identity.user_id);
        handle_socket(socket, state, identity).instrument(span)
    }))
}

fn identity_from_params(
    params: &HashMap<String, String>,
) -> Result<ClientIdentity, crate::http::AppError> {
    let field = |name: &str| {
        params
            .get(name)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| {
                crate::http::AppError::new(
                    StatusCode::BAD_REQUEST,
                    Some(format!("missing query param {name}")),
                )
            })
    };
    Ok(ClientIdentity {
        user_id: field("userId")?,
        admin_id: field("adminId")?,
        app_id: field("appId")?,
        client_id: field("clientId")?,
    })
}

async fn handle_socket(mut socket: WebSocket, state: AppState, identity: ClientIdentity) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let id = match state
        .connections
        .register(identity.clone(), events_tx, cancel.clone())
    {
        Ok(id) => id,
        Err(_) => {
            state.metrics.connections_rejected_duplicate.inc();
            let frame = CloseFrame {
                code: CLIENT_ALREADY_CONNECTED,
                reason: "Client Already Connected".into(),
            };
            if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                debug!("failed to close duplicate connection: {e}");
            }
            return;
        }
    };
    state.metrics.connections_opened.inc();

    let mut conn = Connection::new(socket, events_rx, cancel, id, identity, state.clone());
    if let Err(e) = conn.run().await {
        debug!(
            "Error in websocket of user {}: {e:#}",
            conn.identity.user_id
        );
    }

    state.connections.close(id);
    state.metrics.connections_closed.inc();
    info!(
        "Websocket {id} disconnected from user {}",
        conn.identity.user_id
    );
}

/// A partially uploaded bundle.
struct BundleUpload {
    database_id: String,
    bundle_seq_no: u64,
    chunks: BTreeMap<u64, String>,
}

/// State owned by a single connection's task.
struct Connection {
    state: AppState,
    socket: WebSocket,
    events: mpsc::Receiver<ConnEvent>,
    cancel: CancellationToken,
    id: ConnectionId,
    identity: ClientIdentity,
    /// Nonce the client has to echo back before any other action.
    validation_message: String,
    key_validated: bool,
    /// Cleared when a ping goes out, set on any inbound frame.
    alive: bool,
    /// Cursors of the databases open on this connection.
    databases: HashMap<String, Cursor>,
    limits: ConnectionLimits,
    uploads: TtlCache<String, BundleUpload>,
}

impl Connection {
    fn new(
        socket: WebSocket,
        events: mpsc::Receiver<ConnEvent>,
        cancel: CancellationToken,
        id: ConnectionId,
        identity: ClientIdentity,
        state: AppState,
    ) -> Self {
        let limits = ConnectionLimits::new(&state.config.rate_limits);
        Self {
            state,
            socket,
            events,
            cancel,
            id,
            identity,
            validation_message: base64_url::encode(&rand::random::<[u8; 32]>()),
            key_validated: false,
            alive: true,
            databases: HashMap::new(),
            limits,
            uploads: TtlCache::new(MAX_PENDING_UPLOADS),
        }
    }

    async fn run(&mut self) -> Result<()> {
        self.send_push(&Push::Connection {
            connection_id: self.id.as_u64(),
            validation_message: self.validation_message.clone(),
        })
        .await?;

        let period = self.state.config.sync.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(connection_id = %self.id, "connection cancelled");
                    break;
                }
                _ = ping.tick() => {
                    if !self.on_ping_tick().await? {
                        break;
                    }
                }
                msg = self.socket.recv() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(msg)) => self.on_message(msg).await?,
                        Some(Err(e)) => {
                            debug!(connection_id = %self.id, "socket error: {e}");
                            break;
                        }
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await?,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Terminates silent connections, probes the rest.
    ///
    /// The tick doubles as a resync trigger so a cursor that missed a
    /// registry event catches up within one interval.
    async fn on_ping_tick(&mut self) -> Result<bool> {
        if !self.alive {
            debug!(connection_id = %self.id, "no pong since the last ping, terminating");
            return Ok(false);
        }
        self.alive = false;
        self.send_push(&Push::Ping).await?;
        self.resync().await?;
        Ok(true)
    }

    async fn resync(&mut self) -> Result<()> {
        let database_ids: Vec<String> = self.databases.keys().cloned().collect();
        for database_id in database_ids {
            self.catch_up_database(&database_id).await?;
        }
        Ok(())
    }

    /// One catch-up pass for one open database.
    ///
    /// Store trouble is logged and swallowed, the next trigger retries.
    /// Only a dead socket propagates.
    async fn catch_up_database(&mut self, database_id: &str) -> Result<()> {
        let Some(cursor) = self.databases.get(database_id) else {
            return Ok(());
        };
        let pass = push::catch_up(
            &self.state.store,
            &self.state.metrics,
            cursor,
            now_millis(),
            self.state.config.sync.gap_grace,
        )
        .await;
        match pass {
            Ok(Some(batch)) => self.flush_batch(database_id, batch).await,
            Ok(None) => Ok(()),
            Err(e) => {
                warn!("Failed to push transactions on database {database_id} with {e}");
                Ok(())
            }
        }
    }

    /// Delivers a batch and moves the cursor past it.
    ///
    /// The cursor only advances after a successful send. A failed send
    /// leaves it in place and ends the connection, so the client never
    /// observes a skip.
    async fn flush_batch(&mut self, database_id: &str, batch: Batch) -> Result<()> {
        let trigger = self.state.config.sync.bundle_trigger_bytes;
        let build_bundle = match self.databases.get_mut(database_id) {
            Some(cursor) => cursor.note_batch_size(batch.size, trigger),
            None => return Ok(()),
        };
        if batch.deliver {
            let mut payload = batch.payload;
            if build_bundle {
                payload.build_bundle = Some(true);
                self.state.metrics.bundle_hints_sent.inc();
            }
            let pushed = payload.transaction_log.len() as u64;
            self.send_push(&Push::ApplyTransactions(payload)).await?;
            self.state.metrics.transactions_pushed.inc_by(pushed);
        }
        if let Some(cursor) = self.databases.get_mut(database_id) {
            cursor.advance(batch.new_last_seq_no);
        }
        Ok(())
    }

    async fn on_event(&mut self, event: ConnEvent) -> Result<()> {
        match event {
            ConnEvent::Transaction(notification) => {
                let database_id = notification.transaction.database_id.clone();
                if let Some(cursor) = self.databases.get(&database_id) {
                    if let Some(batch) = push::fast_forward(cursor, &notification.transaction) {
                        return self.flush_batch(&database_id, batch).await;
                    }
                }
                self.catch_up_database(&database_id).await
            }
            ConnEvent::UpdatedUser(notification) => {
                self.send_push(&Push::UpdatedUser {
                    updated_user: notification.updated_user.clone(),
                })
                .await
            }
        }
    }

    async fn on_message(&mut self, msg: Message) -> Result<()> {
        self.alive = true;
        let data = match msg {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => return Ok(()),
        };
        if data.len() > MAX_MESSAGE_SIZE {
            return self.send_text("Message is too large").await;
        }
        let request: Request = match serde_json::from_slice(&data) {
            Ok(request) => request,
            Err(e) => {
                debug!(
                    "Ignoring message from user {} that is not a request: {e}",
                    self.identity.user_id
                );
                return Ok(());
            }
        };
        self.dispatch(request).await
    }

    async fn dispatch(&mut self, request: Request) -> Result<()> {
        let Request {
            request_id,
            action,
            params,
        } = request;

        // Answer to the liveness probe. The alive flag is already set.
        if action == "Pong" {
            return Ok(());
        }

        if !self.key_validated && action != "ValidateKey" {
            let status = Status::error(StatusCode::UNAUTHORIZED, "Key not validated");
            return self.respond(request_id, &action, status).await;
        }

        let status = match action.as_str() {
            "ValidateKey" => self.validate_key(params),
            "OpenDatabase" => self.open_database(params).await,
            "OpenDatabaseByDatabaseId" => self.open_database_by_id(params).await,
            "Insert" | "Update" | "Delete" => self.item_command(&action, params).await,
            "BatchTransaction" => self.batch_transaction(params).await,
            "InitBundleUpload" => self.init_bundle_upload(params),
            "UploadBundleChunk" => self.upload_bundle_chunk(params),
            "CompleteBundleUpload" => self.complete_bundle_upload(params).await,
            "ShareDatabase" => self.share_database(params),
            "ModifyDatabasePermissions" => self.modify_database_permissions(params),
            _ => {
                return self
                    .send_text(&format!("Received unkown action {action}"))
                    .await;
            }
        };
        self.respond(request_id, &action, status).await
    }

    fn validate_key(&mut self, params: Value) -> Status {
        if self.key_validated {
            return Status::error(StatusCode::BAD_REQUEST, "Already validated key");
        }
        let params: ValidateKeyParams = parse(params);
        match params.validation_message {
            Some(message) if message == self.validation_message => {
                self.key_validated = true;
                Status::success(json!("Success!"))
            }
            _ => Status::error(StatusCode::UNAUTHORIZED, "Invalid key"),
        }
    }

    async fn open_database(&mut self, params: Value) -> Status {
        let params: OpenDatabaseParams = parse(params);
        let Some(database_name_hash) = params.db_name_hash else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database name hash");
        };

        let resolved = match self
            .state
            .store
            .open_by_name_hash(&self.identity.user_id, &database_name_hash)
        {
            Ok(resolved) => resolved,
            Err(e) => {
                return Status::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to open database with {e}"),
                );
            }
        };
        let (grant, database) = match resolved {
            Some(found) => found,
            None => {
                let Some(new_database) = params.new_database_params else {
                    return Status::error(StatusCode::NOT_FOUND, "Database not found");
                };
                match self.create_database(&database_name_hash, new_database) {
                    Ok(created) => created,
                    Err(status) => return status,
                }
            }
        };
        self.open_cursor(grant, database, params.reopen_at_seq_no)
            .await
    }

    /// First open of a database this user has never seen.
    ///
    /// A lost creation race is fine as long as the winner was this same
    /// user. Then the existing database is opened and the caller's
    /// id candidate is discarded.
    fn create_database(
        &self,
        database_name_hash: &str,
        params: NewDatabaseParams,
    ) -> Result<(GrantRow, DatabaseRow), Status> {
        let Some(database_id) = params.db_id else {
            return Err(Status::error(
                StatusCode::BAD_REQUEST,
                "Missing database id",
            ));
        };
        let Some(database_name) = params.encrypted_db_name else {
            return Err(Status::error(
                StatusCode::BAD_REQUEST,
                "Missing database name",
            ));
        };
        let Some(encrypted_db_key) = params.encrypted_db_key else {
            return Err(Status::error(
                StatusCode::BAD_REQUEST,
                "Missing database key",
            ));
        };

        let database = DatabaseRow {
            database_id: database_id.clone(),
            owner_id: self.identity.user_id.clone(),
            database_name,
            next_seq_number: 0,
            bundle_seq_no: None,
        };
        let grant = GrantRow {
            user_id: self.identity.user_id.clone(),
            database_name_hash: database_name_hash.to_owned(),
            database_id,
            encrypted_db_key,
            read_only: false,
            resharing_allowed: true,
            sender_id: None,
        };
        match self.state.store.create_database(&database, &grant) {
            Ok(()) => Ok((grant, database)),
            Err(StoreError::DatabaseAlreadyExists | StoreError::GrantAlreadyExists) => {
                match self
                    .state
                    .store
                    .open_by_name_hash(&self.identity.user_id, database_name_hash)
                {
                    Ok(Some(found)) => Ok(found),
                    Ok(None) => Err(Status::error(
                        StatusCode::CONFLICT,
                        "Database already exists",
                    )),
                    Err(e) => Err(Status::error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to open database with {e}"),
                    )),
                }
            }
            Err(e) => Err(Status::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to open database with {e}"),
            )),
        }
    }

    async fn open_database_by_id(&mut self, params: Value) -> Status {
        let params: OpenByDatabaseIdParams = parse(params);
        let Some(database_id) = params.database_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database id");
        };
        let grant = match self
            .state
            .store
            .get_grant_by_database(&database_id, &self.identity.user_id)
        {
            Ok(Some(grant)) => grant,
            Ok(None) => return Status::error(StatusCode::NOT_FOUND, "Database not found"),
            Err(e) => {
                return Status::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to open database with {e}"),
                );
            }
        };
        let database = match self.state.store.get_database(&database_id) {
            Ok(Some(database)) => database,
            Ok(None) => return Status::error(StatusCode::NOT_FOUND, "Database not found"),
            Err(e) => {
                return Status::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to open database with {e}"),
                );
            }
        };
        self.open_cursor(grant, database, params.reopen_at_seq_no)
            .await
    }

    /// Installs the cursor, registers the watch and pushes the opening
    /// payload. Re-opening a database resets its cursor.
    async fn open_cursor(
        &mut self,
        grant: GrantRow,
        database: DatabaseRow,
        reopen_at_seq_no: Option<u64>,
    ) -> Status {
        let database_id = database.database_id.clone();
        let cursor = Cursor::open(&grant, &database, reopen_at_seq_no);
        self.databases.insert(database_id.clone(), cursor);
        self.state.connections.open_database(self.id, &database_id);
        self.state.metrics.databases_opened.inc();
        info!("Database {database_id} opened on connection {}", self.id);
        if let Err(e) = self.catch_up_database(&database_id).await {
            // the socket is gone, the response send below surfaces it
            debug!(connection_id = %self.id, "opening push failed: {e}");
        }
        Status::success(json!("Success!"))
    }

    async fn item_command(&mut self, action: &str, params: Value) -> Status {
        if let Err(status) = self.admit_data_op() {
            return status;
        }
        let params: CommandParams = parse(params);
        let Some(database_name_hash) = params.db_name_hash else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database name hash");
        };
        let Some(database_id) = params.db_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database id");
        };
        let Some(key) = params.item_key else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing item key");
        };
        let Some(record) = params.encrypted_item else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing record");
        };
        if !self.databases.contains_key(&database_id) {
            return Status::error(StatusCode::FORBIDDEN, "Database is not open");
        }
        let command = match action {
            "Insert" => Command::Insert { key, record },
            "Update" => Command::Update { key, record },
            _ => Command::Delete { key, record },
        };
        self.run_commit(action, &database_name_hash, &database_id, command)
            .await
    }

    async fn batch_transaction(&mut self, params: Value) -> Status {
        if let Err(status) = self.admit_data_op() {
            return status;
        }
        let params: BatchParams = parse(params);
        let Some(database_name_hash) = params.db_name_hash else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database name hash");
        };
        let Some(database_id) = params.db_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database id");
        };
        let operations = match params.operations {
            Some(operations) if !operations.is_empty() => operations,
            _ => return Status::error(StatusCode::BAD_REQUEST, "Missing operations"),
        };
        if !self.databases.contains_key(&database_id) {
            return Status::error(StatusCode::FORBIDDEN, "Database is not open");
        }

        let mut converted = Vec::with_capacity(operations.len());
        for (i, operation) in operations.into_iter().enumerate() {
            let Some(key) = operation.item_key else {
                return Status::error(
                    StatusCode::BAD_REQUEST,
                    format!("Operation {i} missing item key"),
                );
            };
            let Some(record) = operation.encrypted_item else {
                return Status::error(
                    StatusCode::BAD_REQUEST,
                    format!("Operation {i} missing record"),
                );
            };
            let command = match operation.command.as_deref() {
                Some("Insert") => ItemCommand::Insert,
                Some("Update") => ItemCommand::Update,
                Some("Delete") => ItemCommand::Delete,
                Some(_) => {
                    return Status::error(
                        StatusCode::BAD_REQUEST,
                        format!("Operation {i} invalid command"),
                    );
                }
                None => {
                    return Status::error(
                        StatusCode::BAD_REQUEST,
                        format!("Operation {i} missing command"),
                    );
                }
            };
            converted.push(Operation {
                command,
                key,
                record,
            });
        }

        self.run_commit(
            "batch",
            &database_name_hash,
            &database_id,
            Command::BatchTransaction {
                operations: converted,
            },
        )
        .await
    }

    async fn run_commit(
        &mut self,
        verb: &str,
        database_name_hash: &str,
        database_id: &str,
        command: Command,
    ) -> Status {
        let result = commit::commit(
            &self.state,
            &self.identity.user_id,
            database_name_hash,
            database_id,
            command,
        )
        .await;
        match result {
            Ok(sequence_no) => Status::success(json!({ "sequenceNo": sequence_no })),
            Err(e @ CommitError::Validation(_)) => {
                Status::error(StatusCode::BAD_REQUEST, e.to_string())
            }
            Err(e @ CommitError::PermissionDenied) => {
                Status::error(StatusCode::BAD_REQUEST, e.to_string())
            }
            Err(CommitError::Store(e)) => Status::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to {verb} with {e}"),
            ),
        }
    }

    fn init_bundle_upload(&mut self, params: Value) -> Status {
        let params: InitBundleUploadParams = parse(params);
        let Some(database_id) = params.db_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database id");
        };
        let Some(bundle_seq_no) = params.seq_no else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing bundle sequence number");
        };
        if !self.databases.contains_key(&database_id) {
            return Status::error(StatusCode::FORBIDDEN, "Database is not open");
        }
        let current = match self.state.store.get_database(&database_id) {
            Ok(Some(database)) => database.bundle_seq_no,
            Ok(None) => return Status::error(StatusCode::NOT_FOUND, "Database not found"),
            Err(e) => {
                return Status::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to bundle with {e}"),
                );
            }
        };
        if current.is_some_and(|current| current >= bundle_seq_no) {
            return Status::error(
                StatusCode::BAD_REQUEST,
                "Bundle sequence no must be greater than current bundle",
            );
        }

        let upload_id = base64_url::encode(&rand::random::<[u8; 16]>());
        self.uploads.insert(
            upload_id.clone(),
            BundleUpload {
                database_id,
                bundle_seq_no,
                chunks: BTreeMap::new(),
            },
            UPLOAD_TTL,
        );
        Status::success(json!({ "uploadId": upload_id }))
    }

    fn upload_bundle_chunk(&mut self, params: Value) -> Status {
        if let Err(status) = self.admit_file_op() {
            return status;
        }
        let params: UploadBundleChunkParams = parse(params);
        let Some(upload_id) = params.upload_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing upload id");
        };
        let Some(chunk_no) = params.chunk_no else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing chunk number");
        };
        let Some(chunk) = params.chunk else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing chunk");
        };
        let Some(upload) = self.uploads.get_mut(&upload_id) else {
            return Status::error(StatusCode::NOT_FOUND, "Upload not found");
        };
        upload.chunks.insert(chunk_no, chunk);
        Status::success(json!("Success!"))
    }

    async fn complete_bundle_upload(&mut self, params: Value) -> Status {
        let params: CompleteBundleUploadParams = parse(params);
        let Some(upload_id) = params.upload_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing upload id");
        };
        let Some(upload) = self.uploads.remove(&upload_id) else {
            return Status::error(StatusCode::NOT_FOUND, "Upload not found");
        };
        let BundleUpload {
            database_id,
            bundle_seq_no,
            chunks,
        } = upload;
        if chunks.is_empty() {
            return Status::error(StatusCode::BAD_REQUEST, "Missing bundle chunks");
        }
        let bundle: String = chunks.into_values().collect();

        // Write the blob before moving the pointer so a crash in between
        // leaves the old bundle intact.
        if let Err(e) = self
            .state
            .store
            .put_bundle(&database_id, bundle_seq_no, bundle.as_bytes())
            .await
        {
            return Status::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to bundle with {e}"),
            );
        }
        match self.state.store.record_bundle(&database_id, bundle_seq_no) {
            Ok(()) => {
                self.state.metrics.bundles_uploaded.inc();
                info!("Bundle {bundle_seq_no} saved on database {database_id}");
                Status::success(json!({}))
            }
            Err(StoreError::StaleBundle { .. }) => Status::error(
                StatusCode::BAD_REQUEST,
                "Bundle sequence no must be greater than current bundle",
            ),
            Err(e) => Status::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to bundle with {e}"),
            ),
        }
    }

    fn share_database(&mut self, params: Value) -> Status {
        let params: ShareDatabaseParams = parse(params);
        let Some(database_id) = params.db_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database id");
        };
        let Some(recipient_id) = params.user_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing user id");
        };
        let Some(encrypted_db_key) = params.encrypted_db_key else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database key");
        };

        let grant = match self
            .state
            .store
            .get_grant_by_database(&database_id, &self.identity.user_id)
        {
            Ok(Some(grant)) => grant,
            Ok(None) => return Status::error(StatusCode::NOT_FOUND, "Database not found"),
            Err(e) => {
                return Status::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to share database with {e}"),
                );
            }
        };
        let database = match self.state.store.get_database(&database_id) {
            Ok(Some(database)) => database,
            Ok(None) => return Status::error(StatusCode::NOT_FOUND, "Database not found"),
            Err(e) => {
                return Status::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to share database with {e}"),
                );
            }
        };
        let is_owner = database.owner_id == self.identity.user_id;
        if !is_owner && !grant.resharing_allowed {
            return Status::error(StatusCode::FORBIDDEN, "Resharing not allowed");
        }

        // Recipients open shared databases by id, so the id doubles as
        // their name hash.
        let recipient_grant = GrantRow {
            user_id: recipient_id,
            database_name_hash: database_id.clone(),
            database_id,
            encrypted_db_key,
            read_only: params.read_only.unwrap_or(true),
            resharing_allowed: params.resharing_allowed.unwrap_or(false),
            sender_id: Some(self.identity.user_id.clone()),
        };
        match self.state.store.put_grant(&recipient_grant) {
            Ok(()) => Status::success(json!("Success!")),
            Err(StoreError::GrantAlreadyExists) => Status::error(
                StatusCode::CONFLICT,
                "User already has access to this database",
            ),
            Err(e) => Status::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to share database with {e}"),
            ),
        }
    }

    fn modify_database_permissions(&mut self, params: Value) -> Status {
        let params: ModifyPermissionsParams = parse(params);
        let Some(database_id) = params.db_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing database id");
        };
        let Some(target_user_id) = params.user_id else {
            return Status::error(StatusCode::BAD_REQUEST, "Missing user id");
        };
        let database = match self.state.store.get_database(&database_id) {
            Ok(Some(database)) => database,
            Ok(None) => return Status::error(StatusCode::NOT_FOUND, "Database not found"),
            Err(e) => {
                return Status::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to modify permissions with {e}"),
                );
            }
        };
        if database.owner_id != self.identity.user_id {
            return Status::error(
                StatusCode::FORBIDDEN,
                "Only the owner can modify permissions",
            );
        }
        if target_user_id == database.owner_id {
            return Status::error(
                StatusCode::FORBIDDEN,
                "Cannot modify the owner's permissions",
            );
        }

        let result = if params.revoke.unwrap_or(false) {
            self.state.store.revoke_grant(&database_id, &target_user_id)
        } else {
            self.state.store.modify_grant(
                &database_id,
                &target_user_id,
                params.read_only,
                params.resharing_allowed,
            )
        };
        match result {
            Ok(()) => Status::success(json!("Success!")),
            Err(StoreError::GrantNotFound) => {
                Status::error(StatusCode::NOT_FOUND, "Grant not found")
            }
            Err(e) => Status::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to modify permissions with {e}"),
            ),
        }
    }

    fn admit_data_op(&mut self) -> Result<(), Status> {
        self.limits.data_ops.try_admit().map_err(|e| {
            self.state.metrics.ratelimit_rejections.inc();
            Status::too_many_requests(e.retry_after.as_millis() as u64)
        })
    }

    fn admit_file_op(&mut self) -> Result<(), Status> {
        self.limits.file_ops.try_admit().map_err(|e| {
            self.state.metrics.ratelimit_rejections.inc();
            Status::too_many_requests(e.retry_after.as_millis() as u64)
        })
    }

    async fn respond(&mut self, request_id: String, action: &str, status: Status) -> Result<()> {
        let response = Response {
            request_id,
            route: action.to_owned(),
            response: status,
        };
        let text = serde_json::to_string(&response)?;
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_push(&mut self, push: &Push) -> Result<()> {
        let text = serde_json::to_string(push)?;
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::Text(text.to_owned().into()))
            .await?;
        Ok(())
    }
}

/// Best-effort param decoding. Undecodable params turn into all-`None`
/// fields and fail the per-field validations with the right messages.
fn parse<T: DeserializeOwned + Default>(params: Value) -> T {
    serde_json::from_value(params).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_all_four_params() {
        let mut params = HashMap::new();
        params.insert("userId".to_owned(), "user-1".to_owned());
        params.insert("adminId".to_owned(), "admin-1".to_owned());
        params.insert("appId".to_owned(), "app-1".to_owned());
        assert!(identity_from_params(&params).is_err());

        params.insert("clientId".to_owned(), "client-1".to_owned());
        let identity = identity_from_params(&params).unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.client_id, "client-1");
    }

    #[test]
    fn empty_identity_params_are_rejected() {
        let mut params = HashMap::new();
        params.insert("userId".to_owned(), String::new());
        params.insert("adminId".to_owned(), "admin-1".to_owned());
        params.insert("appId".to_owned(), "app-1".to_owned());
        params.insert("clientId".to_owned(), "client-1".to_owned());
        assert!(identity_from_params(&params).is_err());
    }

    #[test]
    fn garbage_params_decode_to_empty() {
        let params: CommandParams = parse(json!(["not", "an", "object"]));
        assert!(params.db_id.is_none());
        assert!(params.item_key.is_none());
    }
}

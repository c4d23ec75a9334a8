//! HTTP server part of the sync service
//!
//! Two axum apps on separate listeners: the public one carries the
//! websocket endpoint and the health check, the internal one takes
//! commit notifications from sibling instances.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::Method,
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
};
use tokio::{net::TcpListener, task::JoinSet};
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{Level, info, span, warn};

mod error;

pub(crate) use error::{AppError, AppResult};

use crate::{
    config::ListenConfig,
    metrics::Metrics,
    protos::peer::{
        NOTIFY_TRANSACTION_PATH, NOTIFY_UPDATED_USER_PATH, NotifyTransaction, NotifyUpdatedUser,
    },
    state::AppState,
    ws,
};

/// The HTTP part of a sync instance, both listeners.
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    public_addr: SocketAddr,
    internal_addr: SocketAddr,
}

impl HttpServer {
    /// Spawn the public and the internal listener.
    pub async fn spawn(
        public_config: ListenConfig,
        internal_config: ListenConfig,
        state: AppState,
    ) -> Result<HttpServer> {
        let mut tasks = JoinSet::new();

        let public_addr = {
            let app = create_public_app(state.clone());
            let listener = TcpListener::bind(public_config.socket_addr())
                .await?
                .into_std()?;
            let bound_addr = listener.local_addr()?;
            let fut = axum_server::from_tcp(listener)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            info!("Public server listening on {bound_addr}");
            tasks.spawn(fut);
            bound_addr
        };

        let internal_addr = {
            let app = create_internal_app(state);
            let listener = TcpListener::bind(internal_config.socket_addr())
                .await?
                .into_std()?;
            let bound_addr = listener.local_addr()?;
            let fut = axum_server::from_tcp(listener)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            info!("Internal server listening on {bound_addr}");
            tasks.spawn(fut);
            bound_addr
        };

        Ok(HttpServer {
            tasks,
            public_addr,
            internal_addr,
        })
    }

    /// Get the bound address of the public socket.
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Get the bound address of the internal socket.
    pub fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    /// Shutdown the server and wait for all tasks to complete.
    pub async fn shutdown(mut self) -> Result<()> {
        // TODO: Graceful cancellation.
        self.tasks.abort_all();
        self.run_until_done().await?;
        Ok(())
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<()> {
        let mut final_res: anyhow::Result<()> = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(anyhow::Error::from(err));
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err.into());
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_public_app(state: AppState) -> Router {
    // configure cors middleware
    let cors = CorsLayer::new()
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(cors::Any);

    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let conn_info = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .expect("connectinfo extension to be present");
        let span = span!(
        Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = %conn_info.0,
            );
        span
    });

    let metrics = state.metrics.clone();

    // configure routes
    let router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/ping", get(|| async { "Healthy" }))
        .route("/", get(|| async { "Hi!" }))
        .with_state(state);

    // configure app
    router
        .layer(cors)
        .layer(trace)
        .route_layer(middleware::from_fn_with_state(metrics, metrics_middleware))
}

pub(crate) fn create_internal_app(state: AppState) -> Router {
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let conn_info = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .expect("connectinfo extension to be present");
        let span = span!(
            Level::DEBUG,
            "internal_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = %conn_info.0,
        );
        span
    });

    Router::new()
        .route(NOTIFY_TRANSACTION_PATH, post(notify_transaction))
        .route(NOTIFY_UPDATED_USER_PATH, post(notify_updated_user))
        .route("/ping", get(|| async { "Healthy" }))
        .with_state(state)
        .layer(trace)
}

/// A sibling instance committed a transaction. Hand it to the local
/// connections watching the database; nothing is re-broadcast.
async fn notify_transaction(
    State(state): State<AppState>,
    Json(notification): Json<NotifyTransaction>,
) -> impl IntoResponse {
    let reached = state.connections.push_transaction(Arc::new(notification));
    Json(serde_json::json!({ "reached": reached }))
}

async fn notify_updated_user(
    State(state): State<AppState>,
    Json(notification): Json<NotifyUpdatedUser>,
) -> impl IntoResponse {
    let reached = state.connections.push_updated_user(Arc::new(notification));
    Json(serde_json::json!({ "reached": reached }))
}

/// Record request metrics.
///
// TODO:
// * Request duration would be much better tracked as a histogram.
// * It would be great to attach labels to the metrics, so that the recorded metrics
// can filter by method etc.
async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    metrics.http_requests_duration_ms.inc_by(latency as u64);
    metrics.http_requests.inc();
    if status.is_success() {
        metrics.http_requests_success.inc();
    } else {
        metrics.http_requests_error.inc();
    }
    response
}

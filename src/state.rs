//! Shared state of the sync server

use std::sync::Arc;

use crate::{
    config::Config, metrics::Metrics, peers::Peers, registry::Connections, store::Store,
};

/// The shared app state.
#[derive(Clone)]
pub struct AppState {
    /// The durable store.
    pub store: Arc<Store>,
    /// All live connections on this instance.
    pub connections: Connections,
    /// Handle to the sibling server instances.
    pub peers: Peers,
    /// Process metrics.
    pub metrics: Arc<Metrics>,
    /// Server configuration.
    pub config: Arc<Config>,
}

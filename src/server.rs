//! The main server which combines the HTTP listeners, the store and metrics.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use iroh_metrics::Registry;
use tracing::info;

use crate::{
    config::Config, http::HttpServer, metrics::ServerMetrics, peers::Peers, registry::Connections,
    state::AppState, store::Store,
};

/// Spawn the server and run until the `Ctrl-C` signal is received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<()> {
    let store = Store::persistent(Config::store_db_path()?, Config::bundle_dir()?)?;
    let server = Server::spawn(config, store).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown().await?;
    Ok(())
}

/// The sync server.
pub struct Server {
    http_server: HttpServer,
    metrics_task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Server {
    /// Spawn the server.
    ///
    /// This will spawn several background tasks:
    /// * The public HTTP listener carrying the websocket endpoint
    /// * The internal HTTP listener taking peer notifications
    /// * A metrics server task, unless disabled in the config
    pub async fn spawn(config: Config, store: Store) -> Result<Self> {
        let metrics = ServerMetrics::default();
        let metrics_addr = config.metrics_addr();
        let config = Arc::new(config);

        let peers = Peers::new(&config.peers, metrics.server.clone())?;
        let state = AppState {
            store: Arc::new(store),
            connections: Connections::default(),
            peers,
            metrics: metrics.server.clone(),
            config: config.clone(),
        };

        let mut registry = Registry::default();
        registry.register_all(&metrics);
        let registry = Arc::new(RwLock::new(registry));
        let metrics_task = tokio::task::spawn(async move {
            if let Some(addr) = metrics_addr {
                iroh_metrics::service::start_metrics_server(addr, registry).await?;
            }
            Ok(())
        });

        let http_server =
            HttpServer::spawn(config.public.clone(), config.internal.clone(), state).await?;
        Ok(Self {
            http_server,
            metrics_task,
        })
    }

    /// Cancel the server tasks and wait for all tasks to complete.
    pub async fn shutdown(self) -> Result<()> {
        self.metrics_task.abort();
        self.http_server.shutdown().await?;
        Ok(())
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run forever unless all tasks close with an error, or the server is shut down.
    pub async fn run_until_error(self) -> Result<()> {
        self.http_server.run_until_done().await?;
        self.metrics_task.abort();
        Ok(())
    }

    /// Spawn a server suitable for testing.
    ///
    /// Binds both listeners on ephemeral localhost ports, stores everything
    /// in memory and disables the metrics listener.
    ///
    /// It returns the server handle and the base [`url::Url`]s of the public
    /// and the internal listener.
    #[cfg(test)]
    pub async fn spawn_for_tests() -> Result<(Self, url::Url, url::Url)> {
        use std::net::{IpAddr, Ipv4Addr};

        use crate::config::MetricsConfig;

        let mut config = Config::default();
        config.public.port = 0;
        config.public.bind_addr = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.internal.port = 0;
        config.internal.bind_addr = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.metrics = Some(MetricsConfig::disabled());

        let store = Store::in_memory()?;
        let server = Self::spawn(config, store).await?;
        let public_url = format!("http://{}", server.http_server.public_addr()).parse()?;
        let internal_url = format!("http://{}", server.http_server.internal_addr()).parse()?;
        Ok((server, public_url, internal_url))
    }
}

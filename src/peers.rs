//! Best-effort broadcast to sibling server instances.
//!
//! A commit on this instance only reaches sockets this instance hosts.
//! Broadcasting nudges every peer to run catch-up passes for its own
//! connections. Delivery is fire-and-forget: an unreachable peer is
//! logged and ignored, its connections resync on their next ping tick.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::{
    metrics::Metrics,
    protos::peer::{
        NOTIFY_TRANSACTION_PATH, NOTIFY_UPDATED_USER_PATH, NotifyTransaction, NotifyUpdatedUser,
    },
};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct PeerEndpoint {
    notify_transaction: Url,
    notify_updated_user: Url,
}

/// Handle to the peer instances of this server.
#[derive(Debug, Clone)]
pub struct Peers {
    client: reqwest::Client,
    endpoints: Arc<Vec<PeerEndpoint>>,
    metrics: Arc<Metrics>,
}

impl Peers {
    /// Build the notification endpoints for a set of peer base urls.
    pub fn new(peers: &[Url], metrics: Arc<Metrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .context("failed to build peer http client")?;
        let endpoints = peers
            .iter()
            .map(|base| {
                Ok(PeerEndpoint {
                    notify_transaction: base
                        .join(NOTIFY_TRANSACTION_PATH)
                        .with_context(|| format!("invalid peer url {base}"))?,
                    notify_updated_user: base
                        .join(NOTIFY_UPDATED_USER_PATH)
                        .with_context(|| format!("invalid peer url {base}"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            client,
            endpoints: Arc::new(endpoints),
            metrics,
        })
    }

    /// Tell every peer about a committed transaction.
    pub fn broadcast_transaction(&self, notification: &NotifyTransaction) {
        match serde_json::to_value(notification) {
            Ok(body) => self.broadcast(body, |peer| peer.notify_transaction.clone()),
            Err(e) => warn!("failed to encode transaction notification with {e}"),
        }
    }

    /// Tell every peer about a user profile change.
    pub fn broadcast_updated_user(&self, notification: &NotifyUpdatedUser) {
        match serde_json::to_value(notification) {
            Ok(body) => self.broadcast(body, |peer| peer.notify_updated_user.clone()),
            Err(e) => warn!("failed to encode user notification with {e}"),
        }
    }

    fn broadcast(&self, body: Value, url_of: impl Fn(&PeerEndpoint) -> Url) {
        for peer in self.endpoints.iter() {
            let url = url_of(peer);
            let client = self.client.clone();
            let metrics = self.metrics.clone();
            let body = body.clone();
            tokio::spawn(async move {
                match client.post(url.clone()).json(&body).send().await {
                    Ok(res) if res.status().is_success() => {
                        metrics.peer_notifications_sent.inc();
                    }
                    Ok(res) => {
                        metrics.peer_notifications_failed.inc();
                        warn!(peer = %url, status = %res.status(), "Failed to notify db update");
                    }
                    Err(e) => {
                        metrics.peer_notifications_failed.inc();
                        warn!(peer = %url, "Failed to notify db update with {e}");
                    }
                }
            });
        }
    }
}

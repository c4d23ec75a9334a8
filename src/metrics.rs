//! Metrics support for the server

use std::sync::Arc;

use iroh_metrics::{Counter, MetricsGroup, MetricsGroupSet};

/// Metrics tracked for the sync server
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "lockstep")]
pub struct Metrics {
    /*
     * Connection lifecycle
     */
    /// Websocket connections accepted
    pub connections_opened: Counter,
    /// Connections closed, for any reason
    pub connections_closed: Counter,
    /// Connections rejected because the client was already connected
    #[metrics(help = "Number of sockets closed with code 3001.")]
    pub connections_rejected_duplicate: Counter,
    /// Databases opened over live connections
    pub databases_opened: Counter,

    /*
     * Commit path
     */
    /// Transactions durably appended to a log
    pub commits: Counter,
    /// Commits that failed after allocating a sequence number
    pub commit_failures: Counter,
    /// Rollback markers written to plug failed commits
    #[metrics(help = "Number of allocated sequence slots filled with a rollback marker.")]
    pub rollbacks_plugged: Counter,

    /*
     * Push path
     */
    /// Catch-up passes executed
    pub catchup_passes: Counter,
    /// Catch-up passes abandoned on a gap younger than the grace period
    pub catchup_gap_waits: Counter,
    /// Log entries delivered to clients
    pub transactions_pushed: Counter,
    /// Compaction hints sent to clients
    pub bundle_hints_sent: Counter,
    /// Bundles uploaded
    pub bundles_uploaded: Counter,

    /*
     * Admission and fan-out
     */
    /// Requests rejected by a rate limit bucket
    pub ratelimit_rejections: Counter,
    /// Notifications sent to peer instances
    pub peer_notifications_sent: Counter,
    /// Notifications to peer instances that failed
    pub peer_notifications_failed: Counter,

    /*
     * HTTP surface
     */
    /// Number of HTTP requests
    pub http_requests: Counter,
    /// Number of HTTP requests with a 2xx status code
    pub http_requests_success: Counter,
    /// Number of HTTP requests with a non-2xx status code
    pub http_requests_error: Counter,
    /// Total duration of all HTTP requests in milliseconds
    pub http_requests_duration_ms: Counter,
}

/// All metrics tracked in the sync server.
#[derive(Debug, Default, Clone, MetricsGroupSet)]
#[metrics(name = "lockstep")]
pub struct ServerMetrics {
    /// Metrics tracked for the sync core.
    pub server: Arc<Metrics>,
}

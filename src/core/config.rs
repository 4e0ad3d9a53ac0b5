//! Centralized configuration constants for capture-relay.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (envelope type names, frame
//! type strings) stay in their respective modules.

use std::time::Duration;

// ── Fan-out / Aggregation ────────────────────────────────────────────────────

/// A station is eligible for fan-out only if its last heartbeat is at most
/// this old.
pub const STATION_FRESHNESS_WINDOW: Duration = Duration::from_secs(120);

/// Maximum number of stations a single request is pushed to.
pub const MAX_FANOUT_STATIONS: usize = 3;

// ── Receiver wait budget ─────────────────────────────────────────────────────

/// Hard ceiling on how long a receiver waits for a request's results.
pub const REQUEST_HARD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Sliding grace window that starts at the first successful station result.
/// Once it expires the receiver stops waiting for further stations.
pub const REQUEST_GRACE_WINDOW: Duration = Duration::from_secs(2 * 60);

/// Fallback poll interval for the multi-result endpoint (covers missed pushes).
pub const RESULTS_POLL_INTERVAL: Duration = Duration::from_secs(5);

// ── Signaling / Negotiation ──────────────────────────────────────────────────

/// Cap on the offer/answer round trip for one session.
pub const SDP_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout waiting for the data channel to open once SDP is exchanged.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// STUN servers handed to every peer connection. No TURN fallback.
pub const STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Label of the data channel the station creates for the file transfer.
pub const FILE_CHANNEL_LABEL: &str = "capture-file";

/// How long the sending side keeps the channel up after the last byte is
/// flushed, waiting for the receiver to close it.
pub const DC_CLOSE_GRACE: Duration = Duration::from_secs(5);

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Fixed payload chunk size (16 KiB). No per-chunk header is added, so this
/// is also the on-wire message size for every chunk except the last.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the data channel send buffer (bytes). The sender
/// pauses while `buffered_amount` is above this value.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 64 * 1024;

/// Poll interval for the buffered-amount throttle and the final drain.
pub const DC_BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for a single backpressure pause before the send is aborted.
pub const DC_BACKPRESSURE_MAX_WAIT: Duration = Duration::from_secs(30);

// ── Station ──────────────────────────────────────────────────────────────────

/// Interval between station heartbeats. Well inside the freshness window.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before a station reconnects after its socket drops.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// ── Server ───────────────────────────────────────────────────────────────────

/// Time allowed for the first (auth) frame after the WebSocket upgrade.
pub const AUTH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a station's download URL to answer a proxied request.
pub const PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest HTTP request (headers + body) the API listener accepts.
pub const MAX_HTTP_REQUEST_BYTES: usize = 256 * 1024;

/// Default WebSocket listen address.
pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:8765";

/// Default HTTP API listen address.
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8766";

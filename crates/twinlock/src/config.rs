//! Runtime configuration for clients and servers.
//!
//! Defaults carry the protocol timings; the server's clap arguments let every
//! knob be overridden from the command line or a `TWINLOCK_*` variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// RPC sweeper period.
pub const SWEEP_INTERVAL: Duration = twinlock_proto::SWEEP_INTERVAL;
/// Window in which a late primary still wins preference over the standby.
pub const PREFERRED_WINDOW: Duration = Duration::from_millis(1000);
/// Ack-pipeline heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(333);
/// Retry queue tick.
pub const RETRY_TICK: Duration = Duration::from_millis(50);
/// Pause between reconnect attempts of one link.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// Pause before an aborted ENTER is re-sent.
pub const ENTER_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// How long an aborted ENTER waits for any link to come back.
pub const UNAVAILABLE_GRACE: Duration = Duration::from_millis(2000);
/// Consecutive ACK_EXIT beats that make the server force-release a key.
pub const ACK_DEADLOCK_THRESHOLD: u32 = 3;
/// Maximum nested enters by one owner.
pub const MAX_REENTRANCY: u32 = 1024;
/// Smallest finite timeout `enter` accepts.
pub const MIN_ENTER_TIMEOUT: Duration = Duration::from_millis(1000);
/// Extra time the client waits beyond the server-side ENTER timeout.
pub const RPC_GRACE: Duration = Duration::from_millis(1000);
/// Time a new connection has to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Outbound frames buffered per connection.
pub const LINK_QUEUE_CAPACITY: usize = 4096;
/// Keepalive period on the server-to-server link.
pub const REPLICATION_HEARTBEAT: Duration = Duration::from_millis(1000);
/// Deadline for a snapshot pull from the peer.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `LockClient::connect` waits for the link manager to be ready.
pub const READY_TIMEOUT: Duration = Duration::from_secs(3);

/// Client-side settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Stable logical name of this client, sent in every handshake.
    pub identity: String,
    pub sweep_interval: Duration,
    pub preferred_window: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
    pub enter_retry_backoff: Duration,
    pub unavailable_grace: Duration,
    pub max_reentrancy: u32,
    pub min_enter_timeout: Duration,
    pub rpc_grace: Duration,
    pub ready_timeout: Duration,
    /// Deadline for a lock table listing.
    pub info_timeout: Duration,
    pub link_queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            sweep_interval: SWEEP_INTERVAL,
            preferred_window: PREFERRED_WINDOW,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_backoff: RECONNECT_BACKOFF,
            enter_retry_backoff: ENTER_RETRY_BACKOFF,
            unavailable_grace: UNAVAILABLE_GRACE,
            max_reentrancy: MAX_REENTRANCY,
            min_enter_timeout: MIN_ENTER_TIMEOUT,
            rpc_grace: RPC_GRACE,
            ready_timeout: READY_TIMEOUT,
            info_timeout: SNAPSHOT_TIMEOUT,
            link_queue_capacity: LINK_QUEUE_CAPACITY,
        }
    }
}

/// Server-side settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Name this server announces on its link to the peer.
    pub identity: String,
    pub listen: SocketAddr,
    /// The other server of the pair; `None` runs without a mirror.
    pub peer: Option<SocketAddr>,
    pub retry_tick: Duration,
    pub sweep_interval: Duration,
    pub ack_threshold: u32,
    pub reconnect_backoff: Duration,
    pub replication_heartbeat: Duration,
    pub handshake_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub link_queue_capacity: usize,
}

impl ServerConfig {
    pub fn new(identity: impl Into<String>, listen: SocketAddr) -> Self {
        Self {
            identity: identity.into(),
            listen,
            peer: None,
            retry_tick: RETRY_TICK,
            sweep_interval: SWEEP_INTERVAL,
            ack_threshold: ACK_DEADLOCK_THRESHOLD,
            reconnect_backoff: RECONNECT_BACKOFF,
            replication_heartbeat: REPLICATION_HEARTBEAT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            snapshot_timeout: SNAPSHOT_TIMEOUT,
            link_queue_capacity: LINK_QUEUE_CAPACITY,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// CLI options for running one lock server.
#[derive(Parser, Debug, Clone)]
#[command(name = "twinlock-server", about = "Run one node of a twinlock server pair")]
pub struct ServerArgs {
    /// Name announced to the peer server.
    #[arg(long, env = "TWINLOCK_IDENTITY", default_value = "twinlock-server")]
    pub identity: String,

    #[arg(long, env = "TWINLOCK_LISTEN")]
    pub listen: SocketAddr,

    /// Address of the other server in the pair (mirror target and snapshot source).
    #[arg(long, env = "TWINLOCK_PEER")]
    pub peer: Option<SocketAddr>,

    /// Retry queue tick (ms).
    #[arg(long, env = "TWINLOCK_RETRY_TICK_MS", default_value_t = 50)]
    pub retry_tick_ms: u64,

    /// RPC timeout sweeper period (ms).
    #[arg(long, env = "TWINLOCK_SWEEP_INTERVAL_MS", default_value_t = 100)]
    pub sweep_interval_ms: u64,

    /// Consecutive ACK_EXIT heartbeats before a held key is force-released.
    #[arg(long, env = "TWINLOCK_ACK_THRESHOLD", default_value_t = ACK_DEADLOCK_THRESHOLD)]
    pub ack_threshold: u32,

    /// Backoff between reconnect attempts to the peer (ms).
    #[arg(long, env = "TWINLOCK_RECONNECT_BACKOFF_MS", default_value_t = 500)]
    pub reconnect_backoff_ms: u64,

    /// Keepalive period on the peer link (ms).
    #[arg(long, env = "TWINLOCK_REPLICATION_HEARTBEAT_MS", default_value_t = 1000)]
    pub replication_heartbeat_ms: u64,
}

impl ServerArgs {
    pub fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::new(self.identity, self.listen);
        config.peer = self.peer;
        config.retry_tick = Duration::from_millis(self.retry_tick_ms.max(1));
        config.sweep_interval = Duration::from_millis(self.sweep_interval_ms.max(1));
        config.ack_threshold = self.ack_threshold.max(1);
        config.reconnect_backoff = Duration::from_millis(self.reconnect_backoff_ms);
        config.replication_heartbeat = Duration::from_millis(self.replication_heartbeat_ms.max(1));
        config
    }
}

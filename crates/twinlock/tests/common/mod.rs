//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use twinlock::{start_server, ClientConfig, LockClient, ServerConfig, ServerHandle, StaticResolver};

/// Upper bound for startup, replication and failover waits.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Ask the OS for an unused loopback port.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Block until something accepts connections on `addr`.
pub fn wait_for_port(addr: SocketAddr, timeout: Duration) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("port {addr} did not open in time");
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Two in-process servers on loopback, each configured with the other as peer.
pub struct ServerPair {
    pub primary: ServerHandle,
    pub standby: ServerHandle,
}

impl ServerPair {
    pub async fn start() -> Self {
        let primary_addr = loopback(pick_free_port().expect("primary port"));
        let standby_addr = loopback(pick_free_port().expect("standby port"));
        let primary = start_server(ServerConfig::new("server-primary", primary_addr).with_peer(standby_addr))
            .await
            .expect("start primary");
        let standby = start_server(ServerConfig::new("server-standby", standby_addr).with_peer(primary_addr))
            .await
            .expect("start standby");
        wait_for_port(primary.local_addr(), IO_TIMEOUT);
        wait_for_port(standby.local_addr(), IO_TIMEOUT);
        Self { primary, standby }
    }

    pub fn resolver(&self) -> StaticResolver {
        StaticResolver::new(self.primary.local_addr(), self.standby.local_addr())
    }

    /// Wait until both peer links stream and have finished their snapshot step.
    pub async fn wait_replicating(&self) {
        let ready = wait_until(IO_TIMEOUT, || {
            self.primary.replication_ready() && self.standby.replication_ready()
        })
        .await;
        assert!(
            ready,
            "replication not ready: primary={:?} standby={:?}",
            self.primary.replication_state(),
            self.standby.replication_state()
        );
    }

    pub async fn shutdown(self) {
        self.primary.shutdown().await.expect("primary shutdown");
        self.standby.shutdown().await.expect("standby shutdown");
    }
}

pub async fn connect_client(pair: &ServerPair, identity: &str) -> LockClient {
    connect_client_with(pair, ClientConfig::new(identity)).await
}

/// Connect and wait until both links are up so every client prefers the
/// primary.
pub async fn connect_client_with(pair: &ServerPair, config: ClientConfig) -> LockClient {
    let identity = config.identity.clone();
    let client = LockClient::connect(config, &pair.resolver())
        .await
        .unwrap_or_else(|err| panic!("connect {identity}: {err}"));
    let links = client.links().clone();
    let both_up = wait_until(IO_TIMEOUT, || {
        links.state(twinlock::Slot::Primary) == twinlock::LinkState::Streaming
            && links.state(twinlock::Slot::Standby) == twinlock::LinkState::Streaming
    })
    .await;
    assert!(both_up, "{identity} did not bring both links up");
    client
}

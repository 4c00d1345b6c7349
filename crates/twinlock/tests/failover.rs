//! Primary/standby behavior: replicated ownership survives the active server,
//! stale ownership is reclaimed, and corrupt frames only cost their own
//! connection.
//!
//! Test flow (replicated owner):
//! 1) Start both servers and wait for the peer links to stream.
//! 2) Client A takes L2 through the primary.
//! 3) Wait until the standby's table shows the mirrored grant.
//! 4) Kill the primary and check the standby still has A as the owner.
//!
//! Test flow (rejoin):
//! 1) Start the standby alone; A takes K1 there.
//! 2) Start the primary; B takes K2 there.
//! 3) Once the peer links stream, each side lists the other's grant and a
//!    third client cannot take K1 through the primary.

mod common;

use std::time::Duration;

use bytes::BytesMut;
use common::{
    connect_client, connect_client_with, loopback, pick_free_port, wait_for_port, wait_until, ServerPair, IO_TIMEOUT,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use twinlock::{
    start_server, ClientConfig, HandleState, LinkState, LockClient, LockError, OwnerId, ServerConfig, Slot,
    StaticResolver,
};
use twinlock_proto::{encode_frame, Handshake, LinkMode};

fn quiet_client(identity: &str) -> ClientConfig {
    // Keeps heartbeats out of the way so only the failover path is observed.
    let mut config = ClientConfig::new(identity);
    config.heartbeat_interval = Duration::from_secs(30);
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn standby_keeps_replicated_owner_after_primary_dies() {
    let pair = ServerPair::start().await;
    pair.wait_replicating().await;
    let client = connect_client_with(&pair, quiet_client("A")).await;
    assert_eq!(client.links().preferred(), Some(Slot::Primary));

    client
        .handle("L2")
        .enter(OwnerId::new(), Some(Duration::from_secs(5)))
        .await
        .expect("A enters L2");
    assert_eq!(pair.primary.table().owner_of("L2").as_deref(), Some("A"));

    let mirrored = wait_until(IO_TIMEOUT, || {
        pair.standby.table().owner_of("L2").as_deref() == Some("A")
    })
    .await;
    assert!(mirrored, "grant never reached the standby");

    pair.primary.abort();

    let failed_over = wait_until(IO_TIMEOUT, || client.links().preferred() == Some(Slot::Standby)).await;
    assert!(failed_over, "client did not fail over to the standby");
    assert_eq!(pair.standby.table().owner_of("L2").as_deref(), Some("A"));
    // Ownership carried by the dead link is dropped locally.
    let handle = client.handle("L2");
    let cleared = wait_until(IO_TIMEOUT, || handle.state() == HandleState::Idle).await;
    assert!(cleared, "local ownership survived the dead link");

    client.close();
    pair.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn standby_serves_new_locks_after_failover() {
    let pair = ServerPair::start().await;
    pair.wait_replicating().await;
    let client_a = connect_client_with(&pair, quiet_client("A")).await;
    let client_b = connect_client_with(&pair, quiet_client("B")).await;

    client_a
        .handle("L2")
        .enter(OwnerId::new(), None)
        .await
        .expect("A enters L2");
    let mirrored = wait_until(IO_TIMEOUT, || pair.standby.table().owner_of("L2").is_some()).await;
    assert!(mirrored);

    pair.primary.abort();

    // Enter retries across the failover instead of surfacing the dead link.
    client_b
        .handle("L3")
        .enter(OwnerId::new(), Some(Duration::from_secs(5)))
        .await
        .expect("B enters L3 on the standby");
    assert_eq!(pair.standby.table().owner_of("L3").as_deref(), Some("B"));

    // L2 is still A's on the standby.
    let err = client_b
        .handle("L2")
        .enter(OwnerId::new(), Some(Duration::from_millis(1_000)))
        .await
        .expect_err("L2 still belongs to A");
    assert!(matches!(err, twinlock::LockError::Timeout), "unexpected error: {err}");

    client_a.close();
    client_b.close();
    pair.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_owner_is_reclaimed_by_heartbeats_after_failover() {
    let pair = ServerPair::start().await;
    pair.wait_replicating().await;
    let client = connect_client(&pair, "A").await;

    client
        .handle("L4")
        .enter(OwnerId::new(), None)
        .await
        .expect("A enters L4");
    let mirrored = wait_until(IO_TIMEOUT, || pair.standby.table().owner_of("L4").is_some()).await;
    assert!(mirrored);

    pair.primary.abort();

    // A forgot L4 when its link died; its ACK_EXIT heartbeats to the standby
    // free the key after the threshold.
    let reclaimed = wait_until(IO_TIMEOUT, || pair.standby.table().owner_of("L4").is_none()).await;
    assert!(reclaimed, "standby never reclaimed L4");

    client.close();
    pair.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_header_byte_drops_only_that_connection() {
    let pair = ServerPair::start().await;
    let client = connect_client(&pair, "healthy").await;

    let mut raw = TcpStream::connect(pair.primary.local_addr())
        .await
        .expect("raw connect");
    let mut out = BytesMut::new();
    encode_frame(&Handshake::new(LinkMode::Client, "garbage").encode(), &mut out).expect("encode handshake");
    // Wrong header key followed by an otherwise well-formed frame.
    out.extend_from_slice(&[0x00, 0, 0, 0, 1, 0x42]);
    raw.write_all(&out).await.expect("write frames");

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(IO_TIMEOUT, raw.read(&mut buf))
        .await
        .expect("server should close the connection");
    match read {
        Ok(n) => assert_eq!(n, 0, "server sent data on a corrupt link"),
        Err(_) => {} // reset also counts as closed
    }

    let owner = OwnerId::new();
    let handle = client.handle("after-garbage");
    handle
        .enter(owner, Some(Duration::from_secs(2)))
        .await
        .expect("healthy client still served");
    handle.exit(owner).expect("exit");

    client.close();
    pair.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejoining_primary_merges_tables_both_ways() {
    let primary_addr = loopback(pick_free_port().expect("primary port"));
    let standby_addr = loopback(pick_free_port().expect("standby port"));
    let resolver = StaticResolver::new(primary_addr, standby_addr);

    let standby = start_server(ServerConfig::new("server-standby", standby_addr).with_peer(primary_addr))
        .await
        .expect("start standby");
    wait_for_port(standby.local_addr(), IO_TIMEOUT);

    let client_a = LockClient::connect(quiet_client("A"), &resolver)
        .await
        .expect("connect A");
    // Let the affinity window pass so A stays on the standby once the primary is up.
    assert!(client_a.links().wait_ready(IO_TIMEOUT).await, "A never became ready");
    assert_eq!(client_a.links().preferred(), Some(Slot::Standby));
    client_a
        .handle("K1")
        .enter(OwnerId::new(), Some(Duration::from_secs(5)))
        .await
        .expect("A enters K1 on the lone standby");
    assert_eq!(standby.table().owner_of("K1").as_deref(), Some("A"));

    let primary = start_server(ServerConfig::new("server-primary", primary_addr).with_peer(standby_addr))
        .await
        .expect("start primary");
    wait_for_port(primary.local_addr(), IO_TIMEOUT);

    let client_b = LockClient::connect(quiet_client("B"), &resolver)
        .await
        .expect("connect B");
    let both_up = wait_until(IO_TIMEOUT, || {
        client_b.links().state(Slot::Primary) == LinkState::Streaming
            && client_b.links().state(Slot::Standby) == LinkState::Streaming
    })
    .await;
    assert!(both_up, "B did not bring both links up");
    assert_eq!(client_b.links().preferred(), Some(Slot::Primary));
    client_b
        .handle("K2")
        .enter(OwnerId::new(), Some(Duration::from_secs(5)))
        .await
        .expect("B enters K2 on the primary");
    assert_eq!(client_a.links().preferred(), Some(Slot::Standby));

    let ready = wait_until(IO_TIMEOUT, || primary.replication_ready() && standby.replication_ready()).await;
    assert!(ready, "peer links never finished merging");
    let merged = wait_until(IO_TIMEOUT, || {
        primary.table().owner_of("K1").as_deref() == Some("A")
            && standby.table().owner_of("K2").as_deref() == Some("B")
            && primary.table().owner_of("K2").as_deref() == Some("B")
            && standby.table().owner_of("K1").as_deref() == Some("A")
    })
    .await;
    assert!(
        merged,
        "tables did not converge: primary={:?} standby={:?}",
        primary.table().snapshot(),
        standby.table().snapshot()
    );

    let client_c = LockClient::connect(quiet_client("C"), &resolver)
        .await
        .expect("connect C");
    let both_up = wait_until(IO_TIMEOUT, || {
        client_c.links().state(Slot::Primary) == LinkState::Streaming
            && client_c.links().state(Slot::Standby) == LinkState::Streaming
    })
    .await;
    assert!(both_up, "C did not bring both links up");
    let err = client_c
        .handle("K1")
        .enter(OwnerId::new(), Some(Duration::from_millis(1_000)))
        .await
        .expect_err("K1 still belongs to A");
    assert!(matches!(err, LockError::Timeout), "unexpected error: {err}");

    client_a.close();
    client_b.close();
    client_c.close();
    primary.shutdown().await.expect("primary shutdown");
    standby.shutdown().await.expect("standby shutdown");
}

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

//! End-to-end routing over real loopback sockets.
//!
//! Covers broadcast fan-out (no echo to the source), outbound filtering,
//! dedup suppression, UDP-server peer learning and the TCP listener.

use mavhub::config::{Configuration, UdpEndpointConfig, UdpMode};
use mavhub::router::RouterInstance;
use mavhub::stats::StatsRegistry;
use mavlink::common::{MavMessage, HEARTBEAT_DATA};
use mavlink::MavHeader;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

fn heartbeat_v2(sysid: u8, compid: u8, seq: u8) -> Vec<u8> {
    let header = MavHeader {
        system_id: sysid,
        component_id: compid,
        sequence: seq,
    };
    let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA::default());
    let mut buf = Vec::new();
    mavlink::write_v2_msg(&mut buf, header, &msg).expect("write heartbeat");
    buf
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .expect("probe bind")
        .local_addr()
        .expect("probe addr")
        .port()
}

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("probe bind")
        .local_addr()
        .expect("probe addr")
        .port()
}

fn udp_server(name: &str, port: u16) -> UdpEndpointConfig {
    UdpEndpointConfig {
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        mode: UdpMode::Server,
        group: None,
        filters: Default::default(),
    }
}

fn udp_client(name: &str, port: u16) -> UdpEndpointConfig {
    UdpEndpointConfig {
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        mode: UdpMode::Client,
        group: None,
        filters: Default::default(),
    }
}

async fn recv_frame(socket: &UdpSocket, timeout_ms: u64) -> Option<Vec<u8>> {
    let mut buf = [0u8; 1024];
    match tokio::time::timeout(Duration::from_millis(timeout_ms), socket.recv_from(&mut buf)).await
    {
        Ok(Ok((n, _addr))) => Some(buf[..n].to_vec()),
        _ => None,
    }
}

struct RunningRouter {
    control: mavhub::router::RouterControl,
    registry: StatsRegistry,
    handle: tokio::task::JoinHandle<i32>,
}

async fn start_router(name: &str, config: Configuration) -> RunningRouter {
    let mut router = RouterInstance::new(name, &config.general);
    router.open().expect("open");
    router
        .add_endpoints(&config)
        .await
        .expect("add endpoints");
    let control = router.control();
    let registry = router.stats_registry();
    let handle = tokio::spawn(async move { router.run().await });
    // Let the endpoint tasks reach their read loops
    tokio::time::sleep(Duration::from_millis(50)).await;
    RunningRouter {
        control,
        registry,
        handle,
    }
}

impl RunningRouter {
    async fn stop(self) -> i32 {
        self.control.request_exit(0);
        self.handle.await.expect("router join")
    }
}

#[tokio::test]
async fn test_broadcast_reaches_all_other_endpoints_but_not_source() {
    let peer_a = UdpSocket::bind("127.0.0.1:0").await.expect("peer a");
    let peer_b = UdpSocket::bind("127.0.0.1:0").await.expect("peer b");
    let server_port = free_udp_port();

    let config = Configuration {
        udp_endpoints: vec![
            udp_server("src", server_port),
            udp_client("a", peer_a.local_addr().expect("addr").port()),
            udp_client("b", peer_b.local_addr().expect("addr").port()),
        ],
        ..Default::default()
    };
    let router = start_router("it-broadcast", config).await;

    let injector = UdpSocket::bind("127.0.0.1:0").await.expect("injector");
    let frame = heartbeat_v2(7, 1, 0);
    injector
        .send_to(&frame, ("127.0.0.1", server_port))
        .await
        .expect("inject");

    let got_a = recv_frame(&peer_a, 1000).await.expect("a receives");
    let got_b = recv_frame(&peer_b, 1000).await.expect("b receives");
    assert_eq!(got_a, frame, "payload must be forwarded unchanged");
    assert_eq!(got_b, frame);

    // Frames never echo back to their source endpoint
    assert!(
        recv_frame(&injector, 200).await.is_none(),
        "source endpoint must not see its own frame"
    );

    assert_eq!(router.stop().await, 0);

    // Teardown released the bound port
    UdpSocket::bind(("127.0.0.1", server_port))
        .await
        .expect("server port released after teardown");
}

#[tokio::test]
async fn test_blocked_msg_id_is_filtered_and_counted() {
    let peer_a = UdpSocket::bind("127.0.0.1:0").await.expect("peer a");
    let server_port = free_udp_port();

    let mut blocked = udp_client("a", peer_a.local_addr().expect("addr").port());
    blocked.filters.block_msg_id_out.insert(0); // HEARTBEAT

    let config = Configuration {
        udp_endpoints: vec![udp_server("src", server_port), blocked],
        ..Default::default()
    };
    let router = start_router("it-filter", config).await;

    let injector = UdpSocket::bind("127.0.0.1:0").await.expect("injector");
    injector
        .send_to(&heartbeat_v2(7, 1, 0), ("127.0.0.1", server_port))
        .await
        .expect("inject");

    assert!(
        recv_frame(&peer_a, 300).await.is_none(),
        "blocked message must not be written"
    );

    let snapshot = router
        .registry
        .read()
        .iter()
        .find(|h| h.name == "a")
        .expect("endpoint a stats")
        .stats
        .snapshot();
    assert_eq!(snapshot.filtered.msg_id_out, 1);
    assert_eq!(snapshot.tx_messages, 0);

    router.stop().await;
}

#[tokio::test]
async fn test_duplicate_frames_suppressed_within_window() {
    let peer_a = UdpSocket::bind("127.0.0.1:0").await.expect("peer a");
    let server_port = free_udp_port();

    let mut config = Configuration {
        udp_endpoints: vec![
            udp_server("src", server_port),
            udp_client("a", peer_a.local_addr().expect("addr").port()),
        ],
        ..Default::default()
    };
    config.general.deduplication_period_ms = 200;

    let router = start_router("it-dedup", config).await;
    let injector = UdpSocket::bind("127.0.0.1:0").await.expect("injector");
    let frame = heartbeat_v2(7, 1, 0);

    injector
        .send_to(&frame, ("127.0.0.1", server_port))
        .await
        .expect("first");
    assert!(recv_frame(&peer_a, 1000).await.is_some(), "first is new");

    injector
        .send_to(&frame, ("127.0.0.1", server_port))
        .await
        .expect("second");
    assert!(
        recv_frame(&peer_a, 300).await.is_none(),
        "identical frame within the window is suppressed"
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    injector
        .send_to(&frame, ("127.0.0.1", server_port))
        .await
        .expect("third");
    assert!(
        recv_frame(&peer_a, 1000).await.is_some(),
        "after the window the frame is new again"
    );

    router.stop().await;
}

#[tokio::test]
async fn test_udp_server_drops_until_peer_learned() {
    let inject_port = free_udp_port();
    let observe_port = free_udp_port();

    let config = Configuration {
        udp_endpoints: vec![
            udp_server("inject", inject_port),
            udp_server("observe", observe_port),
        ],
        ..Default::default()
    };
    let router = start_router("it-learned-peer", config).await;

    let injector = UdpSocket::bind("127.0.0.1:0").await.expect("injector");
    let observer = UdpSocket::bind("127.0.0.1:0").await.expect("observer");

    // The observe endpoint has no learned peer yet: the frame is dropped
    injector
        .send_to(&heartbeat_v2(7, 1, 0), ("127.0.0.1", inject_port))
        .await
        .expect("inject");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let no_peer_drops = router
        .registry
        .read()
        .iter()
        .find(|h| h.name == "observe")
        .expect("observe stats")
        .stats
        .snapshot()
        .no_peer_drops;
    assert_eq!(no_peer_drops, 1);

    // Teach the observe endpoint its peer, then inject a fresh frame
    observer
        .send_to(&heartbeat_v2(9, 1, 0), ("127.0.0.1", observe_port))
        .await
        .expect("teach peer");
    tokio::time::sleep(Duration::from_millis(100)).await;

    injector
        .send_to(&heartbeat_v2(7, 1, 1), ("127.0.0.1", inject_port))
        .await
        .expect("inject again");
    assert!(
        recv_frame(&observer, 1000).await.is_some(),
        "learned peer receives traffic"
    );

    router.stop().await;
}

#[tokio::test]
async fn test_tcp_server_accepts_and_routes_dynamic_clients() {
    let peer_a = UdpSocket::bind("127.0.0.1:0").await.expect("peer a");
    let tcp_port = free_tcp_port();

    let mut config = Configuration {
        udp_endpoints: vec![udp_client("a", peer_a.local_addr().expect("addr").port())],
        ..Default::default()
    };
    config.general.tcp_server_port = Some(tcp_port);

    let router = start_router("it-tcp", config).await;

    let mut stream = TcpStream::connect(("127.0.0.1", tcp_port))
        .await
        .expect("connect to router");
    stream
        .write_all(&heartbeat_v2(7, 1, 0))
        .await
        .expect("send over tcp");
    stream.flush().await.expect("flush");

    assert!(
        recv_frame(&peer_a, 1000).await.is_some(),
        "frame from the accepted TCP client reaches the UDP endpoint"
    );

    router.stop().await;
}

#[tokio::test]
async fn test_group_members_share_destinations() {
    // Destination system 9 sits behind "left"; "right" shares its group,
    // an ungrouped endpoint does not.
    let left_port = free_udp_port();
    let right_port = free_udp_port();
    let lone_port = free_udp_port();
    let inject_port = free_udp_port();

    let mut left = udp_server("left", left_port);
    left.group = Some("pair".to_string());
    let mut right = udp_server("right", right_port);
    right.group = Some("pair".to_string());

    let config = Configuration {
        udp_endpoints: vec![
            left,
            right,
            udp_server("lone", lone_port),
            udp_server("inject", inject_port),
        ],
        ..Default::default()
    };
    let router = start_router("it-groups", config).await;

    let left_sock = UdpSocket::bind("127.0.0.1:0").await.expect("left");
    let right_sock = UdpSocket::bind("127.0.0.1:0").await.expect("right");
    let lone_sock = UdpSocket::bind("127.0.0.1:0").await.expect("lone");
    let injector = UdpSocket::bind("127.0.0.1:0").await.expect("injector");

    // Teach every endpoint its peer (these heartbeats also populate the
    // route table: system 9 behind "left")
    left_sock
        .send_to(&heartbeat_v2(9, 1, 0), ("127.0.0.1", left_port))
        .await
        .expect("teach left");
    right_sock
        .send_to(&heartbeat_v2(21, 1, 0), ("127.0.0.1", right_port))
        .await
        .expect("teach right");
    lone_sock
        .send_to(&heartbeat_v2(22, 1, 0), ("127.0.0.1", lone_port))
        .await
        .expect("teach lone");
    tokio::time::sleep(Duration::from_millis(150)).await;
    // Drain the fan-out of the teaching broadcasts
    while recv_frame(&left_sock, 100).await.is_some() {}
    while recv_frame(&right_sock, 100).await.is_some() {}
    while recv_frame(&lone_sock, 100).await.is_some() {}

    // A message targeted at system 9: left owns the route, right is
    // eligible through the group, lone is not
    let mut ping = Vec::new();
    mavlink::write_v2_msg(
        &mut ping,
        MavHeader {
            system_id: 255,
            component_id: 190,
            sequence: 1,
        },
        &MavMessage::PING(mavlink::common::PING_DATA {
            time_usec: 1,
            seq: 1,
            target_system: 9,
            target_component: 1,
        }),
    )
    .expect("write ping");
    injector
        .send_to(&ping, ("127.0.0.1", inject_port))
        .await
        .expect("inject ping");

    assert!(recv_frame(&left_sock, 1000).await.is_some(), "route owner");
    assert!(recv_frame(&right_sock, 1000).await.is_some(), "group peer");
    assert!(
        recv_frame(&lone_sock, 300).await.is_none(),
        "ungrouped endpoint has no route"
    );

    router.stop().await;
}

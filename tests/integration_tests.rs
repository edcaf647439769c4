use bytes::Bytes;
use harbor::{
    network::{InterfaceId, LocalInterface},
    v4::{codec, Message, MessageType},
    Daemon, DhcpRelay, DhcpServer, HarborError, RelayConfig, ServerConfig,
};
use std::{
    collections::HashMap,
    io::Write,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};
use tokio::{net::UdpSocket, time::timeout};
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(5);

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

async fn bind(address: Ipv4Addr) -> UdpSocket {
    UdpSocket::bind(SocketAddrV4::new(address, 0)).await.unwrap()
}

fn local_v4(socket: &UdpSocket) -> SocketAddrV4 {
    match socket.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {other}"),
    }
}

async fn recv_message(socket: &UdpSocket) -> (Message, SocketAddrV4) {
    let mut buf = [0u8; 1500];
    let (len, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    let std::net::SocketAddr::V4(from) = from else {
        panic!("unexpected source {from}");
    };
    (codec::decode(&buf[..len]).unwrap(), from)
}

#[test]
fn server_config_fills_defaults() {
    let file = write_config(
        r#"{
            "first_address": "10.0.0.10",
            "last_address": "10.0.0.20",
            "static_entries": [
                { "hw_address": "02:00:00:00:00:01", "address": "10.0.0.15" }
            ]
        }"#,
    );

    let config = assert_ok!(ServerConfig::load(file.path()));
    assert_eq!(config.pool_network, Ipv4Addr::new(10, 0, 0, 0));
    assert_eq!(config.lease_seconds, 30);
    assert_eq!(config.renew_seconds, 15);
    assert_eq!(config.rebind_seconds, 25);
    assert_eq!(config.static_entries.len(), 1);
}

#[test]
fn invalid_server_config_is_rejected() {
    let file = write_config(r#"{ "first_address": "10.0.0.20", "last_address": "10.0.0.10" }"#);
    assert!(matches!(
        ServerConfig::load(file.path()),
        Err(HarborError::Config(_))
    ));

    let garbage = write_config("{ not json");
    assert!(matches!(
        ServerConfig::load(garbage.path()),
        Err(HarborError::Json(_))
    ));
    assert_err!(ServerConfig::load("/nonexistent/harbor.json"));
}

#[test]
fn relay_config_round_trips_through_json() {
    let file = write_config(
        r#"{
            "upstream_interface": "eth0",
            "server_address": "10.0.0.1",
            "subnets": [
                { "interface": "eth1", "gateway": "192.168.1.1", "mask": "255.255.255.0" },
                { "interface": "eth2", "gateway": "192.168.2.1", "mask": "255.255.255.0" }
            ]
        }"#,
    );

    let config = assert_ok!(RelayConfig::load(file.path()));
    assert_eq!(config.server_port, 67);
    assert_eq!(config.client_port, 68);

    let rendered = serde_json::to_string(&config).unwrap();
    let reparsed: RelayConfig = serde_json::from_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}

#[test]
fn relay_upstream_must_not_serve_clients() {
    let file = write_config(
        r#"{
            "upstream_interface": "eth0",
            "server_address": "10.0.0.1",
            "subnets": [
                { "interface": "eth0", "gateway": "192.168.1.1", "mask": "255.255.255.0" }
            ]
        }"#,
    );
    assert_err!(RelayConfig::load(file.path()));
}

#[tokio::test]
async fn relay_daemon_forwards_discover_to_server() {
    let upstream = bind(Ipv4Addr::LOCALHOST).await;
    let lan = bind(Ipv4Addr::LOCALHOST).await;
    let fake_server = bind(Ipv4Addr::LOCALHOST).await;
    let client = bind(Ipv4Addr::LOCALHOST).await;
    let lan_addr = local_v4(&lan);
    let upstream_addr = local_v4(&upstream);

    let mut relay = DhcpRelay::new(local_v4(&fake_server), InterfaceId(1));
    relay
        .add_relay_interface(
            InterfaceId(2),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap();

    let sockets = HashMap::from([(InterfaceId(1), upstream), (InterfaceId(2), lan)]);
    let mut daemon = Daemon::with_sockets(relay, sockets);
    let running = tokio::spawn(async move { daemon.run().await });

    let discover = Message::new(
        MessageType::Discover,
        0x5151,
        Bytes::from_static(&[0x02, 0, 0, 0, 0, 0x42]),
    );
    client
        .send_to(&codec::encode(&discover).unwrap(), lan_addr)
        .await
        .unwrap();

    let (forwarded, from) = recv_message(&fake_server).await;
    assert_eq!(from, upstream_addr);
    assert_eq!(forwarded.message_type, MessageType::Discover);
    assert_eq!(forwarded.transaction_id, 0x5151);
    assert_eq!(forwarded.gateway_addr, Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(forwarded.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));

    running.abort();
}

#[tokio::test]
async fn server_daemon_unicasts_ack_to_lease_holder() {
    let own = Ipv4Addr::LOCALHOST;
    let leased = Ipv4Addr::new(127, 0, 0, 2);
    let interfaces = vec![LocalInterface {
        id: InterfaceId(1),
        name: "lo".to_string(),
        address: own,
        mask: Ipv4Addr::new(255, 0, 0, 0),
    }];
    let config = ServerConfig {
        pool_network: Ipv4Addr::new(127, 0, 0, 0),
        pool_mask: Ipv4Addr::new(255, 0, 0, 0),
        first_address: leased,
        last_address: Ipv4Addr::new(127, 0, 0, 9),
        ..Default::default()
    };
    let server = assert_ok!(DhcpServer::new(&config, &interfaces));

    let socket = bind(own).await;
    let server_addr = local_v4(&socket);
    let mut daemon = Daemon::with_sockets(server, HashMap::from([(InterfaceId(1), socket)]));
    let running = tokio::spawn(async move { daemon.run().await });

    let client = bind(leased).await;
    let hw = Bytes::from_static(&[0x02, 0, 0, 0, 0, 0x07]);

    // The OFFER is broadcast and not observable here; it still allocates the lease.
    let discover = Message::new(MessageType::Discover, 1, hw.clone());
    client
        .send_to(&codec::encode(&discover).unwrap(), server_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut request = Message::new(MessageType::Request, 2, hw);
    request.requested_addr = leased;
    client
        .send_to(&codec::encode(&request).unwrap(), server_addr)
        .await
        .unwrap();

    let (ack, from) = recv_message(&client).await;
    assert_eq!(from, server_addr);
    assert_eq!(ack.message_type, MessageType::Ack);
    assert_eq!(ack.transaction_id, 2);
    assert_eq!(ack.your_addr, leased);
    assert_eq!(ack.lease_seconds, 30);

    running.abort();
}

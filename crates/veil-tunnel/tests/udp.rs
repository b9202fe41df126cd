//! Integration tests for tunnels over real UDP sockets.

use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use veil_core::{AddressFamily, MAX_PACKET_SIZE};
use veil_crypto::keys;
use veil_tunnel::{Action, Tunnel};

async fn recv(socket: &UdpSocket, buf: &mut [u8]) -> usize {
    timeout(Duration::from_secs(2), socket.recv(buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap()
}

fn network(action: Action) -> usize {
    match action {
        Action::WriteToNetwork(n) => n,
        other => panic!("expected WriteToNetwork, got {other:?}"),
    }
}

/// Full handshake and an echoed packet over loopback UDP
#[tokio::test]
async fn test_tunnel_over_udp() {
    let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_socket.local_addr().unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    client_socket.connect(server_addr).await.unwrap();

    let client_private = keys::generate();
    let server_private = keys::generate();
    let client_public = keys::derive_public(&client_private);
    let server_public = keys::derive_public(&server_private);

    // Server task: answer the handshake, then echo one packet back.
    let server_handle = tokio::spawn(async move {
        let mut server = Tunnel::new(server_private, client_public, None, 0, 2);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut out = vec![0u8; MAX_PACKET_SIZE];

        // Initiation
        let (len, peer) = server_socket.recv_from(&mut buf).await.unwrap();
        let n = network(server.read_from(peer.ip(), &buf[..len], &mut out));
        server_socket.send_to(&out[..n], peer).await.unwrap();

        // Keepalive confirming the session
        let (len, _) = server_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(server.read_from(peer.ip(), &buf[..len], &mut out), Action::Done);

        // Data
        let (len, _) = server_socket.recv_from(&mut buf).await.unwrap();
        let n = match server.read_from(peer.ip(), &buf[..len], &mut out) {
            Action::WriteToTunnel(n, AddressFamily::V4) => n,
            other => panic!("expected an IPv4 delivery, got {other:?}"),
        };
        let packet = out[..n].to_vec();
        let n = network(server.write(&packet, &mut out));
        server_socket.send_to(&out[..n], client_addr).await.unwrap();

        server.stats()
    });

    let mut client = Tunnel::new(client_private, server_public, None, 0, 1);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut out = vec![0u8; MAX_PACKET_SIZE];

    let mut packet = vec![0x45, 0, 0, 24, 0, 0, 0, 0, 64, 17, 0, 0];
    packet.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
    packet.extend_from_slice(b"ping");

    let n = network(client.write(&packet, &mut out));
    client_socket.send(&out[..n]).await.unwrap();

    let len = recv(&client_socket, &mut buf).await;
    let n = network(client.read(&buf[..len], &mut out));
    client_socket.send(&out[..n]).await.unwrap();

    let n = network(client.read(&[], &mut out));
    client_socket.send(&out[..n]).await.unwrap();
    assert_eq!(client.read(&[], &mut out), Action::Done);

    let len = recv(&client_socket, &mut buf).await;
    match client.read(&buf[..len], &mut out) {
        Action::WriteToTunnel(n, AddressFamily::V4) => assert_eq!(&out[..n], &packet[..]),
        other => panic!("expected the echo, got {other:?}"),
    }

    let server_stats = timeout(Duration::from_secs(2), server_handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server_stats.rx_bytes, packet.len() as u64);
    assert_eq!(server_stats.tx_bytes, packet.len() as u64);

    let client_stats = client.stats();
    assert!(client_stats.time_since_last_handshake.is_some());
    assert_eq!(client_stats.handshake_attempts, 1);
    let json = serde_json::to_value(client_stats).unwrap();
    assert_eq!(json["rx_bytes"], packet.len() as u64);
}

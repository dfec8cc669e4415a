//! End-to-end scenarios from SPEC_FULL.md §8 (S1, S2, S5, S6). The timing
//! wheel's own boundary scenarios (S3 generation cancellation, S4
//! long-term migration) are unit-tested against `MockClock` alongside the
//! wheel implementation instead of here, since they don't need a socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dgram_core::clock::SystemClock;
use dgram_udp::observer::{DatagramObserver, Event};
use dgram_udp::{Connection, ConnectionManager, UdpConfig};
use tokio::sync::mpsc;

/// Forwards every event onto an unbounded channel so a test can `.await`
/// readiness instead of polling `recv()` in a busy loop.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<Event>,
}

impl DatagramObserver for ChannelObserver {
    fn on_event(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

fn channel_observer() -> (Arc<ChannelObserver>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelObserver { tx }), rx)
}

async fn wait_for_read_ready(rx: &mut mpsc::UnboundedReceiver<Event>) {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Event::ReadReady)) => return,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("observer channel closed before ReadReady"),
            Err(_) => panic!("timed out waiting for ReadReady"),
        }
    }
}

/// S1 — loopback echo between two connected sockets.
#[tokio::test(flavor = "multi_thread")]
async fn loopback_echo_connected_child() {
    let clock = Arc::new(SystemClock);
    let config = UdpConfig::default();

    let (server_obs, mut server_rx) = channel_observer();
    let server = Connection::create(
        "127.0.0.1:0".parse().unwrap(),
        None,
        server_obs,
        config.clone(),
        clock.clone(),
    )
    .await
    .unwrap();
    server.start_io();
    let server_addr = server.local_addr();

    let (client_obs, mut client_rx) = channel_observer();
    let client = Connection::create("127.0.0.1:0".parse().unwrap(), Some(server_addr), client_obs, config, clock)
        .await
        .unwrap();
    client.start_io();

    client.send(Bytes::from_static(b"helloword"), None, None, 0).unwrap();

    wait_for_read_ready(&mut server_rx).await;
    let received = server.recv().expect("server should have a buffered packet");
    assert_eq!(received.payload().as_ref(), b"helloword");
    let from = received.from.expect("inbound packet carries its source");

    server.send(received.entire_buffer(), Some(from), None, 0).unwrap();

    wait_for_read_ready(&mut client_rx).await;
    let echoed = client.recv().expect("client should receive the echo");
    assert_eq!(echoed.payload().as_ref(), b"helloword");
}

/// S2 — an accept connection promotes a peer to a sub-connection, and
/// subsequent datagrams from that peer arrive on the child, in order.
#[tokio::test(flavor = "multi_thread")]
async fn accept_then_promote() {
    let clock = Arc::new(SystemClock);
    let config = UdpConfig::default();

    let manager = ConnectionManager::new();
    let (listener_obs, mut listener_rx) = channel_observer();
    let listener = manager
        .create_accept("127.0.0.1:0".parse().unwrap(), listener_obs, config.clone(), clock.clone())
        .await
        .unwrap();
    let listener_addr = listener.local_addr();

    let (client_obs, mut client_rx) = channel_observer();
    let client = Connection::create(
        "127.0.0.1:0".parse().unwrap(),
        Some(listener_addr),
        client_obs,
        config.clone(),
        clock.clone(),
    )
    .await
    .unwrap();
    client.start_io();
    let client_addr = client.local_addr();

    client.send(Bytes::from_static(b"helloword"), None, None, 0).unwrap();
    wait_for_read_ready(&mut listener_rx).await;

    let first = listener.recv_unclaimed().expect("first datagram is unclaimed until promoted");
    assert_eq!(first.payload().as_ref(), b"helloword");

    let child = listener.create_sub_connection(client_addr).await.unwrap();

    client.send(Bytes::from_static(b"helloword1"), None, None, 0).unwrap();
    client.send(Bytes::from_static(b"helloword2"), None, None, 0).unwrap();

    let mut got: Vec<Bytes> = Vec::new();
    while got.len() < 2 {
        if let Some(packet) = child.recv() {
            got.push(packet.payload().clone());
        } else {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    assert_eq!(got[0].as_ref(), b"helloword1");
    assert_eq!(got[1].as_ref(), b"helloword2");

    // Child replies go out its own connected socket.
    child.send(Bytes::from_static(b"ack"), None, None, 0).unwrap();
    wait_for_read_ready(&mut client_rx).await;
    let ack = client.recv().expect("client receives the child's reply");
    assert_eq!(ack.payload().as_ref(), b"ack");
}

/// S5 — a send from a thread other than the connection's owning task
/// still results in exactly one delivery and one `WriteReady`.
#[tokio::test(flavor = "multi_thread")]
async fn cross_thread_send_delivers_exactly_once() {
    let clock = Arc::new(SystemClock);
    let config = UdpConfig::default();

    let (server_obs, mut server_rx) = channel_observer();
    let server = Connection::create("127.0.0.1:0".parse().unwrap(), None, server_obs, config.clone(), clock.clone())
        .await
        .unwrap();
    server.start_io();
    let server_addr = server.local_addr();

    let (client_obs, _client_rx) = channel_observer();
    let client = Connection::create("127.0.0.1:0".parse().unwrap(), Some(server_addr), client_obs, config, clock)
        .await
        .unwrap();
    client.start_io();

    let sender = client.clone();
    tokio::spawn(async move {
        sender.send(Bytes::from_static(b"cross-thread"), None, None, 0).unwrap();
    })
    .await
    .unwrap();

    wait_for_read_ready(&mut server_rx).await;
    let packet = server.recv().unwrap();
    assert_eq!(packet.payload().as_ref(), b"cross-thread");
    assert!(server.recv().is_none(), "exactly one datagram should have been delivered");
}

/// S6 — an accept connection demultiplexes two interleaved peers into
/// two distinct sub-connections without cross-talk.
#[tokio::test(flavor = "multi_thread")]
async fn accept_demultiplexes_two_peers() {
    let clock = Arc::new(SystemClock);
    let config = UdpConfig::default();

    let (listener_obs, mut listener_rx) = channel_observer();
    let listener = Connection::create_accept(
        "127.0.0.1:0".parse().unwrap(),
        listener_obs,
        config.clone(),
        clock.clone(),
    )
    .await
    .unwrap();
    listener.start_io();
    let listener_addr: SocketAddr = listener.local_addr();

    let (peer_a_obs, _a_rx) = channel_observer();
    let peer_a = Connection::create(
        "127.0.0.1:0".parse().unwrap(),
        Some(listener_addr),
        peer_a_obs,
        config.clone(),
        clock.clone(),
    )
    .await
    .unwrap();
    peer_a.start_io();

    let (peer_b_obs, _b_rx) = channel_observer();
    let peer_b = Connection::create(
        "127.0.0.1:0".parse().unwrap(),
        Some(listener_addr),
        peer_b_obs,
        config.clone(),
        clock.clone(),
    )
    .await
    .unwrap();
    peer_b.start_io();

    peer_a.send(Bytes::from_static(b"a1"), None, None, 0).unwrap();
    wait_for_read_ready(&mut listener_rx).await;
    let first = listener.recv_unclaimed().unwrap();
    let child_a = listener.create_sub_connection(first.from.unwrap()).await.unwrap();

    peer_b.send(Bytes::from_static(b"b1"), None, None, 0).unwrap();
    wait_for_read_ready(&mut listener_rx).await;
    let first_b = listener.recv_unclaimed().unwrap();
    let child_b = listener.create_sub_connection(first_b.from.unwrap()).await.unwrap();

    peer_a.send(Bytes::from_static(b"a2"), None, None, 0).unwrap();
    peer_a.send(Bytes::from_static(b"a3"), None, None, 0).unwrap();
    peer_b.send(Bytes::from_static(b"b2"), None, None, 0).unwrap();

    let mut from_a = vec![first.payload().clone()];
    let mut from_b = vec![first_b.payload().clone()];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while (from_a.len() < 3 || from_b.len() < 2) && tokio::time::Instant::now() < deadline {
        if let Some(p) = child_a.recv() {
            from_a.push(p.payload().clone());
        }
        if let Some(p) = child_b.recv() {
            from_b.push(p.payload().clone());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(from_a, vec![Bytes::from_static(b"a1"), Bytes::from_static(b"a2"), Bytes::from_static(b"a3")]);
    assert_eq!(from_b, vec![Bytes::from_static(b"b1"), Bytes::from_static(b"b2")]);
}

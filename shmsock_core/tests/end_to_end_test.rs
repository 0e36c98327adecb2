/// End-to-end socket scenarios over the in-process loopback host
use shmsock_core::{
    Endpoint, EndpointId, IoMode, LoopbackHost, ShmsockError, SocketConfig, SocketState,
};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const TOTAL: usize = 0x2000;

fn host() -> LoopbackHost {
    LoopbackHost::with_limits(4096, 1024, Duration::from_millis(2))
}

fn endpoint(host: &LoopbackHost, id: u16, buffer_order: u8) -> Endpoint {
    let mut config = SocketConfig::for_endpoint(EndpointId(id));
    config.buffer_order = buffer_order;
    config.poll_interval_ms = 2;
    config.handshake_timeout_ms = 2000;
    config.shutdown_timeout_ms = 2000;
    Endpoint::create(config, host.attach(EndpointId(id))).unwrap()
}

/// Byte `i` of the reference workload
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'0' + (i % 10) as u8).collect()
}

/// Listen on `name` and accept one connection from `client`
fn connect_pair(host: &LoopbackHost, name: &str, buffer_order: u8) -> (Endpoint, Endpoint, Endpoint) {
    let server = endpoint(host, 1, buffer_order);
    server.bind(name).unwrap();
    server.listen(1).unwrap();

    let client = endpoint(host, 2, buffer_order);
    let accepted = thread::scope(|s| {
        let acceptor = s.spawn(|| server.accept().unwrap());
        client.connect(name).unwrap();
        acceptor.join().unwrap()
    });
    (server, client, accepted)
}

fn receive_all(accepted: &Endpoint, len: usize) -> Vec<u8> {
    let mut received = vec![0u8; len];
    assert_eq!(accepted.recv_exact(&mut received).unwrap(), len);
    received
}

#[test]
fn test_fixed_chunks_are_reassembled() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "echo", 5);
    assert_eq!(client.state(), SocketState::Connected);
    assert_eq!(accepted.local_name().unwrap().as_str(), "echo");

    let data = pattern(TOTAL);
    let sender = thread::spawn({
        let data = data.clone();
        move || {
            for chunk in data.chunks(4096) {
                assert_eq!(client.send(chunk, IoMode::Blocking).unwrap(), chunk.len());
            }
            client
        }
    });

    let received = receive_all(&accepted, TOTAL);
    let client = sender.join().unwrap();
    assert_eq!(received, data);
    // Marker bytes of the reference workload
    assert_eq!(received[0], b'0');
    assert_eq!(received[4095], b'5');
    assert_eq!(received[TOTAL - 1], b'1');

    let stats = client.stats().unwrap();
    assert_eq!(stats.total_sent, TOTAL as u64);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn test_varying_chunks_are_reassembled() {
    let host = host();
    // One page, so chunks keep straddling the wrap point
    let (_server, client, accepted) = connect_pair(&host, "varying", 0);

    let data = pattern(TOTAL);
    let sender = thread::spawn({
        let data = data.clone();
        move || {
            let mut sent = 0;
            let mut i = 0;
            while sent < data.len() {
                let len = (i % 100 + 1).min(data.len() - sent);
                sent += client.send(&data[sent..sent + len], IoMode::Blocking).unwrap();
                i += 1;
            }
            client.shutdown(std::net::Shutdown::Write).unwrap();
            client
        }
    });

    let mut received = Vec::new();
    let mut i = 0;
    loop {
        let chunk = accepted.recv(i % 37 + 1, IoMode::Blocking).unwrap();
        if chunk.is_empty() {
            break;
        }
        received.extend_from_slice(&chunk);
        i += 1;
    }
    let _client = sender.join().unwrap();
    assert_eq!(received.len(), TOTAL);
    assert_eq!(received, data);
}

#[test]
fn test_slow_consumer_unblocks_producer() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "slow", 0);
    let capacity = client.stats().unwrap().capacity as usize;
    let data = pattern(capacity * 8);

    let sender = thread::spawn({
        let data = data.clone();
        move || {
            // One call, far larger than the ring
            let sent = client.send(&data, IoMode::Blocking);
            (client, sent)
        }
    });

    let mut received = Vec::new();
    while received.len() < data.len() {
        thread::sleep(Duration::from_millis(1));
        let chunk = accepted.recv(1000, IoMode::Blocking).unwrap();
        assert!(!chunk.is_empty());
        received.extend_from_slice(&chunk);
    }

    let (_client, sent) = sender.join().unwrap();
    assert_eq!(sent.unwrap(), data.len());
    assert_eq!(received, data);
}

#[test]
fn test_connect_after_listener_close_fails() {
    let host = host();
    let server = endpoint(&host, 1, 0);
    server.bind("gone").unwrap();
    server.listen(4).unwrap();
    server.close().unwrap();
    assert_eq!(server.state(), SocketState::Closed);

    let client = endpoint(&host, 2, 0);
    assert!(matches!(
        client.connect("gone"),
        Err(ShmsockError::ServiceNotFound(_))
    ));
    assert_eq!(host.grant_table().live_grants(), 0);

    // The name is free again
    let other = endpoint(&host, 3, 0);
    other.bind("gone").unwrap();
}

#[test]
fn test_listener_closing_with_pending_connect() {
    let host = host();
    let server = endpoint(&host, 1, 0);
    server.bind("pending").unwrap();
    server.listen(1).unwrap();

    let client = endpoint(&host, 2, 0);
    let connector = thread::spawn(move || client.connect("pending"));

    // Wait until the connector has advertised itself, then close without accepting
    let dir = "/shmsock/service/pending";
    while shmsock_core::RendezvousDirectory::list(host.directory().as_ref(), dir)
        .unwrap()
        .is_empty()
    {
        thread::sleep(Duration::from_millis(1));
    }
    server.close().unwrap();

    assert!(matches!(
        connector.join().unwrap(),
        Err(ShmsockError::ServiceNotFound(_))
    ));
    assert_eq!(host.grant_table().live_grants(), 0);
    assert_eq!(host.event_hub().open_ports(), 0);
}

#[test]
fn test_forced_shutdown_releases_blocked_sender() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "force", 0);
    let capacity = client.stats().unwrap().capacity as usize;

    let sender = thread::spawn(move || {
        let sent = client.send(&pattern(capacity * 2), IoMode::Blocking);
        (client, sent)
    });

    // Let the producer fill the ring and park
    while accepted.stats().unwrap().free != 0 {
        thread::sleep(Duration::from_millis(1));
    }
    accepted.close().unwrap();

    let (_client, sent) = sender.join().unwrap();
    // The first ring-full of bytes went through before the consumer left
    assert_eq!(sent.unwrap(), capacity);
}

#[test]
fn test_blocked_receive_is_cancellable() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "cancel", 0);

    let token = accepted.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        token.cancel();
    });
    assert!(matches!(
        accepted.recv(16, IoMode::Blocking),
        Err(ShmsockError::Cancelled)
    ));
    canceller.join().unwrap();

    // The connection itself is still usable once the token is re-armed
    accepted.cancel_token().reset();
    client.send(b"still here", IoMode::Blocking).unwrap();
    assert_eq!(accepted.recv(32, IoMode::Blocking).unwrap(), b"still here");
    client.close().unwrap();
    accepted.close().unwrap();
}

#[test]
fn test_local_close_releases_blocked_send() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "close-send", 0);
    let capacity = client.stats().unwrap().capacity as usize;
    let data = pattern(capacity * 2);

    thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        let client = &client;
        let data = &data;
        s.spawn(move || tx.send(client.send(data, IoMode::Blocking)).unwrap());

        while accepted.stats().unwrap().free != 0 {
            thread::sleep(Duration::from_millis(1));
        }
        client.close().unwrap();

        // Only the first ring-full went through
        let sent = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("send still blocked after close");
        assert_eq!(sent.unwrap(), capacity);
    });

    let mut received = vec![0u8; capacity * 2];
    assert_eq!(accepted.recv_exact(&mut received).unwrap(), capacity);
    assert_eq!(&received[..capacity], &data[..capacity]);
}

#[test]
fn test_local_close_releases_blocked_recv() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "close-recv", 0);

    thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        let accepted = &accepted;
        s.spawn(move || tx.send(accepted.recv(16, IoMode::Blocking)).unwrap());
        thread::sleep(Duration::from_millis(20));

        // close waits for the producer's acknowledgement, so run it aside
        let closer = s.spawn(move || accepted.close());
        let received = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("recv still blocked after close");
        assert!(received.unwrap().is_empty());

        client.close().unwrap();
        closer.join().unwrap().unwrap();
    });
    assert_eq!(accepted.state(), SocketState::Closed);
}

#[test]
fn test_shutdown_read_releases_blocked_recv() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "shut-recv", 0);

    thread::scope(|s| {
        let reader = s.spawn(|| accepted.recv(16, IoMode::Blocking));
        thread::sleep(Duration::from_millis(20));
        accepted.shutdown(std::net::Shutdown::Read).unwrap();
        assert!(reader.join().unwrap().unwrap().is_empty());
    });

    // The producer is told to stop as well
    assert!(matches!(
        client.send(b"ignored", IoMode::Blocking),
        Err(ShmsockError::ConnectionClosed)
    ));
}

#[test]
fn test_zero_length_recv_is_rejected() {
    let host = host();
    let (_server, client, accepted) = connect_pair(&host, "zero", 0);
    assert!(matches!(
        accepted.recv(0, IoMode::NonBlocking),
        Err(ShmsockError::Io(_))
    ));

    // Still connected and usable
    client.send(b"ok", IoMode::Blocking).unwrap();
    assert_eq!(accepted.recv(2, IoMode::Blocking).unwrap(), b"ok");
    client.close().unwrap();
    assert!(accepted.recv(2, IoMode::Blocking).unwrap().is_empty());
}

/// Rendezvous races and teardown bookkeeping
use shmsock_core::{
    Endpoint, EndpointId, IoMode, LoopbackHost, RendezvousDirectory, ShmsockError, SocketConfig,
    SocketState,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn host() -> LoopbackHost {
    LoopbackHost::with_limits(4096, 1024, Duration::from_millis(2))
}

fn config(id: u16) -> SocketConfig {
    let mut config = SocketConfig::for_endpoint(EndpointId(id));
    config.buffer_order = 1;
    config.poll_interval_ms = 2;
    config.handshake_timeout_ms = 2000;
    config.shutdown_timeout_ms = 500;
    config
}

#[test]
fn test_concurrent_accepts_consume_connection_once() {
    let host = host();
    let mut listener_config = config(1);
    listener_config.accept_timeout_ms = Some(300);
    let listener = Arc::new(Endpoint::create(listener_config, host.attach(EndpointId(1))).unwrap());
    listener.bind("race").unwrap();
    listener.listen(2).unwrap();

    let accepters: Vec<_> = (0..2)
        .map(|_| {
            let listener = Arc::clone(&listener);
            thread::spawn(move || listener.accept())
        })
        .collect();

    let client = Endpoint::create(config(2), host.attach(EndpointId(2))).unwrap();
    client.connect("race").unwrap();

    let results: Vec<_> = accepters.into_iter().map(|h| h.join().unwrap()).collect();
    let accepted: Vec<&Endpoint> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(accepted.len(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ShmsockError::Timeout))));

    client.send(b"once", IoMode::Blocking).unwrap();
    assert_eq!(accepted[0].recv(8, IoMode::Blocking).unwrap(), b"once");
    client.close().unwrap();
}

#[test]
fn test_directory_take_has_single_winner() {
    let host = host();
    let directory = host.directory();
    for round in 0..20 {
        let path = format!("/shmsock/service/race/{}", round + 1);
        directory.write(&path, "2").unwrap();
        let winners = thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|_| s.spawn(|| directory.take(&path).unwrap()))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .count()
        });
        assert_eq!(winners, 1);
    }
}

#[test]
fn test_close_twice_releases_everything_once() {
    let host = host();
    let listener = Endpoint::create(config(1), host.attach(EndpointId(1))).unwrap();
    listener.bind("idem").unwrap();
    listener.listen(1).unwrap();

    let client = Endpoint::create(config(2), host.attach(EndpointId(2))).unwrap();
    let accepted = thread::scope(|s| {
        let acceptor = s.spawn(|| listener.accept().unwrap());
        client.connect("idem").unwrap();
        acceptor.join().unwrap()
    });

    // Descriptor plus two ring pages, granted and mapped once each
    assert_eq!(host.grant_table().live_grants(), 3);
    assert_eq!(host.grant_table().active_mappings(), 3);

    client.send(&[9u8; 100], IoMode::Blocking).unwrap();
    client.close().unwrap();
    client.close().unwrap();
    assert_eq!(client.state(), SocketState::Closed);
    assert_eq!(host.grant_table().live_grants(), 0);
    assert!(matches!(
        client.send(b"x", IoMode::Blocking),
        Err(ShmsockError::InvalidState(_))
    ));

    // Bytes written before close are still delivered, then end-of-stream
    assert_eq!(accepted.recv(200, IoMode::Blocking).unwrap().len(), 100);
    assert!(accepted.recv(200, IoMode::Blocking).unwrap().is_empty());

    accepted.close().unwrap();
    accepted.close().unwrap();
    assert_eq!(host.grant_table().active_mappings(), 0);
    assert_eq!(host.event_hub().open_ports(), 0);

    listener.close().unwrap();
    listener.close().unwrap();
    assert!(host.directory().is_empty());
}

#[test]
fn test_accepted_close_times_out_without_acknowledgement() {
    let host = host();
    let listener = Endpoint::create(config(1), host.attach(EndpointId(1))).unwrap();
    listener.bind("linger").unwrap();
    listener.listen(1).unwrap();

    let client = Endpoint::create(config(2), host.attach(EndpointId(2))).unwrap();
    let accepted = thread::scope(|s| {
        let acceptor = s.spawn(|| listener.accept().unwrap());
        client.connect("linger").unwrap();
        acceptor.join().unwrap()
    });

    // The client never sends again, so nothing acknowledges the forced shutdown
    assert!(matches!(accepted.close(), Err(ShmsockError::Timeout)));
    assert_eq!(accepted.state(), SocketState::Closed);
    assert_eq!(host.grant_table().active_mappings(), 0);

    assert!(matches!(
        client.send(b"late", IoMode::Blocking),
        Err(ShmsockError::ConnectionClosed)
    ));
    client.close().unwrap();
    assert_eq!(host.grant_table().live_grants(), 0);
}

#[test]
fn test_connect_cancelled_while_waiting_for_accept() {
    let host = host();
    let listener = Endpoint::create(config(1), host.attach(EndpointId(1))).unwrap();
    listener.bind("never").unwrap();
    listener.listen(1).unwrap();

    let client = Endpoint::create(config(2), host.attach(EndpointId(2))).unwrap();
    let token = client.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        token.cancel();
    });

    assert!(matches!(client.connect("never"), Err(ShmsockError::Cancelled)));
    canceller.join().unwrap();

    // Pending entry withdrawn and every grant revoked
    assert!(host
        .directory()
        .list("/shmsock/service/never")
        .unwrap()
        .is_empty());
    assert_eq!(host.grant_table().live_grants(), 0);
    assert_eq!(client.state(), SocketState::Unbound);
}

#[test]
fn test_connect_times_out_without_accept() {
    let host = host();
    let listener = Endpoint::create(config(1), host.attach(EndpointId(1))).unwrap();
    listener.bind("slowpoke").unwrap();
    listener.listen(1).unwrap();

    let mut client_config = config(2);
    client_config.connect_timeout_ms = Some(50);
    let client = Endpoint::create(client_config, host.attach(EndpointId(2))).unwrap();
    assert!(matches!(client.connect("slowpoke"), Err(ShmsockError::Timeout)));
    assert_eq!(host.grant_table().live_grants(), 0);
}

#[test]
fn test_accept_is_cancellable() {
    let host = host();
    let listener = Endpoint::create(config(1), host.attach(EndpointId(1))).unwrap();
    listener.bind("quiet").unwrap();
    listener.listen(1).unwrap();

    let token = listener.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        token.cancel();
    });
    assert!(matches!(listener.accept(), Err(ShmsockError::Cancelled)));
    canceller.join().unwrap();

    // Still listening once the token is re-armed
    listener.cancel_token().reset();
    assert_eq!(listener.state(), SocketState::Server);
    assert_eq!(host.directory().watch_count(), 0);
}

#[test]
fn test_listener_close_releases_accept() {
    let host = host();
    let listener = Arc::new(Endpoint::create(config(1), host.attach(EndpointId(1))).unwrap());
    listener.bind("closing").unwrap();
    listener.listen(1).unwrap();

    let acceptor = {
        let listener = Arc::clone(&listener);
        thread::spawn(move || listener.accept())
    };
    thread::sleep(Duration::from_millis(30));
    listener.close().unwrap();

    assert!(matches!(
        acceptor.join().unwrap(),
        Err(ShmsockError::InvalidState(_))
    ));
    assert!(host.directory().is_empty());
    assert_eq!(host.directory().watch_count(), 0);
}

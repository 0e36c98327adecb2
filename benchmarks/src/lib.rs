//! Shared fixtures for the SHMSOCK benchmark suite.

use rand::{Rng, SeedableRng};
use shmsock_core::{Endpoint, EndpointId, LoopbackHost, ShmsockResult, SocketConfig};
use std::thread;

/// Deterministic pseudo-random payload
pub fn create_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    (0..size).map(|_| rng.gen()).collect()
}

/// Config used by every benchmark endpoint: a 32-page ring and a short poll interval
pub fn bench_config(id: u16) -> SocketConfig {
    let mut config = SocketConfig::for_endpoint(EndpointId(id));
    config.buffer_order = 5;
    config.poll_interval_ms = 1;
    config
}

/// Listener, client and accepted endpoint connected over `host` as `name`
pub fn connected_pair(
    host: &LoopbackHost,
    name: &str,
) -> ShmsockResult<(Endpoint, Endpoint, Endpoint)> {
    let listener = Endpoint::create(bench_config(1), host.attach(EndpointId(1)))?;
    listener.bind(name)?;
    listener.listen(1)?;

    let client = Endpoint::create(bench_config(2), host.attach(EndpointId(2)))?;
    let accepted = thread::scope(|s| {
        let acceptor = s.spawn(|| listener.accept());
        let connected = client.connect(name);
        let accepted = acceptor
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        connected.and(accepted)
    })?;
    Ok((listener, client, accepted))
}
